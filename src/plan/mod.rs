//! Fast-path planners.
//!
//! The generic evaluator reaches marginal rates through finite differences and
//! totals through numeric band integration; both are slow and only
//! approximately exact at kinks. Two structural shapes cover most authored
//! schedules and admit exact closed forms:
//!
//! 1. a body that is *directly* a `brackets` call over the plain income
//!    selector with all-literal bounds and rates, and
//! 2. a body that is directly a `piece` over simple `x ⋚ threshold`
//!    conditions with affine arm values.
//!
//! Plans are built once at model construction and shared by every backend.

use crate::ast::{BinOp, Bound, CmpOp, Expr, Wrapper};
use crate::model::{Component, ComponentBody};
use crate::numeric::MIN_DERIVATIVE_STEP;

/// One resolved band with the cumulative tax at its lower edge precomputed,
/// turning total/marginal queries into O(#arms) range lookups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BracketArm {
    pub lower: f64,
    /// `f64::INFINITY` for the open-ended top band.
    pub upper: f64,
    pub rate: f64,
    pub base_at_lower: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BracketPlan {
    pub arms: Vec<BracketArm>,
    /// Total tax once the selector clears the last bounded band.
    pub final_total: f64,
    /// Bands may leave gaps (before the first, or between two); income inside
    /// a gap contributes rate 0 and keeps the lower band's base.
    pub has_gaps: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PieceArm {
    pub threshold: f64,
    pub inclusive: bool,
    /// Value on the arm is `a·x + b`.
    pub a: f64,
    pub b: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PieceValuePlan {
    pub arms: Vec<PieceArm>,
    pub else_a: f64,
    pub else_b: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ComponentPlans {
    pub bracket: Option<BracketPlan>,
    pub piece: Option<PieceValuePlan>,
}

pub fn build_component_plans(component: &Component) -> ComponentPlans {
    ComponentPlans {
        bracket: build_bracket_plan(component),
        piece: build_piece_plan(component),
    }
}

/// An affine form `a·x + b`, proven symbolically.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine {
    a: f64,
    b: f64,
}

fn build_bracket_plan(component: &Component) -> Option<BracketPlan> {
    if component.wrapper != Wrapper::Total {
        return None;
    }
    let ComponentBody::Block(block) = &component.body else {
        return None;
    };
    if !block.stmts.is_empty() {
        return None;
    }
    let Expr::Brackets { selector, arms } = &block.result else {
        return None;
    };
    if !matches!(selector.as_ref(), Expr::Ident(name) if name == "x") {
        return None;
    }

    let mut literal_arms = Vec::with_capacity(arms.len());
    for arm in arms {
        let lower = literal_bound(&arm.lower)?;
        let upper = literal_bound(&arm.upper)?;
        let rate = literal_number(&arm.rate)?;
        if !lower.is_finite() {
            return None;
        }
        if upper.is_finite() && upper <= lower {
            return None;
        }
        literal_arms.push((lower, upper, rate));
    }

    finalize_bracket_arms(&literal_arms)
}

/// Validates ordering, tracks gaps and precomputes cumulative bases.
pub(crate) fn finalize_bracket_arms(literal_arms: &[(f64, f64, f64)]) -> Option<BracketPlan> {
    if literal_arms.is_empty() {
        return None;
    }

    let mut previous_upper = f64::NEG_INFINITY;
    let mut has_gaps = false;
    for (index, &(lower, upper, _)) in literal_arms.iter().enumerate() {
        if index == 0 {
            if lower > 0.0 {
                has_gaps = true;
            }
        } else {
            if lower < previous_upper {
                return None;
            }
            if lower > previous_upper {
                has_gaps = true;
            }
        }
        // A band after an unbounded one can never be reached.
        if previous_upper == f64::INFINITY {
            return None;
        }
        previous_upper = upper;
    }

    let mut arms = Vec::with_capacity(literal_arms.len());
    let mut cumulative = 0.0;
    for &(lower, upper, rate) in literal_arms {
        arms.push(BracketArm {
            lower,
            upper,
            rate,
            base_at_lower: cumulative,
        });
        if upper.is_finite() {
            cumulative += (upper - lower) * rate;
        }
    }

    Some(BracketPlan {
        arms,
        final_total: cumulative,
        has_gaps,
    })
}

impl BracketPlan {
    /// Total tax at `selector` (already the banded income).
    pub fn total(&self, selector: f64) -> f64 {
        if !selector.is_finite() || selector <= 0.0 {
            return 0.0;
        }
        for arm in &self.arms {
            if selector <= arm.upper {
                if self.has_gaps && selector <= arm.lower {
                    return arm.base_at_lower;
                }
                return arm.base_at_lower + (selector - arm.lower) * arm.rate;
            }
        }
        self.final_total
    }

    /// Marginal rate at `income`, using the left-hand convention: the income
    /// is nudged one derivative step down before the band lookup so exact
    /// thresholds report the band below.
    pub fn marginal(&self, income: f64) -> f64 {
        if !income.is_finite() || income < 0.0 {
            return 0.0;
        }
        let left = if income > 0.0 {
            (income - MIN_DERIVATIVE_STEP).max(0.0)
        } else {
            0.0
        };
        for arm in &self.arms {
            if left < arm.upper {
                if self.has_gaps && left < arm.lower {
                    return 0.0;
                }
                return arm.rate;
            }
        }
        0.0
    }
}

fn build_piece_plan(component: &Component) -> Option<PieceValuePlan> {
    if component.wrapper != Wrapper::Total {
        return None;
    }
    let ComponentBody::Block(block) = &component.body else {
        return None;
    };
    if !block.stmts.is_empty() {
        return None;
    }
    let Expr::Piece { arms, default } = &block.result else {
        return None;
    };

    let mut plan_arms = Vec::with_capacity(arms.len());
    for arm in arms {
        let (threshold, inclusive) = upper_bound_condition(&arm.condition)?;
        let affine = extract_affine(&arm.value)?;
        plan_arms.push(PieceArm {
            threshold,
            inclusive,
            a: affine.a,
            b: affine.b,
        });
    }

    let (else_a, else_b) = match default {
        Some(expr) => {
            let affine = extract_affine(expr)?;
            (affine.a, affine.b)
        }
        None => (0.0, 0.0),
    };

    Some(PieceValuePlan {
        arms: plan_arms,
        else_a,
        else_b,
    })
}

impl PieceValuePlan {
    pub fn value(&self, income: f64) -> f64 {
        if !income.is_finite() {
            return 0.0;
        }
        for arm in &self.arms {
            let hit = if arm.inclusive {
                income <= arm.threshold
            } else {
                income < arm.threshold
            };
            if hit {
                return arm.a * income + arm.b;
            }
        }
        self.else_a * income + self.else_b
    }

    /// Marginal is the matched arm's slope, again with the left-hand nudge.
    pub fn marginal(&self, income: f64) -> f64 {
        if !income.is_finite() || income < 0.0 {
            return 0.0;
        }
        let left = if income > 0.0 {
            (income - MIN_DERIVATIVE_STEP).max(0.0)
        } else {
            0.0
        };
        for arm in &self.arms {
            let hit = if arm.inclusive {
                left <= arm.threshold
            } else {
                left < arm.threshold
            };
            if hit {
                return arm.a;
            }
        }
        self.else_a
    }
}

/// Matches `x < t`, `x <= t`, `t > x`, `t >= x` with a literal threshold.
fn upper_bound_condition(expr: &Expr) -> Option<(f64, bool)> {
    let Expr::Compare { op, lhs, rhs } = expr else {
        return None;
    };

    let lhs_is_x = matches!(lhs.as_ref(), Expr::Ident(name) if name == "x");
    let rhs_is_x = matches!(rhs.as_ref(), Expr::Ident(name) if name == "x");

    if lhs_is_x {
        let threshold = literal_number(rhs)?;
        return match op {
            CmpOp::Lt => Some((threshold, false)),
            CmpOp::Le => Some((threshold, true)),
            _ => None,
        };
    }
    if rhs_is_x {
        let threshold = literal_number(lhs)?;
        return match op {
            CmpOp::Gt => Some((threshold, false)),
            CmpOp::Ge => Some((threshold, true)),
            _ => None,
        };
    }
    None
}

/// Symbolic affine-coefficient extraction through +, -, unary minus,
/// multiplication by a constant and division by a nonzero constant.
fn extract_affine(expr: &Expr) -> Option<Affine> {
    match expr {
        Expr::Number(value) if value.is_finite() => Some(Affine { a: 0.0, b: *value }),
        Expr::Ident(name) if name == "x" => Some(Affine { a: 1.0, b: 0.0 }),
        Expr::Neg(inner) => {
            let inner = extract_affine(inner)?;
            Some(Affine {
                a: -inner.a,
                b: -inner.b,
            })
        }
        Expr::Binary { op, lhs, rhs } => {
            let left = extract_affine(lhs)?;
            let right = extract_affine(rhs)?;
            match op {
                BinOp::Add => Some(Affine {
                    a: left.a + right.a,
                    b: left.b + right.b,
                }),
                BinOp::Sub => Some(Affine {
                    a: left.a - right.a,
                    b: left.b - right.b,
                }),
                BinOp::Mul => multiply_affine(left, right),
                BinOp::Div => {
                    // Only division by a nonzero constant keeps the form affine.
                    if right.a != 0.0 || right.b == 0.0 {
                        return None;
                    }
                    Some(Affine {
                        a: left.a / right.b,
                        b: left.b / right.b,
                    })
                }
                BinOp::Pow => None,
            }
        }
        _ => None,
    }
}

fn multiply_affine(left: Affine, right: Affine) -> Option<Affine> {
    // x·x would be quadratic.
    if left.a != 0.0 && right.a != 0.0 {
        return None;
    }
    if left.a == 0.0 {
        Some(Affine {
            a: left.b * right.a,
            b: left.b * right.b,
        })
    } else {
        Some(Affine {
            a: right.b * left.a,
            b: right.b * left.b,
        })
    }
}

pub(crate) fn literal_bound(bound: &Bound) -> Option<f64> {
    match bound {
        Bound::Unbounded => Some(f64::INFINITY),
        Bound::Finite(expr) => literal_number(expr),
    }
}

pub(crate) fn literal_number(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(value) if value.is_finite() => Some(*value),
        Expr::Neg(inner) => literal_number(inner).map(|v| -v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, ComponentDef, CountryBlock, Program, RangeArm};
    use crate::model::TaxModel;
    use std::rc::Rc;

    fn plan_for(result: Expr) -> ComponentPlans {
        let program = Program {
            countries: vec![CountryBlock {
                name: "Testland".to_string(),
                currency: None,
                components: vec![ComponentDef {
                    name: "T".to_string(),
                    kind: Some("income_tax".to_string()),
                    wrapper: Wrapper::Total,
                    body: crate::ast::ComponentBody::Block(Rc::new(Block {
                        stmts: vec![],
                        result,
                    })),
                }],
            }],
        };
        let model = TaxModel::build(&program).unwrap();
        model.plans(crate::model::ComponentId(0)).clone()
    }

    fn standard_brackets() -> Expr {
        Expr::Brackets {
            selector: Box::new(Expr::ident("x")),
            arms: vec![
                RangeArm::literal(0.0, Some(10_000.0), Expr::number(0.10)),
                RangeArm::literal(10_000.0, Some(20_000.0), Expr::number(0.20)),
                RangeArm::literal(20_000.0, None, Expr::number(0.30)),
            ],
        }
    }

    #[test]
    fn test_bracket_plan_precomputes_bases() {
        let plans = plan_for(standard_brackets());
        let plan = plans.bracket.expect("literal schedule should plan");
        assert_eq!(plan.arms[1].base_at_lower, 1_000.0);
        assert_eq!(plan.arms[2].base_at_lower, 3_000.0);
        assert!(!plan.has_gaps);
    }

    #[test]
    fn test_bracket_plan_adjoining_arm_continuity() {
        let plans = plan_for(standard_brackets());
        let plan = plans.bracket.unwrap();
        for window in plan.arms.windows(2) {
            let below = plan.total(window[0].upper);
            assert!(
                (below - window[1].base_at_lower).abs() < 1e-9,
                "discontinuity at {}",
                window[0].upper
            );
        }
    }

    #[test]
    fn test_bracket_totals_and_marginals() {
        let plans = plan_for(standard_brackets());
        let plan = plans.bracket.unwrap();
        assert!((plan.total(25_000.0) - 4_500.0).abs() < 1e-9);
        assert!((plan.marginal(20_001.0) - 0.30).abs() < 1e-12);
        assert!((plan.marginal(9_999.0) - 0.10).abs() < 1e-12);
        // Exactly at the threshold the left-hand band wins.
        assert!((plan.marginal(10_000.0) - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_bracket_gap_reports_zero_rate() {
        let plans = plan_for(Expr::Brackets {
            selector: Box::new(Expr::ident("x")),
            arms: vec![
                RangeArm::literal(0.0, Some(5_000.0), Expr::number(0.10)),
                RangeArm::literal(8_000.0, None, Expr::number(0.20)),
            ],
        });
        let plan = plans.bracket.unwrap();
        assert!(plan.has_gaps);
        assert!(plan.marginal(6_000.0).abs() < 1e-12);
        assert!((plan.total(6_000.0) - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlapping_arms_refuse_to_plan() {
        let plans = plan_for(Expr::Brackets {
            selector: Box::new(Expr::ident("x")),
            arms: vec![
                RangeArm::literal(0.0, Some(10_000.0), Expr::number(0.10)),
                RangeArm::literal(9_000.0, None, Expr::number(0.20)),
            ],
        });
        assert!(plans.bracket.is_none());
    }

    #[test]
    fn test_non_literal_rate_refuses_to_plan() {
        let plans = plan_for(Expr::Brackets {
            selector: Box::new(Expr::ident("x")),
            arms: vec![RangeArm {
                lower: Bound::Finite(Expr::number(0.0)),
                upper: Bound::Unbounded,
                rate: Expr::binary(BinOp::Mul, Expr::number(0.1), Expr::ident("x")),
            }],
        });
        assert!(plans.bracket.is_none());
    }

    #[test]
    fn test_piece_plan_affine_extraction() {
        // piece { x <= 10000: 0; else: (x - 10000) * 0.25 }
        let plans = plan_for(Expr::Piece {
            arms: vec![crate::ast::PieceArm {
                condition: Expr::compare(CmpOp::Le, Expr::ident("x"), Expr::number(10_000.0)),
                value: Expr::number(0.0),
            }],
            default: Some(Box::new(Expr::binary(
                BinOp::Mul,
                Expr::binary(BinOp::Sub, Expr::ident("x"), Expr::number(10_000.0)),
                Expr::number(0.25),
            ))),
        });
        let plan = plans.piece.expect("affine piece should plan");
        assert_eq!(plan.else_a, 0.25);
        assert_eq!(plan.else_b, -2_500.0);
        assert!((plan.value(20_000.0) - 2_500.0).abs() < 1e-9);
        assert!((plan.marginal(10_001.0) - 0.25).abs() < 1e-12);
        assert!(plan.marginal(10_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_piece_with_quadratic_arm_refuses() {
        let plans = plan_for(Expr::Piece {
            arms: vec![crate::ast::PieceArm {
                condition: Expr::compare(CmpOp::Lt, Expr::ident("x"), Expr::number(100.0)),
                value: Expr::binary(BinOp::Mul, Expr::ident("x"), Expr::ident("x")),
            }],
            default: None,
        });
        assert!(plans.piece.is_none());
    }

    #[test]
    fn test_reversed_comparison_normalizes() {
        // 50000 >= x  ⇔  x <= 50000
        let plans = plan_for(Expr::Piece {
            arms: vec![crate::ast::PieceArm {
                condition: Expr::compare(CmpOp::Ge, Expr::number(50_000.0), Expr::ident("x")),
                value: Expr::binary(BinOp::Mul, Expr::number(0.1), Expr::ident("x")),
            }],
            default: None,
        });
        let plan = plans.piece.unwrap();
        assert_eq!(plan.arms[0].threshold, 50_000.0);
        assert!(plan.arms[0].inclusive);
        assert_eq!(plan.arms[0].a, 0.1);
    }
}
