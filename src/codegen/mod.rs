//! The code generator: builds a specialized, self-contained evaluator for one
//! prepared (country, schedule set, currency) context.
//!
//! Where the reference evaluator walks the parse tree, the specialized
//! program is an IR interpreted by a flat dispatch loop, with reachability
//! pruning, closed-form bracket arms, symbolic dual-number derivatives,
//! Newton-assisted warm-started fixed points, per-component one-slot caches,
//! and cycle guards only when the dependency graph could not rule cycles out.
//!
//! Building can fail — unresolved references, cross-country calls, shapes the
//! lowering does not express. That is never an error for the caller: the
//! prepared evaluator falls back to the compiled-closures backend.

mod ir;
mod lower;

pub use ir::SpecializedProgram;
pub use lower::CodegenError;

use crate::currency::CurrencyTable;
use crate::model::{ComponentId, Country, TaxModel};

/// Attempts to specialize. `source_to_country` converts caller incomes into
/// the country currency and is baked into the program.
pub fn build_program(
    model: &TaxModel,
    currencies: &CurrencyTable,
    country: &Country,
    active: &[ComponentId],
    source_to_country: f64,
) -> Result<SpecializedProgram, CodegenError> {
    lower::Builder::build(model, currencies, country, active, source_to_country)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        BinOp, Block, CmpOp, ComponentBody as AstBody, ComponentDef, CountryBlock, CurrencyDecl,
        Expr, PieceArm, Program, RangeArm, Stmt, Wrapper,
    };
    use crate::eval::{Evaluator, Shared};
    use crate::model::CountryId;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn build_fixture(components: Vec<(&str, &str, Vec<Stmt>, Expr)>) -> (TaxModel, CurrencyTable) {
        let defs = components
            .into_iter()
            .map(|(name, kind, stmts, result)| ComponentDef {
                name: name.to_string(),
                kind: Some(kind.to_string()),
                wrapper: Wrapper::Total,
                body: AstBody::Block(Rc::new(Block { stmts, result })),
            })
            .collect();
        let program = Program {
            countries: vec![CountryBlock {
                name: "Testland".to_string(),
                currency: Some(CurrencyDecl::Bare("EUR".to_string())),
                components: defs,
            }],
        };
        let model = TaxModel::build(&program).unwrap();
        let mut table = CurrencyTable::from_conversions(&HashMap::new()).unwrap();
        model.seed_currency_table(&mut table).unwrap();
        (model, table)
    }

    fn assert_program_matches_walk(
        model: &TaxModel,
        table: &CurrencyTable,
        incomes: &[f64],
        marginal_epsilon: f64,
    ) {
        let country = model.country_by_key("testland").unwrap();
        let active: Vec<ComponentId> = country
            .component_ids
            .iter()
            .copied()
            .filter(|&id| model.component(id).kind_key != "_")
            .collect();
        let program = build_program(model, table, country, &active, 1.0)
            .expect("fixture should specialize");

        let evaluator = Evaluator::new(model, table);
        for &income in incomes {
            let frame = evaluator.frame_for(CountryId(0), income);
            let mut shared = Shared::new();
            let mut walk_marginal = 0.0;
            let mut walk_total = 0.0;
            for &id in &active {
                walk_marginal += evaluator.component_marginal(id, &frame, &mut shared).unwrap();
                walk_total += evaluator.component_total(id, &frame, &mut shared).unwrap();
            }
            let walk_overall = if income <= 0.0 {
                0.0
            } else {
                walk_total / income
            };

            let generated_marginal = program.marginal_rate(income).unwrap();
            let generated_overall = program.overall_rate(income).unwrap();

            assert!(
                (walk_marginal - generated_marginal).abs() < marginal_epsilon,
                "marginal at {income}: walk {walk_marginal} vs generated {generated_marginal}"
            );
            assert!(
                (walk_overall - generated_overall).abs() < 1e-6,
                "overall at {income}: walk {walk_overall} vs generated {generated_overall}"
            );
        }
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
    fn test_bracket_schedule_specializes_exactly() {
        let (model, table) = build_fixture(vec![("Tax", "income_tax", vec![], standard_brackets())]);
        let country = model.country_by_key("testland").unwrap();
        let active = country.component_ids.clone();
        let program = build_program(&model, &table, country, &active, 1.0).unwrap();

        assert!((program.overall_rate(25_000.0).unwrap() * 25_000.0 - 4_500.0).abs() < 1e-9);
        assert!((program.marginal_rate(20_001.0).unwrap() - 0.30).abs() < 1e-12);
        assert!((program.marginal_rate(9_999.0).unwrap() - 0.10).abs() < 1e-12);
        assert_eq!(program.marginal_rate(-5.0).unwrap(), 0.0);
        assert_eq!(program.overall_rate(0.0).unwrap(), 0.0);
    }

    #[test]
    fn test_symbolic_marginal_through_locals_and_reference() {
        // Base:  brackets over x (closed form).
        // Surtax: depends on Base through T(..), plus a smooth term.
        let surtax = Expr::binary(
            BinOp::Add,
            Expr::binary(BinOp::Mul, Expr::number(0.01), Expr::reference(&["Base"])),
            Expr::binary(
                BinOp::Div,
                Expr::binary(BinOp::Mul, Expr::ident("x"), Expr::ident("x")),
                Expr::number(1_000_000.0),
            ),
        );
        let (model, table) = build_fixture(vec![
            ("Base", "income_tax", vec![], standard_brackets()),
            ("Surtax", "surtax", vec![], surtax),
        ]);
        // Symbolic derivative vs the oracle's finite differences: loose bound.
        assert_program_matches_walk(&model, &table, &[0.0, 9_999.0, 25_000.0, 80_000.0], 1e-3);
    }

    #[test]
    fn test_fix_statement_with_newton_and_warm_start() {
        // K = fix(0, 0.5*(k + x*0.2)); K  — fixed point K = 0.2·x, so the
        // marginal must converge to 0.2 via the implicit-function rule.
        let stmts = vec![Stmt {
            name: "K".to_string(),
            value: Expr::Fix {
                init: Box::new(Expr::number(0.0)),
                update: Box::new(Expr::binary(
                    BinOp::Mul,
                    Expr::number(0.5),
                    Expr::binary(
                        BinOp::Add,
                        Expr::ident("k"),
                        Expr::binary(BinOp::Mul, Expr::ident("x"), Expr::number(0.2)),
                    ),
                )),
            },
        }];
        let (model, table) =
            build_fixture(vec![("Solidarity", "income_tax", stmts, Expr::ident("K"))]);
        let country = model.country_by_key("testland").unwrap();
        let active = country.component_ids.clone();
        let program = build_program(&model, &table, country, &active, 1.0).unwrap();

        // Sweep: the warm start must not change converged answers.
        for income in [10_000.0, 10_100.0, 10_200.0, 50_000.0, 10_000.0] {
            let total = program.overall_rate(income).unwrap() * income;
            assert!(
                (total - 0.2 * income).abs() < 1e-4,
                "income {income}: total {total}"
            );
            let marginal = program.marginal_rate(income).unwrap();
            assert!(
                (marginal - 0.2).abs() < 1e-6,
                "income {income}: marginal {marginal}"
            );
        }
    }

    #[test]
    fn test_piecewise_affine_closed_form() {
        let piece = Expr::Piece {
            arms: vec![PieceArm {
                condition: Expr::compare(CmpOp::Le, Expr::ident("x"), Expr::number(12_500.0)),
                value: Expr::number(0.0),
            }],
            default: Some(Box::new(Expr::binary(
                BinOp::Mul,
                Expr::binary(BinOp::Sub, Expr::ident("x"), Expr::number(12_500.0)),
                Expr::number(0.09),
            ))),
        };
        let (model, table) = build_fixture(vec![("Loan", "loan_repayment", vec![], piece)]);
        assert_program_matches_walk(
            &model,
            &table,
            &[0.0, 12_500.0, 12_501.0, 40_000.0],
            1e-9,
        );
    }

    #[test]
    fn test_cycle_guards_surface_circularity() {
        let (model, table) = build_fixture(vec![
            ("A", "income_tax", vec![], Expr::reference(&["B"])),
            ("B", "income_tax", vec![], Expr::reference(&["A"])),
        ]);
        let country = model.country_by_key("testland").unwrap();
        let active = country.component_ids.clone();
        let program = build_program(&model, &table, country, &active, 1.0).unwrap();
        let err = program.overall_rate(10_000.0).unwrap_err();
        assert!(matches!(
            err,
            crate::eval::EvalError::CircularReference(_)
        ));
    }

    #[test]
    fn test_unreachable_components_are_pruned() {
        let (model, table) = build_fixture(vec![
            ("Tax", "income_tax", vec![], standard_brackets()),
            ("Dead", "other", vec![], Expr::number(123.0)),
        ]);
        let country = model.country_by_key("testland").unwrap();
        // Only the income tax is active; "Dead" must not be emitted.
        let active = vec![country.component_ids[0]];
        let program = build_program(&model, &table, country, &active, 1.0).unwrap();
        assert_eq!(program.component_count(), 1);
    }

    #[test]
    fn test_currency_factor_is_baked_in() {
        let (model, table) = build_fixture(vec![("Tax", "income_tax", vec![], standard_brackets())]);
        let country = model.country_by_key("testland").unwrap();
        let active = country.component_ids.clone();
        // Caller currency worth half a unit of country currency.
        let program = build_program(&model, &table, country, &active, 0.5).unwrap();
        // 50k source = 25k local → total 4500 over local income.
        let overall = program.overall_rate(50_000.0).unwrap();
        assert!((overall * 25_000.0 - 4_500.0).abs() < 1e-9);
    }
}
