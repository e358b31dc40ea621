//! The tree-walking evaluator.
//!
//! Reference semantics for the whole DSL: always available, always correct,
//! and the oracle the compiled backends must match. The walk is a recursive
//! DFS over the parse tree with an explicit re-entrancy guard for component
//! references and a per-request memo.
//!
//! The banded-schedule cores (`eval_brackets_with`,
//! `eval_brackets_taxable_with`) are generic over how sub-expressions are
//! evaluated, so the compiled-closure backend shares them verbatim instead of
//! re-implementing the numerically delicate parts.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::ast::{BinOp, Block, Bound, CmpOp, Expr, PieceArm, RangeArm, RefPath};
use crate::currency::CurrencyTable;
use crate::model::{ComponentBody, ComponentId, CountryId, TaxModel};
use crate::numeric::{
    clamp_fix, integrate_midpoint, FIX_ABSOLUTE_TOLERANCE, FIX_MAX_ITERATIONS,
    FIX_RELATIVE_TOLERANCE, MIN_DERIVATIVE_STEP,
};

use super::{apply_func, BlockStmts, EvalError, Frame, Mode, Scope, Shared, Value};

/// Evaluates a sub-expression in a frame; adapters exist for parse-tree nodes
/// and for compiled closures.
pub type ExprEval<'a> = Box<dyn Fn(&Evaluator, &Frame, &mut Shared) -> Result<Value, EvalError> + 'a>;

/// A band arm with its bound and rate evaluators.
pub struct BandArm<'a> {
    pub lower: ExprEval<'a>,
    pub upper: ExprEval<'a>,
    pub rate: ExprEval<'a>,
}

pub struct Evaluator<'m> {
    pub model: &'m TaxModel,
    pub currencies: &'m CurrencyTable,
}

impl<'m> Evaluator<'m> {
    pub fn new(model: &'m TaxModel, currencies: &'m CurrencyTable) -> Self {
        Self { model, currencies }
    }

    /// A fresh frame for a country with income already in that currency.
    pub fn frame_for(&self, country: CountryId, local_income: f64) -> Frame {
        Frame {
            country,
            income: local_income,
            scope: Scope::root(local_income),
            block_stmts: None,
        }
    }

    // --- Component entry points ---

    pub fn component_marginal(
        &self,
        id: ComponentId,
        frame: &Frame,
        shared: &mut Shared,
    ) -> Result<f64, EvalError> {
        self.guarded(id, Mode::Marginal, frame.income, shared, |this, shared| {
            let plans = this.model.plans(id);
            if let Some(plan) = &plans.bracket {
                return Ok(plan.marginal(frame.income));
            }
            if let Some(plan) = &plans.piece {
                return Ok(plan.marginal(frame.income));
            }
            this.left_derivative(id, frame, frame.income, shared)
        })
    }

    pub fn component_total(
        &self,
        id: ComponentId,
        frame: &Frame,
        shared: &mut Shared,
    ) -> Result<f64, EvalError> {
        self.guarded(id, Mode::Total, frame.income, shared, |this, shared| {
            if frame.income <= 0.0 {
                return Ok(0.0);
            }
            let plans = this.model.plans(id);
            if let Some(plan) = &plans.bracket {
                return Ok(plan.total(frame.income));
            }
            if let Some(plan) = &plans.piece {
                return Ok(plan.value(frame.income));
            }
            this.component_value_at_income(id, frame, frame.income, shared)
        })
    }

    /// A component's body value at an explicit income, converting the income
    /// into the component's country first when the reference crosses borders.
    pub fn component_value_at_income(
        &self,
        id: ComponentId,
        frame: &Frame,
        local_income: f64,
        shared: &mut Shared,
    ) -> Result<f64, EvalError> {
        let component = self.model.component(id);
        let next = self.frame_for_country_income(frame, component.country, local_income)?;

        let plans = self.model.plans(id);
        if let Some(plan) = &plans.bracket {
            return Ok(plan.total(next.income));
        }
        if let Some(plan) = &plans.piece {
            return Ok(plan.value(next.income));
        }

        self.guarded_value(id, shared, |this, shared| {
            if let Some(set) = shared.compiled.clone() {
                let compiled = set.get_or_compile(component);
                let value = compiled(this, &next, shared)?;
                return Ok(value.to_number(0.0));
            }

            match &component.body {
                ComponentBody::Number(value) => Ok(*value),
                ComponentBody::Expr(expr) => {
                    Ok(this.eval_expr(expr, &next, shared)?.to_number(0.0))
                }
                ComponentBody::Block(block) => {
                    Ok(this.eval_block(block, &next, shared)?.to_number(0.0))
                }
            }
        })
    }

    /// Re-entrancy guard plus per-income memo for the marginal/total modes.
    fn guarded<F>(
        &self,
        id: ComponentId,
        mode: Mode,
        income: f64,
        shared: &mut Shared,
        body: F,
    ) -> Result<f64, EvalError>
    where
        F: FnOnce(&Self, &mut Shared) -> Result<f64, EvalError>,
    {
        let memo_key = (id, mode, income.to_bits());
        if let Some(&hit) = shared.memo.get(&memo_key) {
            return Ok(hit);
        }

        let guard_key = (id, mode);
        if shared.call_stack.contains(&guard_key) {
            return Err(EvalError::CircularReference(self.model.component_label(id)));
        }

        shared.call_stack.insert(guard_key);
        let result = body(self, shared);
        shared.call_stack.remove(&guard_key);

        if let Ok(value) = &result {
            shared.memo.insert(memo_key, *value);
        }
        result
    }

    /// Guard-only variant for the value mode: `eval` chains must not recurse
    /// into themselves, but value queries at varying incomes are not memoized.
    fn guarded_value<F>(
        &self,
        id: ComponentId,
        shared: &mut Shared,
        body: F,
    ) -> Result<f64, EvalError>
    where
        F: FnOnce(&Self, &mut Shared) -> Result<f64, EvalError>,
    {
        let guard_key = (id, Mode::Value);
        if shared.call_stack.contains(&guard_key) {
            return Err(EvalError::CircularReference(self.model.component_label(id)));
        }
        shared.call_stack.insert(guard_key);
        let result = body(self, shared);
        shared.call_stack.remove(&guard_key);
        result
    }

    /// Left-hand finite difference of the component value (forward at 0).
    fn left_derivative(
        &self,
        id: ComponentId,
        frame: &Frame,
        x: f64,
        shared: &mut Shared,
    ) -> Result<f64, EvalError> {
        if !x.is_finite() || x < 0.0 {
            return Ok(0.0);
        }

        let h = MIN_DERIVATIVE_STEP;
        let value_at_x = self.component_value_at_income(id, frame, x, shared)?;

        if x > 0.0 {
            let lower = (x - h).max(0.0);
            if x <= lower {
                return Ok(0.0);
            }
            let value_at_lower = self.component_value_at_income(id, frame, lower, shared)?;
            return Ok((value_at_x - value_at_lower) / (x - lower));
        }

        let upper = x + h;
        let value_at_upper = self.component_value_at_income(id, frame, upper, shared)?;
        Ok((value_at_upper - value_at_x) / (upper - x))
    }

    /// Rebinds the frame to a country, converting the income between the two
    /// currencies when the countries differ.
    pub fn frame_for_country_income(
        &self,
        frame: &Frame,
        target: CountryId,
        local_income: f64,
    ) -> Result<Frame, EvalError> {
        let mut income = local_income;
        if frame.country != target {
            let from = self.model.country(frame.country);
            let to = self.model.country(target);
            income = self
                .currencies
                .conversion_factor(&from.currency_key, &to.currency_key)
                .map(|factor| local_income * factor)
                .ok_or_else(|| EvalError::MissingConversion {
                    from: from.currency_key.clone(),
                    to: to.currency_key.clone(),
                })?;
        }
        Ok(self.frame_for(target, income))
    }

    /// Child frame with `x` rebound to an integration point.
    pub fn frame_with_local_x(&self, frame: &Frame, x: f64) -> Frame {
        let safe = if x.is_finite() { x } else { 0.0 };
        let scope = frame.scope.child();
        scope.define("x", Value::Num(safe));
        Frame {
            country: frame.country,
            income: safe,
            scope,
            block_stmts: frame.block_stmts.clone(),
        }
    }

    /// Like [`Self::frame_with_local_x`] but additionally re-runs the
    /// enclosing block's statements at the new income, so an allowance
    /// expression reading block locals sees values consistent with it.
    pub fn frame_with_recomputed_locals(
        &self,
        frame: &Frame,
        x: f64,
        shared: &mut Shared,
    ) -> Result<Frame, EvalError> {
        let next = self.frame_with_local_x(frame, x);
        match frame.block_stmts.clone() {
            Some(BlockStmts::Ast(block)) => {
                for stmt in &block.stmts {
                    let value = self.eval_expr(&stmt.value, &next, shared)?;
                    next.scope.define(&stmt.name, value);
                }
            }
            Some(BlockStmts::Compiled(stmts)) => {
                for stmt in stmts.iter() {
                    let value = (stmt.eval)(self, &next, shared)?;
                    next.scope.define(&stmt.name, value);
                }
            }
            None => {}
        }
        Ok(next)
    }

    // --- Expression evaluation ---

    pub fn eval_block(
        &self,
        block: &std::rc::Rc<Block>,
        frame: &Frame,
        shared: &mut Shared,
    ) -> Result<Value, EvalError> {
        let scope = frame.scope.child();
        let block_frame = Frame {
            country: frame.country,
            income: frame.income,
            scope,
            block_stmts: Some(BlockStmts::Ast(std::rc::Rc::clone(block))),
        };

        for stmt in &block.stmts {
            let value = self.eval_expr(&stmt.value, &block_frame, shared)?;
            block_frame.scope.define(&stmt.name, value);
        }

        self.eval_expr(&block.result, &block_frame, shared)
    }

    pub fn eval_expr(
        &self,
        expr: &Expr,
        frame: &Frame,
        shared: &mut Shared,
    ) -> Result<Value, EvalError> {
        match expr {
            Expr::Number(value) => Ok(Value::Num(*value)),
            Expr::Infinity => Ok(Value::Num(f64::INFINITY)),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::Str(text) => Ok(Value::Str(text.as_str().into())),
            Expr::Ident(name) => self.resolve_identifier(name, frame),
            Expr::Neg(inner) => {
                let value = self.eval_expr(inner, frame, shared)?.to_number(0.0);
                Ok(Value::Num(-value))
            }
            Expr::Binary { op, lhs, rhs } => {
                let left = self.eval_expr(lhs, frame, shared)?.to_number(0.0);
                let right = self.eval_expr(rhs, frame, shared)?.to_number(0.0);
                let value = match op {
                    BinOp::Add => left + right,
                    BinOp::Sub => left - right,
                    BinOp::Mul => left * right,
                    BinOp::Div => left / right,
                    BinOp::Pow => left.powf(right),
                };
                Ok(Value::Num(value))
            }
            Expr::Compare { op, lhs, rhs } => {
                let left = self.eval_expr(lhs, frame, shared)?.to_number(0.0);
                let right = self.eval_expr(rhs, frame, shared)?.to_number(0.0);
                let result = match op {
                    CmpOp::Lt => left < right,
                    CmpOp::Le => left <= right,
                    CmpOp::Gt => left > right,
                    CmpOp::Ge => left >= right,
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                };
                Ok(Value::Bool(result))
            }
            Expr::And(terms) => {
                let mut result = true;
                for term in terms {
                    result = result && self.eval_expr(term, frame, shared)?.truthy();
                    if !result {
                        break;
                    }
                }
                Ok(Value::Bool(result))
            }
            Expr::Or(terms) => {
                let mut result = false;
                for term in terms {
                    result = result || self.eval_expr(term, frame, shared)?.truthy();
                    if result {
                        break;
                    }
                }
                Ok(Value::Bool(result))
            }
            Expr::Not(inner) => {
                let value = self.eval_expr(inner, frame, shared)?.truthy();
                Ok(Value::Bool(!value))
            }
            Expr::Ref(path) => {
                let id = self.resolve_reference(frame.country, path)?;
                let component = self.model.component(id);
                let ref_frame =
                    self.frame_for_country_income(frame, component.country, frame.income)?;
                Ok(Value::Num(self.component_total(id, &ref_frame, shared)?))
            }
            Expr::Eval { target, income } => {
                let id = self.resolve_reference(frame.country, target)?;
                let income_value = self.eval_expr(income, frame, shared)?.to_number(0.0);
                let safe_income = if income_value.is_finite() {
                    income_value
                } else {
                    0.0
                };
                Ok(Value::Num(self.component_value_at_income(
                    id,
                    frame,
                    safe_income,
                    shared,
                )?))
            }
            Expr::Fix { init, update } => {
                let run_update = |this: &Self, f: &Frame, s: &mut Shared| this.eval_expr(update, f, s);
                let init_value = self.eval_expr(init, frame, shared)?.to_number(0.0);
                self.run_fix(init_value, &run_update, frame, shared)
            }
            Expr::Call { func, args } => {
                let mut values: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg, frame, shared)?);
                }
                Ok(apply_func(*func, &values))
            }
            Expr::Piece { arms, default } => {
                self.eval_piece(arms, default.as_deref(), frame, shared)
            }
            Expr::Brackets { selector, arms } => {
                let selector_eval: ExprEval = Box::new(|e, f, s| e.eval_expr(selector, f, s));
                let band_arms = ast_band_arms(arms);
                self.eval_brackets_with(frame, shared, &selector_eval, &band_arms)
            }
            Expr::BracketsTaxable {
                income,
                allowance,
                allowance_base,
                arms,
            } => {
                let income_eval: ExprEval = Box::new(|e, f, s| e.eval_expr(income, f, s));
                let allowance_eval: ExprEval = Box::new(|e, f, s| e.eval_expr(allowance, f, s));
                let base_eval: ExprEval = Box::new(|e, f, s| e.eval_expr(allowance_base, f, s));
                let band_arms = ast_band_arms(arms);
                self.eval_brackets_taxable_with(
                    frame,
                    shared,
                    &income_eval,
                    &allowance_eval,
                    &base_eval,
                    &band_arms,
                )
            }
        }
    }

    fn resolve_identifier(&self, name: &str, frame: &Frame) -> Result<Value, EvalError> {
        if let Some(value) = frame.scope.lookup(name) {
            return Ok(value);
        }
        if name == "x" {
            return Ok(Value::Num(frame.income));
        }
        Err(EvalError::UnknownIdentifier(name.to_string()))
    }

    /// The damped fixed-point loop shared by the walk and closure backends.
    /// Non-convergence silently returns the last iterate.
    pub fn run_fix(
        &self,
        init_value: f64,
        update: &dyn Fn(&Self, &Frame, &mut Shared) -> Result<Value, EvalError>,
        frame: &Frame,
        shared: &mut Shared,
    ) -> Result<Value, EvalError> {
        let scope = frame.scope.child();
        let fix_frame = Frame {
            country: frame.country,
            income: frame.income,
            scope,
            block_stmts: frame.block_stmts.clone(),
        };

        let mut current = clamp_fix(init_value);
        for _ in 0..FIX_MAX_ITERATIONS {
            fix_frame.scope.define("k", Value::Num(current));
            let next_raw = update(self, &fix_frame, shared)?;
            let next = clamp_fix(next_raw.to_number(current));

            let delta = (next - current).abs();
            let scale = current.abs().max(next.abs()).max(1.0);
            if delta <= FIX_ABSOLUTE_TOLERANCE + FIX_RELATIVE_TOLERANCE * scale {
                return Ok(Value::Num(next));
            }
            current = next;
        }

        Ok(Value::Num(current))
    }

    fn eval_piece(
        &self,
        arms: &[PieceArm],
        default: Option<&Expr>,
        frame: &Frame,
        shared: &mut Shared,
    ) -> Result<Value, EvalError> {
        for arm in arms {
            if self.eval_expr(&arm.condition, frame, shared)?.truthy() {
                return self.eval_expr(&arm.value, frame, shared);
            }
        }
        match default {
            Some(expr) => self.eval_expr(expr, frame, shared),
            None => Ok(Value::Num(0.0)),
        }
    }

    // --- Shared banded-schedule cores ---

    /// `brackets(selector; [a..b]: rate; ...)` — the integral of the banded
    /// rate function from 0 to the selector. Evaluation stops once the
    /// selector's band is covered.
    pub fn eval_brackets_with(
        &self,
        frame: &Frame,
        shared: &mut Shared,
        selector: &ExprEval,
        arms: &[BandArm],
    ) -> Result<Value, EvalError> {
        let selector = selector(self, frame, shared)?.to_number(0.0);
        if !selector.is_finite() || selector <= 0.0 {
            return Ok(Value::Num(0.0));
        }

        let mut total = 0.0;
        for arm in arms {
            let lower = (arm.lower)(self, frame, shared)?.to_number(0.0);
            let upper = (arm.upper)(self, frame, shared)?.to_number(0.0);

            if !lower.is_finite() || upper.is_nan() {
                continue;
            }
            if selector <= lower {
                continue;
            }
            let segment_upper = selector.min(upper);
            if segment_upper <= lower {
                continue;
            }

            total += self.integrate_banded(frame, shared, lower, segment_upper, &arm.rate)?;

            if selector <= upper {
                break;
            }
        }

        Ok(Value::Num(total))
    }

    /// `bracketsTaxable(income, allowance, allowanceBase; arms...)` — bracket
    /// integral over income reduced by a tapering allowance. Band boundaries
    /// are each reduced by the allowance at that boundary's gross income,
    /// capped at the base; this supports allowances that depend on income.
    pub fn eval_brackets_taxable_with(
        &self,
        frame: &Frame,
        shared: &mut Shared,
        income: &ExprEval,
        allowance: &ExprEval,
        allowance_base: &ExprEval,
        arms: &[BandArm],
    ) -> Result<Value, EvalError> {
        let income = income(self, frame, shared)?.to_number(0.0);
        let allowance_now = allowance(self, frame, shared)?.to_number(0.0);
        let base = allowance_base(self, frame, shared)?.to_number(0.0);
        let cap = if base.is_finite() {
            base.max(0.0)
        } else {
            f64::INFINITY
        };

        let selector = (income - allowance_now).max(0.0);
        if !selector.is_finite() || selector <= 0.0 {
            return Ok(Value::Num(0.0));
        }

        let mut allowance_memo: HashMap<u64, f64> = HashMap::new();
        let mut allowance_at =
            |this: &Self, gross: f64, shared: &mut Shared| -> Result<f64, EvalError> {
                if !gross.is_finite() {
                    return Ok(0.0);
                }
                if let Some(&hit) = allowance_memo.get(&gross.to_bits()) {
                    return Ok(hit);
                }
                let bound_frame = this.frame_with_recomputed_locals(frame, gross, shared)?;
                let raw = allowance(this, &bound_frame, shared)?.to_number(0.0);
                let value = if raw.is_finite() {
                    raw.max(0.0).min(cap)
                } else {
                    0.0
                };
                allowance_memo.insert(gross.to_bits(), value);
                Ok(value)
            };

        let mut total = 0.0;
        for arm in arms {
            let lower_gross = (arm.lower)(self, frame, shared)?.to_number(0.0);
            let upper_gross = (arm.upper)(self, frame, shared)?.to_number(0.0);

            let lower = lower_gross - allowance_at(self, lower_gross, shared)?;
            let upper = if upper_gross == f64::INFINITY {
                f64::INFINITY
            } else {
                upper_gross - allowance_at(self, upper_gross, shared)?
            };

            if !lower.is_finite() || upper.is_nan() {
                continue;
            }
            if selector <= lower {
                continue;
            }
            let segment_upper = selector.min(upper);
            if segment_upper <= lower {
                continue;
            }

            total += self.integrate_banded(frame, shared, lower, segment_upper, &arm.rate)?;

            if selector <= upper {
                break;
            }
        }

        Ok(Value::Num(total))
    }

    fn integrate_banded(
        &self,
        frame: &Frame,
        shared: &mut Shared,
        lower: f64,
        upper: f64,
        rate: &ExprEval,
    ) -> Result<f64, EvalError> {
        let mut first_error: Option<EvalError> = None;
        let total = integrate_midpoint(
            |x_point| {
                if first_error.is_some() {
                    return 0.0;
                }
                let x_frame = self.frame_with_local_x(frame, x_point);
                match rate(self, &x_frame, shared) {
                    Ok(value) => value.to_number(0.0),
                    Err(err) => {
                        first_error = Some(err);
                        0.0
                    }
                }
            },
            lower,
            upper,
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    // --- Reference resolution ---

    pub fn resolve_reference(
        &self,
        current: CountryId,
        path: &RefPath,
    ) -> Result<ComponentId, EvalError> {
        self.model
            .resolve_reference(current, path)
            .map_err(|failure| match failure {
                crate::model::RefFailure::Unknown => EvalError::UnknownReference(path.joined()),
                crate::model::RefFailure::Ambiguous => EvalError::AmbiguousReference(path.joined()),
                crate::model::RefFailure::UnknownCountry => EvalError::UnknownCountry(path.joined()),
            })
    }
}

/// Adapts parse-tree band arms to the evaluator-based core.
fn ast_band_arms(arms: &[RangeArm]) -> Vec<BandArm<'_>> {
    arms.iter()
        .map(|arm| BandArm {
            lower: bound_eval(&arm.lower),
            upper: bound_eval(&arm.upper),
            rate: Box::new(move |e, f, s| e.eval_expr(&arm.rate, f, s)),
        })
        .collect()
}

fn bound_eval(bound: &Bound) -> ExprEval<'_> {
    match bound {
        Bound::Unbounded => Box::new(|_, _, _| Ok(Value::Num(f64::INFINITY))),
        Bound::Finite(expr) => Box::new(move |e, f, s| e.eval_expr(expr, f, s)),
    }
}
