//! Compiled-closures evaluator.
//!
//! A one-time pass converts each parse-tree node into a closure taking the
//! evaluation state, so repeated income queries skip node-kind dispatch.
//! Control flow and numeric behavior mirror the tree-walk evaluator exactly:
//! the same fixed-point loop, the same banded-integration cores, the same
//! cycle guards (which stay in the component entry points). References are
//! resolved at call time, like the walk, so reference errors still surface
//! lazily.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::ast::{BinOp, Bound, CmpOp, Expr, RangeArm};
use crate::eval::{
    apply_func, BandArm, BlockStmts, EvalError, Evaluator, ExprEval, Frame, Shared, Value,
};
use crate::model::{Component, ComponentBody, ComponentId, Country, TaxModel};

/// A compiled expression: owns its data, borrows nothing from the model.
pub type EvalFn = Rc<dyn Fn(&Evaluator, &Frame, &mut Shared) -> Result<Value, EvalError>>;

pub struct CompiledStmt {
    pub name: String,
    pub eval: EvalFn,
}

/// Lazily-populated set of compiled component bodies. Installed into the
/// shared evaluation state by `prepare`; the walk consults it before falling
/// back to parse-tree dispatch.
#[derive(Default)]
pub struct CompiledSet {
    cache: RefCell<HashMap<ComponentId, EvalFn>>,
}

impl CompiledSet {
    pub fn new() -> CompiledSet {
        CompiledSet::default()
    }

    /// Compiles every component of the prepared country up front. Components
    /// of other countries reached through references compile on first use.
    pub fn precompile_country(&self, model: &TaxModel, country: &Country) {
        for &id in &country.component_ids {
            self.get_or_compile(model.component(id));
        }
    }

    pub fn get_or_compile(&self, component: &Component) -> EvalFn {
        if let Some(hit) = self.cache.borrow().get(&component.id) {
            return Rc::clone(hit);
        }
        let compiled = compile_component(component);
        self.cache
            .borrow_mut()
            .insert(component.id, Rc::clone(&compiled));
        compiled
    }
}

fn compile_component(component: &Component) -> EvalFn {
    match &component.body {
        ComponentBody::Number(value) => {
            let constant = *value;
            Rc::new(move |_, _, _| Ok(Value::Num(constant)))
        }
        ComponentBody::Expr(expr) => compile_expr(expr),
        ComponentBody::Block(block) => {
            let stmts: Rc<Vec<CompiledStmt>> = Rc::new(
                block
                    .stmts
                    .iter()
                    .map(|stmt| CompiledStmt {
                        name: stmt.name.clone(),
                        eval: compile_expr(&stmt.value),
                    })
                    .collect(),
            );
            let result = compile_expr(&block.result);

            Rc::new(move |evaluator, frame, shared| {
                let scope = frame.scope.child();
                let block_frame = Frame {
                    country: frame.country,
                    income: frame.income,
                    scope,
                    block_stmts: Some(BlockStmts::Compiled(Rc::clone(&stmts))),
                };
                for stmt in stmts.iter() {
                    let value = (stmt.eval)(evaluator, &block_frame, shared)?;
                    block_frame.scope.define(&stmt.name, value);
                }
                result(evaluator, &block_frame, shared)
            })
        }
    }
}

pub fn compile_expr(expr: &Expr) -> EvalFn {
    match expr {
        Expr::Number(value) => {
            let constant = *value;
            Rc::new(move |_, _, _| Ok(Value::Num(constant)))
        }
        Expr::Infinity => Rc::new(|_, _, _| Ok(Value::Num(f64::INFINITY))),
        Expr::Bool(value) => {
            let constant = *value;
            Rc::new(move |_, _, _| Ok(Value::Bool(constant)))
        }
        Expr::Str(text) => {
            let literal: Rc<str> = text.as_str().into();
            Rc::new(move |_, _, _| Ok(Value::Str(Rc::clone(&literal))))
        }
        Expr::Ident(name) => {
            let name = name.clone();
            Rc::new(move |_, frame, _| {
                if let Some(value) = frame.scope.lookup(&name) {
                    return Ok(value);
                }
                if name == "x" {
                    return Ok(Value::Num(frame.income));
                }
                Err(EvalError::UnknownIdentifier(name.clone()))
            })
        }
        Expr::Neg(inner) => {
            let inner = compile_expr(inner);
            Rc::new(move |evaluator, frame, shared| {
                let value = inner(evaluator, frame, shared)?.to_number(0.0);
                Ok(Value::Num(-value))
            })
        }
        Expr::Binary { op, lhs, rhs } => {
            let op = *op;
            let lhs = compile_expr(lhs);
            let rhs = compile_expr(rhs);
            Rc::new(move |evaluator, frame, shared| {
                let left = lhs(evaluator, frame, shared)?.to_number(0.0);
                let right = rhs(evaluator, frame, shared)?.to_number(0.0);
                let value = match op {
                    BinOp::Add => left + right,
                    BinOp::Sub => left - right,
                    BinOp::Mul => left * right,
                    BinOp::Div => left / right,
                    BinOp::Pow => left.powf(right),
                };
                Ok(Value::Num(value))
            })
        }
        Expr::Compare { op, lhs, rhs } => {
            let op = *op;
            let lhs = compile_expr(lhs);
            let rhs = compile_expr(rhs);
            Rc::new(move |evaluator, frame, shared| {
                let left = lhs(evaluator, frame, shared)?.to_number(0.0);
                let right = rhs(evaluator, frame, shared)?.to_number(0.0);
                let result = match op {
                    CmpOp::Lt => left < right,
                    CmpOp::Le => left <= right,
                    CmpOp::Gt => left > right,
                    CmpOp::Ge => left >= right,
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                };
                Ok(Value::Bool(result))
            })
        }
        Expr::And(terms) => {
            let terms: Vec<EvalFn> = terms.iter().map(compile_expr).collect();
            Rc::new(move |evaluator, frame, shared| {
                let mut result = true;
                for term in &terms {
                    result = result && term(evaluator, frame, shared)?.truthy();
                    if !result {
                        break;
                    }
                }
                Ok(Value::Bool(result))
            })
        }
        Expr::Or(terms) => {
            let terms: Vec<EvalFn> = terms.iter().map(compile_expr).collect();
            Rc::new(move |evaluator, frame, shared| {
                let mut result = false;
                for term in &terms {
                    result = result || term(evaluator, frame, shared)?.truthy();
                    if result {
                        break;
                    }
                }
                Ok(Value::Bool(result))
            })
        }
        Expr::Not(inner) => {
            let inner = compile_expr(inner);
            Rc::new(move |evaluator, frame, shared| {
                let value = inner(evaluator, frame, shared)?.truthy();
                Ok(Value::Bool(!value))
            })
        }
        Expr::Ref(path) => {
            let path = path.clone();
            Rc::new(move |evaluator, frame, shared| {
                let id = evaluator.resolve_reference(frame.country, &path)?;
                let component = evaluator.model.component(id);
                let ref_frame =
                    evaluator.frame_for_country_income(frame, component.country, frame.income)?;
                Ok(Value::Num(evaluator.component_total(
                    id, &ref_frame, shared,
                )?))
            })
        }
        Expr::Eval { target, income } => {
            let target = target.clone();
            let income = compile_expr(income);
            Rc::new(move |evaluator, frame, shared| {
                let id = evaluator.resolve_reference(frame.country, &target)?;
                let income_value = income(evaluator, frame, shared)?.to_number(0.0);
                let safe_income = if income_value.is_finite() {
                    income_value
                } else {
                    0.0
                };
                Ok(Value::Num(evaluator.component_value_at_income(
                    id,
                    frame,
                    safe_income,
                    shared,
                )?))
            })
        }
        Expr::Fix { init, update } => {
            let init = compile_expr(init);
            let update = compile_expr(update);
            Rc::new(move |evaluator, frame, shared| {
                let init_value = init(evaluator, frame, shared)?.to_number(0.0);
                let update = Rc::clone(&update);
                evaluator.run_fix(
                    init_value,
                    &move |e: &Evaluator, f: &Frame, s: &mut Shared| update(e, f, s),
                    frame,
                    shared,
                )
            })
        }
        Expr::Call { func, args } => {
            let func = *func;
            let args: Vec<EvalFn> = args.iter().map(compile_expr).collect();
            Rc::new(move |evaluator, frame, shared| {
                let mut values: SmallVec<[Value; 4]> = SmallVec::with_capacity(args.len());
                for arg in &args {
                    values.push(arg(evaluator, frame, shared)?);
                }
                Ok(apply_func(func, &values))
            })
        }
        Expr::Piece { arms, default } => {
            let arms: Vec<(EvalFn, EvalFn)> = arms
                .iter()
                .map(|arm| (compile_expr(&arm.condition), compile_expr(&arm.value)))
                .collect();
            let default = default.as_deref().map(compile_expr);
            Rc::new(move |evaluator, frame, shared| {
                for (condition, value) in &arms {
                    if condition(evaluator, frame, shared)?.truthy() {
                        return value(evaluator, frame, shared);
                    }
                }
                match &default {
                    Some(value) => value(evaluator, frame, shared),
                    None => Ok(Value::Num(0.0)),
                }
            })
        }
        Expr::Brackets { selector, arms } => {
            let selector = compile_expr(selector);
            let arms = compile_arms(arms);
            Rc::new(move |evaluator, frame, shared| {
                let selector_eval = adapt(&selector);
                let band_arms = adapt_arms(&arms);
                evaluator.eval_brackets_with(frame, shared, &selector_eval, &band_arms)
            })
        }
        Expr::BracketsTaxable {
            income,
            allowance,
            allowance_base,
            arms,
        } => {
            let income = compile_expr(income);
            let allowance = compile_expr(allowance);
            let allowance_base = compile_expr(allowance_base);
            let arms = compile_arms(arms);
            Rc::new(move |evaluator, frame, shared| {
                let income_eval = adapt(&income);
                let allowance_eval = adapt(&allowance);
                let base_eval = adapt(&allowance_base);
                let band_arms = adapt_arms(&arms);
                evaluator.eval_brackets_taxable_with(
                    frame,
                    shared,
                    &income_eval,
                    &allowance_eval,
                    &base_eval,
                    &band_arms,
                )
            })
        }
    }
}

struct CompiledArm {
    lower: EvalFn,
    upper: EvalFn,
    rate: EvalFn,
}

fn compile_arms(arms: &[RangeArm]) -> Vec<CompiledArm> {
    arms.iter()
        .map(|arm| CompiledArm {
            lower: compile_bound(&arm.lower),
            upper: compile_bound(&arm.upper),
            rate: compile_expr(&arm.rate),
        })
        .collect()
}

fn compile_bound(bound: &Bound) -> EvalFn {
    match bound {
        Bound::Unbounded => Rc::new(|_, _, _| Ok(Value::Num(f64::INFINITY))),
        Bound::Finite(expr) => compile_expr(expr),
    }
}

/// Bridges an owned compiled closure into the walker's borrowed evaluator
/// type so both backends share the banded cores.
fn adapt(eval: &EvalFn) -> ExprEval<'_> {
    Box::new(move |e, f, s| eval(e, f, s))
}

fn adapt_arms(arms: &[CompiledArm]) -> Vec<BandArm<'_>> {
    arms.iter()
        .map(|arm| BandArm {
            lower: adapt(&arm.lower),
            upper: adapt(&arm.upper),
            rate: adapt(&arm.rate),
        })
        .collect()
}
