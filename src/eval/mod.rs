//! Evaluation state and the dynamic value type shared by the tree-walk and
//! compiled-closure backends.

mod walker;

pub use walker::{BandArm, Evaluator, ExprEval};

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use thiserror::Error;

use crate::ast::Block;
use crate::compile::CompiledSet;
use crate::model::ComponentId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Unknown country: {0}")]
    UnknownCountry(String),
    #[error("Unknown reference: {0}")]
    UnknownReference(String),
    #[error("Ambiguous reference: {0}")]
    AmbiguousReference(String),
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("Circular component reference detected: {0}")]
    CircularReference(String),
    #[error("Missing currency conversion for {from} -> {to}")]
    MissingConversion { from: String, to: String },
    #[error("gross income must be a finite number")]
    NonFiniteIncome,
    #[error("enabled schedules cannot include \"_\" (internal helper kind)")]
    ReservedKindEnabled,
}

/// Runtime value of a specification expression. Arithmetic coerces through
/// [`Value::to_number`]; conditionals through [`Value::truthy`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(Rc<str>),
}

impl Value {
    /// Permissive numeric coercion: booleans count 1/0, NaN and unparsable
    /// text fall back, infinities pass through (open bracket bounds).
    pub fn to_number(&self, fallback: f64) -> f64 {
        match self {
            Value::Num(n) => {
                if n.is_nan() {
                    fallback
                } else {
                    *n
                }
            }
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return 0.0;
                }
                match trimmed.parse::<f64>() {
                    Ok(v) if !v.is_nan() => v,
                    _ => fallback,
                }
            }
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

/// Applies one of the DSL's numeric primitives to already-evaluated
/// arguments. Missing arguments read as 0; `min`/`max` fold over all
/// arguments; rounding takes an optional increment (default 1).
pub fn apply_func(func: crate::ast::Func, values: &[Value]) -> Value {
    use crate::ast::Func;
    use crate::numeric::{ceil_to_step, floor_to_step, round_to_step};

    let num = |index: usize| -> f64 { values.get(index).map(|v| v.to_number(0.0)).unwrap_or(0.0) };

    let result = match func {
        Func::Min => values
            .iter()
            .map(|v| v.to_number(0.0))
            .fold(f64::INFINITY, f64::min),
        Func::Max => values
            .iter()
            .map(|v| v.to_number(0.0))
            .fold(f64::NEG_INFINITY, f64::max),
        Func::Abs => num(0).abs(),
        Func::Pow => num(0).powf(num(1)),
        Func::Sqrt => num(0).sqrt(),
        Func::Log => num(0).ln(),
        Func::Exp => num(0).exp(),
        Func::Floor => floor_to_step(num(0), if values.len() > 1 { num(1) } else { 1.0 }),
        Func::Ceil => ceil_to_step(num(0), if values.len() > 1 { num(1) } else { 1.0 }),
        Func::Round => round_to_step(num(0), if values.len() > 1 { num(1) } else { 1.0 }),
        Func::Sum => values.iter().map(|v| v.to_number(0.0)).sum(),
        Func::If => {
            if values.len() < 2 {
                0.0
            } else if values[0].truthy() {
                return values[1].clone();
            } else if let Some(other) = values.get(2) {
                return other.clone();
            } else {
                0.0
            }
        }
        Func::Pos => num(0).max(0.0),
    };
    Value::Num(result)
}

/// Evaluation mode, also the re-entrancy guard key discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Value,
    Marginal,
    Total,
}

/// A lexical scope chain. Block-local bindings shadow outer scope; the income
/// variable `x` lives at the root and may be shadowed by integration points.
#[derive(Debug, Clone)]
pub struct Scope(Rc<ScopeNode>);

#[derive(Debug)]
struct ScopeNode {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<ScopeNode>>,
}

impl Scope {
    pub fn root(income: f64) -> Scope {
        let scope = Scope(Rc::new(ScopeNode {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        }));
        scope.define("x", Value::Num(income));
        scope
    }

    pub fn child(&self) -> Scope {
        Scope(Rc::new(ScopeNode {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(&self.0)),
        }))
    }

    pub fn define(&self, name: &str, value: Value) {
        self.0.vars.borrow_mut().insert(name.to_string(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut node = Some(&self.0);
        while let Some(current) = node {
            if let Some(value) = current.vars.borrow().get(name) {
                return Some(value.clone());
            }
            node = current.parent.as_ref();
        }
        None
    }
}

/// Statements of the enclosing component block, carried so tapering-allowance
/// evaluation can recompute block locals at a different income.
#[derive(Clone)]
pub enum BlockStmts {
    Ast(Rc<Block>),
    Compiled(Rc<Vec<crate::compile::CompiledStmt>>),
}

/// The immutable-per-expression part of evaluation state. Cheap to clone:
/// income rebinds and country hops produce fresh frames.
#[derive(Clone)]
pub struct Frame {
    pub country: crate::model::CountryId,
    /// Income already converted into the frame country's currency.
    pub income: f64,
    pub scope: Scope,
    pub block_stmts: Option<BlockStmts>,
}

/// Mutable per-request state: the re-entrancy guard, the per-income memo and
/// the optional compiled-closure set installed by `prepare`.
#[derive(Default)]
pub struct Shared {
    pub call_stack: HashSet<(ComponentId, Mode)>,
    pub memo: HashMap<(ComponentId, Mode, u64), f64>,
    pub compiled: Option<Rc<CompiledSet>>,
}

impl Shared {
    pub fn new() -> Shared {
        Shared::default()
    }

    pub fn with_compiled(compiled: Rc<CompiledSet>) -> Shared {
        Shared {
            compiled: Some(compiled),
            ..Shared::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::Bool(true).to_number(0.0), 1.0);
        assert_eq!(Value::Num(f64::NAN).to_number(7.0), 7.0);
        assert_eq!(Value::Num(f64::INFINITY).to_number(0.0), f64::INFINITY);
        assert_eq!(Value::Str("12.5".into()).to_number(0.0), 12.5);
        assert_eq!(Value::Str("  ".into()).to_number(9.0), 0.0);
        assert_eq!(Value::Str("abc".into()).to_number(9.0), 9.0);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Num(0.0).truthy());
        assert!(!Value::Num(f64::NAN).truthy());
        assert!(Value::Num(-1.0).truthy());
        assert!(!Value::Str("".into()).truthy());
        assert!(Value::Str("0".into()).truthy());
    }

    #[test]
    fn test_scope_shadowing() {
        let root = Scope::root(100.0);
        let child = root.child();
        child.define("x", Value::Num(5.0));
        assert_eq!(child.lookup("x"), Some(Value::Num(5.0)));
        assert_eq!(root.lookup("x"), Some(Value::Num(100.0)));
        assert_eq!(child.lookup("missing"), None);
    }
}
