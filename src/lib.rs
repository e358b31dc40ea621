//! A specification engine for declarative progressive income-tax schedules.
//!
//! A specification defines, per country, a set of tax "components" whose
//! bodies express total tax as a function of income, with banded bracket
//! schedules, piecewise conditionals, cross-component (and cross-country)
//! references and single-variable fixed points. The engine builds a semantic
//! model from the external parser's tree and evaluates two quantities for any
//! gross income: the marginal rate and the overall rate.
//!
//! Three evaluation paths exist, fastest first:
//! - a specialized in-memory program ([`codegen`]) with closed-form bracket
//!   arms, symbolic derivatives and warm-started fixed points;
//! - a compiled-closures evaluator ([`compile`]);
//! - the tree-walking reference evaluator ([`eval`]), the semantics oracle.
//!
//! [`TaxSpecEngine`] selects among them; `prepare` returns a cached context
//! meant to be queried across an income sweep.

pub mod ast;
pub mod codegen;
pub mod compile;
pub mod currency;
pub mod engine;
pub mod eval;
pub mod graph;
pub mod model;
pub mod numeric;
pub mod plan;

pub use currency::{CurrencyError, CurrencyTable};
pub use engine::{PreparedRates, TaxSpecEngine};
pub use eval::EvalError;
pub use model::{ComponentId, CountryId, CountrySummary, ModelError, TaxModel};
