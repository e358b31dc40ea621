//! Shared fixtures: specification trees built the way the external parser
//! would produce them, plus parity assertions between the direct and
//! prepared evaluation paths.

#![allow(dead_code)]

use std::collections::HashMap;
use std::rc::Rc;

use taxspec_core::ast::{
    BinOp, Block, CmpOp, ComponentBody, ComponentDef, CountryBlock, CurrencyDecl, Expr, Program,
    RangeArm, Stmt, Wrapper,
};
use taxspec_core::TaxSpecEngine;

pub fn component(name: &str, kind: &str, stmts: Vec<Stmt>, result: Expr) -> ComponentDef {
    ComponentDef {
        name: name.to_string(),
        kind: Some(kind.to_string()),
        wrapper: Wrapper::Total,
        body: ComponentBody::Block(Rc::new(Block { stmts, result })),
    }
}

pub fn country(
    name: &str,
    currency: Option<CurrencyDecl>,
    components: Vec<ComponentDef>,
) -> CountryBlock {
    CountryBlock {
        name: name.to_string(),
        currency,
        components,
    }
}

pub fn engine_with(program: Program, conversions: &[(&str, f64)]) -> TaxSpecEngine {
    let map: HashMap<String, f64> = conversions
        .iter()
        .map(|(code, rate)| (code.to_string(), *rate))
        .collect();
    TaxSpecEngine::new(&program, &map).expect("fixture specification should build")
}

pub fn stmt(name: &str, value: Expr) -> Stmt {
    Stmt {
        name: name.to_string(),
        value,
    }
}

pub fn num(value: f64) -> Expr {
    Expr::number(value)
}

pub fn x() -> Expr {
    Expr::ident("x")
}

pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinOp::Mul, lhs, rhs)
}

pub fn add(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinOp::Add, lhs, rhs)
}

pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinOp::Sub, lhs, rhs)
}

pub fn le(lhs: Expr, rhs: Expr) -> Expr {
    Expr::compare(CmpOp::Le, lhs, rhs)
}

/// The canonical three-band schedule used across suites:
/// 10% to 10k, 20% to 20k, 30% above.
pub fn standard_brackets() -> Expr {
    Expr::Brackets {
        selector: Box::new(x()),
        arms: vec![
            RangeArm::literal(0.0, Some(10_000.0), num(0.10)),
            RangeArm::literal(10_000.0, Some(20_000.0), num(0.20)),
            RangeArm::literal(20_000.0, None, num(0.30)),
        ],
    }
}

pub fn assert_approx(actual: f64, expected: f64, epsilon: f64, context: &str) {
    let delta = (actual - expected).abs();
    assert!(
        delta <= epsilon,
        "{context}: expected {actual} to be within {epsilon} of {expected} (delta={delta})"
    );
}

/// The prepared path (specialized or closures) must agree with the direct
/// tree-walk API across an income grid. Marginal tolerance is looser because
/// the prepared path may use symbolic derivatives where the oracle uses
/// finite differences.
pub fn assert_prepared_matches_direct(
    engine: &TaxSpecEngine,
    country: &str,
    enabled: Option<&[&str]>,
    currency: &str,
    incomes: &[f64],
    marginal_epsilon: f64,
    overall_epsilon: f64,
) {
    let prepared = engine
        .prepare(country, enabled, currency)
        .expect("prepare should succeed");

    for &income in incomes {
        let direct_marginal = engine
            .marginal_rate(country, enabled, currency, income)
            .unwrap();
        let prepared_marginal = prepared.marginal_rate(income).unwrap();
        assert_approx(
            prepared_marginal,
            direct_marginal,
            marginal_epsilon,
            &format!("{country} income {income} prepared marginal ({})", prepared.backend_name()),
        );

        let direct_overall = engine
            .overall_rate(country, enabled, currency, income)
            .unwrap();
        let prepared_overall = prepared.overall_rate(income).unwrap();
        assert_approx(
            prepared_overall,
            direct_overall,
            overall_epsilon,
            &format!("{country} income {income} prepared overall ({})", prepared.backend_name()),
        );
    }
}
