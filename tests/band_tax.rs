//! Banded bracket schedules: totals as band integrals, left-hand marginal
//! rates at kinks, prepared/direct parity and currency metadata forms.

mod common;

use common::*;
use rstest::rstest;
use taxspec_core::ast::CurrencyDecl;

const ENABLED: &[&str] = &["income tax"];
const PARITY_INCOMES: &[f64] = &[0.0, 10_000.0, 10_001.0, 20_000.0, 20_001.0, 25_000.0];

fn testland() -> taxspec_core::TaxSpecEngine {
    let program = taxspec_core::ast::Program {
        countries: vec![country(
            "Testland",
            Some(CurrencyDecl::Bare("USD".to_string())),
            vec![component("TL_IncomeTax", "income_tax", vec![], standard_brackets())],
        )],
    };
    engine_with(program, &[("USD", 1.0)])
}

#[rstest]
#[case(0.0, 0.0)]
#[case(5_000.0, 500.0)]
#[case(10_000.0, 1_000.0)]
#[case(15_000.0, 2_000.0)]
#[case(20_000.0, 3_000.0)]
#[case(25_000.0, 4_500.0)]
fn test_brackets_compute_total_band_tax(#[case] income: f64, #[case] expected_total: f64) {
    let engine = testland();
    let overall = engine
        .overall_rate("Testland", Some(ENABLED), "USD", income)
        .unwrap();
    let total = if income <= 0.0 { 0.0 } else { overall * income };
    assert_approx(total, expected_total, 1e-6, "band total");
}

#[rstest]
#[case(9_999.0, 0.10)]
#[case(10_000.0, 0.10)]
#[case(10_001.0, 0.20)]
#[case(19_999.0, 0.20)]
#[case(20_000.0, 0.20)]
#[case(20_001.0, 0.30)]
fn test_marginal_rate_uses_left_hand_derivative_at_kinks(
    #[case] income: f64,
    #[case] expected_marginal: f64,
) {
    let engine = testland();
    let marginal = engine
        .marginal_rate("Testland", Some(ENABLED), "USD", income)
        .unwrap();
    assert_approx(marginal, expected_marginal, 1e-6, "kink marginal");
}

#[test]
fn test_prepared_evaluator_matches_direct_api() {
    let engine = testland();
    assert_prepared_matches_direct(
        &engine,
        "Testland",
        Some(ENABLED),
        "USD",
        PARITY_INCOMES,
        1e-6,
        1e-9,
    );
}

#[test]
fn test_overall_rate_consistent_with_marginal_integral() {
    // overall(x)·x must match ∫₀ˣ marginal(t) dt. Trapezoid over a fine
    // grid; the schedule is piecewise constant so the tolerance is loose
    // only around the two kinks.
    let engine = testland();
    let prepared = engine.prepare("Testland", Some(ENABLED), "USD").unwrap();

    let upper = 30_000.0;
    let steps = 3_000;
    let width = upper / steps as f64;
    let mut integral = 0.0;
    let mut previous = prepared.marginal_rate(0.0).unwrap();
    for step in 1..=steps {
        let income = step as f64 * width;
        let current = prepared.marginal_rate(income).unwrap();
        integral += 0.5 * (previous + current) * width;
        previous = current;
    }

    let total = prepared.overall_rate(upper).unwrap() * upper;
    assert_approx(total, integral, 10.0, "integral consistency");
}

#[test]
fn test_currency_metadata_reverse_form() {
    // (8 REV = EUR) quotes eight local units per euro.
    let program = taxspec_core::ast::Program {
        countries: vec![country(
            "ReverseCurrency",
            Some(CurrencyDecl::Reverse {
                amount: 8.0,
                code: "REV".to_string(),
                base: "EUR".to_string(),
            }),
            vec![component(
                "RC_IncomeTax",
                "income_tax",
                vec![],
                taxspec_core::ast::Expr::Brackets {
                    selector: Box::new(x()),
                    arms: vec![taxspec_core::ast::RangeArm::literal(0.0, None, num(0.10))],
                },
            )],
        )],
    };
    let engine = engine_with(program, &[]);

    assert_approx(
        engine.currencies().rate_to_eur("REV").unwrap(),
        1.0 / 8.0,
        1e-12,
        "declared reverse rate",
    );

    // 80 EUR becomes 640 REV; a flat schedule keeps the rate at 10%.
    let marginal = engine
        .marginal_rate("ReverseCurrency", Some(ENABLED), "EUR", 80.0)
        .unwrap();
    assert_approx(marginal, 0.10, 1e-9, "reverse-currency marginal");
}

#[test]
fn test_currency_metadata_direct_form() {
    let program = taxspec_core::ast::Program {
        countries: vec![country(
            "DirectCurrency",
            Some(CurrencyDecl::Direct {
                code: "DCU".to_string(),
                rate: 0.60,
                base: "EUR".to_string(),
            }),
            vec![component(
                "DC_IncomeTax",
                "income_tax",
                vec![],
                standard_brackets(),
            )],
        )],
    };
    let engine = engine_with(program, &[]);
    assert_approx(
        engine.currencies().rate_to_eur("DCU").unwrap(),
        0.60,
        1e-12,
        "declared direct rate",
    );
    // Reciprocal relationship with the reverse form: 0.60 DCU/EUR is the
    // same declaration as (1/0.60 DCU = EUR).
    assert_approx(
        1.0 / engine.currencies().rate_to_eur("DCU").unwrap(),
        1.0 / 0.60,
        1e-12,
        "reciprocal",
    );
}

#[test]
fn test_bare_currency_resolves_from_table() {
    let program = taxspec_core::ast::Program {
        countries: vec![country(
            "BareCurrency",
            Some(CurrencyDecl::Bare("EUR".to_string())),
            vec![component(
                "BC_IncomeTax",
                "income_tax",
                vec![],
                taxspec_core::ast::Expr::Brackets {
                    selector: Box::new(x()),
                    arms: vec![taxspec_core::ast::RangeArm::literal(0.0, None, num(0.05))],
                },
            )],
        )],
    };
    let engine = engine_with(program, &[]);
    let marginal = engine
        .marginal_rate("BareCurrency", Some(ENABLED), "EUR", 80.0)
        .unwrap();
    assert_approx(marginal, 0.05, 1e-9, "bare-currency marginal");
}

#[test]
fn test_cross_currency_income_conversion() {
    // Income quoted in GBP against a USD country: 1 GBP = 1.2 EUR,
    // 1 USD = 0.9 EUR, so 9k GBP = 12k USD → the 20% band.
    let engine = {
        let program = taxspec_core::ast::Program {
            countries: vec![country(
                "Testland",
                Some(CurrencyDecl::Bare("USD".to_string())),
                vec![component("TL_IncomeTax", "income_tax", vec![], standard_brackets())],
            )],
        };
        engine_with(program, &[("USD", 0.9), ("GBP", 1.2)])
    };
    let marginal = engine
        .marginal_rate("Testland", Some(ENABLED), "GBP", 9_000.0)
        .unwrap();
    assert_approx(marginal, 0.20, 1e-9, "cross-currency marginal");
}
