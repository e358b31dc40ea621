//! The public entry point.
//!
//! `TaxSpecEngine` owns the semantic model and the currency table, answers
//! one-off `marginal_rate`/`overall_rate` queries through the tree-walk
//! evaluator, and builds `PreparedRates` contexts for income sweeps: the
//! specialized program when code generation succeeds, the compiled-closures
//! evaluator when it declines. Both prepared paths must agree with the direct
//! API within numerical tolerance.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::ast::Program;
use crate::codegen::{self, SpecializedProgram};
use crate::compile::CompiledSet;
use crate::currency::CurrencyTable;
use crate::eval::{EvalError, Evaluator, Shared};
use crate::model::{
    normalize_currency, normalize_identifier, normalize_schedule_token, Component, ComponentId,
    CountryId, CountrySummary, ModelError, TaxModel,
};
use crate::numeric::maybe_finite;

pub struct TaxSpecEngine {
    model: TaxModel,
    currencies: CurrencyTable,
}

/// One resolved (country, schedule set, currency) combination.
struct PreparedContext {
    country: CountryId,
    active: Vec<ComponentId>,
    /// Multiplier from caller currency into country currency.
    factor: f64,
}

enum Backend {
    Generated(SpecializedProgram),
    Closures(Rc<CompiledSet>),
}

/// The cached, optimized evaluation path returned by [`TaxSpecEngine::prepare`].
///
/// Owns mutable memoization state (one-slot caches, fixed-point warm starts),
/// so it is deliberately not `Sync`; share across threads only behind
/// external synchronization.
pub struct PreparedRates<'e> {
    engine: &'e TaxSpecEngine,
    ctx: PreparedContext,
    backend: Backend,
}

impl TaxSpecEngine {
    pub fn new(program: &Program, conversions: &HashMap<String, f64>) -> Result<Self, ModelError> {
        let model = TaxModel::build(program)?;
        let mut currencies = CurrencyTable::from_conversions(conversions)?;
        model.seed_currency_table(&mut currencies)?;
        Ok(TaxSpecEngine { model, currencies })
    }

    pub fn model(&self) -> &TaxModel {
        &self.model
    }

    pub fn currencies(&self) -> &CurrencyTable {
        &self.currencies
    }

    /// Enumerable countries with their distinct non-`_` kinds, for pickers.
    pub fn countries(&self) -> Vec<CountrySummary> {
        self.model.summaries()
    }

    /// Marginal rate at a gross income, via the reference evaluator.
    pub fn marginal_rate(
        &self,
        country: &str,
        enabled_schedules: Option<&[&str]>,
        currency: &str,
        gross_income: f64,
    ) -> Result<f64, EvalError> {
        let ctx = self.prepare_context(country, enabled_schedules, currency)?;
        self.marginal_direct(&ctx, gross_income, None)
    }

    /// Overall rate (total tax ÷ local income) at a gross income.
    pub fn overall_rate(
        &self,
        country: &str,
        enabled_schedules: Option<&[&str]>,
        currency: &str,
        gross_income: f64,
    ) -> Result<f64, EvalError> {
        let ctx = self.prepare_context(country, enabled_schedules, currency)?;
        self.overall_direct(&ctx, gross_income, None)
    }

    /// Builds the cached, optimized path for repeated income queries.
    pub fn prepare(
        &self,
        country: &str,
        enabled_schedules: Option<&[&str]>,
        currency: &str,
    ) -> Result<PreparedRates<'_>, EvalError> {
        let ctx = self.prepare_context(country, enabled_schedules, currency)?;
        let country_model = self.model.country(ctx.country);

        let backend = match codegen::build_program(
            &self.model,
            &self.currencies,
            country_model,
            &ctx.active,
            ctx.factor,
        ) {
            Ok(program) => Backend::Generated(program),
            Err(declined) => {
                // Specialization is an optimization, never a requirement.
                tracing::debug!(
                    country = %country_model.name,
                    reason = declined.0,
                    "specialization declined; using compiled closures"
                );
                let set = Rc::new(CompiledSet::new());
                set.precompile_country(&self.model, country_model);
                Backend::Closures(set)
            }
        };

        Ok(PreparedRates {
            engine: self,
            ctx,
            backend,
        })
    }

    fn prepare_context(
        &self,
        country: &str,
        enabled_schedules: Option<&[&str]>,
        currency: &str,
    ) -> Result<PreparedContext, EvalError> {
        let country_model = self
            .model
            .country_by_key(&normalize_identifier(country))
            .ok_or_else(|| EvalError::UnknownCountry(country.to_string()))?;

        let enabled_set = normalize_enabled_schedules(enabled_schedules)?;
        let active = self.active_components(country_model.id, enabled_set.as_ref());

        let source_key = normalize_currency(currency);
        let factor = self
            .currencies
            .conversion_factor(&source_key, &country_model.currency_key)
            .ok_or_else(|| EvalError::MissingConversion {
                from: source_key.clone(),
                to: country_model.currency_key.clone(),
            })?;

        Ok(PreparedContext {
            country: country_model.id,
            active,
            factor,
        })
    }

    fn active_components(
        &self,
        country: CountryId,
        enabled: Option<&HashSet<String>>,
    ) -> Vec<ComponentId> {
        let country_model = self.model.country(country);
        match enabled {
            None => country_model
                .component_ids
                .iter()
                .copied()
                .filter(|&id| self.model.component(id).kind_key != "_")
                .collect(),
            Some(set) if set.is_empty() => Vec::new(),
            Some(set) => country_model
                .component_ids
                .iter()
                .copied()
                .filter(|&id| component_enabled(self.model.component(id), country_model.key.as_str(), set))
                .collect(),
        }
    }

    fn marginal_direct(
        &self,
        ctx: &PreparedContext,
        gross_income: f64,
        compiled: Option<Rc<CompiledSet>>,
    ) -> Result<f64, EvalError> {
        if !gross_income.is_finite() {
            return Err(EvalError::NonFiniteIncome);
        }
        let local = gross_income * ctx.factor;
        if local < 0.0 {
            return Ok(0.0);
        }

        let evaluator = Evaluator::new(&self.model, &self.currencies);
        let frame = evaluator.frame_for(ctx.country, local);
        let mut shared = match compiled {
            Some(set) => Shared::with_compiled(set),
            None => Shared::new(),
        };

        let mut total = 0.0;
        for &id in &ctx.active {
            total += evaluator.component_marginal(id, &frame, &mut shared)?;
        }
        Ok(maybe_finite(total))
    }

    fn overall_direct(
        &self,
        ctx: &PreparedContext,
        gross_income: f64,
        compiled: Option<Rc<CompiledSet>>,
    ) -> Result<f64, EvalError> {
        if !gross_income.is_finite() {
            return Err(EvalError::NonFiniteIncome);
        }
        let local = gross_income * ctx.factor;
        if local <= 0.0 {
            return Ok(0.0);
        }

        let evaluator = Evaluator::new(&self.model, &self.currencies);
        let frame = evaluator.frame_for(ctx.country, local);
        let mut shared = match compiled {
            Some(set) => Shared::with_compiled(set),
            None => Shared::new(),
        };

        let mut total = 0.0;
        for &id in &ctx.active {
            total += evaluator.component_total(id, &frame, &mut shared)?;
        }
        Ok(maybe_finite(total / local))
    }
}

impl PreparedRates<'_> {
    pub fn marginal_rate(&self, gross_income: f64) -> Result<f64, EvalError> {
        match &self.backend {
            Backend::Generated(program) => program.marginal_rate(gross_income),
            Backend::Closures(set) => {
                self.engine
                    .marginal_direct(&self.ctx, gross_income, Some(Rc::clone(set)))
            }
        }
    }

    pub fn overall_rate(&self, gross_income: f64) -> Result<f64, EvalError> {
        match &self.backend {
            Backend::Generated(program) => program.overall_rate(gross_income),
            Backend::Closures(set) => {
                self.engine
                    .overall_direct(&self.ctx, gross_income, Some(Rc::clone(set)))
            }
        }
    }

    /// Which evaluation path serves this context. Diagnostic only.
    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Generated(_) => "specialized",
            Backend::Closures(_) => "closures",
        }
    }
}

/// `None` means "all kinds except `_`"; tokens normalize case and whitespace.
/// Naming the internal helper kind is an error.
fn normalize_enabled_schedules(
    enabled: Option<&[&str]>,
) -> Result<Option<HashSet<String>>, EvalError> {
    let Some(tokens) = enabled else {
        return Ok(None);
    };
    let mut normalized = HashSet::with_capacity(tokens.len());
    for token in tokens {
        let token = normalize_schedule_token(token);
        if token.is_empty() {
            continue;
        }
        if token == "_" {
            return Err(EvalError::ReservedKindEnabled);
        }
        normalized.insert(token);
    }
    Ok(Some(normalized))
}

/// Token shapes accepted, all lowercase: kind, component name, `kind:name`,
/// `kind.name`, and each of those qualified by `country:`.
fn component_enabled(component: &Component, country_key: &str, enabled: &HashSet<String>) -> bool {
    if component.kind_key == "_" {
        return false;
    }

    let kind = component.kind_key.as_str();
    let name = component.name_key.as_str();

    enabled.contains(kind)
        || enabled.contains(name)
        || enabled.contains(&format!("{kind}:{name}"))
        || enabled.contains(&format!("{kind}.{name}"))
        || enabled.contains(&format!("{country_key}:{kind}"))
        || enabled.contains(&format!("{country_key}:{name}"))
        || enabled.contains(&format!("{country_key}:{kind}:{name}"))
        || enabled.contains(&format!("{country_key}:{kind}.{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        Block, ComponentBody as AstBody, ComponentDef, CountryBlock, CurrencyDecl, Expr, RangeArm,
        Wrapper,
    };
    use std::rc::Rc;

    fn bracket_program() -> Program {
        Program {
            countries: vec![CountryBlock {
                name: "Testland".to_string(),
                currency: Some(CurrencyDecl::Bare("USD".to_string())),
                components: vec![ComponentDef {
                    name: "TL_IncomeTax".to_string(),
                    kind: Some("income_tax".to_string()),
                    wrapper: Wrapper::Total,
                    body: AstBody::Block(Rc::new(Block {
                        stmts: vec![],
                        result: Expr::Brackets {
                            selector: Box::new(Expr::ident("x")),
                            arms: vec![
                                RangeArm::literal(0.0, Some(10_000.0), Expr::number(0.10)),
                                RangeArm::literal(10_000.0, Some(20_000.0), Expr::number(0.20)),
                                RangeArm::literal(20_000.0, None, Expr::number(0.30)),
                            ],
                        },
                    })),
                }],
            }],
        }
    }

    fn engine() -> TaxSpecEngine {
        let mut conversions = HashMap::new();
        conversions.insert("USD".to_string(), 1.0);
        TaxSpecEngine::new(&bracket_program(), &conversions).unwrap()
    }

    #[test]
    fn test_direct_api_on_bracket_fixture() {
        let engine = engine();
        let schedules = ["income tax"];
        let overall = engine
            .overall_rate("Testland", Some(&schedules), "USD", 25_000.0)
            .unwrap();
        assert!((overall * 25_000.0 - 4_500.0).abs() < 1e-9);

        let marginal = engine
            .marginal_rate("Testland", Some(&schedules), "USD", 20_001.0)
            .unwrap();
        assert!((marginal - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_country_errors() {
        let engine = engine();
        let err = engine
            .marginal_rate("Atlantis", None, "USD", 1_000.0)
            .unwrap_err();
        assert!(matches!(err, EvalError::UnknownCountry(_)));
    }

    #[test]
    fn test_reserved_kind_rejected() {
        let engine = engine();
        let schedules = ["_"];
        let err = engine
            .marginal_rate("Testland", Some(&schedules), "USD", 1_000.0)
            .unwrap_err();
        assert_eq!(err, EvalError::ReservedKindEnabled);
    }

    #[test]
    fn test_empty_schedule_set_disables_everything() {
        let engine = engine();
        let schedules: [&str; 0] = [];
        let marginal = engine
            .marginal_rate("Testland", Some(&schedules), "USD", 50_000.0)
            .unwrap();
        assert_eq!(marginal, 0.0);
    }

    #[test]
    fn test_schedule_token_shapes() {
        let engine = engine();
        for token in [
            "income_tax",
            "Income Tax",
            "tl_incometax",
            "income_tax:tl_incometax",
            "income_tax.tl_incometax",
            "testland:income_tax",
            "testland:tl_incometax",
            "testland:income_tax:tl_incometax",
        ] {
            let schedules = [token];
            let marginal = engine
                .marginal_rate("Testland", Some(&schedules), "USD", 15_000.0)
                .unwrap();
            assert!(
                (marginal - 0.20).abs() < 1e-9,
                "token {token:?} did not enable the schedule"
            );
        }
    }

    #[test]
    fn test_negative_income_rates_are_zero() {
        let engine = engine();
        assert_eq!(
            engine.marginal_rate("Testland", None, "USD", -1.0).unwrap(),
            0.0
        );
        assert_eq!(
            engine.overall_rate("Testland", None, "USD", 0.0).unwrap(),
            0.0
        );
    }

    #[test]
    fn test_countries_summary_for_pickers() {
        let engine = engine();
        let summaries = engine.countries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "Testland");
        assert_eq!(summaries[0].currency, "USD");
        assert_eq!(summaries[0].kinds, vec!["income_tax".to_string()]);
    }

    #[test]
    fn test_prepared_uses_specialized_backend_here() {
        let engine = engine();
        let prepared = engine.prepare("Testland", None, "USD").unwrap();
        assert_eq!(prepared.backend_name(), "specialized");
        let direct = engine
            .marginal_rate("Testland", None, "USD", 10_001.0)
            .unwrap();
        let cached = prepared.marginal_rate(10_001.0).unwrap();
        assert!((direct - cached).abs() < 1e-9);
    }
}
