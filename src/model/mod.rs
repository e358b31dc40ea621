//! Semantic model builder.
//!
//! Consumes the parse tree once and produces an immutable arena of countries
//! and components with dense integer ids. All later stages (evaluation,
//! dependency analysis, compilation) address components by `ComponentId`
//! instead of re-walking string-keyed maps.

use std::collections::HashMap;
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;

use crate::ast::{Block, ComponentBody as AstBody, CurrencyDecl, Expr, Program, Wrapper};
use crate::currency::{CurrencyError, CurrencyTable};
use crate::plan::{self, ComponentPlans};

/// A dense, stable identifier into the crate-wide component arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ComponentId(pub u32);

impl ComponentId {
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
    pub fn new(idx: usize) -> Self {
        Self(idx as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CountryId(pub u32);

impl CountryId {
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
    pub fn new(idx: usize) -> Self {
        Self(idx as u32)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Duplicate country definition: {0}")]
    DuplicateCountry(String),
    #[error("Duplicate component in {country}: {kind}:{name}")]
    DuplicateComponent {
        country: String,
        kind: String,
        name: String,
    },
    #[error("Currency metadata for {country} must reference EUR, e.g. ({currency} = 0.60 * EUR)")]
    CurrencyBaseNotEur { country: String, currency: String },
    #[error(transparent)]
    Currency(#[from] CurrencyError),
    #[error("Missing conversion rate for currency \"{currency}\" in country \"{country}\"")]
    MissingRate { currency: String, country: String },
}

/// Evaluation body of a component, with the shared parse-tree parts
/// reference-counted so evaluation frames can hold onto block statements.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentBody {
    Number(f64),
    Expr(Rc<Expr>),
    Block(Rc<Block>),
}

#[derive(Debug, Clone)]
pub struct Component {
    pub id: ComponentId,
    pub country: CountryId,
    pub name: String,
    pub name_key: String,
    pub kind: String,
    pub kind_key: String,
    pub wrapper: Wrapper,
    pub body: ComponentBody,
}

#[derive(Debug, Clone)]
pub struct Country {
    pub id: CountryId,
    pub name: String,
    pub key: String,
    pub currency: String,
    pub currency_key: String,
    /// Set only when a rate is literally declared in the header; otherwise the
    /// external currency table must supply it.
    pub currency_to_eur: Option<f64>,
    pub component_ids: Vec<ComponentId>,
    by_kind_and_name: HashMap<(String, String), ComponentId>,
    by_kind: HashMap<String, Vec<ComponentId>>,
    by_name: HashMap<String, Vec<ComponentId>>,
}

impl Country {
    pub fn lookup_kind_name(&self, kind_key: &str, name_key: &str) -> Option<ComponentId> {
        self.by_kind_and_name
            .get(&(kind_key.to_string(), name_key.to_string()))
            .copied()
    }

    pub fn lookup_by_name(&self, name_key: &str) -> &[ComponentId] {
        self.by_name.get(name_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn lookup_by_kind(&self, kind_key: &str) -> &[ComponentId] {
        self.by_kind.get(kind_key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Model summary consumed by UI layers to populate pickers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountrySummary {
    pub name: String,
    pub currency: String,
    /// Distinct non-`_` kinds, in first-seen order.
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaxModel {
    countries: Vec<Country>,
    components: Vec<Component>,
    /// Fast-path plans, parallel to `components`.
    plans: Vec<ComponentPlans>,
    by_country_key: HashMap<String, CountryId>,
}

impl TaxModel {
    /// Builds the model and precomputes fast-path plans.
    ///
    /// Duplicate countries and duplicate (kind, name) pairs fail eagerly;
    /// reference errors are deliberately left to evaluation time.
    pub fn build(program: &Program) -> Result<Self, ModelError> {
        let mut model = TaxModel::default();

        for country_block in &program.countries {
            let country_name = country_block.name.clone();
            let country_key = normalize_identifier(&country_name);
            if model.by_country_key.contains_key(&country_key) {
                return Err(ModelError::DuplicateCountry(country_name));
            }

            let (currency, currency_to_eur) =
                resolve_currency_decl(&country_name, country_block.currency.as_ref())?;

            let country_id = CountryId::new(model.countries.len());
            let mut country = Country {
                id: country_id,
                name: country_name.clone(),
                key: country_key.clone(),
                currency_key: normalize_currency(&currency),
                currency,
                currency_to_eur,
                component_ids: Vec::with_capacity(country_block.components.len()),
                by_kind_and_name: HashMap::new(),
                by_kind: HashMap::new(),
                by_name: HashMap::new(),
            };

            for def in &country_block.components {
                let kind = def.kind.clone().unwrap_or_else(|| "_".to_string());
                let kind_key = normalize_identifier(&kind);
                let name_key = normalize_identifier(&def.name);

                let pair = (kind_key.clone(), name_key.clone());
                if country.by_kind_and_name.contains_key(&pair) {
                    return Err(ModelError::DuplicateComponent {
                        country: country_name,
                        kind,
                        name: def.name.clone(),
                    });
                }

                let id = ComponentId::new(model.components.len());
                let component = Component {
                    id,
                    country: country_id,
                    name: def.name.clone(),
                    name_key: name_key.clone(),
                    kind,
                    kind_key: kind_key.clone(),
                    wrapper: def.wrapper,
                    body: match &def.body {
                        AstBody::Number(value) => ComponentBody::Number(*value),
                        AstBody::Expr(expr) => ComponentBody::Expr(Rc::clone(expr)),
                        AstBody::Block(block) => ComponentBody::Block(Rc::clone(block)),
                    },
                };

                country.by_kind_and_name.insert(pair, id);
                country.by_kind.entry(kind_key).or_default().push(id);
                country.by_name.entry(name_key).or_default().push(id);
                country.component_ids.push(id);

                model.plans.push(plan::build_component_plans(&component));
                model.components.push(component);
            }

            model.by_country_key.insert(country_key, country_id);
            model.countries.push(country);
        }

        Ok(model)
    }

    /// Merges header-declared rates into the table, then verifies every
    /// country's currency resolves before any evaluation can run.
    pub fn seed_currency_table(&self, table: &mut CurrencyTable) -> Result<(), ModelError> {
        for country in &self.countries {
            if let Some(rate) = country.currency_to_eur {
                table.declare(&country.currency, rate)?;
            }
        }
        for country in &self.countries {
            if table.rate_to_eur(&country.currency_key).is_none() {
                return Err(ModelError::MissingRate {
                    currency: country.currency_key.clone(),
                    country: country.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn country_by_key(&self, key: &str) -> Option<&Country> {
        self.by_country_key
            .get(key)
            .map(|id| &self.countries[id.index()])
    }

    #[inline(always)]
    pub fn country(&self, id: CountryId) -> &Country {
        &self.countries[id.index()]
    }

    #[inline(always)]
    pub fn component(&self, id: ComponentId) -> &Component {
        &self.components[id.index()]
    }

    #[inline(always)]
    pub fn plans(&self, id: ComponentId) -> &ComponentPlans {
        &self.plans[id.index()]
    }

    pub fn countries(&self) -> &[Country] {
        &self.countries
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Human-readable label used in circular-reference diagnostics.
    pub fn component_label(&self, id: ComponentId) -> String {
        let component = self.component(id);
        let country = self.country(component.country);
        format!("{}.{}.{}", country.name, component.kind, component.name)
    }

    pub fn summaries(&self) -> Vec<CountrySummary> {
        self.countries
            .iter()
            .map(|country| {
                let mut kinds = Vec::new();
                for &id in &country.component_ids {
                    let component = self.component(id);
                    if component.kind_key != "_" && !kinds.contains(&component.kind) {
                        kinds.push(component.kind.clone());
                    }
                }
                CountrySummary {
                    name: country.name.clone(),
                    currency: country.currency.clone(),
                    kinds,
                }
            })
            .collect()
    }
}

/// Why a reference path failed to resolve. The evaluator maps these onto its
/// error taxonomy with the offending path attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefFailure {
    Unknown,
    Ambiguous,
    UnknownCountry,
}

impl TaxModel {
    /// Resolves a reference path against the current country. Accepted
    /// shapes: `Name`, `Kind.Name`, `Country.Name`, `Country.Kind.Name`.
    /// An unqualified name must match exactly one component.
    pub fn resolve_reference(
        &self,
        current: CountryId,
        path: &crate::ast::RefPath,
    ) -> Result<ComponentId, RefFailure> {
        let normalized: Vec<String> = path.0.iter().map(|s| normalize_identifier(s)).collect();
        let country = self.country(current);

        match normalized.as_slice() {
            [name] => match country.lookup_by_name(name) {
                [only] => Ok(*only),
                [] => Err(RefFailure::Unknown),
                _ => Err(RefFailure::Ambiguous),
            },
            [first, second] => {
                if let Some(id) = country.lookup_kind_name(first, second) {
                    return Ok(id);
                }
                if let Some(target) = self.country_by_key(first) {
                    return match target.lookup_by_name(second) {
                        [only] => Ok(*only),
                        [] => Err(RefFailure::Unknown),
                        _ => Err(RefFailure::Ambiguous),
                    };
                }
                Err(RefFailure::Unknown)
            }
            [country_key, kind_key, name_key] => {
                let target = self
                    .country_by_key(country_key)
                    .ok_or(RefFailure::UnknownCountry)?;
                target
                    .lookup_kind_name(kind_key, name_key)
                    .ok_or(RefFailure::Unknown)
            }
            _ => Err(RefFailure::Unknown),
        }
    }
}

fn resolve_currency_decl(
    country_name: &str,
    decl: Option<&CurrencyDecl>,
) -> Result<(String, Option<f64>), ModelError> {
    let Some(decl) = decl else {
        return Ok(("EUR".to_string(), None));
    };

    match decl {
        CurrencyDecl::Bare(code) => Ok((code.clone(), None)),
        CurrencyDecl::Direct { code, rate, base } => {
            if normalize_currency(base) != "EUR" {
                return Err(ModelError::CurrencyBaseNotEur {
                    country: country_name.to_string(),
                    currency: code.clone(),
                });
            }
            if !rate.is_finite() || *rate <= 0.0 {
                return Err(CurrencyError::NonPositiveRate(normalize_currency(code)).into());
            }
            Ok((code.clone(), Some(*rate)))
        }
        CurrencyDecl::Reverse { amount, code, base } => {
            if normalize_currency(base) != "EUR" {
                return Err(ModelError::CurrencyBaseNotEur {
                    country: country_name.to_string(),
                    currency: code.clone(),
                });
            }
            if !amount.is_finite() || *amount <= 0.0 {
                return Err(CurrencyError::NonPositiveRate(normalize_currency(code)).into());
            }
            // `11.25 CUR = EUR` quotes the local amount per euro; invert it.
            Ok((code.clone(), Some(1.0 / amount)))
        }
    }
}

/// Case-insensitive identifier key. Country, kind and component names compare
/// through this.
pub fn normalize_identifier(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Enabled-schedule tokens additionally collapse interior whitespace so
/// `"income tax"` matches the kind `income_tax`.
pub fn normalize_schedule_token(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn normalize_currency(value: &str) -> String {
    value.trim().to_uppercase()
}
