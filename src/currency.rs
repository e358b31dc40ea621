//! Currency → EUR conversion table.
//!
//! Rates follow the `localAmount × rate = EUR` convention. The table is seeded
//! from external configuration and then overridden by any rate literally
//! declared in a country header, so a specification can ship self-contained
//! fixtures without a rate file.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::normalize_currency;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CurrencyError {
    #[error("Conversion rate must be positive for currency \"{0}\"")]
    NonPositiveRate(String),
    #[error("Invalid currency configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Default)]
pub struct CurrencyTable {
    to_eur: HashMap<String, f64>,
}

impl CurrencyTable {
    /// Builds a table from caller-supplied conversions. `EUR → 1` is implicit.
    pub fn from_conversions(conversions: &HashMap<String, f64>) -> Result<Self, CurrencyError> {
        let mut to_eur = HashMap::with_capacity(conversions.len() + 1);
        for (code, &rate) in conversions {
            let normalized = normalize_currency(code);
            if !rate.is_finite() || rate <= 0.0 {
                return Err(CurrencyError::NonPositiveRate(normalized));
            }
            to_eur.insert(normalized, rate);
        }
        to_eur.entry("EUR".to_string()).or_insert(1.0);
        Ok(CurrencyTable { to_eur })
    }

    /// Configuration seam: a JSON object of `{"CODE": rate}` pairs.
    pub fn from_json_str(source: &str) -> Result<Self, CurrencyError> {
        let conversions: HashMap<String, f64> = serde_json::from_str(source)
            .map_err(|err| CurrencyError::InvalidConfig(err.to_string()))?;
        Self::from_conversions(&conversions)
    }

    /// Installs a rate declared in a country header, overriding the seed.
    pub fn declare(&mut self, code: &str, rate: f64) -> Result<(), CurrencyError> {
        let normalized = normalize_currency(code);
        if !rate.is_finite() || rate <= 0.0 {
            return Err(CurrencyError::NonPositiveRate(normalized));
        }
        self.to_eur.insert(normalized, rate);
        Ok(())
    }

    #[inline(always)]
    pub fn rate_to_eur(&self, normalized_code: &str) -> Option<f64> {
        self.to_eur.get(normalized_code).copied()
    }

    /// Conversion factor from one currency to another, if both resolve.
    pub fn conversion_factor(&self, from_key: &str, to_key: &str) -> Option<f64> {
        if from_key == to_key {
            return Some(1.0);
        }
        let source = self.rate_to_eur(from_key)?;
        let target = self.rate_to_eur(to_key)?;
        Some(source / target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eur_is_implicit() {
        let table = CurrencyTable::from_conversions(&HashMap::new()).unwrap();
        assert_eq!(table.rate_to_eur("EUR"), Some(1.0));
    }

    #[test]
    fn test_declared_rate_overrides_seed() {
        let mut seed = HashMap::new();
        seed.insert("DKK".to_string(), 0.12);
        let mut table = CurrencyTable::from_conversions(&seed).unwrap();
        table.declare("DKK", 0.134).unwrap();
        assert_eq!(table.rate_to_eur("DKK"), Some(0.134));
    }

    #[test]
    fn test_cross_rate_uses_ratio() {
        let mut seed = HashMap::new();
        seed.insert("USD".to_string(), 0.9);
        seed.insert("GBP".to_string(), 1.2);
        let table = CurrencyTable::from_conversions(&seed).unwrap();
        let factor = table.conversion_factor("USD", "GBP").unwrap();
        assert!((factor - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let mut seed = HashMap::new();
        seed.insert("usd".to_string(), 0.0);
        let err = CurrencyTable::from_conversions(&seed).unwrap_err();
        assert_eq!(err, CurrencyError::NonPositiveRate("USD".to_string()));
    }

    #[test]
    fn test_json_seed() {
        let table = CurrencyTable::from_json_str(r#"{ "NOK": 0.085, "eur": 1.0 }"#).unwrap();
        assert_eq!(table.rate_to_eur("NOK"), Some(0.085));
    }
}
