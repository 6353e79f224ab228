//! Offering catalog and counter scope policy
//!
//! The catalog lists every offering a requester may pick. Offerings that are
//! still in development are listed but cannot be chosen. Flagship offerings
//! share one global serial counter; all others number their certificates
//! independently.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ids::OfferingId;
use crate::{Error, Result};

/// Gender token used to pick the certificate template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }

    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            _ => None,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A course offering certificates can be issued for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    pub id: OfferingId,

    pub title: String,

    /// Earliest date a revocation date may carry
    pub launched_on: NaiveDate,

    /// Offerings still in development are listed but rejected
    #[serde(default = "default_available")]
    pub available: bool,

    /// Flagship offerings draw serials from the global counter
    #[serde(default)]
    pub flagship: bool,

    /// Template reference per gender; falls back to `<id>-<gender>`
    #[serde(default)]
    pub templates: BTreeMap<Gender, String>,
}

fn default_available() -> bool {
    true
}

impl Offering {
    pub fn new(id: impl Into<String>, title: impl Into<String>, launched_on: NaiveDate) -> Self {
        Self {
            id: OfferingId::new(id),
            title: title.into(),
            launched_on,
            available: true,
            flagship: false,
            templates: BTreeMap::new(),
        }
    }

    pub fn flagship(mut self) -> Self {
        self.flagship = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_template(mut self, gender: Gender, template: impl Into<String>) -> Self {
        self.templates.insert(gender, template.into());
        self
    }

    /// Template reference used when generating this offering's certificate
    pub fn template_for(&self, gender: Gender) -> String {
        self.templates
            .get(&gender)
            .cloned()
            .unwrap_or_else(|| format!("{}-{}", self.id, gender))
    }
}

/// Which named counter a serial is drawn from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterScope {
    Global,
    Offering(OfferingId),
}

impl CounterScope {
    /// Storage key for the counter
    pub fn key(&self) -> String {
        match self {
            CounterScope::Global => "global".to_string(),
            CounterScope::Offering(id) => format!("offering:{}", id),
        }
    }

    /// Parse a scope as written by operators: `global` or an offering id
    pub fn parse(s: &str) -> Self {
        match s {
            "global" => CounterScope::Global,
            other => CounterScope::Offering(OfferingId::new(
                other.strip_prefix("offering:").unwrap_or(other),
            )),
        }
    }
}

impl fmt::Display for CounterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// The set of offerings known to the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    offerings: Vec<Offering>,
}

impl Catalog {
    pub fn new(offerings: Vec<Offering>) -> Result<Self> {
        let mut seen = HashSet::new();
        for offering in &offerings {
            if !seen.insert(offering.id.clone()) {
                return Err(Error::DuplicateOffering(offering.id.clone()));
            }
        }
        Ok(Self { offerings })
    }

    /// Parse a catalog from a JSON array of offerings
    pub fn from_json(json: &str) -> Result<Self> {
        let offerings: Vec<Offering> = serde_json::from_str(json)?;
        Self::new(offerings)
    }

    pub fn offerings(&self) -> &[Offering] {
        &self.offerings
    }

    pub fn get(&self, id: &OfferingId) -> Option<&Offering> {
        self.offerings.iter().find(|o| &o.id == id)
    }

    /// Look up an offering by the token a requester submitted
    pub fn find(&self, token: &str) -> Option<&Offering> {
        self.offerings.iter().find(|o| o.id.as_str() == token)
    }

    /// Counter scope policy: flagship offerings share the global counter
    pub fn counter_scope(&self, id: &OfferingId) -> CounterScope {
        match self.get(id) {
            Some(offering) if offering.flagship => CounterScope::Global,
            _ => CounterScope::Offering(id.clone()),
        }
    }

    /// Every distinct counter scope the catalog can draw from
    pub fn scopes(&self) -> Vec<CounterScope> {
        let mut scopes = Vec::new();
        for offering in self.offerings.iter().filter(|o| o.available) {
            let scope = self.counter_scope(&offering.id);
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        scopes
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("built-in catalog date is valid")
}

impl Default for Catalog {
    fn default() -> Self {
        let offerings = vec![
            Offering::new("214271", "Best in Python. Part 1", date(2024, 5, 1))
                .flagship()
                .with_template(Gender::Male, "part1-male")
                .with_template(Gender::Female, "part1-female"),
            Offering::new("221885", "Best in Python. Part 2", date(2024, 11, 1))
                .flagship()
                .with_template(Gender::Male, "part2-male")
                .with_template(Gender::Female, "part2-female"),
            Offering::new("python-part-3", "Best in Python. Part 3", date(2025, 6, 1))
                .unavailable(),
            Offering::new("python-oop", "Best in Python. OOP", date(2025, 6, 1)).unavailable(),
        ];
        Self { offerings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flagship_offerings_share_global_scope() {
        let catalog = Catalog::default();
        assert_eq!(
            catalog.counter_scope(&OfferingId::new("214271")),
            CounterScope::Global
        );
        assert_eq!(
            catalog.counter_scope(&OfferingId::new("221885")),
            CounterScope::Global
        );
    }

    #[test]
    fn test_other_offerings_get_their_own_scope() {
        let catalog =
            Catalog::new(vec![Offering::new("77", "Side course", date(2024, 1, 1))]).unwrap();
        assert_eq!(
            catalog.counter_scope(&OfferingId::new("77")),
            CounterScope::Offering(OfferingId::new("77"))
        );
        assert_eq!(catalog.scopes().len(), 1);
    }

    #[test]
    fn test_duplicate_offering_rejected() {
        let result = Catalog::new(vec![
            Offering::new("1", "A", date(2024, 1, 1)),
            Offering::new("1", "B", date(2024, 1, 1)),
        ]);
        assert_eq!(result, Err(Error::DuplicateOffering(OfferingId::new("1"))));
    }

    #[test]
    fn test_scope_parse_and_key() {
        assert_eq!(CounterScope::parse("global"), CounterScope::Global);
        assert_eq!(
            CounterScope::parse("offering:55"),
            CounterScope::Offering(OfferingId::new("55"))
        );
        assert_eq!(CounterScope::parse("55").key(), "offering:55");
    }

    #[test]
    fn test_catalog_from_json() {
        let json = r#"[
            {"id": "9", "title": "Rust", "launched_on": "2024-02-01", "flagship": true,
             "templates": {"male": "rust-m"}},
            {"id": "10", "title": "Go", "launched_on": "2024-03-01", "available": false}
        ]"#;
        let catalog = Catalog::from_json(json).unwrap();
        let rust = catalog.find("9").unwrap();
        assert!(rust.flagship);
        assert_eq!(rust.template_for(Gender::Male), "rust-m");
        assert_eq!(rust.template_for(Gender::Female), "9-female");
        assert!(!catalog.find("10").unwrap().available);
    }
}
