//! Validators for interview input
//!
//! Each data-collecting step has one validator. A failed validation leaves
//! the interview where it is; the requester is asked again.

use std::sync::OnceLock;

use chrono::{Duration, NaiveDate};
use regex::Regex;

use crate::catalog::{Catalog, Gender, Offering};
use crate::ids::{ExternalAccountId, FullName};
use crate::{Error, Result};

/// Date format requesters type revocation dates in
pub const DATE_FORMAT: &str = "%d.%m.%Y";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[А-ЯЁA-Z][а-яёa-z]+ [А-ЯЁA-Z][а-яёa-z]+$").expect("name pattern compiles")
    })
}

/// Validate a "First Last" name
pub fn full_name(input: &str) -> Result<FullName> {
    let trimmed = input.trim();
    if name_pattern().is_match(trimmed) {
        Ok(FullName(trimmed.to_string()))
    } else {
        Err(Error::InvalidName)
    }
}

/// Validate a gender token
pub fn gender(input: &str) -> Result<Gender> {
    let token = input.trim();
    Gender::from_token(token).ok_or_else(|| Error::InvalidGender(token.to_string()))
}

/// Validate an offering token against the catalog
pub fn offering<'a>(catalog: &'a Catalog, input: &str) -> Result<&'a Offering> {
    let token = input.trim();
    let offering = catalog
        .find(token)
        .ok_or_else(|| Error::UnknownOffering(token.to_string()))?;
    if !offering.available {
        return Err(Error::OfferingUnavailable(offering.id.clone()));
    }
    Ok(offering)
}

/// Validate a revocation date: `DD.MM.YYYY`, within `[launch, today + 1]`
pub fn revocation_date(input: &str, offering: &Offering, today: NaiveDate) -> Result<NaiveDate> {
    let date =
        NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).map_err(|_| Error::InvalidDate)?;
    let earliest = offering.launched_on;
    let latest = today + Duration::days(1);
    if date < earliest || date > latest {
        return Err(Error::DateOutOfRange {
            date,
            earliest,
            latest,
        });
    }
    Ok(date)
}

/// Pattern for profile links on the external platform
///
/// Accepts `https://<host>/users/<digits>` with an optional `www.` prefix,
/// trailing slash, query or fragment, and extracts the account id.
#[derive(Debug, Clone)]
pub struct ProfileLinkPattern {
    host: String,
    regex: Regex,
}

impl ProfileLinkPattern {
    pub fn new(host: &str) -> Result<Self> {
        let host = host.trim().trim_end_matches('/');
        if host.is_empty() || host.contains('/') {
            return Err(Error::InvalidProfileHost(host.to_string()));
        }
        let pattern = format!(
            r"^https?://(?:www\.)?{}/users/(\d+)/?(?:[?#]\S*)?$",
            regex::escape(host)
        );
        let regex = Regex::new(&pattern).map_err(|e| Error::InvalidProfileHost(e.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            regex,
        })
    }

    /// Extract the account id from a profile link
    pub fn extract(&self, input: &str) -> Result<ExternalAccountId> {
        let invalid = || Error::InvalidProfileLink {
            host: self.host.clone(),
        };
        let captures = self.regex.captures(input.trim()).ok_or_else(invalid)?;
        captures
            .get(1)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(ExternalAccountId)
            .ok_or_else(invalid)
    }
}

/// Everything the interview needs to validate input at one point in time
#[derive(Debug, Clone, Copy)]
pub struct Validators<'a> {
    pub catalog: &'a Catalog,
    pub links: &'a ProfileLinkPattern,
    pub today: NaiveDate,
}
