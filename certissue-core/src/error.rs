//! Error types for interview input and catalog handling

use chrono::NaiveDate;
use thiserror::Error;

use crate::ids::OfferingId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Full name must be a first and last name, each capitalised")]
    InvalidName,

    #[error("Unknown gender: {0}")]
    InvalidGender(String),

    #[error("Unknown offering: {0}")]
    UnknownOffering(String),

    #[error("Offering {0} is not open for certificates yet")]
    OfferingUnavailable(OfferingId),

    #[error("Date must be written as DD.MM.YYYY")]
    InvalidDate,

    #[error("Date {date} is outside the accepted range {earliest}..={latest}")]
    DateOutOfRange {
        date: NaiveDate,
        earliest: NaiveDate,
        latest: NaiveDate,
    },

    #[error("Not a profile link on {host}")]
    InvalidProfileLink { host: String },

    #[error("Invalid profile host: {0}")]
    InvalidProfileHost(String),

    #[error("Action {action} is not accepted at step {step}")]
    UnexpectedAction {
        action: &'static str,
        step: &'static str,
    },

    #[error("Duplicate offering in catalog: {0}")]
    DuplicateOffering(OfferingId),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}
