//! Certificate issuance core library
//!
//! Domain model for issuing course-completion certificates:
//! - Requesters describe what they completed through a fixed, linear interview
//! - Each interview step carries only the fields collected so far
//! - A binding ties one external platform account to one requester per offering

pub mod binding;
pub mod catalog;
pub mod error;
pub mod ids;
pub mod interview;
pub mod validate;

pub use binding::{BindConflict, BindOutcome, IdentityBinding};
pub use catalog::{Catalog, CounterScope, Gender, Offering};
pub use error::Error;
pub use ids::{ExternalAccountId, FullName, OfferingId, RequesterId, Serial, TargetId};
pub use interview::{Action, Application, Interview, Next, Step, Summary};
pub use validate::{ProfileLinkPattern, Validators};

/// Result type for certissue-core operations
pub type Result<T> = std::result::Result<T, Error>;
