//! Certificate issuance service
//!
//! Walks requesters through a short interview, verifies their completion
//! against an external learning platform, and issues serially numbered
//! certificates. Also runs a durable notification queue for operator
//! broadcasts.

pub mod config;
pub mod delivery;
pub mod eligibility;
pub mod error;
pub mod gate;
pub mod generator;
pub mod platform;
pub mod queue;
pub mod report;
pub mod retry;
pub mod routes;
pub mod state;
pub mod store;
pub mod workflow;

pub use config::Config;
pub use delivery::{BotApiChannel, ConsoleChannel, DeliveryChannel, DeliveryOutcome};
pub use eligibility::{Eligibility, EligibilityVerifier, VerifierSettings, VerifyError};
pub use error::ServiceError;
pub use generator::{Artifact, CertificateGenerator, GenerationError, TextCertificateGenerator};
pub use platform::{HttpPlatformClient, PlatformClient, PlatformError};
pub use queue::{BatchCompletion, BatchReport, NotificationQueue, QueueSettings, WorkerPool};
pub use retry::RetryPolicy;
pub use state::{AppState, Components};
pub use store::{SqliteStore, Stores};
pub use workflow::{Reply, WorkflowDeps, WorkflowEngine, WorkflowError};
