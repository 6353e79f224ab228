//! Delivery channel abstractions

pub mod bot;
pub mod console;

use std::time::Duration;

use async_trait::async_trait;
use certissue_core::TargetId;

pub use bot::{BotApiChannel, BotConfig};
pub use console::ConsoleChannel;

use crate::store::Payload;

/// How a single delivery attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// Retry after the given wait
    RateLimited(Duration),
    /// The target will never accept this; do not retry
    PermanentRejection(String),
    TransientError(String),
}

/// Trait for pushing payloads to requesters
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, target: TargetId, payload: &Payload) -> DeliveryOutcome;
}

/// Allow using Box<dyn DeliveryChannel> as a DeliveryChannel
#[async_trait]
impl DeliveryChannel for Box<dyn DeliveryChannel> {
    async fn deliver(&self, target: TargetId, payload: &Payload) -> DeliveryOutcome {
        (**self).deliver(target, payload).await
    }
}
