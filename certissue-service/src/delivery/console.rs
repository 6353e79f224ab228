//! Console delivery channel for development

use async_trait::async_trait;
use certissue_core::TargetId;

use super::{DeliveryChannel, DeliveryOutcome};
use crate::store::Payload;

/// Delivery channel that logs to console (for development)
pub struct ConsoleChannel;

impl ConsoleChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for ConsoleChannel {
    async fn deliver(&self, target: TargetId, payload: &Payload) -> DeliveryOutcome {
        println!();
        println!("========================================");
        println!("  MESSAGE FOR: {}", target);
        match payload {
            Payload::Text { text } => println!("  {}", text),
            Payload::Document { path, caption } => {
                println!("  DOCUMENT: {}", path.display());
                println!("  {}", caption);
            }
        }
        println!("========================================");
        println!();

        tracing::info!(target_id = %target, "Message delivered to console");

        DeliveryOutcome::Success
    }
}
