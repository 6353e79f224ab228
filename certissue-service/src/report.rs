//! Operator notifications

use std::sync::Arc;

use async_trait::async_trait;
use certissue_core::{CounterScope, TargetId};

use crate::queue::{BatchCompletion, BatchReport, NotificationQueue};
use crate::store::{IssuanceCounter, Payload};

/// Sends alerts and bulk-send reports to every operator through the queue
pub struct AdminNotifier {
    queue: NotificationQueue,
    admins: Vec<TargetId>,
    counter: Arc<dyn IssuanceCounter>,
    scopes: Vec<CounterScope>,
}

impl AdminNotifier {
    pub fn new(
        queue: NotificationQueue,
        admins: Vec<TargetId>,
        counter: Arc<dyn IssuanceCounter>,
        scopes: Vec<CounterScope>,
    ) -> Self {
        Self {
            queue,
            admins,
            counter,
            scopes,
        }
    }

    pub fn admins(&self) -> &[TargetId] {
        &self.admins
    }

    /// Queue a text message for every operator
    pub fn alert(&self, text: &str) {
        for admin in &self.admins {
            if let Err(e) = self.queue.enqueue(*admin, Payload::text(text)) {
                tracing::error!(admin = %admin, error = %e, "Failed to queue operator alert");
            }
        }
    }

    /// Current value of each counter, one per line
    pub fn counter_lines(&self) -> String {
        self.scopes
            .iter()
            .map(|scope| match self.counter.current(scope) {
                Ok(value) => format!("Last serial ({}): {:06}", scope, value),
                Err(e) => format!("Last serial ({}): unavailable ({})", scope, e),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl BatchCompletion for AdminNotifier {
    async fn batch_completed(&self, report: BatchReport) {
        let text = format!(
            "Bulk send finished\nDelivered: {}\nFailed: {}\n\n{}",
            report.delivered,
            report.failed,
            self.counter_lines()
        );
        self.alert(&text);
    }
}
