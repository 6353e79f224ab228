//! Service state management

use std::sync::Arc;
use std::time::Duration;

use certissue_core::{Catalog, ProfileLinkPattern, TargetId};

use crate::config::Config;
use crate::delivery::DeliveryChannel;
use crate::eligibility::EligibilityVerifier;
use crate::error::ServiceError;
use crate::gate::{Maintenance, NoRateLimit, RateLimiter, TtlRateLimiter};
use crate::generator::CertificateGenerator;
use crate::platform::PlatformClient;
use crate::queue::{NotificationQueue, WorkerPool};
use crate::report::AdminNotifier;
use crate::store::{IdentityLedger, IssuanceCounter, Stores};
use crate::workflow::{WorkflowDeps, WorkflowEngine};

/// External collaborators the service is assembled from
pub struct Components {
    pub stores: Stores,
    pub platform: Arc<dyn PlatformClient>,
    pub generator: Arc<dyn CertificateGenerator>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

/// Application state shared across handlers
pub struct AppState {
    pub engine: WorkflowEngine,
    pub queue: NotificationQueue,
    pub notifier: Arc<AdminNotifier>,
    pub ledger: Arc<dyn IdentityLedger>,
    pub counter: Arc<dyn IssuanceCounter>,
    pub catalog: Arc<Catalog>,
    pub limiter: Arc<dyn RateLimiter>,
    pub maintenance: Maintenance,
}

impl AppState {
    /// Wire the engine, queue and gate together and start the workers
    pub fn build(
        config: &Config,
        catalog: Catalog,
        components: Components,
    ) -> Result<(Self, WorkerPool), ServiceError> {
        let catalog = Arc::new(catalog);
        let stores = components.stores;
        let links = ProfileLinkPattern::new(&config.platform.profile_host)
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let (queue, workers) = NotificationQueue::start(
            components.delivery.clone(),
            stores.jobs.clone(),
            config.queue.settings(),
        );
        let notifier = Arc::new(AdminNotifier::new(
            queue.clone(),
            config.admins(),
            stores.counter.clone(),
            catalog.scopes(),
        ));
        let verifier = Arc::new(EligibilityVerifier::new(
            components.platform,
            config.platform.credentials(),
            config.platform.verifier_settings(),
        ));

        let engine = WorkflowEngine::new(WorkflowDeps {
            sessions: stores.sessions.clone(),
            ledger: stores.ledger.clone(),
            counter: stores.counter.clone(),
            verifier,
            generator: components.generator,
            delivery: components.delivery,
            notifier: notifier.clone(),
            catalog: catalog.clone(),
            links,
            retry: config.queue.retry_policy(),
        });

        let limiter: Arc<dyn RateLimiter> = if config.throttle.window_ms == 0 {
            Arc::new(NoRateLimit)
        } else {
            Arc::new(TtlRateLimiter::new(
                Duration::from_millis(config.throttle.window_ms),
                Duration::from_millis(config.throttle.cooldown_ms),
            ))
        };

        let state = Self {
            engine,
            queue,
            notifier,
            ledger: stores.ledger,
            counter: stores.counter,
            catalog,
            limiter,
            maintenance: Maintenance::new(config.maintenance),
        };
        Ok((state, workers))
    }

    pub fn is_admin(&self, id: i64) -> bool {
        self.notifier.admins().contains(&TargetId(id))
    }
}
