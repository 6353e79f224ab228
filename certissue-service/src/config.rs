//! Service configuration

use std::time::Duration;

use certissue_core::{Catalog, TargetId};
use serde::Deserialize;

use crate::delivery::BotConfig;
use crate::eligibility::VerifierSettings;
use crate::error::ServiceError;
use crate::platform::ClientCredentials;
use crate::queue::QueueSettings;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// SQLite database file; in-memory stores when unset
    pub database_path: Option<String>,

    /// Where generated certificates are written
    pub artifact_dir: String,

    /// Requester ids with operator rights
    pub admin_ids: Vec<i64>,

    /// Start with maintenance mode on
    pub maintenance: bool,

    /// Stamp generated certificates as a test version
    pub watermark: bool,

    /// JSON offering catalog; the built-in catalog when unset
    pub offerings_file: Option<String>,

    pub platform: PlatformConfig,

    /// Bot API delivery; console delivery when unset
    pub bot: Option<BotConfig>,

    pub queue: QueueConfig,

    pub throttle: ThrottleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub base_url: String,
    /// Host accepted in profile links
    pub profile_host: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub max_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_rate_limit_waits: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Zero disables throttling
    pub window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_path: None,
            artifact_dir: "certificates".to_string(),
            admin_ids: Vec::new(),
            maintenance: false,
            watermark: false,
            offerings_file: None,
            platform: PlatformConfig::default(),
            bot: None,
            queue: QueueConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "https://stepik.org".to_string(),
            profile_host: "stepik.org".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout_secs: 10,
            max_attempts: 3,
            max_pages: 100,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            base_delay_ms: 2000,
            max_rate_limit_waits: 5,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: 700,
            cooldown_ms: 5000,
        }
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env(key).and_then(|s| s.parse().ok())
}

fn flag_env(key: &str) -> Option<bool> {
    get_env(key).map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Admin ids separated by spaces or commas
fn parse_ids(s: &str) -> Vec<i64> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset or empty variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let platform = PlatformConfig {
            base_url: get_env("PLATFORM_URL").unwrap_or(defaults.platform.base_url),
            profile_host: get_env("PROFILE_HOST").unwrap_or(defaults.platform.profile_host),
            client_id: get_env("PLATFORM_CLIENT_ID").unwrap_or_default(),
            client_secret: get_env("PLATFORM_CLIENT_SECRET").unwrap_or_default(),
            timeout_secs: parse_env("PLATFORM_TIMEOUT_SECS")
                .unwrap_or(defaults.platform.timeout_secs),
            max_attempts: parse_env("PLATFORM_MAX_ATTEMPTS")
                .unwrap_or(defaults.platform.max_attempts),
            max_pages: parse_env("PLATFORM_MAX_PAGES").unwrap_or(defaults.platform.max_pages),
        };
        let queue = QueueConfig {
            concurrency: parse_env("QUEUE_CONCURRENCY").unwrap_or(defaults.queue.concurrency),
            max_attempts: parse_env("QUEUE_MAX_ATTEMPTS").unwrap_or(defaults.queue.max_attempts),
            base_delay_ms: parse_env("QUEUE_BASE_DELAY_MS").unwrap_or(defaults.queue.base_delay_ms),
            max_rate_limit_waits: parse_env("QUEUE_MAX_RATE_LIMIT_WAITS")
                .unwrap_or(defaults.queue.max_rate_limit_waits),
        };
        let throttle = ThrottleConfig {
            window_ms: parse_env("THROTTLE_WINDOW_MS").unwrap_or(defaults.throttle.window_ms),
            cooldown_ms: parse_env("THROTTLE_COOLDOWN_MS").unwrap_or(defaults.throttle.cooldown_ms),
        };

        Self {
            port: parse_env("PORT").unwrap_or(defaults.port),
            database_path: get_env("DATABASE_PATH"),
            artifact_dir: get_env("ARTIFACT_DIR").unwrap_or(defaults.artifact_dir),
            admin_ids: get_env("ADMIN_IDS").map(|s| parse_ids(&s)).unwrap_or_default(),
            maintenance: flag_env("MAINTENANCE").unwrap_or(defaults.maintenance),
            watermark: flag_env("WATERMARK").unwrap_or(defaults.watermark),
            offerings_file: get_env("OFFERINGS_FILE"),
            platform,
            bot: BotConfig::from_env(),
            queue,
            throttle,
        }
    }

    pub fn admins(&self) -> Vec<TargetId> {
        self.admin_ids.iter().copied().map(TargetId).collect()
    }

    /// Catalog from `offerings_file`, or the built-in one
    pub fn load_catalog(&self) -> Result<Catalog, ServiceError> {
        match &self.offerings_file {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .map_err(|e| ServiceError::Internal(format!("cannot read {}: {}", path, e)))?;
                Catalog::from_json(&json).map_err(|e| ServiceError::ValidationError(e.to_string()))
            }
            None => Ok(Catalog::default()),
        }
    }
}

impl PlatformConfig {
    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    pub fn verifier_settings(&self) -> VerifierSettings {
        VerifierSettings {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            call_timeout: Duration::from_secs(self.timeout_secs),
            max_pages: self.max_pages,
            ..VerifierSettings::default()
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_rate_limit_waits: self.max_rate_limit_waits,
            ..RetryPolicy::default()
        }
    }

    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            concurrency: self.concurrency,
            retry: self.retry_policy(),
        }
    }
}
