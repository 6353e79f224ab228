//! Messaging bot API delivery channel for production

use std::time::Duration;

use async_trait::async_trait;
use certissue_core::TargetId;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{DeliveryChannel, DeliveryOutcome};
use crate::store::Payload;

/// Configuration for the bot API
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// API base URL (e.g., "https://api.telegram.org")
    pub api_url: String,
    pub token: String,
    pub timeout_secs: u64,
}

impl BotConfig {
    /// Create config from environment variables
    ///
    /// Required:
    /// - BOT_TOKEN
    ///
    /// Optional:
    /// - BOT_API_URL (default: https://api.telegram.org)
    /// - BOT_TIMEOUT_SECS (default: 30)
    pub fn from_env() -> Option<Self> {
        fn get_env(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|s| !s.is_empty())
        }

        let token = get_env("BOT_TOKEN")?;
        let api_url =
            get_env("BOT_API_URL").unwrap_or_else(|| "https://api.telegram.org".to_string());
        let timeout_secs = get_env("BOT_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Some(Self {
            api_url,
            token,
            timeout_secs,
        })
    }
}

#[derive(Deserialize)]
struct ApiReply {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Deserialize)]
struct ReplyParameters {
    retry_after: Option<u64>,
}

/// Delivery channel backed by a Telegram-style bot HTTP API
pub struct BotApiChannel {
    client: reqwest::Client,
    config: BotConfig,
}

impl BotApiChannel {
    pub fn new(config: BotConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| e.to_string())?;

        tracing::info!(api_url = %config.api_url, "Bot API channel configured");

        Ok(Self { client, config })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.token,
            method
        )
    }

    async fn send(
        &self,
        target: TargetId,
        payload: &Payload,
    ) -> Result<reqwest::Response, DeliveryOutcome> {
        let request = match payload {
            Payload::Text { text } => self
                .client
                .post(self.method_url("sendMessage"))
                .json(&json!({ "chat_id": target.0, "text": text })),
            Payload::Document { path, caption } => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    let reason = format!("cannot read {}: {}", path.display(), e);
                    DeliveryOutcome::PermanentRejection(reason)
                })?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "certificate".to_string());
                let form = Form::new()
                    .text("chat_id", target.0.to_string())
                    .text("caption", caption.clone())
                    .part("document", Part::bytes(bytes).file_name(file_name));
                self.client.post(self.method_url("sendDocument")).multipart(form)
            }
        };

        request
            .send()
            .await
            .map_err(|e| DeliveryOutcome::TransientError(e.to_string()))
    }
}

/// Classify a non-success bot API reply
fn classify(status: StatusCode, reply: Option<ApiReply>) -> DeliveryOutcome {
    let description = reply
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let wait = reply
                .and_then(|r| r.parameters)
                .and_then(|p| p.retry_after)
                .unwrap_or(1);
            DeliveryOutcome::RateLimited(Duration::from_secs(wait))
        }
        // Blocked, unknown chat, malformed request
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND => DeliveryOutcome::PermanentRejection(description),
        _ => DeliveryOutcome::TransientError(description),
    }
}

#[async_trait]
impl DeliveryChannel for BotApiChannel {
    async fn deliver(&self, target: TargetId, payload: &Payload) -> DeliveryOutcome {
        let response = match self.send(target, payload).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };

        let status = response.status();
        if status.is_success() {
            return DeliveryOutcome::Success;
        }

        let reply = response.json::<ApiReply>().await.ok();
        let outcome = classify(status, reply);
        tracing::debug!(
            target_id = %target,
            status = status.as_u16(),
            outcome = ?outcome,
            "Bot API refused delivery"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(body: serde_json::Value) -> Option<ApiReply> {
        serde_json::from_value(body).ok()
    }

    #[test]
    fn test_rate_limit_uses_retry_after() {
        let outcome = classify(
            StatusCode::TOO_MANY_REQUESTS,
            reply(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests",
                "parameters": { "retry_after": 7 }
            })),
        );
        assert_eq!(outcome, DeliveryOutcome::RateLimited(Duration::from_secs(7)));
    }

    #[test]
    fn test_blocked_target_is_permanent() {
        let outcome = classify(
            StatusCode::FORBIDDEN,
            reply(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })),
        );
        assert_eq!(
            outcome,
            DeliveryOutcome::PermanentRejection("Forbidden: bot was blocked by the user".into())
        );
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, None),
            DeliveryOutcome::TransientError(_)
        ));
    }
}
