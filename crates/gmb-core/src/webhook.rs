//! Webhook adapter: run a job off the request path and POST the outcome to a
//! caller-supplied URL.
//!
//! Delivery is best effort. A failed POST is logged and not retried, and it
//! never changes the job's registry record.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::{ScrapeOutcome, aggregate, record_outcome};
use crate::event::{BusinessRecord, Stats};
use crate::query::ScrapeQuery;
use crate::registry::JobRegistry;
use crate::worker::Launcher;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid webhook url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("webhook endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Body of the outbound callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WebhookPayload {
    Success {
        job_id: Uuid,
        success: bool,
        query: ScrapeQuery,
        stats: Stats,
        businesses: Vec<BusinessRecord>,
        total_businesses: usize,
    },
    Failure {
        job_id: Uuid,
        success: bool,
        query: ScrapeQuery,
        error: String,
    },
}

impl WebhookPayload {
    pub fn from_outcome(job_id: Uuid, query: &ScrapeQuery, outcome: &ScrapeOutcome) -> Self {
        if outcome.is_success() {
            WebhookPayload::Success {
                job_id,
                success: true,
                query: query.clone(),
                stats: outcome.stats.clone(),
                total_businesses: outcome.businesses.len(),
                businesses: outcome.businesses.clone(),
            }
        } else {
            WebhookPayload::Failure {
                job_id,
                success: false,
                query: query.clone(),
                error: outcome.failure_message().to_string(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WebhookPayload::Success { .. })
    }
}

/// Parse and check a callback URL. Only `http` and `https` are accepted.
pub fn parse_webhook_url(raw: &str) -> Result<Url, WebhookError> {
    let url = Url::parse(raw).map_err(|e| WebhookError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(WebhookError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

/// Outbound HTTP client for callbacks.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_WEBHOOK_TIMEOUT)
    }
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build webhook client, using defaults");
                Client::new()
            });
        Self { client }
    }

    /// POST `payload` as JSON. Any non-2xx answer is an error.
    pub async fn deliver(&self, url: &Url, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self.client.post(url.clone()).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WebhookError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Launch, aggregate, record, then call back.
///
/// Meant to be `tokio::spawn`ed by the request handler after it has
/// acknowledged the caller. The registry entry for `job_id` must exist.
pub async fn run_webhook_job(
    job_id: Uuid,
    query: ScrapeQuery,
    url: Url,
    launcher: Arc<dyn Launcher>,
    registry: JobRegistry,
    notifier: WebhookNotifier,
) {
    let outcome = match launcher.launch(&query).await {
        Ok(bridge) => aggregate(bridge).await,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to launch worker for webhook job");
            ScrapeOutcome::failed(e.to_string())
        }
    };
    record_outcome(&registry, job_id, &query, &outcome).await;

    let payload = WebhookPayload::from_outcome(job_id, &query, &outcome);
    match notifier.deliver(&url, &payload).await {
        Ok(()) => info!(
            job_id = %job_id,
            url = %url,
            success = payload.is_success(),
            "webhook delivered"
        ),
        Err(e) => warn!(job_id = %job_id, url = %url, error = %e, "webhook delivery failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> ScrapeQuery {
        ScrapeQuery::new("pharmacie", "Lille", 3)
    }

    #[test]
    fn success_payload_shape() {
        let outcome = ScrapeOutcome {
            stats: Stats {
                total: 1,
                ..Default::default()
            },
            businesses: vec![BusinessRecord {
                name: "Pharmacie du Centre".into(),
                ..Default::default()
            }],
            error: None,
        };
        let id = Uuid::new_v4();
        let json = serde_json::to_value(WebhookPayload::from_outcome(id, &query(), &outcome)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["job_id"], id.to_string());
        assert_eq!(json["total_businesses"], 1);
        assert_eq!(json["query"]["city"], "Lille");
        assert_eq!(json["businesses"][0]["name"], "Pharmacie du Centre");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failure_payload_shape() {
        let json = serde_json::to_value(WebhookPayload::from_outcome(
            Uuid::new_v4(),
            &query(),
            &ScrapeOutcome::failed("boom"),
        ))
        .unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
        assert!(json.get("businesses").is_none());
    }

    #[test]
    fn empty_run_is_reported_as_failure() {
        let outcome = ScrapeOutcome {
            stats: Stats::default(),
            businesses: vec![],
            error: None,
        };
        let payload = WebhookPayload::from_outcome(Uuid::new_v4(), &query(), &outcome);
        assert!(!payload.is_success());
    }

    #[test]
    fn url_validation() {
        assert!(parse_webhook_url("https://hooks.example.com/scrape").is_ok());
        assert!(parse_webhook_url("http://127.0.0.1:9000/cb").is_ok());
        assert!(matches!(
            parse_webhook_url("ftp://example.com/cb"),
            Err(WebhookError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_webhook_url("not a url"),
            Err(WebhookError::InvalidUrl { .. })
        ));
    }
}
