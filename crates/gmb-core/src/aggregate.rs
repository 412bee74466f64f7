//! Aggregating adapter: drain an event sequence into a single outcome.

use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::{BridgeError, ResultCache};
use crate::event::{BusinessRecord, Event, EventKind, Stats};
use crate::query::ScrapeQuery;
use crate::registry::{JobRegistry, ScrapeResult};

/// Message used when a drain produced nothing and reported no error.
pub const NO_RESULTS_MESSAGE: &str = "no businesses found";

/// Result of draining one job's events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeOutcome {
    pub stats: Stats,
    pub businesses: Vec<BusinessRecord>,
    /// Set when the worker reported an error or the job could not run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScrapeOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            stats: Stats::default(),
            businesses: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// No error and at least one business. A clean run with zero results is
    /// *not* a success.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.businesses.is_empty()
    }

    /// The error to show a caller when [`is_success`](Self::is_success) is
    /// false.
    pub fn failure_message(&self) -> &str {
        self.error.as_deref().unwrap_or(NO_RESULTS_MESSAGE)
    }
}

/// Drain `events` to the first terminal event (or the end of the sequence).
pub async fn aggregate<S>(events: S) -> ScrapeOutcome
where
    S: Stream<Item = Result<Event, BridgeError>>,
{
    let mut events = std::pin::pin!(events);
    let mut cache = ResultCache::new();

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => cache.absorb(event),
            Err(e) => {
                warn!(error = %e, "event sequence failed");
                return ScrapeOutcome::failed(e.to_string());
            }
        };
        match event.kind {
            EventKind::Complete { stats, businesses } => {
                let stats = stats.unwrap_or_else(|| cache.current_stats());
                return ScrapeOutcome {
                    stats,
                    businesses,
                    error: None,
                };
            }
            EventKind::Error { message } => {
                debug!(error = %message, "worker reported an error");
                return ScrapeOutcome::failed(message);
            }
            _ => {}
        }
    }

    debug!("event sequence ended without a terminal event");
    let (stats, businesses) = cache.into_parts();
    ScrapeOutcome {
        stats,
        businesses,
        error: None,
    }
}

/// Store `outcome` as the terminal state of `job_id`.
///
/// A worker error becomes `error`; anything else, including an empty run,
/// becomes `completed`.
pub async fn record_outcome(
    registry: &JobRegistry,
    job_id: Uuid,
    query: &ScrapeQuery,
    outcome: &ScrapeOutcome,
) {
    let recorded = match &outcome.error {
        Some(message) => registry.fail(job_id, message.clone()).await,
        None => {
            let result = ScrapeResult::new(
                query.clone(),
                outcome.stats.clone(),
                outcome.businesses.clone(),
            );
            registry.complete(job_id, result).await
        }
    };
    if let Err(e) = recorded {
        warn!(job_id = %job_id, error = %e, "failed to record job outcome");
    }
}
