//! Streaming adapter: relay one job's events to a live client as
//! Server-Sent-Events frames, with a heartbeat.
//!
//! The adapter writes [`StreamFrame`]s into a bounded channel that the HTTP
//! layer turns into the response body. A failed send means the client went
//! away.
//!
//! ```text
//!   job ──► [launch] ──► event ─► event ─► ... ─► complete | error
//!            ping          ping        ping
//! ```
//!
//! Worker events and pings are produced by the same task, so a ping can never
//! follow the terminal frame.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{BridgeError, ResultCache};
use crate::event::{Event, EventKind};
use crate::query::ScrapeQuery;
use crate::registry::{JobRegistry, ScrapeResult};
use crate::worker::{Launcher, WorkerControl};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Registry message for a stream whose client vanished before a worker was
/// started.
pub const ABANDONED_MESSAGE: &str = "client disconnected before the job started";

/// One SSE message: `event: <event>\ndata: <data>\n\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
}

impl StreamFrame {
    /// Frame an event. Worker events keep every field they were printed with.
    pub fn from_event(event: &Event) -> Self {
        let data = match event.to_json() {
            Ok(value) => value.to_string(),
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                "{}".to_string()
            }
        };
        Self {
            event: event.name().to_string(),
            data,
        }
    }

    /// Wire form of the frame.
    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }

    pub fn is_ping(&self) -> bool {
        self.event == "ping"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Period between pings.
    pub heartbeat: Duration,
    /// Terminate the worker when the client disconnects. Off by default: the
    /// worker then runs to completion unobserved.
    pub cancel_on_disconnect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            cancel_on_disconnect: false,
        }
    }
}

/// How a streaming job ended, from the adapter's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The worker sent `complete`.
    Completed,
    /// The worker sent `error`, could not be launched, or its output failed.
    Failed,
    /// The client went away before a terminal frame was written.
    Disconnected,
    /// The worker's output ended without a terminal event.
    Exhausted,
}

/// Drive one streaming job from the `job` frame to its terminal frame.
///
/// The registry entry for `job_id` must already exist. Returns once a
/// terminal frame has been written, the event sequence has ended, or the
/// client has disconnected.
pub async fn run_stream_job(
    job_id: Uuid,
    query: ScrapeQuery,
    launcher: Arc<dyn Launcher>,
    registry: JobRegistry,
    config: StreamConfig,
    sink: mpsc::Sender<StreamFrame>,
) -> StreamOutcome {
    if sink.send(StreamFrame::from_event(&Event::job(job_id))).await.is_err() {
        return abandon(&registry, job_id).await;
    }

    let mut ticker = heartbeat(config.heartbeat);

    // Launching may wait for a worker slot; keep the client alive meanwhile.
    let launch = launcher.launch(&query);
    tokio::pin!(launch);
    let launched = loop {
        tokio::select! {
            biased;
            result = &mut launch => break result,
            _ = ticker.tick() => {
                if sink.send(StreamFrame::from_event(&Event::ping())).await.is_err() {
                    return abandon(&registry, job_id).await;
                }
            }
        }
    };

    let bridge = match launched {
        Ok(bridge) => bridge,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to launch worker for stream");
            record_failure(&registry, job_id, e.to_string()).await;
            let _ = sink.send(StreamFrame::from_event(&Event::error(e.to_string()))).await;
            return StreamOutcome::Failed;
        }
    };
    info!(job_id = %job_id, pid = ?bridge.pid(), "streaming worker events");

    let control = bridge.control().cloned();
    let job = StreamJob {
        job_id,
        query: &query,
        registry: &registry,
        config: &config,
        sink: &sink,
        control: control.as_ref(),
    };
    job.forward(bridge, &mut ticker).await
}

struct StreamJob<'a> {
    job_id: Uuid,
    query: &'a ScrapeQuery,
    registry: &'a JobRegistry,
    config: &'a StreamConfig,
    sink: &'a mpsc::Sender<StreamFrame>,
    control: Option<&'a WorkerControl>,
}

impl StreamJob<'_> {
    async fn forward<S>(&self, events: S, ticker: &mut Interval) -> StreamOutcome
    where
        S: Stream<Item = Result<Event, BridgeError>>,
    {
        let mut events = std::pin::pin!(events);
        let mut cache = ResultCache::new();

        loop {
            tokio::select! {
                biased;
                item = events.next() => match item {
                    Some(Ok(event)) => {
                        let event = cache.absorb(event);
                        if let Some(outcome) = self.relay(event, &cache).await {
                            return outcome;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(job_id = %self.job_id, error = %e, "worker event sequence failed");
                        record_failure(self.registry, self.job_id, e.to_string()).await;
                        if !self.send(Event::error(e.to_string())).await {
                            return self.disconnected();
                        }
                        return StreamOutcome::Failed;
                    }
                    None => {
                        debug!(job_id = %self.job_id, "worker output ended without a terminal event");
                        let (stats, businesses) = std::mem::take(&mut cache).into_parts();
                        let result = ScrapeResult::new(self.query.clone(), stats, businesses);
                        if let Err(e) = self.registry.complete(self.job_id, result).await {
                            warn!(job_id = %self.job_id, error = %e, "failed to record job outcome");
                        }
                        return StreamOutcome::Exhausted;
                    }
                },
                _ = ticker.tick() => {
                    if !self.send(Event::ping()).await {
                        return self.disconnected();
                    }
                }
            }
        }
    }

    /// Forward one worker event. Returns the outcome if the job is over.
    async fn relay(&self, event: Event, cache: &ResultCache) -> Option<StreamOutcome> {
        // The registry is updated before the terminal frame goes out, so a
        // client that polls right after `complete` sees the stored result.
        let terminal = match &event.kind {
            EventKind::Complete { stats, businesses } => {
                let stats = stats.clone().unwrap_or_else(|| cache.current_stats());
                let result = ScrapeResult::new(self.query.clone(), stats, businesses.clone());
                info!(
                    job_id = %self.job_id,
                    businesses = result.total_businesses,
                    "stream job completed"
                );
                if let Err(e) = self.registry.complete(self.job_id, result).await {
                    warn!(job_id = %self.job_id, error = %e, "failed to record job outcome");
                }
                Some(StreamOutcome::Completed)
            }
            EventKind::Error { message } => {
                info!(job_id = %self.job_id, error = %message, "worker reported an error");
                record_failure(self.registry, self.job_id, message.clone()).await;
                Some(StreamOutcome::Failed)
            }
            _ => None,
        };

        if !self.send(event).await {
            return Some(self.disconnected());
        }
        terminal
    }

    async fn send(&self, event: Event) -> bool {
        self.sink.send(StreamFrame::from_event(&event)).await.is_ok()
    }

    fn disconnected(&self) -> StreamOutcome {
        match self.control {
            Some(control) if self.config.cancel_on_disconnect => {
                info!(job_id = %self.job_id, pid = control.pid(), "client disconnected, terminating worker");
                control.terminate();
            }
            _ => info!(job_id = %self.job_id, "client disconnected, worker left running"),
        }
        StreamOutcome::Disconnected
    }
}

fn heartbeat(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn abandon(registry: &JobRegistry, job_id: Uuid) -> StreamOutcome {
    info!(job_id = %job_id, "client disconnected before a worker was started");
    record_failure(registry, job_id, ABANDONED_MESSAGE).await;
    StreamOutcome::Disconnected
}

async fn record_failure(registry: &JobRegistry, job_id: Uuid, message: impl Into<String>) {
    if let Err(e) = registry.fail(job_id, message).await {
        warn!(job_id = %job_id, error = %e, "failed to record job failure");
    }
}
