//! Supervision and event bridging for the business scraper worker.
//!
//! A [`Launcher`] spawns one worker process per job and exposes its stdout as
//! an [`EventBridge`]. Three adapters consume a bridge: [`stream`] relays it
//! as SSE frames, [`aggregate`] drains it into one [`ScrapeOutcome`], and
//! [`webhook`] drains it in the background and posts the outcome to a
//! callback URL. Job lifecycles are tracked in a [`JobRegistry`].

pub mod aggregate;
pub mod bridge;
pub mod event;
pub mod query;
pub mod registry;
pub mod stream;
pub mod webhook;
pub mod worker;

pub use aggregate::{ScrapeOutcome, aggregate, record_outcome};
pub use bridge::{BridgeError, EventBridge};
pub use event::{BusinessRecord, Event, EventKind, Stats};
pub use query::{ScrapeQuery, ValidationError};
pub use registry::{Job, JobRegistry, JobStatus, ScrapeResult};
pub use stream::{StreamConfig, StreamFrame, StreamOutcome, run_stream_job};
pub use webhook::{WebhookNotifier, WebhookPayload, run_webhook_job};
pub use worker::{AdmissionPolicy, LaunchError, Launcher, ProcessLauncher, WorkerCommand};
