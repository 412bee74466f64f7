//! The `Launcher` trait and its process-backed implementation.
//!
//! Adapters never spawn workers directly; they ask a [`Launcher`] for an
//! [`EventBridge`]. The process launcher optionally gates spawning behind a
//! semaphore so the number of live workers stays bounded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::bridge::EventBridge;
use crate::query::ScrapeQuery;

use super::process::{SpawnError, WorkerCommand, WorkerProcess};

/// Default bridge queue length, in events.
pub const DEFAULT_BRIDGE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("worker capacity reached ({limit} running), try again later")]
    AtCapacity { limit: usize },

    #[error("worker admission closed")]
    Closed,
}

/// What to do when every worker slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Wait for a slot to free up.
    #[default]
    Queue,
    /// Fail the launch with [`LaunchError::AtCapacity`].
    Reject,
}

/// Starts a worker for a query and hands back its event sequence.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, query: &ScrapeQuery) -> Result<EventBridge, LaunchError>;
}

// Compile-time assertion: Launcher must be usable as `dyn Launcher`.
const _: () = {
    fn _assert_object_safe(_: &dyn Launcher) {}
};

#[derive(Debug, Clone)]
struct Admission {
    slots: Arc<Semaphore>,
    limit: usize,
    policy: AdmissionPolicy,
}

/// Spawns one worker process per launch.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: WorkerCommand,
    bridge_capacity: usize,
    admission: Option<Admission>,
}

impl ProcessLauncher {
    /// A launcher with no concurrency ceiling.
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            bridge_capacity: DEFAULT_BRIDGE_CAPACITY,
            admission: None,
        }
    }

    pub fn with_bridge_capacity(mut self, capacity: usize) -> Self {
        self.bridge_capacity = capacity.max(1);
        self
    }

    /// Allow at most `limit` workers to run at once.
    pub fn with_max_concurrent(mut self, limit: usize, policy: AdmissionPolicy) -> Self {
        let limit = limit.max(1);
        self.admission = Some(Admission {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            policy,
        });
        self
    }

    /// Number of free worker slots, or `None` when unbounded.
    pub fn available_slots(&self) -> Option<usize> {
        self.admission.as_ref().map(|a| a.slots.available_permits())
    }

    async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, LaunchError> {
        let Some(admission) = &self.admission else {
            return Ok(None);
        };
        let permit = match admission.policy {
            AdmissionPolicy::Reject => match Arc::clone(&admission.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    info!(limit = admission.limit, "rejecting launch, worker capacity reached");
                    return Err(LaunchError::AtCapacity {
                        limit: admission.limit,
                    });
                }
                Err(TryAcquireError::Closed) => return Err(LaunchError::Closed),
            },
            AdmissionPolicy::Queue => {
                if admission.slots.available_permits() == 0 {
                    debug!(limit = admission.limit, "worker capacity reached, queueing launch");
                }
                Arc::clone(&admission.slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| LaunchError::Closed)?
            }
        };
        Ok(Some(permit))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, query: &ScrapeQuery) -> Result<EventBridge, LaunchError> {
        let permit = self.admit().await?;
        let process = WorkerProcess::spawn(&self.command, query)?;
        Ok(EventBridge::spawn(process, self.bridge_capacity, permit))
    }
}
