//! In-memory job registry.
//!
//! Maps job ids to their lifecycle record. A job is created `running` when a
//! request is accepted and transitions exactly once, to `completed` or
//! `error`. Records are kept for the life of the process unless a retention
//! period is configured, in which case terminal jobs older than it are
//! evicted lazily on the next `create`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{BusinessRecord, Stats};
use crate::query::ScrapeQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// The stored outcome of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub query: ScrapeQuery,
    pub stats: Stats,
    pub businesses: Vec<BusinessRecord>,
    pub total_businesses: usize,
}

impl ScrapeResult {
    pub fn new(query: ScrapeQuery, stats: Stats, businesses: Vec<BusinessRecord>) -> Self {
        Self {
            query,
            stats,
            total_businesses: businesses.len(),
            businesses,
        }
    }
}

/// One job's lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScrapeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job {0} already exists")]
    Duplicate(Uuid),

    #[error("job {0} not found")]
    Unknown(Uuid),

    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: Uuid, status: JobStatus },
}

/// Shared, cloneable handle to the job map.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    retention: Option<Duration>,
}

impl JobRegistry {
    /// A registry that never evicts.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that evicts terminal jobs once they are older than
    /// `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::default(),
            retention: Some(retention),
        }
    }

    /// Insert a new `running` job.
    pub async fn create(&self, job_id: Uuid) -> Result<Job, RegistryError> {
        let mut jobs = self.jobs.write().await;
        if let Some(retention) = self.retention {
            evict_expired(&mut jobs, retention, Utc::now());
        }
        if jobs.contains_key(&job_id) {
            return Err(RegistryError::Duplicate(job_id));
        }
        let job = Job {
            job_id,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        };
        jobs.insert(job_id, job.clone());
        debug!(job_id = %job_id, "job created");
        Ok(job)
    }

    /// Transition `running -> completed`.
    pub async fn complete(&self, job_id: Uuid, result: ScrapeResult) -> Result<(), RegistryError> {
        self.finish(job_id, JobStatus::Completed, |job| job.result = Some(result))
            .await
    }

    /// Transition `running -> error`.
    pub async fn fail(&self, job_id: Uuid, message: impl Into<String>) -> Result<(), RegistryError> {
        let message = message.into();
        self.finish(job_id, JobStatus::Error, |job| job.error = Some(message))
            .await
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(RegistryError::Unknown(job_id))?;
        if job.status.is_terminal() {
            warn!(job_id = %job_id, current = %job.status, attempted = %status, "ignoring second terminal transition");
            return Err(RegistryError::AlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        job.status = status;
        job.completed_at = Some(Utc::now());
        apply(job);
        debug!(job_id = %job_id, status = %status, "job finished");
        Ok(())
    }

    /// Snapshot of one job.
    pub async fn get(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Number of jobs still `running`.
    pub async fn running(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

fn evict_expired(jobs: &mut HashMap<Uuid, Job>, retention: Duration, now: DateTime<Utc>) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return;
    };
    let before = jobs.len();
    jobs.retain(|_, job| match job.completed_at {
        Some(done) => now - done < retention,
        None => true,
    });
    let evicted = before - jobs.len();
    if evicted > 0 {
        debug!(evicted, remaining = jobs.len(), "evicted expired jobs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(n: usize) -> ScrapeResult {
        let businesses = (0..n)
            .map(|i| BusinessRecord {
                name: format!("biz-{i}"),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        ScrapeResult::new(
            ScrapeQuery::new("fleuriste", "Nantes", 2),
            Stats::tally(&businesses, 0, 1.0),
            businesses,
        )
    }

    #[tokio::test]
    async fn create_then_get() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        let created = registry.create(id).await.unwrap();
        assert_eq!(created.status, JobStatus::Running);

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.completed_at.is_none());
        assert!(job.result.is_none());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn running_counts_only_unfinished_jobs() {
        let registry = JobRegistry::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for id in [a, b, c] {
            registry.create(id).await.unwrap();
        }
        registry.complete(a, result(1)).await.unwrap();
        registry.fail(b, "captcha").await.unwrap();

        assert_eq!(registry.running().await, 1);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        registry.create(id).await.unwrap();
        assert_eq!(registry.create(id).await.unwrap_err(), RegistryError::Duplicate(id));
    }

    #[tokio::test]
    async fn complete_sets_result_and_timestamp() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        registry.create(id).await.unwrap();
        registry.complete(id, result(2)).await.unwrap();

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.unwrap() >= job.started_at);
        assert_eq!(job.result.unwrap().total_businesses, 2);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn terminal_state_is_never_overwritten() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        registry.create(id).await.unwrap();
        registry.fail(id, "boom").await.unwrap();

        let err = registry.complete(id, result(1)).await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyTerminal {
                job_id: id,
                status: JobStatus::Error
            }
        );
        assert!(registry.fail(id, "second").await.is_err());

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn unknown_job() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        assert!(registry.get(id).await.is_none());
        assert_eq!(registry.fail(id, "x").await.unwrap_err(), RegistryError::Unknown(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_jobs_do_not_interfere() {
        let registry = JobRegistry::new();
        let ids: Vec<Uuid> = (0..64).map(|_| Uuid::new_v4()).collect();

        let handles: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.create(id).await.unwrap();
                    tokio::task::yield_now().await;
                    if i % 2 == 0 {
                        registry.complete(id, result(i)).await.unwrap();
                    } else {
                        registry.fail(id, format!("failed-{i}")).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len().await, ids.len());
        for (i, id) in ids.iter().enumerate() {
            let job = registry.get(*id).await.unwrap();
            if i % 2 == 0 {
                assert_eq!(job.status, JobStatus::Completed);
                assert_eq!(job.result.unwrap().total_businesses, i);
            } else {
                assert_eq!(job.status, JobStatus::Error);
                assert_eq!(job.error.unwrap(), format!("failed-{i}"));
            }
        }
    }

    #[tokio::test]
    async fn serializes_without_absent_fields() {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        let job = registry.create(id).await.unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["job_id"], id.to_string());
        assert!(json.get("completed_at").is_none());
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn eviction_keeps_running_and_recent_jobs() {
        let now = Utc::now();
        let job = |status, completed_at| Job {
            job_id: Uuid::new_v4(),
            status,
            started_at: now - chrono::Duration::hours(2),
            completed_at,
            result: None,
            error: None,
        };
        let running = job(JobStatus::Running, None);
        let recent = job(JobStatus::Completed, Some(now - chrono::Duration::seconds(10)));
        let old = job(JobStatus::Error, Some(now - chrono::Duration::hours(1)));

        let mut jobs = HashMap::new();
        for j in [&running, &recent, &old] {
            jobs.insert(j.job_id, j.clone());
        }
        evict_expired(&mut jobs, Duration::from_secs(60), now);

        assert!(jobs.contains_key(&running.job_id));
        assert!(jobs.contains_key(&recent.job_id));
        assert!(!jobs.contains_key(&old.job_id));
    }

    #[tokio::test]
    async fn retention_evicts_on_create() {
        let registry = JobRegistry::with_retention(Duration::ZERO);
        let first = Uuid::new_v4();
        registry.create(first).await.unwrap();
        registry.fail(first, "done").await.unwrap();

        registry.create(Uuid::new_v4()).await.unwrap();
        assert!(registry.get(first).await.is_none());
        assert_eq!(registry.len().await, 1);
    }
}
