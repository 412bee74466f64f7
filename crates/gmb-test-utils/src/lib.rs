//! Shared test utilities for gmb integration tests.
//!
//! Provides fake workers (shell scripts and in-memory launchers) and a
//! loopback HTTP receiver that records webhook callbacks.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use gmb_core::{
    EventBridge,
    query::ScrapeQuery,
    worker::{LaunchError, Launcher},
};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

/// Write an executable `/bin/sh` script into `dir` and return its path.
#[cfg(unix)]
pub fn write_worker_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write worker script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod worker script");
    path
}

/// Shell lines that print `events` to stdout, one JSON object per line.
pub fn echo_events(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| format!("echo '{}'\n", e.to_string().replace('\'', "'\\''")))
        .collect()
}

/// A launcher whose workers replay fixed stdout text.
///
/// Every launch records the query it was given.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    output: String,
    launches: Mutex<Vec<ScrapeQuery>>,
}

impl ScriptedLauncher {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            launches: Mutex::default(),
        }
    }

    /// Replay `events` as JSONL.
    pub fn from_events(events: &[Value]) -> Self {
        let mut output = String::new();
        for event in events {
            output.push_str(&event.to_string());
            output.push('\n');
        }
        Self::new(output)
    }

    pub fn launches(&self) -> Vec<ScrapeQuery> {
        self.launches.lock().expect("launch log poisoned").clone()
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, query: &ScrapeQuery) -> Result<EventBridge, LaunchError> {
        self.launches
            .lock()
            .expect("launch log poisoned")
            .push(query.clone());
        let reader = std::io::Cursor::new(self.output.clone().into_bytes());
        Ok(EventBridge::from_reader(reader, 64))
    }
}

/// A launcher that always reports the worker pool as full.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullLauncher;

#[async_trait]
impl Launcher for FullLauncher {
    async fn launch(&self, _query: &ScrapeQuery) -> Result<EventBridge, LaunchError> {
        Err(LaunchError::AtCapacity { limit: 1 })
    }
}

/// A launcher that parks every launch until [`open`](Self::open) is called,
/// then delegates to a [`ScriptedLauncher`]. Stands in for a worker pool
/// that queues callers.
#[derive(Debug, Default)]
pub struct GatedLauncher {
    inner: ScriptedLauncher,
    started: Notify,
    gate: Notify,
}

impl GatedLauncher {
    pub fn new(inner: ScriptedLauncher) -> Self {
        Self {
            inner,
            started: Notify::new(),
            gate: Notify::new(),
        }
    }

    /// Wait until a launch is parked at the gate.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Release every parked launch and the next one to arrive.
    pub fn open(&self) {
        self.gate.notify_waiters();
        self.gate.notify_one();
    }
}

#[async_trait]
impl Launcher for GatedLauncher {
    async fn launch(&self, query: &ScrapeQuery) -> Result<EventBridge, LaunchError> {
        self.started.notify_one();
        self.gate.notified().await;
        self.inner.launch(query).await
    }
}

/// A `Arc<dyn Launcher>` helper for handing fakes to adapters.
pub fn shared<L: Launcher + 'static>(launcher: L) -> Arc<dyn Launcher> {
    Arc::new(launcher)
}

/// Loopback HTTP server that captures JSON bodies POSTed to `/hook`.
pub struct WebhookReceiver {
    pub addr: SocketAddr,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl WebhookReceiver {
    /// Start a receiver answering every callback with `status`.
    pub async fn start(status: StatusCode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/hook", post(capture))
            .with_state((tx, status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind webhook receiver");
        let addr = listener.local_addr().expect("receiver has no address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, rx }
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    /// Wait for the next captured callback body.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

async fn capture(
    State((tx, status)): State<(mpsc::UnboundedSender<Value>, StatusCode)>,
    axum::Json(body): axum::Json<Value>,
) -> StatusCode {
    let _ = tx.send(body);
    status
}
