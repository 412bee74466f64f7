//! Event bridge: the worker's line-oriented stdout as a pull-based,
//! ordered [`Stream`] of [`Event`]s.
//!
//! A reader task owns the stdout pipe. It parses each line, feeds the
//! [`ResultCache`], and hands events to the consumer through a bounded
//! channel. A consumer already parked in `next()` receives the event directly;
//! otherwise the event waits in the channel buffer. When the buffer is full
//! the reader stops reading, which in turn blocks the worker's writes.
//!
//! The sequence ends after the first terminal event (`complete` / `error`),
//! after a read error, once stdout closes and the process has exited, or
//! shortly after the process exits even if a descendant still holds stdout.
//! A bridge is single-use: a new job needs a new bridge over a new process.

pub mod cache;

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::{Event, parse_event_line};
use crate::worker::{WorkerControl, WorkerProcess};

pub use cache::ResultCache;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to read worker output: {0}")]
    Read(#[from] std::io::Error),

    #[error("worker stdout is not available")]
    NoStdout,
}

/// Ordered, cancellable sequence of events from one worker.
#[derive(Debug)]
pub struct EventBridge {
    rx: mpsc::Receiver<Result<Event, BridgeError>>,
    control: Option<WorkerControl>,
    done: bool,
}

impl EventBridge {
    /// Bridge a spawned worker's stdout.
    ///
    /// `permit` is an admission slot; it is released when the worker exits,
    /// independent of how long the consumer keeps the bridge.
    pub fn spawn(
        mut process: WorkerProcess,
        capacity: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let control = process.control();
        match process.take_stdout() {
            Some(stdout) => Self::start(stdout, capacity, Some(control), permit),
            None => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(Err(BridgeError::NoStdout));
                let watcher = control.clone();
                tokio::spawn(async move {
                    watcher.wait().await;
                    drop(permit);
                });
                Self {
                    rx,
                    control: Some(control),
                    done: false,
                }
            }
        }
    }

    /// Bridge an arbitrary byte source carrying JSONL events. The sequence
    /// ends at EOF.
    pub fn from_reader<R>(reader: R, capacity: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::start(reader, capacity, None, None)
    }

    fn start<R>(
        reader: R,
        capacity: usize,
        control: Option<WorkerControl>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(pump(reader, tx, control.clone(), permit));
        Self {
            rx,
            control,
            done: false,
        }
    }

    /// Pid of the underlying worker, if this bridge wraps a process.
    pub fn pid(&self) -> Option<u32> {
        self.control.as_ref().map(WorkerControl::pid)
    }

    pub fn control(&self) -> Option<&WorkerControl> {
        self.control.as_ref()
    }

    /// Ask the underlying worker to stop. The sequence then ends once the
    /// process exits.
    pub fn terminate(&self) {
        if let Some(control) = &self.control {
            control.terminate();
        }
    }
}

impl Stream for EventBridge {
    type Item = Result<Event, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let item = ready!(self.rx.poll_recv(cx));
        match &item {
            Some(Ok(event)) if event.is_terminal() => self.done = true,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => self.done = true,
        }
        Poll::Ready(item)
    }
}

/// How long stdout is still read after the worker exited. A descendant that
/// inherited the pipe can keep it open indefinitely.
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Reader task: stdout lines in, events out.
async fn pump<R>(
    reader: R,
    tx: mpsc::Sender<Result<Event, BridgeError>>,
    control: Option<WorkerControl>,
    permit: Option<OwnedSemaphorePermit>,
) where
    R: AsyncRead + Unpin,
{
    let pid = control.as_ref().map(WorkerControl::pid);
    let mut reader = BufReader::new(reader);
    let mut cache = ResultCache::new();
    let mut buf = Vec::new();
    // Set once the consumer is gone or a terminal event went out. From then
    // on output is drained and discarded so the worker never blocks on a
    // full pipe.
    let mut closed = false;
    let mut forwarded = 0usize;
    let mut dropped = 0usize;

    let exited = async {
        match &control {
            Some(control) => control.wait().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(exited);
    let mut drain_until: Option<Instant> = None;

    loop {
        // `read_until` keeps partial input in `buf` when another branch wins,
        // so `buf` is only cleared once a whole line has been handled.
        let read = tokio::select! {
            biased;
            read = reader.read_until(b'\n', &mut buf) => read,
            exit = &mut exited, if drain_until.is_none() => {
                debug!(?pid, exit = %exit, "worker exited, draining buffered output");
                drain_until = Some(Instant::now() + EXIT_DRAIN_WINDOW);
                continue;
            }
            _ = tokio::time::sleep_until(drain_until.unwrap_or_else(Instant::now)), if drain_until.is_some() => {
                debug!(?pid, "worker exited but its stdout is still open, ending sequence");
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                if line.is_empty() || closed {
                    continue;
                }
                match parse_event_line(&line) {
                    Ok(Some(event)) => {
                        let event = cache.absorb(event);
                        let terminal = event.is_terminal();
                        if tx.send(Ok(event)).await.is_err() {
                            debug!(?pid, "bridge consumer gone, draining worker output");
                            closed = true;
                            continue;
                        }
                        forwarded += 1;
                        if terminal {
                            closed = true;
                        }
                    }
                    Ok(None) => {
                        debug!(?pid, line = %line, "ignoring unrecognised worker event");
                    }
                    Err(e) => {
                        dropped += 1;
                        warn!(?pid, error = %e, line = %line, "dropping malformed worker line");
                    }
                }
            }
            Err(e) => {
                warn!(?pid, error = %e, "error reading worker stdout");
                if !closed {
                    let _ = tx.send(Err(BridgeError::Read(e))).await;
                }
                break;
            }
        }
    }

    if let Some(control) = &control {
        let exit = control.wait().await;
        debug!(?pid, exit = %exit, forwarded, dropped, "worker output finished");
    }
    drop(permit);
    // `tx` drops here: a consumer parked in `next()` sees end-of-sequence.
}
