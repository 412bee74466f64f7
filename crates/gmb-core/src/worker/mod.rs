//! Worker supervision: one external scraper process per job.
//!
//! ```text
//! Adapter
//!     |
//!     v
//! Launcher::launch(query) --admission--> WorkerProcess::spawn
//!     |                                        |
//!     |                     stdout ------------+----> EventBridge
//!     |                     stderr --> tracing
//!     v                     exit   --> WorkerControl (watch)
//! EventBridge (Stream<Item = Result<Event, BridgeError>>)
//! ```

pub mod launcher;
pub mod process;

pub use launcher::{AdmissionPolicy, DEFAULT_BRIDGE_CAPACITY, LaunchError, Launcher, ProcessLauncher};
pub use process::{SpawnError, WorkerCommand, WorkerControl, WorkerExit, WorkerProcess};
