//! Worker process handle.
//!
//! Spawns the scraper worker as a subprocess, pipes its stdout for the event
//! bridge, logs its stderr, and publishes its exit status on a watch channel.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::query::ScrapeQuery;

/// How to invoke the worker. The query arguments are appended to `args`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Executable, resolved through `$PATH` when not absolute.
    pub program: String,
    /// Leading arguments, typically the worker script path.
    pub args: Vec<String>,
    /// Fixed working directory for the worker's resource files.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables, merged into the inherited environment.
    pub env: HashMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build(&self, query: &ScrapeQuery) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).args(query.worker_args());

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        // Unbuffered, UTF-8 output from Python workers.
        cmd.env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        cmd
    }
}

/// The worker could not be launched.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker '{program}' exited before reporting a pid")]
    NoPid { program: String },
}

/// How the worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(String),
    /// Waiting on the child failed; the process state is unknown.
    Unknown(String),
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Code(0))
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return WorkerExit::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return WorkerExit::Signal(signal_name(signal));
            }
        }
        WorkerExit::Unknown(status.to_string())
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {code}"),
            WorkerExit::Signal(name) => write!(f, "signal {name}"),
            WorkerExit::Unknown(reason) => write!(f, "unknown exit ({reason})"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGABRT => "SIGABRT".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        other => format!("SIG{other}"),
    }
}

/// Cloneable control surface over a running worker: exit observation and
/// termination.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    pid: u32,
    exit: watch::Receiver<Option<WorkerExit>>,
    terminate: CancellationToken,
}

impl WorkerControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, if the process has already exited.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Ask the worker to stop. No-op once the process has exited, and
    /// repeated calls only deliver the request once.
    pub fn terminate(&self) {
        if self.has_exited() || self.terminate.is_cancelled() {
            return;
        }
        debug!(pid = self.pid, "requesting worker termination");
        self.terminate.cancel();
    }

    /// Wait until the process exits.
    pub async fn wait(&self) -> WorkerExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(|status| status.is_some()).await {
            Ok(status) => status.clone().unwrap_or_else(|| WorkerExit::Unknown("no status".into())),
            Err(_) => WorkerExit::Unknown("exit watcher dropped".to_string()),
        }
    }
}

/// One spawned worker.
#[derive(Debug)]
pub struct WorkerProcess {
    control: WorkerControl,
    stdout: Option<ChildStdout>,
}

impl WorkerProcess {
    /// Launch the worker for `query`.
    ///
    /// Must be called inside a tokio runtime: a background task owns the
    /// child and publishes its exit status, and another drains stderr into
    /// the log.
    pub fn spawn(command: &WorkerCommand, query: &ScrapeQuery) -> Result<Self, SpawnError> {
        let mut child = command
            .build(query)
            .spawn()
            .map_err(|source| SpawnError::Launch {
                program: command.program.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| SpawnError::NoPid {
            program: command.program.clone(),
        })?;

        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(pid, stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let terminate = CancellationToken::new();
        let token = terminate.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    send_terminate(&mut child, pid);
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => WorkerExit::from_status(status),
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait on worker");
                    WorkerExit::Unknown(e.to_string())
                }
            };
            debug!(pid, exit = %exit, "worker exited");
            let _ = exit_tx.send(Some(exit));
        });

        debug!(pid, program = %command.program, activity = %query.activity, city = %query.city, grid_size = query.grid_size, "worker spawned");

        Ok(Self {
            control: WorkerControl {
                pid,
                exit: exit_rx,
                terminate,
            },
            stdout,
        })
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    /// Take the stdout pipe. Returns `None` on the second call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn terminate(&self) {
        self.control.terminate();
    }
}

fn send_terminate(child: &mut tokio::process::Child, pid: u32) {
    #[cfg(unix)]
    {
        // SAFETY: pid belongs to a child we spawned and have not reaped yet.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret == 0 {
            return;
        }
        warn!(pid, "SIGTERM failed, falling back to kill");
    }
    if let Err(e) = child.start_kill() {
        warn!(pid, error = %e, "failed to kill worker");
    }
}

async fn log_stderr(pid: u32, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(pid, line, "worker stderr");
                }
            }
            Err(e) => {
                warn!(pid, error = %e, "error reading worker stderr");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn query() -> ScrapeQuery {
        ScrapeQuery::new("boulangerie", "Paris", 2)
    }

    async fn read_all(process: &mut WorkerProcess) -> String {
        let mut out = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn passes_query_arguments_after_leading_args() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "args.sh", "echo \"$@\"\n");
        let command = WorkerCommand::new("/bin/sh").arg(script);

        let mut process = WorkerProcess::spawn(&command, &query()).unwrap();
        assert_eq!(read_all(&mut process).await.trim(), "boulangerie Paris 2");
        assert_eq!(process.control().wait().await, WorkerExit::Code(0));
    }

    #[tokio::test]
    async fn sets_working_dir_and_env() {
        let tmp = tempfile::tempdir().unwrap();
        let work_dir = tmp.path().join("work");
        std::fs::create_dir(&work_dir).unwrap();
        let script = write_script(
            tmp.path(),
            "env.sh",
            "pwd\necho \"$PYTHONUNBUFFERED $GMB_EXTRA\"\n",
        );
        let command = WorkerCommand::new(script)
            .working_dir(&work_dir)
            .env("GMB_EXTRA", "yes");

        let mut process = WorkerProcess::spawn(&command, &query()).unwrap();
        let out = read_all(&mut process).await;
        let mut lines = out.lines();
        let cwd = std::path::PathBuf::from(lines.next().unwrap());
        assert_eq!(
            cwd.canonicalize().unwrap(),
            work_dir.canonicalize().unwrap()
        );
        assert_eq!(lines.next().unwrap(), "1 yes");
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let command = WorkerCommand::new("/nonexistent/path/to/worker");
        let err = WorkerProcess::spawn(&command, &query()).unwrap_err();
        assert!(matches!(err, SpawnError::Launch { .. }));
        assert!(err.to_string().contains("/nonexistent/path/to/worker"));
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fail.sh", "exit 3\n");
        let process = WorkerProcess::spawn(&WorkerCommand::new(script), &query()).unwrap();
        let exit = process.control().wait().await;
        assert_eq!(exit, WorkerExit::Code(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn terminate_stops_worker_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy.sh", "exec sleep 3600\n");
        let process = WorkerProcess::spawn(&WorkerCommand::new(script), &query()).unwrap();
        let control = process.control();
        assert!(!control.has_exited());

        process.terminate();
        process.terminate();

        let exit = tokio::time::timeout(Duration::from_secs(5), control.wait())
            .await
            .expect("worker should exit after terminate");
        assert_eq!(exit, WorkerExit::Signal("SIGTERM".to_string()));

        // After exit, terminate is a no-op.
        control.terminate();
        assert_eq!(control.exit_status(), Some(exit));
    }

    #[tokio::test]
    async fn stdout_can_only_be_taken_once() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "quick.sh", "echo hi\n");
        let mut process = WorkerProcess::spawn(&WorkerCommand::new(script), &query()).unwrap();
        assert!(process.take_stdout().is_some());
        assert!(process.take_stdout().is_none());
    }

    #[test]
    fn exit_display() {
        assert_eq!(WorkerExit::Code(1).to_string(), "exit code 1");
        assert_eq!(WorkerExit::Signal("SIGKILL".into()).to_string(), "signal SIGKILL");
    }
}
