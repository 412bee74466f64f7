//! Configuration file management for gmb.
//!
//! Provides a TOML-based config file at `~/.config/gmb/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gmb_core::stream::{DEFAULT_HEARTBEAT, StreamConfig};
use gmb_core::webhook::DEFAULT_WEBHOOK_TIMEOUT;
use gmb_core::worker::{AdmissionPolicy, DEFAULT_BRIDGE_CAPACITY, ProcessLauncher, WorkerCommand};
use gmb_core::{JobRegistry, WebhookNotifier};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub worker: WorkerSection,
    pub auth: AuthSection,
    pub jobs: JobsSection,
    pub stream: StreamSection,
    pub webhook: WebhookSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Interpreter or executable that runs the scraper.
    pub program: String,
    /// Leading arguments; the query is appended after them.
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Ceiling on simultaneously running workers. Unset means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    pub admission: AdmissionPolicy,
    pub bridge_capacity: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["scraper/gmb_scraper_stream.py".to_string()],
            working_dir: None,
            max_concurrent: None,
            admission: AdmissionPolicy::default(),
            bridge_capacity: DEFAULT_BRIDGE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Accepted API keys. Empty disables the guard.
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// Evict finished jobs after this many seconds. Unset keeps them forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub heartbeat_ms: u64,
    pub cancel_on_disconnect: bool,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            heartbeat_ms: u64::try_from(DEFAULT_HEARTBEAT.as_millis()).unwrap_or(1000),
            cancel_on_disconnect: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSection {
    pub timeout_secs: u64,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_WEBHOOK_TIMEOUT.as_secs(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the gmb config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/gmb` or `~/.config/gmb`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gmb");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("gmb")
}

/// Return the path to the gmb config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a random API key: 32 random bytes, hex-encoded (64 chars).
pub fn generate_api_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct GmbConfig {
    pub bind: String,
    pub port: u16,
    pub worker: WorkerSection,
    pub api_keys: Vec<String>,
    pub retention: Option<Duration>,
    pub stream: StreamConfig,
    pub webhook_timeout: Duration,
}

impl GmbConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// A missing config file is not an error; a config file that exists but
    /// does not parse is.
    pub fn resolve(cli_bind: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let file = if config_path().exists() {
            load_config()?
        } else {
            ConfigFile::default()
        };
        Self::from_file(file, cli_bind, cli_port)
    }

    pub fn from_file(file: ConfigFile, cli_bind: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let bind = match cli_bind {
            Some(bind) => bind.to_string(),
            None => std::env::var("GMB_BIND").unwrap_or(file.server.bind),
        };

        let port = match cli_port {
            Some(port) => port,
            None => match std::env::var("GMB_PORT") {
                Ok(raw) => raw
                    .parse()
                    .with_context(|| format!("GMB_PORT is not a valid port: {raw:?}"))?,
                Err(_) => file.server.port,
            },
        };

        let mut worker = file.worker;
        if let Ok(program) = std::env::var("GMB_WORKER_PROGRAM") {
            worker.program = program;
        }
        if let Ok(script) = std::env::var("GMB_WORKER_SCRIPT") {
            worker.args = vec![script];
        }
        if let Ok(dir) = std::env::var("GMB_WORKER_DIR") {
            worker.working_dir = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = std::env::var("GMB_MAX_WORKERS") {
            let limit: usize = raw
                .parse()
                .with_context(|| format!("GMB_MAX_WORKERS is not a number: {raw:?}"))?;
            worker.max_concurrent = (limit > 0).then_some(limit);
        }

        let mut api_keys = file.auth.api_keys;
        if let Ok(key) = std::env::var("GMB_API_KEY") {
            if !key.is_empty() && !api_keys.contains(&key) {
                api_keys.push(key);
            }
        }

        Ok(Self {
            bind,
            port,
            worker,
            api_keys,
            retention: file.jobs.retention_secs.map(Duration::from_secs),
            stream: StreamConfig {
                heartbeat: Duration::from_millis(file.stream.heartbeat_ms.max(1)),
                cancel_on_disconnect: file.stream.cancel_on_disconnect,
            },
            webhook_timeout: Duration::from_secs(file.webhook.timeout_secs),
        })
    }

    pub fn worker_command(&self) -> WorkerCommand {
        let mut command = WorkerCommand::new(&self.worker.program);
        for arg in &self.worker.args {
            command = command.arg(arg);
        }
        if let Some(dir) = &self.worker.working_dir {
            command = command.working_dir(dir);
        }
        command
    }

    pub fn launcher(&self) -> ProcessLauncher {
        let launcher =
            ProcessLauncher::new(self.worker_command()).with_bridge_capacity(self.worker.bridge_capacity);
        match self.worker.max_concurrent {
            Some(limit) => launcher.with_max_concurrent(limit, self.worker.admission),
            None => launcher,
        }
    }

    pub fn registry(&self) -> JobRegistry {
        match self.retention {
            Some(retention) => JobRegistry::with_retention(retention),
            None => JobRegistry::new(),
        }
    }

    pub fn notifier(&self) -> WebhookNotifier {
        WebhookNotifier::new(self.webhook_timeout)
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: &[&str] = &[
        "GMB_BIND",
        "GMB_PORT",
        "GMB_WORKER_PROGRAM",
        "GMB_WORKER_SCRIPT",
        "GMB_WORKER_DIR",
        "GMB_MAX_WORKERS",
        "GMB_API_KEY",
    ];

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        let guard = crate::test_util::lock_env();
        for var in ENV_VARS {
            unsafe { std::env::remove_var(var) };
        }
        guard
    }

    #[test]
    fn generate_api_key_is_64_hex_chars() {
        let key = generate_api_key();
        assert_eq!(key.len(), 64);
        assert!(
            key.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {key}"
        );
        assert_ne!(key, generate_api_key(), "two generated keys should differ");
    }

    #[test]
    fn empty_file_gives_defaults() {
        let _lock = lock_env();
        let file: ConfigFile = toml::from_str("").unwrap();
        let config = GmbConfig::from_file(file, None, None).unwrap();

        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.worker.program, "python3");
        assert_eq!(config.worker.args, ["scraper/gmb_scraper_stream.py"]);
        assert_eq!(config.worker.max_concurrent, None);
        assert_eq!(config.worker.admission, AdmissionPolicy::Queue);
        assert!(config.api_keys.is_empty());
        assert_eq!(config.retention, None);
        assert_eq!(config.stream, StreamConfig::default());
        assert_eq!(config.webhook_timeout, Duration::from_secs(30));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let _lock = lock_env();
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 8080

            [worker]
            max_concurrent = 3
            admission = "reject"

            [jobs]
            retention_secs = 600

            [stream]
            cancel_on_disconnect = true
            "#,
        )
        .unwrap();
        let config = GmbConfig::from_file(file, None, None).unwrap();

        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.worker.program, "python3");
        assert_eq!(config.worker.max_concurrent, Some(3));
        assert_eq!(config.worker.admission, AdmissionPolicy::Reject);
        assert_eq!(config.retention, Some(Duration::from_secs(600)));
        assert!(config.stream.cancel_on_disconnect);
        assert_eq!(config.stream.heartbeat, Duration::from_secs(1));
        assert_eq!(config.launcher().available_slots(), Some(3));
    }

    #[test]
    fn cli_flag_overrides_env_and_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("GMB_PORT", "4000") };
        unsafe { std::env::set_var("GMB_BIND", "0.0.0.0") };

        let mut file = ConfigFile::default();
        file.server.port = 5000;
        let config = GmbConfig::from_file(file, Some("10.0.0.1"), Some(6000)).unwrap();
        assert_eq!(config.bind, "10.0.0.1");
        assert_eq!(config.port, 6000);

        unsafe { std::env::remove_var("GMB_PORT") };
        unsafe { std::env::remove_var("GMB_BIND") };
    }

    #[test]
    fn env_overrides_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("GMB_PORT", "4000") };
        unsafe { std::env::set_var("GMB_WORKER_SCRIPT", "/opt/scraper/run.py") };
        unsafe { std::env::set_var("GMB_MAX_WORKERS", "2") };
        unsafe { std::env::set_var("GMB_API_KEY", "from-env") };

        let mut file = ConfigFile::default();
        file.server.port = 5000;
        file.worker.args = vec!["a.py".into(), "--flag".into()];
        file.auth.api_keys = vec!["from-file".into()];
        let config = GmbConfig::from_file(file, None, None).unwrap();

        for var in ENV_VARS {
            unsafe { std::env::remove_var(var) };
        }

        assert_eq!(config.port, 4000);
        assert_eq!(config.worker.args, ["/opt/scraper/run.py"]);
        assert_eq!(config.worker.max_concurrent, Some(2));
        assert_eq!(config.api_keys, ["from-file", "from-env"]);
    }

    #[test]
    fn invalid_port_env_is_an_error() {
        let _lock = lock_env();
        unsafe { std::env::set_var("GMB_PORT", "not-a-port") };
        let result = GmbConfig::from_file(ConfigFile::default(), None, None);
        unsafe { std::env::remove_var("GMB_PORT") };

        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("GMB_PORT"), "unexpected error: {msg}");
    }

    #[test]
    fn save_then_resolve_through_xdg_dir() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let mut file = ConfigFile::default();
        file.server.port = 7777;
        file.auth.api_keys = vec![generate_api_key()];
        let saved = save_config(&file);
        let resolved = GmbConfig::resolve(None, None);
        let path = config_path();

        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        saved.unwrap();
        let resolved = resolved.unwrap();
        assert_eq!(resolved.port, 7777);
        assert_eq!(resolved.api_keys.len(), 1);
        assert!(path.starts_with(tmp.path()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(&path).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("gmb/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
