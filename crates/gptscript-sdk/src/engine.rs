use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use gptscript_schema::{env_pairs, non_empty_env_var, GlobalOptions, GPTSCRIPT_URL_ENV};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use crate::error::EngineError;

pub const DEFAULT_ENGINE_BINARY: &str = "gptscript";
/// Overrides the engine binary path.
pub const GPTSCRIPT_BIN_ENV: &str = "GPTSCRIPT_BIN";
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_POLL_INTERVAL_MS: u64 = 100;

const LISTEN_ADDRESS: &str = "127.0.0.1:0";
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
/// How the engine binary is located and started.
pub struct EngineConfig {
    /// Explicit binary path. Falls back to `GPTSCRIPT_BIN`, then a
    /// `gptscript` next to the current executable, then `PATH`.
    pub binary: Option<PathBuf>,
    pub startup_timeout_ms: u64,
    pub health_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            health_poll_interval_ms: DEFAULT_HEALTH_POLL_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    pub fn resolve_binary(&self) -> PathBuf {
        if let Some(binary) = &self.binary {
            return binary.clone();
        }
        if let Some(binary) = non_empty_env_var(GPTSCRIPT_BIN_ENV) {
            return PathBuf::from(binary);
        }
        sibling_binary().unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_BINARY))
    }
}

fn sibling_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let name = if cfg!(windows) {
        "gptscript.exe"
    } else {
        DEFAULT_ENGINE_BINARY
    };
    let candidate = exe.parent()?.join(name);
    candidate.is_file().then_some(candidate)
}

/// Prefixes `http://` when the address has no scheme and drops trailing
/// slashes.
pub fn normalize_engine_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// Extracts the address from the engine's first stderr line, which reads
/// like `... listening on=127.0.0.1:PORT`.
pub fn parse_listen_address(line: &str) -> String {
    let line = line.trim();
    line.split_once('=')
        .map(|(_, address)| address)
        .unwrap_or(line)
        .trim()
        .to_string()
}

#[derive(Debug, Default)]
struct EngineSlot {
    refs: usize,
    url: String,
    child: Option<Child>,
}

#[derive(Debug, Clone, Default)]
/// Reference-counted supervisor for a shared `sys.sdkserver` process.
///
/// The first client to acquire the engine starts it (unless a URL is
/// configured); the last one to release it closes its stdin, which makes
/// the server exit.
pub struct Engine {
    config: EngineConfig,
    slot: Arc<Mutex<EngineSlot>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            slot: Arc::default(),
        }
    }

    /// Process-wide engine behind the convenience constructor
    /// [`crate::GptScript::new`]. Clients built with
    /// [`crate::GptScript::with_engine`] do not use it.
    pub fn global() -> Engine {
        static GLOBAL: OnceLock<Engine> = OnceLock::new();
        GLOBAL.get_or_init(Engine::default).clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a client and returns the engine URL it should talk to.
    ///
    /// An explicit `opts.url` is used as-is. Otherwise `GPTSCRIPT_URL`, then
    /// an already running engine, then a newly spawned one.
    pub async fn acquire(&self, opts: &GlobalOptions) -> Result<String, EngineError> {
        let mut slot = self.slot.lock().await;
        if !opts.url.is_empty() {
            slot.refs += 1;
            return Ok(normalize_engine_url(&opts.url));
        }
        if slot.url.is_empty() {
            if let Some(url) = non_empty_env_var(GPTSCRIPT_URL_ENV) {
                slot.url = normalize_engine_url(&url);
            }
        }
        if slot.url.is_empty() {
            let (child, url) = self.spawn_engine(opts).await?;
            slot.child = Some(child);
            slot.url = url;
        }
        slot.refs += 1;
        Ok(slot.url.clone())
    }

    /// Unregisters a client; stops the engine after the last release.
    pub async fn release(&self) -> Result<(), EngineError> {
        let child = {
            let mut slot = self.slot.lock().await;
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs > 0 {
                return Ok(());
            }
            let child = slot.child.take();
            if child.is_some() {
                slot.url.clear();
            }
            child
        };
        match child {
            Some(child) => shutdown_engine(child).await,
            None => Ok(()),
        }
    }

    pub async fn reference_count(&self) -> usize {
        self.slot.lock().await.refs
    }

    /// Whether this supervisor currently owns a running engine process.
    pub async fn is_spawned(&self) -> bool {
        self.slot.lock().await.child.is_some()
    }

    async fn spawn_engine(&self, opts: &GlobalOptions) -> Result<(Child, String), EngineError> {
        let binary = self.config.resolve_binary();
        let mut command = Command::new(&binary);
        command
            .args(["sys.sdkserver", "--listen-address", LISTEN_ADDRESS])
            .env_clear()
            .envs(env_pairs(&opts.to_env()))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = spawn_with_text_file_busy_retry(&mut command, &binary).await?;

        let stderr = child.stderr.take().ok_or(EngineError::MissingAddress)?;
        let mut lines = BufReader::new(stderr).lines();
        let first = tokio::time::timeout(
            Duration::from_millis(self.config.startup_timeout_ms),
            lines.next_line(),
        )
        .await
        .map_err(|_| EngineError::StartupTimeout {
            timeout_ms: self.config.startup_timeout_ms,
        })??
        .ok_or(EngineError::MissingAddress)?;
        let url = normalize_engine_url(&parse_listen_address(&first));
        tokio::spawn(forward_engine_stderr(lines));

        let http = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()?;
        wait_until_healthy(
            &http,
            &url,
            Duration::from_millis(self.config.startup_timeout_ms),
            Duration::from_millis(self.config.health_poll_interval_ms),
        )
        .await?;

        tracing::debug!(binary = %binary.display(), url = %url, "engine started");
        Ok((child, url))
    }
}

async fn spawn_with_text_file_busy_retry(
    command: &mut Command,
    binary: &Path,
) -> Result<Child, EngineError> {
    const MAX_TEXT_FILE_BUSY_RETRIES: u32 = 5;
    const TEXT_FILE_BUSY_ERRNO: i32 = 26;
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(error)
                if error.raw_os_error() == Some(TEXT_FILE_BUSY_ERRNO)
                    && attempt < MAX_TEXT_FILE_BUSY_RETRIES =>
            {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(source) => {
                return Err(EngineError::Spawn {
                    binary: binary.display().to_string(),
                    source,
                })
            }
        }
    }
}

async fn forward_engine_stderr(mut lines: Lines<BufReader<ChildStderr>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(line = %line, "engine stderr");
    }
}

/// Polls `{url}/healthz` until it answers with a success status.
pub async fn wait_until_healthy(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), EngineError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let health_url = format!("{url}/healthz");
    loop {
        match http.get(&health_url).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                tracing::debug!(status = response.status().as_u16(), "engine not healthy yet");
            }
            Err(error) => {
                tracing::debug!(error = %error, "engine health check failed");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::Unhealthy {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn shutdown_engine(mut child: Child) -> Result<(), EngineError> {
    drop(child.stdin.take());
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(status) => {
            let status = status?;
            tracing::debug!(status = %status, "engine exited");
        }
        Err(_) => {
            tracing::warn!("engine still running after stdin closed; killing it");
            child.kill().await?;
        }
    }
    Ok(())
}
