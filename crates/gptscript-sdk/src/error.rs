use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Why a run ended in the `Error` state.
pub enum FailureKind {
    /// The engine reported an error in its `runFinish` frame.
    Engine,
    /// A record could not be decoded.
    Protocol,
    /// The engine prompted for input on a run that did not allow prompts.
    PolicyViolation,
    /// Connecting to or reading from the engine failed.
    Transport,
    /// The engine answered with a status outside `[200, 400)`.
    HttpStatus,
    /// The caller cancelled the run.
    Aborted,
    /// The run task panicked.
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Protocol => "protocol",
            Self::PolicyViolation => "policy_violation",
            Self::Transport => "transport",
            Self::HttpStatus => "http_status",
            Self::Aborted => "aborted",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    InvalidState(String),
    #[error("run was aborted with error output: {err_output}")]
    Aborted { err_output: String },
    #[error("run encountered an error: {message} with error output: {err_output}")]
    Failed {
        kind: FailureKind,
        message: String,
        err_output: String,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RunError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Aborted { .. } => Some(FailureKind::Aborted),
            Self::Failed { kind, .. } => Some(*kind),
            Self::InvalidState(_) | Self::Serde(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn engine '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine exited before reporting its listen address")]
    MissingAddress,
    #[error("engine did not report its listen address within {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },
    #[error("engine at {url} did not become healthy within {timeout_ms}ms")]
    Unhealthy { url: String, timeout_ms: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum GptScriptError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
