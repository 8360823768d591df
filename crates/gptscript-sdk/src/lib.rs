//! Async client for a GPTScript engine.
//!
//! [`GptScript`] owns a reference to a shared engine server and issues
//! runs against it. A [`Run`] streams the engine's events in the background,
//! fans them out to [`EventHandler`]s, and exposes the accumulated state of
//! the turn; chat tools continue through [`Run::next_chat`].

mod client;
mod decode;
mod engine;
mod error;
mod handler;
mod run;

pub use client::{GptScript, GPTSCRIPT_WORKSPACE_ID_ENV};
pub use decode::{decode_line, decode_record, DecodeError, LineBuffer, StreamRecord, DONE_SENTINEL};
pub use engine::{
    normalize_engine_url, parse_listen_address, wait_until_healthy, Engine, EngineConfig,
    DEFAULT_ENGINE_BINARY, DEFAULT_HEALTH_POLL_INTERVAL_MS, DEFAULT_STARTUP_TIMEOUT_MS,
    GPTSCRIPT_BIN_ENV,
};
pub use error::{EngineError, FailureKind, GptScriptError, RunError};
pub use handler::{event_handler, EventHandler, EventHandlerFuture};
pub use run::{
    engine_http_client, Run, RunHandle, RunSnapshot, ToolPayload, ABORTED_MESSAGE,
    GENERIC_RUN_ERROR, RUN_REQUEST_TIMEOUT,
};

pub use gptscript_schema as schema;
