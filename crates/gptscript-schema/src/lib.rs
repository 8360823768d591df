//! Wire and value types for talking to a GPTScript engine.
//!
//! Covers protocol frames, tool and text nodes, layered run options, and the
//! payloads of the engine's credential, dataset, and workspace endpoints.

mod credential;
mod dataset;
mod frame;
mod node;
mod options;
mod response;
mod serde_util;
mod tool;

pub use credential::{Credential, CredentialType, DEFAULT_CREDENTIAL_CONTEXT};
pub use dataset::{Dataset, DatasetElement, DatasetElementMeta, DatasetMeta, FileInfo};
pub use frame::{
    Call, CallFrame, Frame, InputContext, Output, Program, PromptField, PromptFrame,
    RunEventType, RunFrame, RunState, ToolCategory, Usage,
};
pub use node::{Document, Node, Text};
pub use options::{
    env_lookup, env_pairs, non_empty_env_var, GlobalOptions, Options, CACHE_DIR_ENV,
    DEFAULT_MODEL_ENV, DEFAULT_MODEL_PROVIDER_ENV, GPTSCRIPT_TOKEN_ENV, GPTSCRIPT_URL_ENV,
    OPENAI_API_KEY_ENV, OPENAI_BASE_URL_ENV,
};
pub use response::{AuthResponse, PromptResponse};
pub use tool::{ArgumentSchema, Property, Repo, SourceRef, Tool, ToolDef, ToolReference};
