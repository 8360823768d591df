use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serde_util::null_default;

pub const DEFAULT_CREDENTIAL_CONTEXT: &str = "default";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CredentialType {
    #[default]
    Tool,
    ModelProvider,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// A stored credential as the engine's credential store sees it.
pub struct Credential {
    pub context: String,
    pub tool_name: String,
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    #[serde(deserialize_with = "null_default")]
    pub env: BTreeMap<String, String>,
    pub ephemeral: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "null_default")]
    pub refresh_token: String,
}

impl Default for Credential {
    fn default() -> Self {
        Self {
            context: DEFAULT_CREDENTIAL_CONTEXT.to_string(),
            tool_name: String::new(),
            credential_type: CredentialType::Tool,
            env: BTreeMap::new(),
            ephemeral: false,
            expires_at: None,
            refresh_token: String::new(),
        }
    }
}

impl Credential {
    /// JSON document submitted as the `content` of a create request.
    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
