use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Answer to a `callConfirm` frame.
pub struct AuthResponse {
    pub id: String,
    pub accept: bool,
    pub message: String,
}

impl AuthResponse {
    pub fn accept(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            accept: true,
            message: String::new(),
        }
    }

    pub fn deny(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            accept: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Answer to a prompt frame: field name to value.
pub struct PromptResponse {
    pub id: String,
    pub responses: BTreeMap<String, String>,
}

impl PromptResponse {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            responses: BTreeMap::new(),
        }
    }

    pub fn with_response(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.responses.insert(field.into(), value.into());
        self
    }
}
