use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serde_util::null_default;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatasetMeta {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatasetElementMeta {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatasetElement {
    pub name: String,
    pub description: String,
    pub contents: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(deserialize_with = "null_default")]
    pub elements: BTreeMap<String, DatasetElementMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Metadata of a file stored in a workspace.
pub struct FileInfo {
    #[serde(rename = "workspaceID")]
    pub workspace_id: String,
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}
