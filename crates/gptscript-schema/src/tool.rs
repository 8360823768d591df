use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::serde_util::{is_false, is_zero, null_default};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// One typed parameter in an [`ArgumentSchema`].
pub struct Property {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default: String,
}

impl Default for Property {
    fn default() -> Self {
        Self {
            property_type: "string".to_string(),
            description: String::new(),
            default: String::new(),
        }
    }
}

impl Property {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// JSON-schema-like description of a tool's arguments.
pub struct ArgumentSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(deserialize_with = "null_default")]
    pub properties: BTreeMap<String, Property>,
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "null_default"
    )]
    pub required: Vec<String>,
}

impl Default for ArgumentSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ArgumentSchema {
    pub fn with_property(mut self, name: impl Into<String>, property: Property) -> Self {
        self.properties.insert(name.into(), property);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Instructions and metadata describing a unit of work for the engine.
///
/// Empty and default fields are omitted on the wire so a parsed tool
/// re-serializes to what the engine produced.
pub struct ToolDef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub max_tokens: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    #[serde(skip_serializing_if = "is_false")]
    pub model_provider: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub json_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "is_false")]
    pub chat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_prompt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<ArgumentSchema>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub global_tools: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub global_model_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub context: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub export_context: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub export: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub agents: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub credentials: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub export_credentials: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub input_filters: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub export_input_filters: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub output_filters: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub export_output_filters: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub tool_type: String,
    #[serde(
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_default"
    )]
    pub meta_data: BTreeMap<String, String>,
}

impl ToolDef {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// A resolved reference from one tool to another.
pub struct ToolReference {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub named: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arg: String,
    #[serde(rename = "toolID", skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Repo {
    #[serde(rename = "VCS", skip_serializing_if = "String::is_empty")]
    pub vcs: String,
    #[serde(rename = "Root", skip_serializing_if = "String::is_empty")]
    pub root: String,
    #[serde(rename = "Path", skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(rename = "Name", skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "Revision", skip_serializing_if = "String::is_empty")]
    pub revision: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// Where a tool was loaded from.
pub struct SourceRef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub line_no: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<Repo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// A [`ToolDef`] after the engine resolved its identity and references.
pub struct Tool {
    #[serde(flatten)]
    pub def: ToolDef,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_default"
    )]
    pub tool_mapping: BTreeMap<String, Vec<ToolReference>>,
    #[serde(
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_default"
    )]
    pub local_tools: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

impl From<ToolDef> for Tool {
    fn from(def: ToolDef) -> Self {
        Self {
            def,
            ..Self::default()
        }
    }
}

impl Tool {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn instructions(&self) -> &str {
        &self.def.instructions
    }
}
