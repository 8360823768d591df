use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::serde_util::null_default;
use crate::tool::{Tool, ToolReference};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
/// Event sub-type carried by every frame.
///
/// Unrecognized strings decode as [`RunEventType::Event`] so newer engines
/// do not break older clients.
pub enum RunEventType {
    #[default]
    Event,
    RunStart,
    RunFinish,
    CallStart,
    CallChat,
    CallSubCalls,
    CallProgress,
    CallConfirm,
    CallContinue,
    CallFinish,
    Prompt,
}

impl RunEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::RunStart => "runStart",
            Self::RunFinish => "runFinish",
            Self::CallStart => "callStart",
            Self::CallChat => "callChat",
            Self::CallSubCalls => "callSubCalls",
            Self::CallProgress => "callProgress",
            Self::CallConfirm => "callConfirm",
            Self::CallContinue => "callContinue",
            Self::CallFinish => "callFinish",
            Self::Prompt => "prompt",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "runStart" => Self::RunStart,
            "runFinish" => Self::RunFinish,
            "callStart" => Self::CallStart,
            "callChat" => Self::CallChat,
            "callSubCalls" => Self::CallSubCalls,
            "callProgress" => Self::CallProgress,
            "callConfirm" => Self::CallConfirm,
            "callContinue" => Self::CallContinue,
            "callFinish" => Self::CallFinish,
            "prompt" => Self::Prompt,
            _ => Self::Event,
        }
    }
}

impl fmt::Display for RunEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RunEventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RunEventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
/// Role a called tool plays in the program.
pub enum ToolCategory {
    Provider,
    Credential,
    Context,
    Input,
    Output,
    #[default]
    None,
}

impl ToolCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Credential => "credential",
            Self::Context => "context",
            Self::Input => "input",
            Self::Output => "output",
            Self::None => "",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "provider" => Self::Provider,
            "credential" => Self::Credential,
            "context" => Self::Context,
            "input" => Self::Input,
            "output" => Self::Output,
            _ => Self::None,
        }
    }
}

impl Serialize for ToolCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ToolCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Lifecycle of a run. `Finished` and `Error` are terminal.
pub enum RunState {
    #[default]
    Creating,
    Running,
    Continue,
    Finished,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Continue => "continue",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// The tool set the engine resolved for a run.
pub struct Program {
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub entry_tool_id: String,
    #[serde(deserialize_with = "null_default")]
    pub tool_set: BTreeMap<String, Tool>,
}

impl Program {
    pub fn entry_tool(&self) -> Option<&Tool> {
        self.tool_set.get(&self.entry_tool_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunFrame {
    #[serde(deserialize_with = "null_default")]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    pub program: Option<Program>,
    #[serde(deserialize_with = "null_default")]
    pub input: String,
    #[serde(deserialize_with = "null_default")]
    pub output: String,
    #[serde(deserialize_with = "null_default")]
    pub error: String,
    #[serde(deserialize_with = "null_default")]
    pub start: String,
    #[serde(deserialize_with = "null_default")]
    pub end: String,
    #[serde(deserialize_with = "null_default")]
    pub chat_state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Call {
    #[serde(rename = "toolID", deserialize_with = "null_default")]
    pub tool_id: String,
    #[serde(deserialize_with = "null_default")]
    pub input: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// One streamed output segment of a call.
pub struct Output {
    #[serde(deserialize_with = "null_default")]
    pub content: String,
    #[serde(deserialize_with = "null_default")]
    pub sub_calls: BTreeMap<String, Call>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct InputContext {
    #[serde(rename = "toolID", deserialize_with = "null_default")]
    pub tool_id: String,
    #[serde(deserialize_with = "null_default")]
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Progress of a single tool call. Repeated frames with the same id carry
/// the accumulated state of that call.
pub struct CallFrame {
    #[serde(deserialize_with = "null_default")]
    pub id: String,
    pub tool: Option<Tool>,
    #[serde(deserialize_with = "null_default")]
    pub agent_group: Vec<ToolReference>,
    pub current_agent: Option<ToolReference>,
    #[serde(deserialize_with = "null_default")]
    pub display_text: String,
    #[serde(deserialize_with = "null_default")]
    pub input_context: Vec<InputContext>,
    pub tool_category: ToolCategory,
    #[serde(deserialize_with = "null_default")]
    pub tool_name: String,
    #[serde(rename = "parentID", deserialize_with = "null_default")]
    pub parent_id: String,
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    #[serde(deserialize_with = "null_default")]
    pub start: String,
    #[serde(deserialize_with = "null_default")]
    pub end: String,
    #[serde(deserialize_with = "null_default")]
    pub input: String,
    #[serde(deserialize_with = "null_default")]
    pub output: Vec<Output>,
    #[serde(deserialize_with = "null_default")]
    pub error: String,
    #[serde(deserialize_with = "null_default")]
    pub usage: Usage,
    pub chat_response_cached: bool,
    pub tool_results: u64,
    pub llm_request: Option<Value>,
    pub llm_response: Option<Value>,
}

impl CallFrame {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }

    /// Concatenated content of every output segment.
    pub fn output_text(&self) -> String {
        self.output
            .iter()
            .map(|segment| segment.content.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// A value the engine asks the user for.
pub struct PromptField {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPromptField {
    Name(String),
    Full {
        #[serde(default)]
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        sensitive: Option<bool>,
    },
}

impl<'de> Deserialize<'de> for PromptField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawPromptField::deserialize(deserializer)? {
            RawPromptField::Name(name) => Self {
                name,
                ..Self::default()
            },
            RawPromptField::Full {
                name,
                description,
                sensitive,
            } => Self {
                name,
                description,
                sensitive,
            },
        })
    }
}

fn prompt_event_type() -> RunEventType {
    RunEventType::Prompt
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptFrame {
    #[serde(default, deserialize_with = "null_default")]
    pub id: String,
    #[serde(rename = "type", default = "prompt_event_type")]
    pub event_type: RunEventType,
    #[serde(default, deserialize_with = "null_default")]
    pub time: String,
    #[serde(default, deserialize_with = "null_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_default")]
    pub fields: Vec<PromptField>,
    #[serde(default, deserialize_with = "null_default")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub sensitive: bool,
}

impl Default for PromptFrame {
    fn default() -> Self {
        Self {
            id: String::new(),
            event_type: RunEventType::Prompt,
            time: String::new(),
            message: String::new(),
            fields: Vec::new(),
            metadata: BTreeMap::new(),
            sensitive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
/// A decoded protocol event, in its wire envelope (`{"call": {...}}`).
pub enum Frame {
    Run(RunFrame),
    Call(CallFrame),
    Prompt(PromptFrame),
}

impl Frame {
    pub fn event_type(&self) -> RunEventType {
        match self {
            Self::Run(frame) => frame.event_type,
            Self::Call(frame) => frame.event_type,
            Self::Prompt(frame) => frame.event_type,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Run(frame) => &frame.id,
            Self::Call(frame) => &frame.id,
            Self::Prompt(frame) => &frame.id,
        }
    }

    pub fn as_call(&self) -> Option<&CallFrame> {
        match self {
            Self::Call(frame) => Some(frame),
            Self::Run(_) | Self::Prompt(_) => None,
        }
    }

    pub fn as_run(&self) -> Option<&RunFrame> {
        match self {
            Self::Run(frame) => Some(frame),
            Self::Call(_) | Self::Prompt(_) => None,
        }
    }

    pub fn as_prompt(&self) -> Option<&PromptFrame> {
        match self {
            Self::Prompt(frame) => Some(frame),
            Self::Run(_) | Self::Call(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CallFrame, Frame, PromptFrame, RunEventType, RunFrame, RunState, ToolCategory};

    #[test]
    fn unit_run_event_type_round_trips_known_names_and_tolerates_unknown() {
        for name in [
            "runStart",
            "runFinish",
            "callStart",
            "callChat",
            "callSubCalls",
            "callProgress",
            "callConfirm",
            "callContinue",
            "callFinish",
            "prompt",
            "event",
        ] {
            assert_eq!(RunEventType::parse(name).as_str(), name);
        }
        assert_eq!(RunEventType::parse("callRetry"), RunEventType::Event);
    }

    #[test]
    fn unit_run_state_terminality() {
        assert!(RunState::Finished.is_terminal());
        assert!(RunState::Error.is_terminal());
        assert!(!RunState::Continue.is_terminal());
        assert!(!RunState::Creating.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    #[test]
    fn functional_call_frame_decodes_engine_shape_with_nulls() {
        let frame: CallFrame = serde_json::from_value(json!({
            "id": "1",
            "toolCategory": "",
            "toolName": "echo",
            "parentID": "",
            "type": "callProgress",
            "output": [{"content": "hel", "subCalls": null}, {"content": "lo"}],
            "agentGroup": null,
            "inputContext": null,
            "usage": {"promptTokens": 4, "completionTokens": 2, "totalTokens": 6},
            "chatResponseCached": true,
            "toolResults": 1,
            "llmRequest": {"model": "gpt-4o"}
        }))
        .expect("decode call frame");

        assert!(frame.is_root());
        assert_eq!(frame.event_type, RunEventType::CallProgress);
        assert_eq!(frame.tool_category, ToolCategory::None);
        assert_eq!(frame.output_text(), "hello");
        assert_eq!(frame.usage.total_tokens, 6);
        assert!(frame.chat_response_cached);
        assert_eq!(frame.tool_results, 1);
    }

    #[test]
    fn functional_run_frame_carries_program_on_start() {
        let frame: RunFrame = serde_json::from_value(json!({
            "id": "run-1",
            "type": "runStart",
            "program": {
                "name": "main",
                "entryToolId": "inline:1",
                "toolSet": {"inline:1": {"id": "inline:1", "instructions": "echo hi"}}
            }
        }))
        .expect("decode run frame");

        let program = frame.program.expect("program");
        assert_eq!(
            program.entry_tool().map(|tool| tool.instructions()),
            Some("echo hi")
        );
    }

    #[test]
    fn functional_prompt_frame_accepts_string_and_object_fields() {
        let frame: PromptFrame = serde_json::from_value(json!({
            "id": "p1",
            "message": "Who are you?",
            "fields": ["first name", {"name": "token", "description": "API token", "sensitive": true}],
            "metadata": {"first_name": "Clicky"}
        }))
        .expect("decode prompt frame");

        assert_eq!(frame.event_type, RunEventType::Prompt);
        assert_eq!(frame.fields[0].name, "first name");
        assert_eq!(frame.fields[1].sensitive, Some(true));
        assert_eq!(frame.metadata["first_name"], "Clicky");
    }

    #[test]
    fn unit_frame_envelope_uses_lowercase_tag() {
        let frame = Frame::Call(CallFrame {
            id: "7".to_string(),
            ..CallFrame::default()
        });
        let value = serde_json::to_value(&frame).expect("serialize frame");
        assert_eq!(value["call"]["id"], "7");
        assert_eq!(frame.id(), "7");
        assert!(frame.as_call().is_some());
        assert!(frame.as_prompt().is_none());
    }
}
