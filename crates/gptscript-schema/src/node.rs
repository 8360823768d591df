use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::serde_util::null_default;
use crate::tool::{Tool, ToolDef};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A free-form text block in a script, optionally tagged with a format
/// (`!markdown`, `!nodeGraph`, ...).
pub struct Text {
    pub format: String,
    pub text: String,
}

impl Text {
    pub fn new(format: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            text: text.into(),
        }
    }

    /// Splits a leading `!format` line off raw node text.
    pub fn parse(raw: &str) -> Self {
        let Some(rest) = raw.strip_prefix('!') else {
            return Self::new("", raw.strip_suffix('\n').unwrap_or(raw));
        };
        match rest.split_once('\n') {
            Some((format, body)) => Self::new(format, body.trim()),
            None => Self::new(rest.trim_end(), ""),
        }
    }

    /// Text as the engine stores it: format line, body, trailing newline.
    pub fn wire_text(&self) -> String {
        if self.format.is_empty() {
            format!("{}\n", self.text)
        } else {
            format!("!{}\n{}\n", self.format, self.text)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One parsed element of a script: a tool or a text block.
pub enum Node {
    Tool(Tool),
    Text(Text),
}

impl Node {
    pub fn as_tool(&self) -> Option<&Tool> {
        match self {
            Self::Tool(tool) => Some(tool),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Self::Text(text) => Some(text),
            Self::Tool(_) => None,
        }
    }
}

impl From<Tool> for Node {
    fn from(tool: Tool) -> Self {
        Self::Tool(tool)
    }
}

impl From<ToolDef> for Node {
    fn from(def: ToolDef) -> Self {
        Self::Tool(Tool::from(def))
    }
}

impl From<Text> for Node {
    fn from(text: Text) -> Self {
        Self::Text(text)
    }
}

#[derive(Serialize, Deserialize)]
struct TextNodeBody {
    #[serde(default, deserialize_with = "null_default")]
    text: String,
}

#[derive(Serialize, Deserialize)]
struct ToolNodeBody {
    #[serde(default, deserialize_with = "null_default")]
    tool: Tool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text_node: Option<TextNodeBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_node: Option<ToolNodeBody>,
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let envelope = match self {
            Self::Text(text) => NodeEnvelope {
                text_node: Some(TextNodeBody {
                    text: text.wire_text(),
                }),
                tool_node: None,
            },
            Self::Tool(tool) => NodeEnvelope {
                text_node: None,
                tool_node: Some(ToolNodeBody { tool: tool.clone() }),
            },
        };
        envelope.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = NodeEnvelope::deserialize(deserializer)?;
        if let Some(text_node) = envelope.text_node {
            return Ok(Self::Text(Text::parse(&text_node.text)));
        }
        Ok(Self::Tool(
            envelope.tool_node.map(|body| body.tool).unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
/// Node list as exchanged with the engine's `parse` and `fmt` endpoints.
pub struct Document {
    #[serde(default, deserialize_with = "null_default")]
    pub nodes: Vec<Node>,
}
