use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Read-only snapshot of a remote tool, as reported by a listing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(default)]
    pub input_schema: Value,
}

/// Outcome of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// One unit of tool-call output.
///
/// Text is the only normalized variant. Anything else the server sends
/// (images, embedded resources, ...) is carried through untouched.
///
/// Serialized text blocks are a bare `{"text": ...}`. Reading back accepts
/// that form and otherwise applies [`ContentBlock::from_protocol`], so a
/// typed non-text block keeps its `type` even when it has a `text` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Text { text: String },
    Other(Value),
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let bare = raw.as_object().is_some_and(|obj| obj.len() == 1);
        match raw.get("text").and_then(Value::as_str) {
            Some(text) if bare => Ok(ContentBlock::text(text)),
            _ => Ok(ContentBlock::from_protocol(raw)),
        }
    }
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Normalize a raw protocol content item.
    ///
    /// `{"type": "text", "text": "..."}` becomes [`ContentBlock::Text`];
    /// every other shape is kept as-is.
    pub fn from_protocol(raw: Value) -> Self {
        let is_text = raw.get("type").and_then(Value::as_str) == Some("text");
        match raw.get("text").and_then(Value::as_str) {
            Some(text) if is_text => ContentBlock::Text { text: text.to_owned() },
            _ => ContentBlock::Other(raw),
        }
    }

    /// The text payload, if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::Other(_) => None,
        }
    }
}

/// The single result produced for every tool call request.
///
/// `tool_use_id` is a caller-supplied correlation token; it is threaded
/// through unchanged and never generated or validated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    pub tool_use_id: String,
    pub status: ToolStatus,
    pub content: Vec<ContentBlock>,
}

impl CallResult {
    pub fn success(tool_use_id: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            status: ToolStatus::Success,
            content,
        }
    }

    /// A failed call carrying one synthesized text block with `message`.
    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            status: ToolStatus::Error,
            content: vec![ContentBlock::text(message)],
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// Concatenated text of all text blocks, newline separated.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
