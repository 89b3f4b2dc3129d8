use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Client-facing failure body: `{"error": {message, type, param, code}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, deserialize_with = "stringish")]
    pub message: String,
    #[serde(rename = "type", default, deserialize_with = "stringish")]
    pub error_type: String,
    #[serde(default, deserialize_with = "stringish")]
    pub param: String,
    #[serde(default, deserialize_with = "stringish")]
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: error_type.into(),
                param: String::new(),
                code: code.into(),
            },
        }
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{\"error\":{}}".to_vec())
    }
}

// 中文注释：上游 code/param 可能是数字或 null，统一转成字符串，避免整包解析失败。
fn stringish<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

/// Message `content`: plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Other(Value),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Concatenated text of the content; non-text parts contribute nothing.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| part.part_type == "text")
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
            MessageContent::Other(_) => String::new(),
        }
    }
}

/// The subset of a buffered completion body needed for usage accounting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimpleResponse {
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub choices: Vec<SimpleChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimpleChoice {
    #[serde(default)]
    pub message: Option<SimpleMessage>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimpleMessage {
    #[serde(default)]
    pub content: MessageContent,
}

impl SimpleChoice {
    pub fn content_text(&self) -> String {
        if let Some(message) = &self.message {
            return message.content.text();
        }
        self.text.clone().unwrap_or_default()
    }
}

/// One chat completion SSE frame, reduced to what usage accounting reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default)]
    pub choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamChoice {
    #[serde(default)]
    pub delta: ChatStreamDelta,
    /// Legacy completions frames carry `text` instead of `delta`.
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamDelta {
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamToolCall {
    #[serde(default)]
    pub function: StreamToolFunction,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamToolFunction {
    #[serde(default, deserialize_with = "stringish")]
    pub name: String,
    #[serde(default, deserialize_with = "stringish")]
    pub arguments: String,
}
