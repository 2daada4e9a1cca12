use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DATA_PREFIX: &str = "data:";

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Content { text: String },
    Error { code: String, message: String },
    Done,
    Skip,
}

impl StreamFrame {
    /// Parse the payload of one data line (marker already stripped).
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() || raw == DONE_SENTINEL {
            return Self::Done;
        }

        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(_) if !raw.starts_with('[') => Self::Content {
                text: raw.to_string(),
            },
            Err(_) => Self::Skip,
        }
    }

    fn from_value(value: Value) -> Self {
        if let Value::Object(fields) = &value {
            match fields.get("type") {
                Some(Value::String(kind)) if kind == "error" => {
                    return Self::Error {
                        code: text_field(fields, "code").unwrap_or_else(|| "UNKNOWN".to_string()),
                        message: text_field(fields, "message")
                            .unwrap_or_else(|| "unknown error".to_string()),
                    };
                }
                None | Some(Value::Null) => {
                    if let Some(message) = text_field(fields, "error") {
                        return Self::Error {
                            code: "LEGACY_ERROR".to_string(),
                            message,
                        };
                    }
                }
                _ => {}
            }
        }

        let text = match value {
            Value::String(text) => text,
            other => other.to_string(),
        };
        Self::Content { text }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done)
    }
}

// Absent and null count as missing; non-string scalars are rendered as JSON.
fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Return the payload of an SSE data line, or `None` for any other line.
pub fn strip_data_prefix(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let data = line.strip_prefix(DATA_PREFIX)?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FallbackResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
