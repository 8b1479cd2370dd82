//! crates/tutor_core/src/message.rs
//!
//! The wire-level chat message exchanged with the client: a role plus an ordered
//! list of typed parts. Parts arrive as loosely-typed JSON objects discriminated by
//! their `type` field (`text`, `tool-<name>`, `data-<name>`, ...), so `UiPart`
//! converts to and from `serde_json::Value` by hand and keeps anything it does not
//! recognise in an explicit `Unrecognized` variant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Completion state of a text or reasoning part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextState {
    Streaming,
    Done,
}

impl TextState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextState::Streaming => "streaming",
            TextState::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "streaming" => Some(TextState::Streaming),
            "done" => Some(TextState::Done),
            _ => None,
        }
    }
}

//=========================================================================================
// Tool invocations
//=========================================================================================

/// Raised when a tool call is asked to move to a state it cannot reach.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tool call cannot move from '{from}' to '{to}'")]
pub struct ToolTransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

/// `input-streaming -> input-available -> output-available | output-error`.
/// Each state only carries the payload that exists at that point.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallState {
    InputStreaming { input: Option<Value> },
    InputAvailable { input: Value },
    OutputAvailable { input: Value, output: Value },
    OutputError { input: Option<Value>, error_text: String },
}

impl ToolCallState {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCallState::InputStreaming { .. } => "input-streaming",
            ToolCallState::InputAvailable { .. } => "input-available",
            ToolCallState::OutputAvailable { .. } => "output-available",
            ToolCallState::OutputError { .. } => "output-error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolCallState::OutputAvailable { .. } | ToolCallState::OutputError { .. }
        )
    }

    pub fn input(&self) -> Option<&Value> {
        match self {
            ToolCallState::InputStreaming { input } | ToolCallState::OutputError { input, .. } => {
                input.as_ref()
            }
            ToolCallState::InputAvailable { input }
            | ToolCallState::OutputAvailable { input, .. } => Some(input),
        }
    }

    pub fn with_input(self, input: Value) -> Result<Self, ToolTransitionError> {
        match self {
            ToolCallState::InputStreaming { .. } => Ok(ToolCallState::InputAvailable { input }),
            other => Err(ToolTransitionError {
                from: other.name(),
                to: "input-available",
            }),
        }
    }

    pub fn with_output(self, output: Value) -> Result<Self, ToolTransitionError> {
        match self {
            ToolCallState::InputAvailable { input } => {
                Ok(ToolCallState::OutputAvailable { input, output })
            }
            other => Err(ToolTransitionError {
                from: other.name(),
                to: "output-available",
            }),
        }
    }

    pub fn with_error(self, error_text: String) -> Result<Self, ToolTransitionError> {
        match self {
            ToolCallState::InputStreaming { input } => {
                Ok(ToolCallState::OutputError { input, error_text })
            }
            ToolCallState::InputAvailable { input } => Ok(ToolCallState::OutputError {
                input: Some(input),
                error_text,
            }),
            other => Err(ToolTransitionError {
                from: other.name(),
                to: "output-error",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub call_id: String,
    pub state: ToolCallState,
    /// Whether the provider ran the tool itself rather than this server.
    pub provider_executed: Option<bool>,
}

//=========================================================================================
// Parts and messages
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum UiPart {
    Text {
        text: String,
        state: Option<TextState>,
    },
    Reasoning {
        text: String,
        state: Option<TextState>,
        provider_metadata: Option<Value>,
    },
    Tool(ToolInvocation),
    SourceUrl {
        source_id: String,
        url: String,
        title: Option<String>,
        provider_metadata: Option<Value>,
    },
    SourceDocument {
        source_id: String,
        media_type: String,
        title: String,
        filename: Option<String>,
        provider_metadata: Option<Value>,
    },
    File {
        media_type: String,
        filename: Option<String>,
        url: String,
    },
    Data {
        name: String,
        id: Option<String>,
        data: Value,
    },
    StepStart,
    /// A part shape this server does not know. Kept verbatim.
    Unrecognized(Value),
}

impl UiPart {
    pub fn text(text: impl Into<String>) -> Self {
        UiPart::Text {
            text: text.into(),
            state: Some(TextState::Done),
        }
    }

    /// The `type` discriminator this part carries on the wire.
    pub fn type_name(&self) -> String {
        match self {
            UiPart::Text { .. } => "text".to_string(),
            UiPart::Reasoning { .. } => "reasoning".to_string(),
            UiPart::Tool(tool) => format!("tool-{}", tool.name),
            UiPart::SourceUrl { .. } => "source-url".to_string(),
            UiPart::SourceDocument { .. } => "source-document".to_string(),
            UiPart::File { .. } => "file".to_string(),
            UiPart::Data { name, .. } => format!("data-{}", name),
            UiPart::StepStart => "step-start".to_string(),
            UiPart::Unrecognized(value) => value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let kind = obj.get("type")?.as_str()?;
        let part = match kind {
            "text" => UiPart::Text {
                text: str_field(obj, "text").unwrap_or_default(),
                state: str_field(obj, "state").as_deref().and_then(TextState::parse),
            },
            "reasoning" => UiPart::Reasoning {
                text: str_field(obj, "text").unwrap_or_default(),
                state: str_field(obj, "state").as_deref().and_then(TextState::parse),
                provider_metadata: value_field(obj, "providerMetadata"),
            },
            "source-url" => UiPart::SourceUrl {
                source_id: str_field(obj, "sourceId")?,
                url: str_field(obj, "url")?,
                title: str_field(obj, "title"),
                provider_metadata: value_field(obj, "providerMetadata"),
            },
            "source-document" => UiPart::SourceDocument {
                source_id: str_field(obj, "sourceId")?,
                media_type: str_field(obj, "mediaType")?,
                title: str_field(obj, "title")?,
                filename: str_field(obj, "filename"),
                provider_metadata: value_field(obj, "providerMetadata"),
            },
            "file" => UiPart::File {
                media_type: str_field(obj, "mediaType")?,
                filename: str_field(obj, "filename"),
                url: str_field(obj, "url")?,
            },
            "step-start" => UiPart::StepStart,
            other => {
                if let Some(name) = other.strip_prefix("tool-") {
                    UiPart::Tool(tool_from_object(name, obj)?)
                } else if let Some(name) = other.strip_prefix("data-") {
                    UiPart::Data {
                        name: name.to_string(),
                        id: str_field(obj, "id"),
                        data: obj.get("data").cloned().unwrap_or(Value::Null),
                    }
                } else {
                    return None;
                }
            }
        };
        Some(part)
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn value_field(obj: &Map<String, Value>, key: &str) -> Option<Value> {
    obj.get(key).filter(|v| !v.is_null()).cloned()
}

fn tool_from_object(name: &str, obj: &Map<String, Value>) -> Option<ToolInvocation> {
    let input = value_field(obj, "input");
    let state = match obj.get("state")?.as_str()? {
        "input-streaming" => ToolCallState::InputStreaming { input },
        "input-available" => ToolCallState::InputAvailable {
            input: input.unwrap_or(Value::Null),
        },
        "output-available" => ToolCallState::OutputAvailable {
            input: input.unwrap_or(Value::Null),
            output: obj.get("output").cloned().unwrap_or(Value::Null),
        },
        "output-error" => ToolCallState::OutputError {
            input,
            error_text: str_field(obj, "errorText").unwrap_or_default(),
        },
        _ => return None,
    };
    Some(ToolInvocation {
        name: name.to_string(),
        call_id: str_field(obj, "toolCallId")?,
        state,
        provider_executed: obj.get("providerExecuted").and_then(Value::as_bool),
    })
}

impl From<Value> for UiPart {
    fn from(value: Value) -> Self {
        match value.as_object().and_then(UiPart::from_object) {
            Some(part) => part,
            None => UiPart::Unrecognized(value),
        }
    }
}

impl From<UiPart> for Value {
    fn from(part: UiPart) -> Self {
        let type_name = part.type_name();
        let mut obj = Map::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                obj.insert(key.to_string(), value);
            }
        };
        match part {
            UiPart::Unrecognized(value) => return value,
            UiPart::Text { text, state } => {
                put("text", Some(Value::String(text)));
                put("state", state.map(|s| Value::from(s.as_str())));
            }
            UiPart::Reasoning {
                text,
                state,
                provider_metadata,
            } => {
                put("text", Some(Value::String(text)));
                put("state", state.map(|s| Value::from(s.as_str())));
                put("providerMetadata", provider_metadata);
            }
            UiPart::Tool(tool) => {
                put("toolCallId", Some(Value::String(tool.call_id)));
                put("state", Some(Value::from(tool.state.name())));
                match tool.state {
                    ToolCallState::InputStreaming { input } => put("input", input),
                    ToolCallState::InputAvailable { input } => put("input", Some(input)),
                    ToolCallState::OutputAvailable { input, output } => {
                        put("input", Some(input));
                        put("output", Some(output));
                    }
                    ToolCallState::OutputError { input, error_text } => {
                        put("input", input);
                        put("errorText", Some(Value::String(error_text)));
                    }
                }
                put("providerExecuted", tool.provider_executed.map(Value::Bool));
            }
            UiPart::SourceUrl {
                source_id,
                url,
                title,
                provider_metadata,
            } => {
                put("sourceId", Some(Value::String(source_id)));
                put("url", Some(Value::String(url)));
                put("title", title.map(Value::String));
                put("providerMetadata", provider_metadata);
            }
            UiPart::SourceDocument {
                source_id,
                media_type,
                title,
                filename,
                provider_metadata,
            } => {
                put("sourceId", Some(Value::String(source_id)));
                put("mediaType", Some(Value::String(media_type)));
                put("title", Some(Value::String(title)));
                put("filename", filename.map(Value::String));
                put("providerMetadata", provider_metadata);
            }
            UiPart::File {
                media_type,
                filename,
                url,
            } => {
                put("mediaType", Some(Value::String(media_type)));
                put("filename", filename.map(Value::String));
                put("url", Some(Value::String(url)));
            }
            UiPart::Data { id, data, .. } => {
                put("id", id.map(Value::String));
                put("data", Some(data));
            }
            UiPart::StepStart => {}
        }
        obj.insert("type".to_string(), Value::String(type_name));
        Value::Object(obj)
    }
}

/// A chat message as the client and the generator see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<UiPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UiMessage {
    /// The first non-empty text part, which is what retrieval queries on.
    pub fn first_text(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            UiPart::Text { text, .. } if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ai_sdk_shaped_message() {
        let message: UiMessage = serde_json::from_value(json!({
            "id": "m1",
            "role": "user",
            "parts": [
                { "type": "step-start" },
                { "type": "text", "text": "What is a closure?", "state": "done" },
                { "type": "tool-searchResources", "toolCallId": "c1",
                  "state": "output-available", "input": { "query": "closure" },
                  "output": { "totalResults": 0 } }
            ]
        }))
        .unwrap();

        assert_eq!(message.role, Role::User);
        assert_eq!(message.parts[0], UiPart::StepStart);
        assert_eq!(message.first_text(), Some("What is a closure?"));
        match &message.parts[2] {
            UiPart::Tool(tool) => {
                assert_eq!(tool.name, "searchResources");
                assert_eq!(tool.state.name(), "output-available");
            }
            other => panic!("expected tool part, got {:?}", other),
        }
    }

    #[test]
    fn unknown_part_is_kept_verbatim() {
        let raw = json!({ "type": "hologram", "payload": [1, 2, 3] });
        let part = UiPart::from(raw.clone());
        assert_eq!(part, UiPart::Unrecognized(raw.clone()));
        assert_eq!(Value::from(part), raw);
    }

    #[test]
    fn tool_part_without_call_id_is_unrecognized() {
        let raw = json!({ "type": "tool-x", "state": "input-available" });
        assert!(matches!(UiPart::from(raw), UiPart::Unrecognized(_)));
    }

    #[test]
    fn first_text_skips_blank_parts() {
        let message = UiMessage {
            id: "m".into(),
            role: Role::User,
            parts: vec![UiPart::text("   "), UiPart::text("hello")],
            metadata: None,
        };
        assert_eq!(message.first_text(), Some("hello"));
    }

    #[test]
    fn tool_state_follows_its_lifecycle() {
        let state = ToolCallState::InputStreaming { input: None };
        let state = state.with_input(json!({ "q": 1 })).unwrap();
        let state = state.with_output(json!("ok")).unwrap();
        assert!(state.is_terminal());
        assert_eq!(state.input(), Some(&json!({ "q": 1 })));

        let err = state.with_input(json!({})).unwrap_err();
        assert_eq!(err.from, "output-available");
        assert_eq!(err.to, "input-available");
    }

    #[test]
    fn tool_error_keeps_available_input() {
        let state = ToolCallState::InputAvailable { input: json!(1) };
        let failed = state.with_error("boom".into()).unwrap();
        assert_eq!(
            failed,
            ToolCallState::OutputError {
                input: Some(json!(1)),
                error_text: "boom".into()
            }
        );
        assert!(ToolCallState::InputStreaming { input: None }
            .with_output(json!(null))
            .is_err());
    }
}
