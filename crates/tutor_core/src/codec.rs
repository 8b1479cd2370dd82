//! crates/tutor_core/src/codec.rs
//!
//! Maps wire messages (`UiMessage`) to the document shape that is persisted and
//! back. Every known part type gets its own tagged document carrying only the
//! fields that matter for that tag; structured payloads (tool input/output, data,
//! provider metadata) are stored as JSON strings. Parts the server does not
//! understand are written as plain text holding a JSON dump of the original, which
//! is lossy and logged as such.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{Role, TextState, ToolCallState, ToolInvocation, UiMessage, UiPart};

/// One persisted part. `key` is positional (`part-0`, `part-1`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPart {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(flatten)]
    pub body: PartDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "snake_case")]
pub enum PartDocument {
    Text {
        text: String,
        state: Option<String>,
    },
    Tool {
        name: String,
        tool_call_id: String,
        state: String,
        input: Option<String>,
        output: Option<String>,
        error_text: Option<String>,
        provider_executed: Option<bool>,
    },
    Reasoning {
        text: String,
        state: Option<String>,
        provider_metadata: Option<String>,
    },
    SourceUrl {
        source_id: String,
        url: String,
        title: Option<String>,
        provider_metadata: Option<String>,
    },
    SourceDocument {
        source_id: String,
        media_type: String,
        title: String,
        filename: Option<String>,
        provider_metadata: Option<String>,
    },
    File {
        media_type: String,
        filename: Option<String>,
        url: String,
    },
    Data {
        name: String,
        data_id: Option<String>,
        data: Option<String>,
    },
    StepStart,
}

/// A chat message in its persisted form.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub session_id: Uuid,
    pub role: Role,
    pub parts: Vec<StoredPart>,
    /// Opaque JSON string. Unreadable metadata decodes as "no metadata".
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Encoding
//=========================================================================================

/// Converts a wire message into the document stored for `session_id`.
pub fn encode(message: &UiMessage, session_id: Uuid) -> StoredMessage {
    let parts = message
        .parts
        .iter()
        .enumerate()
        .map(|(index, part)| StoredPart {
            key: format!("part-{}", index),
            body: encode_part(&message.id, part),
        })
        .collect();

    StoredMessage {
        message_id: message.id.clone(),
        session_id,
        role: message.role,
        parts,
        metadata: message.metadata.as_ref().map(Value::to_string),
        created_at: Utc::now(),
    }
}

fn json_string(value: &Value) -> String {
    value.to_string()
}

fn encode_part(message_id: &str, part: &UiPart) -> PartDocument {
    match part {
        UiPart::Text { text, state } => PartDocument::Text {
            text: text.clone(),
            state: state.map(|s| s.as_str().to_string()),
        },
        UiPart::Reasoning {
            text,
            state,
            provider_metadata,
        } => PartDocument::Reasoning {
            text: text.clone(),
            state: state.map(|s| s.as_str().to_string()),
            provider_metadata: provider_metadata.as_ref().map(json_string),
        },
        UiPart::Tool(tool) => {
            let (output, error_text) = match &tool.state {
                ToolCallState::OutputAvailable { output, .. } => (Some(json_string(output)), None),
                ToolCallState::OutputError { error_text, .. } => (None, Some(error_text.clone())),
                _ => (None, None),
            };
            PartDocument::Tool {
                name: tool.name.clone(),
                tool_call_id: tool.call_id.clone(),
                state: tool.state.name().to_string(),
                input: tool.state.input().map(json_string),
                output,
                error_text,
                provider_executed: tool.provider_executed,
            }
        }
        UiPart::SourceUrl {
            source_id,
            url,
            title,
            provider_metadata,
        } => PartDocument::SourceUrl {
            source_id: source_id.clone(),
            url: url.clone(),
            title: title.clone(),
            provider_metadata: provider_metadata.as_ref().map(json_string),
        },
        UiPart::SourceDocument {
            source_id,
            media_type,
            title,
            filename,
            provider_metadata,
        } => PartDocument::SourceDocument {
            source_id: source_id.clone(),
            media_type: media_type.clone(),
            title: title.clone(),
            filename: filename.clone(),
            provider_metadata: provider_metadata.as_ref().map(json_string),
        },
        UiPart::File {
            media_type,
            filename,
            url,
        } => PartDocument::File {
            media_type: media_type.clone(),
            filename: filename.clone(),
            url: url.clone(),
        },
        UiPart::Data { name, id, data } => PartDocument::Data {
            name: name.clone(),
            data_id: id.clone(),
            data: Some(json_string(data)),
        },
        UiPart::StepStart => PartDocument::StepStart,
        UiPart::Unrecognized(raw) => {
            warn!(
                message_id,
                part_type = %part.type_name(),
                "Unrecognized message part stored as plain text; structure is lost."
            );
            PartDocument::Text {
                text: raw
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| json_string(raw)),
                state: Some(TextState::Done.as_str().to_string()),
            }
        }
    }
}

//=========================================================================================
// Decoding
//=========================================================================================

/// Rebuilds the wire message from its stored document.
pub fn decode(doc: &StoredMessage) -> UiMessage {
    UiMessage {
        id: doc.message_id.clone(),
        role: doc.role,
        parts: doc
            .parts
            .iter()
            .map(|part| decode_part(&doc.message_id, &part.body))
            .collect(),
        metadata: doc.metadata.as_deref().and_then(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| {
                    debug!(message_id = %doc.message_id, "Ignoring unreadable message metadata: {}", e);
                })
                .ok()
        }),
    }
}

fn parse_json(message_id: &str, field: &str, raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(message_id, field, "Stored JSON field is unreadable, keeping it as a string: {}", e);
        Value::String(raw.to_string())
    })
}

fn parse_optional(message_id: &str, field: &str, raw: &Option<String>) -> Option<Value> {
    raw.as_deref().map(|raw| parse_json(message_id, field, raw))
}

fn decode_state(raw: &Option<String>) -> Option<TextState> {
    raw.as_deref().and_then(TextState::parse)
}

fn decode_part(message_id: &str, doc: &PartDocument) -> UiPart {
    match doc {
        PartDocument::Text { text, state } => UiPart::Text {
            text: text.clone(),
            state: decode_state(state),
        },
        PartDocument::Reasoning {
            text,
            state,
            provider_metadata,
        } => UiPart::Reasoning {
            text: text.clone(),
            state: decode_state(state),
            provider_metadata: parse_optional(message_id, "provider_metadata", provider_metadata),
        },
        PartDocument::Tool {
            name,
            tool_call_id,
            state,
            input,
            output,
            error_text,
            provider_executed,
        } => {
            let input = parse_optional(message_id, "input", input);
            let state = match state.as_str() {
                "input-streaming" => ToolCallState::InputStreaming { input },
                "input-available" => ToolCallState::InputAvailable {
                    input: input.unwrap_or(Value::Null),
                },
                "output-available" => ToolCallState::OutputAvailable {
                    input: input.unwrap_or(Value::Null),
                    output: parse_optional(message_id, "output", output).unwrap_or(Value::Null),
                },
                "output-error" => ToolCallState::OutputError {
                    input,
                    error_text: error_text.clone().unwrap_or_default(),
                },
                other => {
                    warn!(message_id, state = other, "Stored tool part has an unknown state.");
                    return UiPart::Unrecognized(
                        serde_json::to_value(doc).unwrap_or(Value::Null),
                    );
                }
            };
            UiPart::Tool(ToolInvocation {
                name: name.clone(),
                call_id: tool_call_id.clone(),
                state,
                provider_executed: *provider_executed,
            })
        }
        PartDocument::SourceUrl {
            source_id,
            url,
            title,
            provider_metadata,
        } => UiPart::SourceUrl {
            source_id: source_id.clone(),
            url: url.clone(),
            title: title.clone(),
            provider_metadata: parse_optional(message_id, "provider_metadata", provider_metadata),
        },
        PartDocument::SourceDocument {
            source_id,
            media_type,
            title,
            filename,
            provider_metadata,
        } => UiPart::SourceDocument {
            source_id: source_id.clone(),
            media_type: media_type.clone(),
            title: title.clone(),
            filename: filename.clone(),
            provider_metadata: parse_optional(message_id, "provider_metadata", provider_metadata),
        },
        PartDocument::File {
            media_type,
            filename,
            url,
        } => UiPart::File {
            media_type: media_type.clone(),
            filename: filename.clone(),
            url: url.clone(),
        },
        PartDocument::Data {
            name,
            data_id,
            data,
        } => UiPart::Data {
            name: name.clone(),
            id: data_id.clone(),
            data: parse_optional(message_id, "data", data).unwrap_or(Value::Null),
        },
        PartDocument::StepStart => UiPart::StepStart,
    }
}
