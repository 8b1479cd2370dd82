//! services/api/src/adapters/generator.rs
//!
//! This module contains the adapter for the tutoring LLM. It implements the
//! `TextGenerator` port on top of OpenAI's streaming chat completions and runs the
//! offered tools itself, feeding their results back for up to `MAX_STEPS` model
//! steps.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionResponseStream, ChatCompletionStreamOptions, ChatCompletionTool,
        ChatCompletionToolArgs, ChatCompletionToolType, CreateChatCompletionRequestArgs,
        FunctionCall, FunctionObjectArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use tutor_core::message::{Role, ToolCallState, UiMessage, UiPart};
use tutor_core::ports::{
    ChatTool, GenerationEvent, GenerationRequest, GenerationStream, PortError, PortResult,
    TextGenerator,
};

/// Upper bound on model calls per turn, tool round-trips included.
const MAX_STEPS: usize = 5;

fn openai_error(e: OpenAIError) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `TextGenerator` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiChatAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiChatAdapter {
    /// Creates a new `OpenAiChatAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    async fn open_step(
        &self,
        messages: &[ChatCompletionRequestMessage],
        tools: &[ChatCompletionTool],
    ) -> PortResult<ChatCompletionResponseStream> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(messages.to_vec())
            .stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            });
        if !tools.is_empty() {
            builder.tools(tools.to_vec());
        }
        let request = builder.build().map_err(openai_error)?;

        self.client
            .chat()
            .create_stream(request)
            .await
            .map_err(openai_error)
    }
}

//=========================================================================================
// Request building
//=========================================================================================

fn text_of(message: &UiMessage) -> String {
    message
        .parts
        .iter()
        .filter_map(|part| match part {
            UiPart::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn tool_call(call_id: &str, name: &str, input: Option<&Value>) -> ChatCompletionMessageToolCall {
    ChatCompletionMessageToolCall {
        id: call_id.to_string(),
        r#type: ChatCompletionToolType::Function,
        function: FunctionCall {
            name: name.to_string(),
            arguments: input.map(Value::to_string).unwrap_or_else(|| "{}".to_string()),
        },
    }
}

fn tool_result_message(call_id: &str, content: String) -> PortResult<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestToolMessageArgs::default()
        .tool_call_id(call_id)
        .content(content)
        .build()
        .map_err(openai_error)?
        .into())
}

fn assistant_message(
    text: Option<String>,
    calls: Vec<ChatCompletionMessageToolCall>,
) -> PortResult<ChatCompletionRequestMessage> {
    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
    if let Some(text) = text {
        builder.content(text);
    }
    if !calls.is_empty() {
        builder.tool_calls(calls);
    }
    Ok(builder.build().map_err(openai_error)?.into())
}

/// Flattens the system prompt and the UI history into provider messages. Finished
/// tool parts become an assistant tool call followed by the tool's result.
fn provider_messages(
    system_prompt: &str,
    history: &[UiMessage],
) -> PortResult<Vec<ChatCompletionRequestMessage>> {
    let mut messages: Vec<ChatCompletionRequestMessage> = vec![ChatCompletionRequestSystemMessageArgs::default()
        .content(system_prompt)
        .build()
        .map_err(openai_error)?
        .into()];

    for message in history {
        let text = text_of(message);
        match message.role {
            Role::System => {
                if !text.is_empty() {
                    messages.push(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(text)
                            .build()
                            .map_err(openai_error)?
                            .into(),
                    );
                }
            }
            Role::User => {
                if !text.is_empty() {
                    messages.push(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(text)
                            .build()
                            .map_err(openai_error)?
                            .into(),
                    );
                }
            }
            Role::Assistant => {
                let mut calls = Vec::new();
                let mut results = Vec::new();
                for part in &message.parts {
                    let UiPart::Tool(tool) = part else { continue };
                    let result = match &tool.state {
                        ToolCallState::OutputAvailable { output, .. } => output.to_string(),
                        ToolCallState::OutputError { error_text, .. } => {
                            json!({ "error": error_text }).to_string()
                        }
                        _ => continue,
                    };
                    calls.push(tool_call(&tool.call_id, &tool.name, tool.state.input()));
                    results.push(tool_result_message(&tool.call_id, result)?);
                }
                if !calls.is_empty() {
                    messages.push(assistant_message(None, calls)?);
                    messages.extend(results);
                }
                if !text.is_empty() {
                    messages.push(assistant_message(Some(text), Vec::new())?);
                }
            }
        }
    }
    Ok(messages)
}

fn tool_definition(tool: &dyn ChatTool) -> PortResult<ChatCompletionTool> {
    let function = FunctionObjectArgs::default()
        .name(tool.name())
        .description(tool.description())
        .parameters(tool.parameters())
        .build()
        .map_err(openai_error)?;
    ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(function)
        .build()
        .map_err(openai_error)
}

/// A tool call assembled from streamed chunks.
#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    /// Whether `ToolInputStart` went out for this call.
    announced: bool,
}

impl PendingCall {
    /// Marks the call announced once its id and name are known, returning them.
    fn announce(&mut self) -> Option<(String, String)> {
        if self.announced || self.id.is_empty() || self.name.is_empty() {
            return None;
        }
        self.announced = true;
        Some((self.id.clone(), self.name.clone()))
    }
}

//=========================================================================================
// `TextGenerator` Trait Implementation
//=========================================================================================

#[async_trait]
impl TextGenerator for OpenAiChatAdapter {
    async fn stream(&self, request: GenerationRequest) -> PortResult<GenerationStream> {
        let mut messages = provider_messages(&request.system_prompt, &request.history)?;
        let tool_defs = request
            .tools
            .iter()
            .map(|tool| tool_definition(tool.as_ref()))
            .collect::<PortResult<Vec<_>>>()?;
        let tools: Vec<Arc<dyn ChatTool>> = request.tools;

        // The first step is opened here so that setup failures surface before any token.
        let first = self.open_step(&messages, &tool_defs).await?;
        let adapter = self.clone();

        let stream = async_stream::stream! {
            let mut step_stream = first;
            let mut full_text = String::new();
            let mut total_tokens: u32 = 0;
            let mut model_id = adapter.model.clone();

            for step in 1..=MAX_STEPS {
                let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();
                let mut step_text = String::new();

                while let Some(chunk) = step_stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            yield Err(openai_error(e));
                            return;
                        }
                    };
                    if let Some(usage) = &chunk.usage {
                        total_tokens += usage.total_tokens;
                    }
                    model_id = chunk.model.clone();

                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                step_text.push_str(&content);
                                yield Ok(GenerationEvent::TextDelta(content));
                            }
                        }
                        for call in choice.delta.tool_calls.unwrap_or_default() {
                            let entry = pending.entry(call.index).or_default();
                            if let Some(id) = call.id {
                                entry.id = id;
                            }
                            if let Some(function) = call.function {
                                if let Some(name) = function.name {
                                    entry.name.push_str(&name);
                                }
                                if let Some(arguments) = function.arguments {
                                    entry.arguments.push_str(&arguments);
                                }
                            }
                            if let Some((call_id, name)) = entry.announce() {
                                yield Ok(GenerationEvent::ToolInputStart { call_id, name });
                            }
                        }
                    }
                }
                full_text.push_str(&step_text);

                if pending.is_empty() || step == MAX_STEPS {
                    if !pending.is_empty() {
                        warn!(steps = MAX_STEPS, "Step limit reached with tool calls outstanding.");
                    }
                    yield Ok(GenerationEvent::Finish {
                        text: full_text,
                        total_tokens,
                        model_id,
                    });
                    return;
                }

                // Run the requested tools and feed their results back.
                let mut calls = Vec::new();
                let mut results = Vec::new();
                for call in pending.into_values() {
                    let parsed = serde_json::from_str::<Value>(&call.arguments);
                    let input = match &parsed {
                        Ok(value) => value.clone(),
                        Err(_) => Value::String(call.arguments.clone()),
                    };
                    yield Ok(GenerationEvent::ToolInputAvailable {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        input: input.clone(),
                    });

                    let outcome = match (parsed, tools.iter().find(|t| t.name() == call.name)) {
                        (Err(e), _) => Err(format!("Invalid tool arguments: {}", e)),
                        (Ok(_), None) => Err(format!("Unknown tool '{}'", call.name)),
                        (Ok(input), Some(tool)) => tool.call(input).await,
                    };
                    debug!(tool = %call.name, ok = outcome.is_ok(), "Tool call finished.");

                    let content = match outcome {
                        Ok(output) => {
                            let content = output.to_string();
                            yield Ok(GenerationEvent::ToolOutputAvailable {
                                call_id: call.id.clone(),
                                output,
                            });
                            content
                        }
                        Err(error_text) => {
                            let content = json!({ "error": error_text }).to_string();
                            yield Ok(GenerationEvent::ToolOutputError {
                                call_id: call.id.clone(),
                                error_text,
                            });
                            content
                        }
                    };
                    calls.push(tool_call(&call.id, &call.name, Some(&input)));
                    match tool_result_message(&call.id, content) {
                        Ok(message) => results.push(message),
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }

                let text = (!step_text.is_empty()).then_some(step_text);
                match assistant_message(text, calls) {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
                messages.extend(results);

                yield Ok(GenerationEvent::StepStart);
                step_stream = match adapter.open_step(&messages, &tool_defs).await {
                    Ok(next) => next,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::message::ToolInvocation;

    #[test]
    fn pending_call_is_announced_once_id_and_name_are_known() {
        let mut call = PendingCall {
            id: "call_1".into(),
            ..PendingCall::default()
        };
        assert_eq!(call.announce(), None);

        call.name.push_str("searchResources");
        assert_eq!(
            call.announce(),
            Some(("call_1".to_string(), "searchResources".to_string()))
        );
        assert_eq!(call.announce(), None);
    }

    fn user(text: &str) -> UiMessage {
        UiMessage {
            id: "u1".into(),
            role: Role::User,
            parts: vec![UiPart::text(text)],
            metadata: None,
        }
    }

    #[test]
    fn system_prompt_leads_the_conversation() {
        let messages = provider_messages("be kind", &[user("hi")]).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn finished_tool_parts_are_replayed_as_call_and_result() {
        let assistant = UiMessage {
            id: "a1".into(),
            role: Role::Assistant,
            parts: vec![
                UiPart::Tool(ToolInvocation {
                    name: "searchResources".into(),
                    call_id: "call-1".into(),
                    state: ToolCallState::OutputAvailable {
                        input: json!({ "query": "loops" }),
                        output: json!({ "totalResults": 0 }),
                    },
                    provider_executed: None,
                }),
                UiPart::text("Nothing found."),
            ],
            metadata: None,
        };

        let messages = provider_messages("p", &[user("find loops"), assistant]).unwrap();
        assert_eq!(messages.len(), 5);
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(messages[3], ChatCompletionRequestMessage::Tool(_)));
        assert!(matches!(messages[4], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn empty_user_messages_are_skipped() {
        let empty = UiMessage {
            id: "u0".into(),
            role: Role::User,
            parts: vec![],
            metadata: None,
        };
        let messages = provider_messages("p", &[empty]).unwrap();
        assert_eq!(messages.len(), 1);
    }
}
