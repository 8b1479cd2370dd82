//! crates/tutor_core/src/chat.rs
//!
//! One chat turn, end to end: resolve the lesson and the session, persist the
//! learner's message, retrieve lesson context, build the prompt and relay the
//! generation to the caller as it arrives. The assistant reply is written by a
//! background task once the generation finishes, so persistence never holds up
//! the visible stream.

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::{self, StoredMessage};
use crate::domain::{ChatSession, MessageMetadata, User};
use crate::error::{DomainError, DomainResult, PortResultExt};
use crate::message::{
    Role, TextState, ToolCallState, ToolInvocation, ToolTransitionError, UiMessage, UiPart,
};
use crate::ports::{
    ChatMessageRepository, ChatTool, Clock, GenerationEvent, GenerationRequest, GenerationStream,
    LessonRepository, TextGenerator,
};
use crate::prompt::build_system_prompt;
use crate::retriever::ContextRetriever;
use crate::session::SessionManager;

//=========================================================================================
// Inputs and outputs
//=========================================================================================

/// A chat request from an authenticated learner.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub user: User,
    pub lesson_id: String,
    /// The whole conversation as the client holds it, newest last.
    pub messages: Vec<UiMessage>,
}

/// One chunk of the streamed reply, in the client's UI-message stream format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    StartStep,
    TextDelta {
        id: String,
        delta: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
    },
    ToolOutputError {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "errorText")]
        error_text: String,
    },
    Finish {
        #[serde(rename = "messageMetadata")]
        metadata: MessageMetadata,
    },
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

//=========================================================================================
// Reply accumulation
//=========================================================================================

/// Closes tool calls the model left without a result.
const UNFINISHED_TOOL_CALL: &str = "Tool call did not complete";

/// Builds the assistant message from generation events, in emission order.
struct ReplyBuilder {
    message_id: String,
    parts: Vec<UiPart>,
}

impl ReplyBuilder {
    fn new(message_id: String) -> Self {
        Self {
            message_id,
            parts: Vec::new(),
        }
    }

    /// Folds one event into the reply and returns the chunk to forward. A tool
    /// event that breaks the tool-call state machine is a validation error.
    fn apply(&mut self, event: GenerationEvent) -> DomainResult<Option<ChatEvent>> {
        let chunk = match event {
            GenerationEvent::TextDelta(delta) => {
                let id = self.append_text(&delta, false);
                ChatEvent::TextDelta { id, delta }
            }
            GenerationEvent::ReasoningDelta(delta) => {
                let id = self.append_text(&delta, true);
                ChatEvent::ReasoningDelta { id, delta }
            }
            GenerationEvent::StepStart => {
                self.parts.push(UiPart::StepStart);
                ChatEvent::StartStep
            }
            GenerationEvent::ToolInputStart { call_id, name } => {
                if self.tool_mut(&call_id).is_some() {
                    return Err(DomainError::Validation(format!(
                        "Tool call {} was started twice",
                        call_id
                    )));
                }
                self.push_tool(&call_id, &name, ToolCallState::InputStreaming { input: None });
                ChatEvent::ToolInputStart {
                    tool_call_id: call_id,
                    tool_name: name,
                }
            }
            GenerationEvent::ToolInputAvailable {
                call_id,
                name,
                input,
            } => {
                if self.tool_mut(&call_id).is_some() {
                    self.advance_tool(&call_id, |state| state.with_input(input.clone()))?;
                } else {
                    self.push_tool(
                        &call_id,
                        &name,
                        ToolCallState::InputAvailable {
                            input: input.clone(),
                        },
                    );
                }
                ChatEvent::ToolInputAvailable {
                    tool_call_id: call_id,
                    tool_name: name,
                    input,
                }
            }
            GenerationEvent::ToolOutputAvailable { call_id, output } => {
                self.advance_tool(&call_id, |state| state.with_output(output.clone()))?;
                ChatEvent::ToolOutputAvailable {
                    tool_call_id: call_id,
                    output,
                }
            }
            GenerationEvent::ToolOutputError {
                call_id,
                error_text,
            } => {
                self.advance_tool(&call_id, |state| state.with_error(error_text.clone()))?;
                ChatEvent::ToolOutputError {
                    tool_call_id: call_id,
                    error_text,
                }
            }
            GenerationEvent::Finish { .. } => return Ok(None),
        };
        Ok(Some(chunk))
    }

    fn append_text(&mut self, delta: &str, reasoning: bool) -> String {
        let continues = match self.parts.last_mut() {
            Some(UiPart::Text {
                text,
                state: Some(TextState::Streaming),
            }) if !reasoning => {
                text.push_str(delta);
                true
            }
            Some(UiPart::Reasoning {
                text,
                state: Some(TextState::Streaming),
                ..
            }) if reasoning => {
                text.push_str(delta);
                true
            }
            _ => false,
        };
        if !continues {
            let text = delta.to_string();
            self.parts.push(if reasoning {
                UiPart::Reasoning {
                    text,
                    state: Some(TextState::Streaming),
                    provider_metadata: None,
                }
            } else {
                UiPart::Text {
                    text,
                    state: Some(TextState::Streaming),
                }
            });
        }
        let prefix = if reasoning { "reasoning" } else { "text" };
        format!("{}-{}", prefix, self.parts.len() - 1)
    }

    fn tool_mut(&mut self, call_id: &str) -> Option<&mut ToolInvocation> {
        self.parts.iter_mut().find_map(|part| match part {
            UiPart::Tool(tool) if tool.call_id == call_id => Some(tool),
            _ => None,
        })
    }

    fn push_tool(&mut self, call_id: &str, name: &str, state: ToolCallState) {
        self.parts.push(UiPart::Tool(ToolInvocation {
            name: name.to_string(),
            call_id: call_id.to_string(),
            state,
            provider_executed: None,
        }));
    }

    fn advance_tool<F>(&mut self, call_id: &str, transition: F) -> DomainResult<()>
    where
        F: FnOnce(ToolCallState) -> Result<ToolCallState, ToolTransitionError>,
    {
        let tool = self.tool_mut(call_id).ok_or_else(|| {
            DomainError::Validation(format!("Tool update for unknown call {}", call_id))
        })?;
        tool.state = transition(tool.state.clone())
            .map_err(|e| DomainError::Validation(format!("Tool call {}: {}", call_id, e)))?;
        Ok(())
    }

    /// Closes every streaming part and returns the complete message.
    fn finish(mut self, final_text: &str, metadata: &MessageMetadata) -> UiMessage {
        for part in &mut self.parts {
            match part {
                UiPart::Text { state, .. } | UiPart::Reasoning { state, .. } => {
                    *state = Some(TextState::Done);
                }
                UiPart::Tool(tool) if !tool.state.is_terminal() => {
                    warn!(call_id = %tool.call_id, "Tool call left without a result.");
                    if let Ok(closed) = tool.state.clone().with_error(UNFINISHED_TOOL_CALL.to_string()) {
                        tool.state = closed;
                    }
                }
                _ => {}
            }
        }
        let has_text = self
            .parts
            .iter()
            .any(|part| matches!(part, UiPart::Text { .. }));
        if !has_text && !final_text.is_empty() {
            self.parts.push(UiPart::text(final_text));
        }

        UiMessage {
            id: self.message_id,
            role: Role::Assistant,
            parts: self.parts,
            metadata: serde_json::to_value(metadata).ok(),
        }
    }
}

//=========================================================================================
// Background persistence of assistant replies
//=========================================================================================

#[derive(Clone)]
struct ReplyWriter {
    messages: Arc<dyn ChatMessageRepository>,
    tasks: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl ReplyWriter {
    /// Writes the reply once, off the request path. Failures are logged with a
    /// correlation id and counted; they never reach the caller.
    fn spawn(&self, session: ChatSession, document: StoredMessage) {
        let writer = self.clone();
        self.tasks.spawn(async move {
            let message_id = document.message_id.clone();
            match writer.messages.save(&session, document).await {
                Ok(()) => info!(
                    session_id = %session.id,
                    message_id = %message_id,
                    "Saved assistant message."
                ),
                Err(e) => {
                    let correlation_id = Uuid::new_v4();
                    writer.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        %correlation_id,
                        session_id = %session.id,
                        message_id = %message_id,
                        "Failed to save assistant message: {}",
                        e
                    );
                }
            }
        });
    }
}

/// Logs a disconnect when the relay is dropped before the generation ended.
struct DisconnectGuard {
    session_id: Uuid,
    done: bool,
}

impl DisconnectGuard {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            done: false,
        }
    }

    fn complete(&mut self) {
        self.done = true;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.done {
            info!(
                session_id = %self.session_id,
                "Client disconnected mid-stream; generation abandoned and partial reply discarded."
            );
        }
    }
}

//=========================================================================================
// The service
//=========================================================================================

pub struct ChatService {
    lessons: Arc<dyn LessonRepository>,
    messages: Arc<dyn ChatMessageRepository>,
    sessions: SessionManager,
    retriever: ContextRetriever,
    generator: Arc<dyn TextGenerator>,
    clock: Arc<dyn Clock>,
    tools: Vec<Arc<dyn ChatTool>>,
    background: TaskTracker,
    persistence_failures: Arc<AtomicU64>,
}

impl ChatService {
    pub fn new(
        lessons: Arc<dyn LessonRepository>,
        messages: Arc<dyn ChatMessageRepository>,
        sessions: SessionManager,
        retriever: ContextRetriever,
        generator: Arc<dyn TextGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lessons,
            messages,
            sessions,
            retriever,
            generator,
            clock,
            tools: Vec::new(),
            background: TaskTracker::new(),
            persistence_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Offers `tool` to the generator on every turn.
    pub fn with_tool(mut self, tool: Arc<dyn ChatTool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Assistant replies that could not be saved since startup.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Waits until every pending assistant-message write has finished.
    pub async fn wait_for_pending_writes(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Runs one chat turn. Everything up to the start of generation happens
    /// before this returns, so setup failures surface as errors; the returned
    /// stream then carries the reply.
    pub async fn send_message(&self, turn: ChatTurn) -> DomainResult<ChatEventStream> {
        let ChatTurn {
            user,
            lesson_id,
            messages,
        } = turn;

        let lesson = self
            .lessons
            .get_by_id(&lesson_id)
            .await
            .repository(|| format!("Failed to fetch lesson {}", lesson_id))?
            .ok_or_else(|| DomainError::not_found("Lesson", lesson_id.as_str()))?;

        let latest = messages
            .last()
            .ok_or_else(|| DomainError::Validation("No message content provided".to_string()))?;
        let query = latest
            .first_text()
            .map(str::to_string)
            .ok_or_else(|| DomainError::Validation("No message content provided".to_string()))?;

        let session = self.sessions.get_or_create_active_session(&user, &lesson).await?;

        if latest.role == Role::User {
            let mut document = codec::encode(latest, session.id);
            document.created_at = self.clock.now();
            self.messages
                .save(&session, document)
                .await
                .repository(|| format!("Failed to save message for session {}", session.id))?;
        }

        let results = self.retriever.lesson_context(&query, &lesson.id).await?;
        let system_prompt = build_system_prompt(&user, &lesson, &results);

        let started = Instant::now();
        let generation = self
            .generator
            .stream(GenerationRequest {
                system_prompt,
                history: messages,
                tools: self.tools.clone(),
            })
            .await
            .generation(|| "Failed to generate chat response".to_string())?;

        info!(
            session_id = %session.id,
            user_id = %user.id,
            lesson_id = %lesson.id,
            context_hits = results.len(),
            "Streaming chat reply."
        );
        Ok(self.relay(generation, session, started))
    }

    /// Decoded messages of the active session for the pair, oldest first.
    pub async fn history(&self, user_id: Uuid, lesson_id: &str) -> DomainResult<Vec<UiMessage>> {
        let stored = self
            .messages
            .history(user_id, lesson_id)
            .await
            .repository(|| format!("Failed to fetch chat history for lesson {}", lesson_id))?;
        Ok(stored.iter().map(codec::decode).collect())
    }

    fn relay(
        &self,
        mut generation: GenerationStream,
        session: ChatSession,
        started: Instant,
    ) -> ChatEventStream {
        let writer = ReplyWriter {
            messages: self.messages.clone(),
            tasks: self.background.clone(),
            failures: self.persistence_failures.clone(),
        };
        let clock = self.clock.clone();
        let message_id = format!("assistant-{}", Uuid::new_v4().simple());

        Box::pin(async_stream::stream! {
            let mut guard = DisconnectGuard::new(session.id);
            let mut reply = ReplyBuilder::new(message_id.clone());
            yield ChatEvent::Start { message_id };

            let mut finished = false;
            while let Some(item) = generation.next().await {
                match item {
                    Ok(GenerationEvent::Finish { text, total_tokens, model_id }) => {
                        let metadata = MessageMetadata {
                            model: model_id,
                            tokens: total_tokens,
                            processing_time: started.elapsed().as_millis() as u64,
                        };
                        let message = reply.finish(&text, &metadata);
                        let mut document = codec::encode(&message, session.id);
                        document.created_at = clock.now();
                        writer.spawn(session.clone(), document);
                        finished = true;
                        guard.complete();
                        yield ChatEvent::Finish { metadata };
                        break;
                    }
                    Ok(event) => match reply.apply(event) {
                        Ok(Some(chunk)) => {
                            yield chunk;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(session_id = %session.id, "Rejected generation event: {}", e);
                            finished = true;
                            guard.complete();
                            yield ChatEvent::Error {
                                error_text: e.public_message(),
                            };
                            break;
                        }
                    },
                    Err(e) => {
                        error!(session_id = %session.id, "Generation failed mid-stream: {}", e);
                        finished = true;
                        guard.complete();
                        yield ChatEvent::Error {
                            error_text: "Failed to generate chat response".to_string(),
                        };
                        break;
                    }
                }
            }

            if !finished {
                warn!(session_id = %session.id, "Generation ended without a finish event.");
                guard.complete();
                yield ChatEvent::Error {
                    error_text: "Failed to generate chat response".to_string(),
                };
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PartDocument;
    use crate::testing::{hit, lesson, user, FakeGenerator, FakeVectorSearch, FixedClock, InMemoryStore};
    use futures::StreamExt;
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryStore>,
        index: Arc<FakeVectorSearch>,
        generator: Arc<FakeGenerator>,
        service: ChatService,
    }

    fn harness(generator: FakeGenerator, index: FakeVectorSearch) -> Harness {
        let store = Arc::new(InMemoryStore::default());
        store.add_lesson(lesson("l1", "Closures in Rust"));
        let index = Arc::new(index);
        let generator = Arc::new(generator);
        let clock = Arc::new(FixedClock::default());
        let service = ChatService::new(
            store.clone(),
            store.clone(),
            SessionManager::new(store.clone(), clock.clone()),
            ContextRetriever::new(index.clone()),
            generator.clone(),
            clock,
        );
        Harness {
            store,
            index,
            generator,
            service,
        }
    }

    fn user_message(text: &str) -> UiMessage {
        UiMessage {
            id: "m1".into(),
            role: Role::User,
            parts: vec![UiPart::text(text)],
            metadata: None,
        }
    }

    fn turn(text: &str) -> ChatTurn {
        ChatTurn {
            user: user("u1"),
            lesson_id: "l1".into(),
            messages: vec![user_message(text)],
        }
    }

    fn finish(text: &str) -> GenerationEvent {
        GenerationEvent::Finish {
            text: text.into(),
            total_tokens: 42,
            model_id: "gpt-test".into(),
        }
    }

    #[tokio::test]
    async fn first_message_runs_the_whole_turn() {
        let h = harness(
            FakeGenerator::with_events(vec![
                GenerationEvent::TextDelta("A closure ".into()),
                GenerationEvent::TextDelta("captures its environment.".into()),
                finish("A closure captures its environment."),
            ]),
            FakeVectorSearch::with_results(vec![hit("c1", 0.8, "Closures capture variables.")]),
        );
        let learner = user("u1");

        let events: Vec<_> = h.service.send_message(turn("What is a closure?")).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        assert!(matches!(events.first(), Some(ChatEvent::Start { .. })));
        assert_eq!(
            events[1],
            ChatEvent::TextDelta {
                id: "text-0".into(),
                delta: "A closure ".into()
            }
        );
        assert!(matches!(events.last(), Some(ChatEvent::Finish { .. })));

        // Context was scoped to the lesson and the prompt names it.
        assert_eq!(h.index.calls()[0].0, "What is a closure?");
        assert_eq!(h.index.calls()[0].1, crate::ports::SearchScope::Lesson("l1".into()));
        let request = h.generator.last_request().unwrap();
        assert!(request.system_prompt.contains("Current Lesson: Closures in Rust"));
        assert!(request.system_prompt.contains("Closures capture variables."));

        let history = h.store.messages_for(learner.id, "l1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        let metadata: MessageMetadata =
            serde_json::from_str(history[1].metadata.as_deref().unwrap()).unwrap();
        assert_eq!(metadata.model, "gpt-test");
        assert_eq!(metadata.tokens, 42);
        assert_eq!(
            history[1].parts[0].body,
            PartDocument::Text {
                text: "A closure captures its environment.".into(),
                state: Some("done".into())
            }
        );
        assert_eq!(h.store.active_sessions_for(learner.id, "l1"), 1);
    }

    #[tokio::test]
    async fn unknown_lesson_is_not_found_and_writes_nothing() {
        let h = harness(FakeGenerator::default(), FakeVectorSearch::default());
        let mut request = turn("hello");
        request.lesson_id = "missing".into();

        let err = h.service.send_message(request).await.err().unwrap();
        assert!(matches!(err, DomainError::NotFound { .. }));
        assert_eq!(h.store.session_count(), 0);
        assert!(h.generator.last_request().is_none());
    }

    #[tokio::test]
    async fn message_without_text_is_rejected_before_generation() {
        let h = harness(FakeGenerator::default(), FakeVectorSearch::default());
        let mut request = turn("   ");
        request.messages[0].parts.push(UiPart::StepStart);

        let err = h.service.send_message(request).await.err().unwrap();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(h.generator.last_request().is_none());
    }

    #[tokio::test]
    async fn user_message_survives_generator_setup_failure() {
        let h = harness(FakeGenerator::failing(), FakeVectorSearch::default());
        let learner = user("u1");

        let err = h.service.send_message(turn("What is a closure?")).await.err().unwrap();
        assert!(matches!(err, DomainError::Generation { .. }));
        assert_eq!(err.code(), "AI_SERVICE_ERROR");

        let history = h.store.messages_for(learner.id, "l1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_and_skips_persistence() {
        let h = harness(
            FakeGenerator::with_events(vec![GenerationEvent::TextDelta("Part".into())])
                .then_fail("connection reset"),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");

        let events: Vec<_> = h.service.send_message(turn("What is a closure?")).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));
        let history = h.store.messages_for(learner.id, "l1");
        assert_eq!(history.len(), 1);
        assert_eq!(h.service.persistence_failures(), 0);
    }

    #[tokio::test]
    async fn disconnect_discards_the_partial_reply() {
        let h = harness(
            FakeGenerator::with_events(vec![
                GenerationEvent::TextDelta("A closure".into()),
                GenerationEvent::TextDelta(" is".into()),
                finish("A closure is"),
            ]),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");

        let mut stream = h.service.send_message(turn("What is a closure?")).await.unwrap();
        stream.next().await;
        stream.next().await;
        drop(stream);
        h.service.wait_for_pending_writes().await;

        assert_eq!(h.store.messages_for(learner.id, "l1").len(), 1);
    }

    #[tokio::test]
    async fn failed_reply_write_is_counted_not_surfaced() {
        let h = harness(
            FakeGenerator::with_events(vec![GenerationEvent::TextDelta("Hi".into()), finish("Hi")]),
            FakeVectorSearch::default(),
        );
        h.store.fail_saves_for(Role::Assistant);

        let events: Vec<_> = h.service.send_message(turn("hello")).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        assert!(matches!(events.last(), Some(ChatEvent::Finish { .. })));
        assert_eq!(h.service.persistence_failures(), 1);
    }

    #[tokio::test]
    async fn tool_calls_stream_and_persist_as_tool_parts() {
        let h = harness(
            FakeGenerator::with_events(vec![
                GenerationEvent::ToolInputAvailable {
                    call_id: "call-1".into(),
                    name: "searchResources".into(),
                    input: json!({ "query": "closures" }),
                },
                GenerationEvent::ToolOutputAvailable {
                    call_id: "call-1".into(),
                    output: json!({ "totalResults": 0 }),
                },
                GenerationEvent::StepStart,
                GenerationEvent::TextDelta("Done.".into()),
                finish("Done."),
            ]),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");

        let events: Vec<_> = h.service.send_message(turn("find examples")).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        assert!(events.contains(&ChatEvent::ToolOutputAvailable {
            tool_call_id: "call-1".into(),
            output: json!({ "totalResults": 0 }),
        }));
        assert!(events.contains(&ChatEvent::TextDelta {
            id: "text-2".into(),
            delta: "Done.".into()
        }));

        let stored = h.store.messages_for(learner.id, "l1");
        let reply = codec::decode(&stored[1]);
        match &reply.parts[0] {
            UiPart::Tool(tool) => {
                assert_eq!(tool.name, "searchResources");
                assert_eq!(
                    tool.state,
                    ToolCallState::OutputAvailable {
                        input: json!({ "query": "closures" }),
                        output: json!({ "totalResults": 0 }),
                    }
                );
            }
            other => panic!("expected a tool part, got {:?}", other),
        }
        assert_eq!(reply.parts[1], UiPart::StepStart);
        assert_eq!(reply.parts[2], UiPart::text("Done."));
    }

    #[tokio::test]
    async fn tool_output_before_input_is_rejected() {
        let h = harness(
            FakeGenerator::with_events(vec![
                GenerationEvent::TextDelta("Let me look.".into()),
                GenerationEvent::ToolOutputAvailable {
                    call_id: "call-9".into(),
                    output: json!({ "totalResults": 1 }),
                },
                finish("Let me look."),
            ]),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");

        let events: Vec<_> = h.service.send_message(turn("find examples")).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        match events.last() {
            Some(ChatEvent::Error { error_text }) => assert!(error_text.contains("call-9")),
            other => panic!("expected an error chunk, got {:?}", other),
        }
        assert!(!events.iter().any(|e| matches!(e, ChatEvent::Finish { .. })));
        assert_eq!(h.store.messages_for(learner.id, "l1").len(), 1);
    }

    #[tokio::test]
    async fn second_output_for_a_finished_call_is_rejected() {
        let h = harness(
            FakeGenerator::with_events(vec![
                GenerationEvent::ToolInputAvailable {
                    call_id: "call-1".into(),
                    name: "searchResources".into(),
                    input: json!({ "query": "closures" }),
                },
                GenerationEvent::ToolOutputError {
                    call_id: "call-1".into(),
                    error_text: "index offline".into(),
                },
                GenerationEvent::ToolOutputAvailable {
                    call_id: "call-1".into(),
                    output: json!({}),
                },
                finish(""),
            ]),
            FakeVectorSearch::default(),
        );

        let events: Vec<_> = h.service.send_message(turn("find examples")).await.unwrap().collect().await;

        match events.last() {
            Some(ChatEvent::Error { error_text }) => {
                assert!(error_text.contains("'output-error' to 'output-available'"))
            }
            other => panic!("expected an error chunk, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn streamed_tool_input_walks_the_state_machine() {
        let h = harness(
            FakeGenerator::with_events(vec![
                GenerationEvent::ToolInputStart {
                    call_id: "call-1".into(),
                    name: "searchResources".into(),
                },
                GenerationEvent::ToolInputAvailable {
                    call_id: "call-1".into(),
                    name: "searchResources".into(),
                    input: json!({ "query": "closures" }),
                },
                GenerationEvent::ToolOutputAvailable {
                    call_id: "call-1".into(),
                    output: json!({ "totalResults": 0 }),
                },
                GenerationEvent::ToolInputStart {
                    call_id: "call-2".into(),
                    name: "searchResources".into(),
                },
                finish(""),
            ]),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");

        let events: Vec<_> = h.service.send_message(turn("find examples")).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        assert_eq!(
            events[1],
            ChatEvent::ToolInputStart {
                tool_call_id: "call-1".into(),
                tool_name: "searchResources".into(),
            }
        );
        assert!(matches!(events.last(), Some(ChatEvent::Finish { .. })));

        let stored = h.store.messages_for(learner.id, "l1");
        let reply = codec::decode(&stored[1]);
        let states: Vec<_> = reply
            .parts
            .iter()
            .filter_map(|part| match part {
                UiPart::Tool(tool) => Some(tool.state.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ToolCallState::OutputAvailable {
                    input: json!({ "query": "closures" }),
                    output: json!({ "totalResults": 0 }),
                },
                // Never answered before the generation finished.
                ToolCallState::OutputError {
                    input: None,
                    error_text: "Tool call did not complete".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn non_user_latest_message_is_not_persisted() {
        let h = harness(
            FakeGenerator::with_events(vec![finish("ok")]),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");
        let mut request = turn("regenerate this");
        request.messages[0].role = Role::Assistant;

        let _: Vec<_> = h.service.send_message(request).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        let stored = h.store.messages_for(learner.id, "l1");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn repeated_turns_share_one_session() {
        let h = harness(
            FakeGenerator::with_events(vec![finish("ok")]),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");

        for text in ["one", "two", "three"] {
            let _: Vec<_> = h.service.send_message(turn(text)).await.unwrap().collect().await;
        }
        h.service.wait_for_pending_writes().await;

        assert_eq!(h.store.active_sessions_for(learner.id, "l1"), 1);
        assert_eq!(h.store.messages_for(learner.id, "l1").len(), 6);
    }

    #[tokio::test]
    async fn history_decodes_stored_messages() {
        let h = harness(
            FakeGenerator::with_events(vec![GenerationEvent::TextDelta("Hi".into()), finish("Hi")]),
            FakeVectorSearch::default(),
        );
        let learner = user("u1");
        let _: Vec<_> = h.service.send_message(turn("hello")).await.unwrap().collect().await;
        h.service.wait_for_pending_writes().await;

        let history = h.service.history(learner.id, "l1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], user_message("hello"));
        assert_eq!(history[1].first_text(), Some("Hi"));
        assert!(history[1].metadata.is_some());
    }

    #[test]
    fn events_serialize_in_the_ui_stream_shape() {
        let value = serde_json::to_value(ChatEvent::ToolInputAvailable {
            tool_call_id: "c1".into(),
            tool_name: "searchResources".into(),
            input: json!({ "query": "x" }),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tool-input-available",
                "toolCallId": "c1",
                "toolName": "searchResources",
                "input": { "query": "x" }
            })
        );
        assert_eq!(
            serde_json::to_value(ChatEvent::StartStep).unwrap(),
            json!({ "type": "start-step" })
        );
    }
}
