//! crates/tutor_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases, the
//! vector index, the LLM provider or the job runner.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::StoredMessage;
use crate::domain::{
    AnalyticsSnapshot, ChatSession, Course, LearningActivity, LearningSession, Lesson,
    NewChatSession, NewUser, ProfilePatch, Recommendation, RecommendationUpsert, StudyStreak,
    User,
};
use crate::message::UiMessage;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// A uniqueness rule rejected the write (e.g. a second active session).
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Repositories
//=========================================================================================

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_external_id(&self, external_id: &str) -> PortResult<Option<User>>;

    async fn get_by_id(&self, user_id: Uuid) -> PortResult<Option<User>>;

    async fn create(&self, user: NewUser) -> PortResult<User>;

    async fn update_profile(&self, user_id: Uuid, patch: ProfilePatch) -> PortResult<()>;

    /// Replaces personal data with placeholders and clears the external id.
    async fn anonymize(&self, user_id: Uuid, at: DateTime<Utc>) -> PortResult<()>;

    async fn update_analytics(&self, user_id: Uuid, analytics: AnalyticsSnapshot) -> PortResult<()>;

    async fn update_streak(&self, user_id: Uuid, streak: StudyStreak) -> PortResult<()>;
}

#[async_trait]
pub trait LessonRepository: Send + Sync {
    async fn get_by_id(&self, lesson_id: &str) -> PortResult<Option<Lesson>>;
}

#[async_trait]
pub trait CourseRepository: Send + Sync {
    /// Returns the courses that exist among `ids`, in no particular order.
    async fn get_by_ids(&self, ids: &[String]) -> PortResult<Vec<Course>>;
}

#[async_trait]
pub trait ChatSessionRepository: Send + Sync {
    async fn get_active(&self, user_id: Uuid, lesson_id: &str) -> PortResult<Option<ChatSession>>;

    /// Inserts an active session. Returns `PortError::Conflict` if one already exists
    /// for the same (user, lesson) pair.
    async fn create(&self, session: NewChatSession) -> PortResult<ChatSession>;

    async fn touch(&self, session_id: Uuid, at: DateTime<Utc>) -> PortResult<()>;
}

#[async_trait]
pub trait ChatMessageRepository: Send + Sync {
    /// Appends one message to the session and bumps its message count.
    async fn save(&self, session: &ChatSession, message: StoredMessage) -> PortResult<()>;

    /// Messages of the active session for the pair, oldest first.
    async fn history(&self, user_id: Uuid, lesson_id: &str) -> PortResult<Vec<StoredMessage>>;
}

#[async_trait]
pub trait RecommendationRepository: Send + Sync {
    /// Creates or overwrites the single record kept for `upsert.user_id`.
    async fn upsert(&self, upsert: RecommendationUpsert) -> PortResult<Uuid>;

    async fn get_for_user(&self, user_id: Uuid) -> PortResult<Option<Recommendation>>;
}

#[async_trait]
pub trait LearningSessionRepository: Send + Sync {
    async fn get_open(&self, user_id: Uuid) -> PortResult<Option<LearningSession>>;

    async fn create(
        &self,
        user_id: Uuid,
        course_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> PortResult<LearningSession>;

    async fn close(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_minutes: u32,
    ) -> PortResult<()>;

    async fn add_activity(&self, session_id: Uuid, activity: LearningActivity) -> PortResult<()>;
}

//=========================================================================================
// Vector search
//=========================================================================================

/// Which kind of chunk an index entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Lesson,
    Course,
    Resource,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Lesson => "lesson",
            ChunkKind::Course => "course",
            ChunkKind::Resource => "resource",
        }
    }
}

/// Metadata stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    /// The lesson, course or resource the chunk belongs to.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub url: Option<String>,
}

/// One hit from the vector index. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub content: Option<String>,
    pub metadata: Option<SourceMetadata>,
}

/// The filter applied to a vector query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchScope {
    /// Chunks of exactly one lesson.
    Lesson(String),
    /// Course chunks across the catalogue.
    Courses,
    /// Supplementary resource chunks.
    Resources,
}

#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn query(
        &self,
        text: &str,
        scope: &SearchScope,
        top_k: usize,
    ) -> PortResult<Vec<SearchResult>>;
}

//=========================================================================================
// Generation
//=========================================================================================

/// A function the generator may call mid-answer.
#[async_trait]
pub trait ChatTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool input.
    fn parameters(&self) -> Value;

    /// Runs the tool. `Err` carries the text shown to the model as the tool error.
    async fn call(&self, input: Value) -> Result<Value, String>;
}

/// Everything the generator needs for one assistant turn.
#[derive(Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub history: Vec<UiMessage>,
    pub tools: Vec<Arc<dyn ChatTool>>,
}

/// Incremental output of a generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// The model began a tool call; its arguments are still streaming.
    ToolInputStart {
        call_id: String,
        name: String,
    },
    ToolInputAvailable {
        call_id: String,
        name: String,
        input: Value,
    },
    ToolOutputAvailable {
        call_id: String,
        output: Value,
    },
    ToolOutputError {
        call_id: String,
        error_text: String,
    },
    /// A new model step starts (after tool results were fed back).
    StepStart,
    /// Always the last event of a successful generation.
    Finish {
        text: String,
        total_tokens: u32,
        model_id: String,
    },
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = PortResult<GenerationEvent>> + Send>>;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Starts a streaming generation. Errors returned here happen before any
    /// token exists; errors inside the stream happen mid-answer.
    async fn stream(&self, request: GenerationRequest) -> PortResult<GenerationStream>;
}

//=========================================================================================
// Jobs and outbound mail
//=========================================================================================

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Submits an event to the background runner and returns its dispatch token.
    async fn send(&self, event_name: &str, payload: Value) -> PortResult<String>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_welcome(&self, user: &User) -> PortResult<()>;
}

/// Source of the current time for services that reason about calendar days.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
