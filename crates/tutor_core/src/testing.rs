//! crates/tutor_core/src/testing.rs
//!
//! In-memory fakes of every port. Compiled for this crate's tests and, behind the
//! `testing` feature, for the API crate's route tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::codec::StoredMessage;
use crate::domain::{
    AnalyticsSnapshot, ChatSession, Course, EmailPreferences, LearningActivity, LearningSession,
    Lesson, NewChatSession, NewUser, OnboardingStatus, ProfilePatch, Recommendation,
    RecommendationUpsert, SessionStatus, SkillLevel, StudyStreak, User,
};
use crate::message::Role;
use crate::ports::{
    ChatMessageRepository, ChatSessionRepository, ChunkKind, Clock, CourseRepository,
    GenerationEvent, GenerationRequest, GenerationStream, JobDispatcher, LearningSessionRepository,
    LessonRepository, Mailer, PortError, PortResult, RecommendationRepository, SearchResult,
    SearchScope, SourceMetadata, TextGenerator, UserRepository, VectorSearch,
};

//=========================================================================================
// Builders
//=========================================================================================

/// A learner whose id is derived from `external_id`, so repeated calls agree.
pub fn user(external_id: &str) -> User {
    let mut bytes = [0u8; 16];
    for (slot, byte) in bytes.iter_mut().zip(external_id.bytes()) {
        *slot = byte;
    }
    User {
        id: Uuid::from_bytes(bytes),
        external_id: Some(external_id.to_string()),
        email: format!("{}@example.com", external_id),
        first_name: "Test".into(),
        last_name: "Learner".into(),
        username: format!("user_{}", external_id),
        level: SkillLevel::Beginner,
        explanation_style: None,
        learning_goals: Vec::new(),
        language: None,
        onboarding: OnboardingStatus::Completed,
        analytics: AnalyticsSnapshot::default(),
        streak: StudyStreak::default(),
        email_preferences: EmailPreferences::default(),
    }
}

pub fn lesson(id: &str, title: &str) -> Lesson {
    Lesson {
        id: id.into(),
        title: title.into(),
        body: format!("Body of {}", title),
    }
}

pub fn hit(id: &str, score: f32, content: &str) -> SearchResult {
    SearchResult {
        id: id.into(),
        score,
        content: Some(content.into()),
        metadata: Some(SourceMetadata {
            id: id.into(),
            kind: ChunkKind::Lesson,
            chunk_index: 0,
            url: None,
        }),
    }
}

//=========================================================================================
// Clock
//=========================================================================================

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

//=========================================================================================
// Vector search
//=========================================================================================

#[derive(Default)]
pub struct FakeVectorSearch {
    results: Vec<SearchResult>,
    fail: bool,
    calls: Mutex<Vec<(String, SearchScope, usize)>>,
}

impl FakeVectorSearch {
    pub fn with_results(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, SearchScope, usize)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl VectorSearch for FakeVectorSearch {
    async fn query(&self, text: &str, scope: &SearchScope, top_k: usize) -> PortResult<Vec<SearchResult>> {
        self.calls.lock().push((text.to_string(), scope.clone(), top_k));
        if self.fail {
            return Err(PortError::Unexpected("index unavailable".into()));
        }
        Ok(self.results.clone())
    }
}

//=========================================================================================
// Generator
//=========================================================================================

#[derive(Default)]
pub struct FakeGenerator {
    events: Vec<PortResult<GenerationEvent>>,
    fail_setup: bool,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl FakeGenerator {
    pub fn with_events(events: Vec<GenerationEvent>) -> Self {
        Self {
            events: events.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }

    /// Fails before any token is produced.
    pub fn failing() -> Self {
        Self {
            fail_setup: true,
            ..Default::default()
        }
    }

    /// Ends the scripted events with a mid-stream failure.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.events.push(Err(PortError::Unexpected(message.to_string())));
        self
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn stream(&self, request: GenerationRequest) -> PortResult<GenerationStream> {
        *self.last_request.lock() = Some(request);
        if self.fail_setup {
            return Err(PortError::Unexpected("model unavailable".into()));
        }
        Ok(Box::pin(stream::iter(self.events.clone())))
    }
}

//=========================================================================================
// Jobs and mail
//=========================================================================================

#[derive(Default)]
pub struct FakeDispatcher {
    fail: bool,
    sent: Mutex<Vec<(String, Value)>>,
}

impl FakeDispatcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl JobDispatcher for FakeDispatcher {
    async fn send(&self, event_name: &str, payload: Value) -> PortResult<String> {
        if self.fail {
            return Err(PortError::Unexpected("runner unreachable".into()));
        }
        let mut sent = self.sent.lock();
        sent.push((event_name.to_string(), payload));
        Ok(format!("job-{}", sent.len()))
    }
}

#[derive(Default)]
pub struct FakeMailer {
    fail: bool,
    welcomed: Mutex<Vec<Uuid>>,
}

impl FakeMailer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn welcomed(&self) -> Vec<Uuid> {
        self.welcomed.lock().clone()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send_welcome(&self, user: &User) -> PortResult<()> {
        if self.fail {
            return Err(PortError::Unexpected("smtp down".into()));
        }
        self.welcomed.lock().push(user.id);
        Ok(())
    }
}

//=========================================================================================
// Repositories
//=========================================================================================

#[derive(Default)]
struct State {
    users: Vec<User>,
    lessons: HashMap<String, Lesson>,
    courses: Vec<Course>,
    sessions: Vec<ChatSession>,
    messages: Vec<StoredMessage>,
    recommendations: HashMap<Uuid, Recommendation>,
    sittings: Vec<LearningSession>,
    activities: Vec<(Uuid, LearningActivity)>,
    failing_role: Option<Role>,
    create_delay: Option<std::time::Duration>,
    conflict_on: Option<(Uuid, String)>,
    session_creates: usize,
}

impl State {
    fn active_session(&self, user_id: Uuid, lesson_id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| {
            s.user_id == user_id && s.lesson_id == lesson_id && s.status == SessionStatus::Active
        })
    }

    fn insert_session(&mut self, new: NewChatSession) -> ChatSession {
        let session = ChatSession {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            lesson_id: new.lesson_id,
            status: SessionStatus::Active,
            created_at: new.created_at,
            last_activity: new.created_at,
            snapshot: new.snapshot,
            message_count: 0,
        };
        self.sessions.push(session.clone());
        session
    }

    fn user_mut(&mut self, user_id: Uuid) -> PortResult<&mut User> {
        self.users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| PortError::NotFound(format!("user {}", user_id)))
    }
}

/// One store backing every repository port, with the uniqueness rules the
/// database enforces.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn add_user(&self, user: User) {
        self.state.lock().users.push(user);
    }

    pub fn add_lesson(&self, lesson: Lesson) {
        self.state.lock().lessons.insert(lesson.id.clone(), lesson);
    }

    pub fn add_course(&self, course: Course) {
        self.state.lock().courses.push(course);
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.state.lock().users.iter().find(|u| u.id == user_id).cloned()
    }

    pub fn user_by_external_id(&self, external_id: &str) -> Option<User> {
        self.state
            .lock()
            .users
            .iter()
            .find(|u| u.external_id.as_deref() == Some(external_id))
            .cloned()
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().users.len()
    }

    pub fn session(&self, session_id: Uuid) -> Option<ChatSession> {
        self.state.lock().sessions.iter().find(|s| s.id == session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// How many times `ChatSessionRepository::create` was called.
    pub fn session_create_calls(&self) -> usize {
        self.state.lock().session_creates
    }

    pub fn active_sessions_for(&self, user_id: Uuid, lesson_id: &str) -> usize {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|s| {
                s.user_id == user_id && s.lesson_id == lesson_id && s.status == SessionStatus::Active
            })
            .count()
    }

    /// Slows session inserts down to widen race windows.
    pub fn set_create_delay(&self, delay: std::time::Duration) {
        self.state.lock().create_delay = Some(delay);
    }

    /// Simulates another writer inserting the pair's session just before ours.
    pub fn conflict_on_next_create(&self, user_id: Uuid, lesson_id: &str) {
        self.state.lock().conflict_on = Some((user_id, lesson_id.to_string()));
    }

    pub fn fail_saves_for(&self, role: Role) {
        self.state.lock().failing_role = Some(role);
    }

    pub fn messages_for(&self, user_id: Uuid, lesson_id: &str) -> Vec<StoredMessage> {
        let state = self.state.lock();
        match state.active_session(user_id, lesson_id) {
            Some(session) => state
                .messages
                .iter()
                .filter(|m| m.session_id == session.id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn recommendation_for(&self, user_id: Uuid) -> Option<Recommendation> {
        self.state.lock().recommendations.get(&user_id).cloned()
    }

    pub fn recommendation_count(&self) -> usize {
        self.state.lock().recommendations.len()
    }

    pub fn sittings_for(&self, user_id: Uuid) -> Vec<LearningSession> {
        self.state
            .lock()
            .sittings
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn activities_for(&self, session_id: Uuid) -> Vec<LearningActivity> {
        self.state
            .lock()
            .activities
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, activity)| activity.clone())
            .collect()
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn get_by_external_id(&self, external_id: &str) -> PortResult<Option<User>> {
        Ok(self.user_by_external_id(external_id))
    }

    async fn get_by_id(&self, user_id: Uuid) -> PortResult<Option<User>> {
        Ok(self.user(user_id))
    }

    async fn create(&self, new: NewUser) -> PortResult<User> {
        let mut state = self.state.lock();
        if state
            .users
            .iter()
            .any(|u| u.external_id.as_deref() == Some(new.external_id.as_str()))
        {
            return Err(PortError::Conflict(format!("user {}", new.external_id)));
        }
        let user = User {
            id: Uuid::new_v4(),
            external_id: Some(new.external_id),
            email: new.email,
            first_name: new.first_name,
            last_name: new.last_name,
            username: new.username,
            level: new.level,
            explanation_style: None,
            learning_goals: Vec::new(),
            language: None,
            onboarding: new.onboarding,
            analytics: AnalyticsSnapshot::default(),
            streak: StudyStreak::default(),
            email_preferences: EmailPreferences::default(),
        };
        state.users.push(user.clone());
        Ok(user)
    }

    async fn update_profile(&self, user_id: Uuid, patch: ProfilePatch) -> PortResult<()> {
        let mut state = self.state.lock();
        let user = state.user_mut(user_id)?;
        if let Some(email) = patch.email {
            user.email = email;
        }
        if let Some(first_name) = patch.first_name {
            user.first_name = first_name;
        }
        if let Some(last_name) = patch.last_name {
            user.last_name = last_name;
        }
        if let Some(username) = patch.username {
            user.username = username;
        }
        Ok(())
    }

    async fn anonymize(&self, user_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        let mut state = self.state.lock();
        let user = state.user_mut(user_id)?;
        user.email = "deleted@example.com".into();
        user.first_name = "Deleted".into();
        user.last_name = "User".into();
        user.username = format!("deleted_user_{}", at.timestamp_millis());
        user.external_id = None;
        Ok(())
    }

    async fn update_analytics(&self, user_id: Uuid, analytics: AnalyticsSnapshot) -> PortResult<()> {
        self.state.lock().user_mut(user_id)?.analytics = analytics;
        Ok(())
    }

    async fn update_streak(&self, user_id: Uuid, streak: StudyStreak) -> PortResult<()> {
        self.state.lock().user_mut(user_id)?.streak = streak;
        Ok(())
    }
}

#[async_trait]
impl LessonRepository for InMemoryStore {
    async fn get_by_id(&self, lesson_id: &str) -> PortResult<Option<Lesson>> {
        Ok(self.state.lock().lessons.get(lesson_id).cloned())
    }
}

#[async_trait]
impl CourseRepository for InMemoryStore {
    async fn get_by_ids(&self, ids: &[String]) -> PortResult<Vec<Course>> {
        Ok(self
            .state
            .lock()
            .courses
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChatSessionRepository for InMemoryStore {
    async fn get_active(&self, user_id: Uuid, lesson_id: &str) -> PortResult<Option<ChatSession>> {
        Ok(self.state.lock().active_session(user_id, lesson_id).cloned())
    }

    async fn create(&self, new: NewChatSession) -> PortResult<ChatSession> {
        let delay = {
            let mut state = self.state.lock();
            state.session_creates += 1;
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let key = (new.user_id, new.lesson_id.clone());
        if state.conflict_on.as_ref() == Some(&key) {
            state.conflict_on = None;
            state.insert_session(new.clone());
        }
        if state.active_session(new.user_id, &new.lesson_id).is_some() {
            return Err(PortError::Conflict(format!(
                "active session exists for user {} and lesson {}",
                new.user_id, new.lesson_id
            )));
        }
        Ok(state.insert_session(new))
    }

    async fn touch(&self, session_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| PortError::NotFound(format!("session {}", session_id)))?;
        session.last_activity = at;
        Ok(())
    }
}

#[async_trait]
impl ChatMessageRepository for InMemoryStore {
    async fn save(&self, session: &ChatSession, message: StoredMessage) -> PortResult<()> {
        let mut state = self.state.lock();
        if state.failing_role == Some(message.role) {
            return Err(PortError::Unexpected("write rejected".into()));
        }
        if let Some(stored) = state.sessions.iter_mut().find(|s| s.id == session.id) {
            stored.message_count += 1;
        }
        state.messages.push(message);
        Ok(())
    }

    async fn history(&self, user_id: Uuid, lesson_id: &str) -> PortResult<Vec<StoredMessage>> {
        Ok(self.messages_for(user_id, lesson_id))
    }
}

#[async_trait]
impl RecommendationRepository for InMemoryStore {
    async fn upsert(&self, upsert: RecommendationUpsert) -> PortResult<Uuid> {
        let mut state = self.state.lock();
        let id = state
            .recommendations
            .get(&upsert.user_id)
            .map(|r| r.id)
            .unwrap_or_else(Uuid::new_v4);
        state.recommendations.insert(
            upsert.user_id,
            Recommendation {
                id,
                user_id: upsert.user_id,
                query: upsert.query,
                reason: upsert.reason,
                courses: upsert.courses,
                status: upsert.status,
                message: upsert.message,
                updated_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_for_user(&self, user_id: Uuid) -> PortResult<Option<Recommendation>> {
        Ok(self.recommendation_for(user_id))
    }
}

#[async_trait]
impl LearningSessionRepository for InMemoryStore {
    async fn get_open(&self, user_id: Uuid) -> PortResult<Option<LearningSession>> {
        Ok(self
            .state
            .lock()
            .sittings
            .iter()
            .rev()
            .find(|s| s.user_id == user_id && s.ended_at.is_none())
            .cloned())
    }

    async fn create(
        &self,
        user_id: Uuid,
        course_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> PortResult<LearningSession> {
        let sitting = LearningSession {
            id: Uuid::new_v4(),
            user_id,
            course_id,
            started_at,
            ended_at: None,
            duration_minutes: None,
        };
        self.state.lock().sittings.push(sitting.clone());
        Ok(sitting)
    }

    async fn close(&self, session_id: Uuid, ended_at: DateTime<Utc>, duration_minutes: u32) -> PortResult<()> {
        let mut state = self.state.lock();
        let sitting = state
            .sittings
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| PortError::NotFound(format!("learning session {}", session_id)))?;
        sitting.ended_at = Some(ended_at);
        sitting.duration_minutes = Some(duration_minutes);
        Ok(())
    }

    async fn add_activity(&self, session_id: Uuid, activity: LearningActivity) -> PortResult<()> {
        self.state.lock().activities.push((session_id, activity));
        Ok(())
    }
}
