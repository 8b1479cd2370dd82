//! crates/tutor_core/src/events.rs
//!
//! Learning activity events reported by the client: study sittings opening and
//! closing, and completed lessons and quizzes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::{ActivityRecord, AnalyticsService, ANALYTICS_EVENT};
use crate::domain::{ActivityKind, LearningActivity, LearningSession};
use crate::error::{DomainError, DomainResult, PortResultExt};
use crate::ports::{Clock, JobDispatcher, LearningSessionRepository, UserRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventType {
    SessionStarted,
    LessonCompleted,
    QuizCompleted,
    SessionEnded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub event_type: ActivityEventType,
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub course_id: Option<String>,
    /// Minutes.
    #[serde(default)]
    pub time_spent: Option<u32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ActivityEvent {
    fn percentage(&self) -> Option<f64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("percentage"))
            .and_then(Value::as_f64)
    }
}

pub struct EventService {
    users: Arc<dyn UserRepository>,
    sittings: Arc<dyn LearningSessionRepository>,
    analytics: Arc<AnalyticsService>,
    jobs: Arc<dyn JobDispatcher>,
    clock: Arc<dyn Clock>,
}

impl EventService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        sittings: Arc<dyn LearningSessionRepository>,
        analytics: Arc<AnalyticsService>,
        jobs: Arc<dyn JobDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            sittings,
            analytics,
            jobs,
            clock,
        }
    }

    /// Applies one event for `user_id` and returns a short confirmation.
    pub async fn process(&self, user_id: Uuid, event: &ActivityEvent) -> DomainResult<&'static str> {
        self.users
            .get_by_id(user_id)
            .await
            .repository(|| format!("Failed to fetch user {}", user_id))?
            .ok_or_else(|| DomainError::not_found("User", user_id.to_string()))?;

        match event.event_type {
            ActivityEventType::SessionStarted => {
                if let Some(open) = self.open_sitting(user_id).await? {
                    self.close(&open).await?;
                }
                self.start(user_id, event.course_id.clone()).await?;
                Ok("Learning session started")
            }
            ActivityEventType::LessonCompleted => {
                self.completed(user_id, event, ActivityKind::Lesson).await?;
                Ok("Lesson completion recorded")
            }
            ActivityEventType::QuizCompleted => {
                self.completed(user_id, event, ActivityKind::Quiz).await?;
                Ok("Quiz completion recorded")
            }
            ActivityEventType::SessionEnded => match self.open_sitting(user_id).await? {
                Some(open) => {
                    self.close(&open).await?;
                    Ok("Learning session ended")
                }
                None => Ok("No active learning session to end"),
            },
        }
    }

    async fn completed(&self, user_id: Uuid, event: &ActivityEvent, kind: ActivityKind) -> DomainResult<()> {
        let content_id = event
            .content_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                DomainError::Validation(format!(
                    "contentId is required for {}_completed event",
                    kind
                ))
            })?;
        let time_spent = event.time_spent.unwrap_or(0);

        let sitting = match self.open_sitting(user_id).await? {
            Some(open) => open,
            None => self.start(user_id, event.course_id.clone()).await?,
        };
        self.sittings
            .add_activity(
                sitting.id,
                LearningActivity {
                    kind,
                    content_id: content_id.to_string(),
                    time_spent_minutes: time_spent,
                },
            )
            .await
            .repository(|| format!("Failed to record activity for session {}", sitting.id))?;

        let record = ActivityRecord {
            user_id,
            activity_type: kind,
            time_spent,
            percentage: event.percentage(),
        };
        self.analytics.update_user_analytics(&record).await?;

        // The synchronous update above is authoritative; the job only refreshes.
        let payload = serde_json::to_value(&record)
            .map_err(|e| DomainError::Internal(format!("Failed to encode analytics job: {}", e)))?;
        if let Err(e) = self.jobs.send(ANALYTICS_EVENT, payload).await {
            warn!(%user_id, "Failed to dispatch analytics job: {}", e);
        }
        Ok(())
    }

    async fn open_sitting(&self, user_id: Uuid) -> DomainResult<Option<LearningSession>> {
        self.sittings
            .get_open(user_id)
            .await
            .repository(|| format!("Failed to fetch learning session for user {}", user_id))
    }

    async fn start(&self, user_id: Uuid, course_id: Option<String>) -> DomainResult<LearningSession> {
        let sitting = self
            .sittings
            .create(user_id, course_id, self.clock.now())
            .await
            .repository(|| format!("Failed to start learning session for user {}", user_id))?;
        info!(%user_id, session_id = %sitting.id, "Learning session started.");
        Ok(sitting)
    }

    async fn close(&self, sitting: &LearningSession) -> DomainResult<()> {
        let ended_at = self.clock.now();
        let minutes = (ended_at - sitting.started_at).num_minutes().max(0);
        let minutes = u32::try_from(minutes).unwrap_or(u32::MAX);
        self.sittings
            .close(sitting.id, ended_at, minutes)
            .await
            .repository(|| format!("Failed to close learning session {}", sitting.id))?;
        info!(session_id = %sitting.id, duration_minutes = minutes, "Learning session closed.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{user, FakeDispatcher, FixedClock, InMemoryStore};
    use chrono::Duration;
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryStore>,
        jobs: Arc<FakeDispatcher>,
        clock: Arc<FixedClock>,
        service: EventService,
        user_id: Uuid,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::default());
        let learner = user("u1");
        store.add_user(learner.clone());
        let jobs = Arc::new(FakeDispatcher::default());
        let clock = Arc::new(FixedClock::default());
        let analytics = Arc::new(AnalyticsService::new(store.clone(), clock.clone()));
        let service = EventService::new(store.clone(), store.clone(), analytics, jobs.clone(), clock.clone());
        Harness {
            store,
            jobs,
            clock,
            service,
            user_id: learner.id,
        }
    }

    fn event(value: Value) -> ActivityEvent {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn starting_a_session_closes_the_open_one() {
        let h = harness();
        h.service
            .process(h.user_id, &event(json!({ "eventType": "session_started", "courseId": "c1" })))
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(25));
        h.service
            .process(h.user_id, &event(json!({ "eventType": "session_started" })))
            .await
            .unwrap();

        let sittings = h.store.sittings_for(h.user_id);
        assert_eq!(sittings.len(), 2);
        assert_eq!(sittings[0].duration_minutes, Some(25));
        assert_eq!(sittings[0].course_id.as_deref(), Some("c1"));
        assert!(sittings[1].ended_at.is_none());
    }

    #[tokio::test]
    async fn lesson_completion_records_activity_and_xp() {
        let h = harness();
        let message = h
            .service
            .process(
                h.user_id,
                &event(json!({ "eventType": "lesson_completed", "contentId": "l1", "timeSpent": 12 })),
            )
            .await
            .unwrap();

        assert_eq!(message, "Lesson completion recorded");
        let sittings = h.store.sittings_for(h.user_id);
        assert_eq!(sittings.len(), 1);
        let activities = h.store.activities_for(sittings[0].id);
        assert_eq!(activities[0].kind, ActivityKind::Lesson);
        assert_eq!(activities[0].time_spent_minutes, 12);
        assert_eq!(h.store.user(h.user_id).unwrap().analytics.total_xp, 50);

        let sent = h.jobs.sent();
        assert_eq!(sent[0].0, ANALYTICS_EVENT);
        assert_eq!(sent[0].1["activityType"], "lesson");
    }

    #[tokio::test]
    async fn quiz_xp_uses_the_reported_percentage() {
        let h = harness();
        h.service
            .process(
                h.user_id,
                &event(json!({
                    "eventType": "quiz_completed",
                    "contentId": "q1",
                    "metadata": { "percentage": 72.5 }
                })),
            )
            .await
            .unwrap();
        assert_eq!(h.store.user(h.user_id).unwrap().analytics.total_xp, 72);
    }

    #[tokio::test]
    async fn completion_without_content_id_is_rejected() {
        let h = harness();
        let err = h
            .service
            .process(h.user_id, &event(json!({ "eventType": "quiz_completed" })))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(err.to_string(), "contentId is required for quiz_completed event");
        assert!(h.store.sittings_for(h.user_id).is_empty());
    }

    #[tokio::test]
    async fn ending_without_an_open_session_is_fine() {
        let h = harness();
        let message = h
            .service
            .process(h.user_id, &event(json!({ "eventType": "session_ended" })))
            .await
            .unwrap();
        assert_eq!(message, "No active learning session to end");
    }

    #[tokio::test]
    async fn analytics_dispatch_failure_does_not_fail_the_event() {
        let store = Arc::new(InMemoryStore::default());
        let learner = user("u1");
        store.add_user(learner.clone());
        let clock = Arc::new(FixedClock::default());
        let analytics = Arc::new(AnalyticsService::new(store.clone(), clock.clone()));
        let service = EventService::new(
            store.clone(),
            store.clone(),
            analytics,
            Arc::new(FakeDispatcher::failing()),
            clock,
        );

        service
            .process(learner.id, &event(json!({ "eventType": "lesson_completed", "contentId": "l1" })))
            .await
            .unwrap();
        assert_eq!(store.user(learner.id).unwrap().analytics.total_xp, 50);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let h = harness();
        let err = h
            .service
            .process(Uuid::from_u128(99), &event(json!({ "eventType": "session_ended" })))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
