//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of the
//! repository ports from the `tutor_core` crate. It handles all interactions with
//! the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tutor_core::codec::{StoredMessage, StoredPart};
use tutor_core::domain::{
    AnalyticsSnapshot, ChatSession, Course, EmailPreferences, LearningActivity, LearningSession,
    Lesson, NewChatSession, NewUser, ProfilePatch, Recommendation, RecommendationUpsert,
    SessionSnapshot, SessionStatus, StudyStreak, UnknownVariant, User,
};
use tutor_core::message::Role;
use tutor_core::ports::{
    ChatMessageRepository, ChatSessionRepository, CourseRepository, LearningSessionRepository,
    LessonRepository, PortError, PortResult, RecommendationRepository, UserRepository,
};
use uuid::Uuid;

/// Postgres error code for a unique-constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements every repository port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn db_error(e: sqlx::Error) -> PortError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            PortError::Conflict(db.message().to_string())
        }
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn parse_column<T>(value: &str) -> PortResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse()
        .map_err(|e: UnknownVariant| PortError::Unexpected(e.to_string()))
}

fn to_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_column(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const USER_COLUMNS: &str = "id, external_id, email, first_name, last_name, username, level, \
    explanation_style, learning_goals, language, onboarding, total_xp, current_level, \
    total_study_minutes, average_session_minutes, streak_days, streak_started_on, \
    email_welcome, email_achievements, email_weekly_digest";

#[derive(FromRow)]
struct UserRecord {
    id: Uuid,
    external_id: Option<String>,
    email: String,
    first_name: String,
    last_name: String,
    username: String,
    level: String,
    explanation_style: Option<String>,
    learning_goals: Vec<String>,
    language: Option<String>,
    onboarding: String,
    total_xp: i32,
    current_level: i32,
    total_study_minutes: i32,
    average_session_minutes: i32,
    streak_days: i32,
    streak_started_on: Option<NaiveDate>,
    email_welcome: bool,
    email_achievements: bool,
    email_weekly_digest: bool,
}
impl UserRecord {
    fn to_domain(self) -> PortResult<User> {
        Ok(User {
            id: self.id,
            external_id: self.external_id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            username: self.username,
            level: parse_column(&self.level)?,
            explanation_style: self.explanation_style,
            learning_goals: self.learning_goals,
            language: self.language.as_deref().map(parse_column).transpose()?,
            onboarding: parse_column(&self.onboarding)?,
            analytics: AnalyticsSnapshot {
                total_xp: to_count(self.total_xp),
                current_level: to_count(self.current_level),
                total_study_minutes: to_count(self.total_study_minutes),
                average_session_minutes: to_count(self.average_session_minutes),
            },
            streak: StudyStreak {
                days: to_count(self.streak_days),
                started_on: self.streak_started_on,
            },
            email_preferences: EmailPreferences {
                welcome: self.email_welcome,
                achievements: self.email_achievements,
                weekly_digest: self.email_weekly_digest,
            },
        })
    }
}

#[derive(FromRow)]
struct LessonRecord {
    id: String,
    title: String,
    body: String,
}
impl LessonRecord {
    fn to_domain(self) -> Lesson {
        Lesson {
            id: self.id,
            title: self.title,
            body: self.body,
        }
    }
}

#[derive(FromRow)]
struct CourseRecord {
    id: String,
    title: String,
    description: Option<String>,
}
impl CourseRecord {
    fn to_domain(self) -> Course {
        Course {
            id: self.id,
            title: self.title,
            description: self.description,
        }
    }
}

const SESSION_COLUMNS: &str = "id, user_id, lesson_id, status, created_at, last_activity, \
    snapshot_user_level, snapshot_lesson_title, message_count";

#[derive(FromRow)]
struct ChatSessionRecord {
    id: Uuid,
    user_id: Uuid,
    lesson_id: String,
    status: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    snapshot_user_level: String,
    snapshot_lesson_title: String,
    message_count: i32,
}
impl ChatSessionRecord {
    fn to_domain(self) -> PortResult<ChatSession> {
        Ok(ChatSession {
            id: self.id,
            user_id: self.user_id,
            lesson_id: self.lesson_id,
            status: parse_column(&self.status)?,
            created_at: self.created_at,
            last_activity: self.last_activity,
            snapshot: SessionSnapshot {
                user_level: parse_column(&self.snapshot_user_level)?,
                lesson_title: self.snapshot_lesson_title,
            },
            message_count: to_count(self.message_count),
        })
    }
}

#[derive(FromRow)]
struct MessageRecord {
    message_id: String,
    session_id: Uuid,
    role: String,
    parts: Json<Vec<StoredPart>>,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
}
impl MessageRecord {
    fn to_domain(self) -> PortResult<StoredMessage> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| PortError::Unexpected(format!("unknown role '{}'", self.role)))?;
        Ok(StoredMessage {
            message_id: self.message_id,
            session_id: self.session_id,
            role,
            parts: self.parts.0,
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct RecommendationRecord {
    id: Uuid,
    user_id: Uuid,
    query: String,
    reason: Option<String>,
    courses: Vec<String>,
    status: String,
    message: String,
    updated_at: DateTime<Utc>,
}
impl RecommendationRecord {
    fn to_domain(self) -> PortResult<Recommendation> {
        Ok(Recommendation {
            id: self.id,
            user_id: self.user_id,
            query: self.query,
            reason: self.reason,
            courses: self.courses,
            status: parse_column(&self.status)?,
            message: self.message,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct LearningSessionRecord {
    id: Uuid,
    user_id: Uuid,
    course_id: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_minutes: Option<i32>,
}
impl LearningSessionRecord {
    fn to_domain(self) -> LearningSession {
        LearningSession {
            id: self.id,
            user_id: self.user_id,
            course_id: self.course_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_minutes: self.duration_minutes.map(to_count),
        }
    }
}

//=========================================================================================
// Users and content
//=========================================================================================

#[async_trait]
impl UserRepository for DbAdapter {
    async fn get_by_external_id(&self, external_id: &str) -> PortResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE external_id = $1", USER_COLUMNS);
        sqlx::query_as::<_, UserRecord>(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(UserRecord::to_domain)
            .transpose()
    }

    async fn get_by_id(&self, user_id: Uuid) -> PortResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        sqlx::query_as::<_, UserRecord>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(UserRecord::to_domain)
            .transpose()
    }

    async fn create(&self, user: NewUser) -> PortResult<User> {
        let sql = format!(
            "INSERT INTO users (id, external_id, email, first_name, last_name, username, onboarding, level) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
            USER_COLUMNS
        );
        sqlx::query_as::<_, UserRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(&user.external_id)
            .bind(&user.email)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.username)
            .bind(user.onboarding.as_str())
            .bind(user.level.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?
            .to_domain()
    }

    async fn update_profile(&self, user_id: Uuid, patch: ProfilePatch) -> PortResult<()> {
        sqlx::query(
            "UPDATE users SET email = COALESCE($2, email), first_name = COALESCE($3, first_name), \
             last_name = COALESCE($4, last_name), username = COALESCE($5, username), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(patch.email)
        .bind(patch.first_name)
        .bind(patch.last_name)
        .bind(patch.username)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn anonymize(&self, user_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE users SET email = 'deleted@example.com', first_name = 'Deleted', last_name = 'User', \
             username = $2, external_id = NULL, deleted_at = $3, updated_at = $3 WHERE id = $1",
        )
        .bind(user_id)
        .bind(format!("deleted_user_{}", at.timestamp_millis()))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("User {} not found", user_id)));
        }
        Ok(())
    }

    async fn update_analytics(&self, user_id: Uuid, analytics: AnalyticsSnapshot) -> PortResult<()> {
        sqlx::query(
            "UPDATE users SET total_xp = $2, current_level = $3, total_study_minutes = $4, \
             average_session_minutes = $5, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(to_column(analytics.total_xp))
        .bind(to_column(analytics.current_level))
        .bind(to_column(analytics.total_study_minutes))
        .bind(to_column(analytics.average_session_minutes))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_streak(&self, user_id: Uuid, streak: StudyStreak) -> PortResult<()> {
        sqlx::query("UPDATE users SET streak_days = $2, streak_started_on = $3 WHERE id = $1")
            .bind(user_id)
            .bind(to_column(streak.days))
            .bind(streak.started_on)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl LessonRepository for DbAdapter {
    async fn get_by_id(&self, lesson_id: &str) -> PortResult<Option<Lesson>> {
        let record = sqlx::query_as::<_, LessonRecord>("SELECT id, title, body FROM lessons WHERE id = $1")
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(record.map(LessonRecord::to_domain))
    }
}

#[async_trait]
impl CourseRepository for DbAdapter {
    async fn get_by_ids(&self, ids: &[String]) -> PortResult<Vec<Course>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, CourseRecord>(
            "SELECT id, title, description FROM courses WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(records.into_iter().map(CourseRecord::to_domain).collect())
    }
}

//=========================================================================================
// Chat sessions and messages
//=========================================================================================

#[async_trait]
impl ChatSessionRepository for DbAdapter {
    async fn get_active(&self, user_id: Uuid, lesson_id: &str) -> PortResult<Option<ChatSession>> {
        let sql = format!(
            "SELECT {} FROM chat_sessions WHERE user_id = $1 AND lesson_id = $2 AND status = $3",
            SESSION_COLUMNS
        );
        sqlx::query_as::<_, ChatSessionRecord>(&sql)
            .bind(user_id)
            .bind(lesson_id)
            .bind(SessionStatus::Active.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(ChatSessionRecord::to_domain)
            .transpose()
    }

    async fn create(&self, session: NewChatSession) -> PortResult<ChatSession> {
        let sql = format!(
            "INSERT INTO chat_sessions (id, user_id, lesson_id, status, created_at, last_activity, \
             snapshot_user_level, snapshot_lesson_title) VALUES ($1, $2, $3, $4, $5, $5, $6, $7) \
             RETURNING {}",
            SESSION_COLUMNS
        );
        // The partial unique index turns a concurrent second insert into a Conflict.
        sqlx::query_as::<_, ChatSessionRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(session.user_id)
            .bind(&session.lesson_id)
            .bind(SessionStatus::Active.as_str())
            .bind(session.created_at)
            .bind(session.snapshot.user_level.as_str())
            .bind(&session.snapshot.lesson_title)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?
            .to_domain()
    }

    async fn touch(&self, session_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        sqlx::query("UPDATE chat_sessions SET last_activity = $2 WHERE id = $1")
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl ChatMessageRepository for DbAdapter {
    async fn save(&self, session: &ChatSession, message: StoredMessage) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            "INSERT INTO chat_messages (message_id, session_id, role, parts, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&message.message_id)
        .bind(session.id)
        .bind(message.role.as_str())
        .bind(Json(&message.parts))
        .bind(&message.metadata)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query("UPDATE chat_sessions SET message_count = message_count + 1 WHERE id = $1")
            .bind(session.id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn history(&self, user_id: Uuid, lesson_id: &str) -> PortResult<Vec<StoredMessage>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            "SELECT m.message_id, m.session_id, m.role, m.parts, m.metadata, m.created_at \
             FROM chat_messages m JOIN chat_sessions s ON s.id = m.session_id \
             WHERE s.user_id = $1 AND s.lesson_id = $2 AND s.status = $3 \
             ORDER BY m.created_at ASC, m.id ASC",
        )
        .bind(user_id)
        .bind(lesson_id)
        .bind(SessionStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        records.into_iter().map(MessageRecord::to_domain).collect()
    }
}

//=========================================================================================
// Recommendations and learning activity
//=========================================================================================

#[async_trait]
impl RecommendationRepository for DbAdapter {
    async fn upsert(&self, upsert: RecommendationUpsert) -> PortResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            "INSERT INTO recommendations (id, user_id, query, reason, courses, status, message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (user_id) DO UPDATE SET query = EXCLUDED.query, reason = EXCLUDED.reason, \
             courses = EXCLUDED.courses, status = EXCLUDED.status, message = EXCLUDED.message, \
             updated_at = NOW() \
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(upsert.user_id)
        .bind(&upsert.query)
        .bind(&upsert.reason)
        .bind(&upsert.courses)
        .bind(upsert.status.as_str())
        .bind(&upsert.message)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(id.0)
    }

    async fn get_for_user(&self, user_id: Uuid) -> PortResult<Option<Recommendation>> {
        sqlx::query_as::<_, RecommendationRecord>(
            "SELECT id, user_id, query, reason, courses, status, message, updated_at \
             FROM recommendations WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(RecommendationRecord::to_domain)
        .transpose()
    }
}

#[async_trait]
impl LearningSessionRepository for DbAdapter {
    async fn get_open(&self, user_id: Uuid) -> PortResult<Option<LearningSession>> {
        let record = sqlx::query_as::<_, LearningSessionRecord>(
            "SELECT id, user_id, course_id, started_at, ended_at, duration_minutes \
             FROM learning_sessions WHERE user_id = $1 AND ended_at IS NULL \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(record.map(LearningSessionRecord::to_domain))
    }

    async fn create(
        &self,
        user_id: Uuid,
        course_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> PortResult<LearningSession> {
        let record = sqlx::query_as::<_, LearningSessionRecord>(
            "INSERT INTO learning_sessions (id, user_id, course_id, started_at) VALUES ($1, $2, $3, $4) \
             RETURNING id, user_id, course_id, started_at, ended_at, duration_minutes",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(course_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(record.to_domain())
    }

    async fn close(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_minutes: u32,
    ) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE learning_sessions SET ended_at = $2, duration_minutes = $3 WHERE id = $1",
        )
        .bind(session_id)
        .bind(ended_at)
        .bind(to_column(duration_minutes))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!(
                "Learning session {} not found",
                session_id
            )));
        }
        Ok(())
    }

    async fn add_activity(&self, session_id: Uuid, activity: LearningActivity) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO learning_activities (session_id, kind, content_id, time_spent_minutes) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(session_id)
        .bind(activity.kind.as_str())
        .bind(&activity.content_id)
        .bind(to_column(activity.time_spent_minutes))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_counters_are_clamped() {
        assert_eq!(to_count(-3), 0);
        assert_eq!(to_count(42), 42);
        assert_eq!(to_column(u32::MAX), i32::MAX);
    }

    #[test]
    fn unknown_enum_columns_surface_as_unexpected() {
        let err = parse_column::<SessionStatus>("archived").unwrap_err();
        assert!(matches!(err, PortError::Unexpected(msg) if msg.contains("archived")));
    }

    #[test]
    fn non_database_errors_are_unexpected() {
        assert!(matches!(db_error(sqlx::Error::RowNotFound), PortError::Unexpected(_)));
    }
}
