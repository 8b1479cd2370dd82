//! crates/tutor_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format,
//! apart from the serde derives the HTTP boundary reuses.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// Small enums shared by several records
//=========================================================================================

/// Error returned when a stored string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}
string_enum!(SkillLevel, "skill level", {
    Beginner => "beginner",
    Intermediate => "intermediate",
    Advanced => "advanced",
});

/// The answer language a learner asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguagePreference {
    /// Indonesian only.
    #[serde(rename = "id")]
    Indonesian,
    /// English only.
    #[serde(rename = "en")]
    English,
    /// Indonesian prose, English technical terms.
    #[serde(rename = "mix")]
    Mixed,
}
string_enum!(LanguagePreference, "language preference", {
    Indonesian => "id",
    English => "en",
    Mixed => "mix",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    #[default]
    NotStarted,
    Completed,
}
string_enum!(OnboardingStatus, "onboarding status", {
    NotStarted => "not_started",
    Completed => "completed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}
string_enum!(SessionStatus, "session status", {
    Active => "active",
    Closed => "closed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    InProgress,
    Completed,
    Failed,
}
string_enum!(RecommendationStatus, "recommendation status", {
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

//=========================================================================================
// Users
//=========================================================================================

/// Running analytics totals kept on the user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub total_xp: u32,
    pub current_level: u32,
    pub total_study_minutes: u32,
    pub average_session_minutes: u32,
}

impl Default for AnalyticsSnapshot {
    fn default() -> Self {
        Self {
            total_xp: 0,
            current_level: 1,
            total_study_minutes: 0,
            average_session_minutes: 0,
        }
    }
}

/// Consecutive study days and the day the run began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StudyStreak {
    pub days: u32,
    pub started_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPreferences {
    pub welcome: bool,
    pub achievements: bool,
    pub weekly_digest: bool,
}

impl Default for EmailPreferences {
    fn default() -> Self {
        Self {
            welcome: true,
            achievements: true,
            weekly_digest: true,
        }
    }
}

/// A learner, mirrored locally from the identity provider.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    /// The auth provider's id. Cleared when the account is anonymized.
    pub external_id: Option<String>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub level: SkillLevel,
    pub explanation_style: Option<String>,
    pub learning_goals: Vec<String>,
    pub language: Option<LanguagePreference>,
    pub onboarding: OnboardingStatus,
    pub analytics: AnalyticsSnapshot,
    pub streak: StudyStreak,
    pub email_preferences: EmailPreferences,
}

/// Everything needed to insert a user mirrored from a `created` sync event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub external_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub onboarding: OnboardingStatus,
    pub level: SkillLevel,
}

/// Profile fields an `updated` sync event may overwrite. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.username.is_none()
    }
}

//=========================================================================================
// Content
//=========================================================================================

/// A static content unit. Read-only from the core's point of view.
#[derive(Debug, Clone, PartialEq)]
pub struct Lesson {
    pub id: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

//=========================================================================================
// Chat
//=========================================================================================

/// Opening conditions captured when a chat session is created. Not kept in sync afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub user_level: SkillLevel,
    pub lesson_title: String,
}

/// One continuous tutoring conversation scoped to a (user, lesson) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub lesson_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub snapshot: SessionSnapshot,
    pub message_count: u32,
}

/// Insert payload for a new active session.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChatSession {
    pub user_id: Uuid,
    pub lesson_id: String,
    pub snapshot: SessionSnapshot,
    pub created_at: DateTime<Utc>,
}

/// Per-message metadata attached to assistant replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub model: String,
    pub tokens: u32,
    /// Wall-clock milliseconds from generation start to completion.
    pub processing_time: u64,
}

//=========================================================================================
// Recommendations
//=========================================================================================

/// The single recommendation record kept per user.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub query: String,
    pub reason: Option<String>,
    pub courses: Vec<String>,
    pub status: RecommendationStatus,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Create-or-overwrite payload, keyed by `user_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationUpsert {
    pub user_id: Uuid,
    pub query: String,
    pub reason: Option<String>,
    pub courses: Vec<String>,
    pub status: RecommendationStatus,
    pub message: String,
}

//=========================================================================================
// Learning activity
//=========================================================================================

/// A study sitting, opened by `session_started` and closed by `session_ended`.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Lesson,
    Quiz,
    Reading,
}
string_enum!(ActivityKind, "activity kind", {
    Lesson => "lesson",
    Quiz => "quiz",
    Reading => "reading",
});

#[derive(Debug, Clone, PartialEq)]
pub struct LearningActivity {
    pub kind: ActivityKind,
    pub content_id: String,
    pub time_spent_minutes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_enums_parse_their_own_text() {
        for status in [
            RecommendationStatus::InProgress,
            RecommendationStatus::Completed,
            RecommendationStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RecommendationStatus>(), Ok(status));
        }
        assert_eq!("mix".parse::<LanguagePreference>(), Ok(LanguagePreference::Mixed));
    }

    #[test]
    fn unknown_variant_names_the_kind() {
        let err = "archived".parse::<SessionStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown session status value 'archived'");
    }

    #[test]
    fn empty_profile_patch_is_detected() {
        assert!(ProfilePatch::default().is_empty());
        let patch = ProfilePatch {
            username: Some("ana".into()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
