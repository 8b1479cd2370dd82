//! crates/tutor_core/src/analytics.rs
//!
//! XP, levels and study streaks kept on the user record.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::{ActivityKind, AnalyticsSnapshot, StudyStreak, User};
use crate::error::{DomainError, DomainResult, PortResultExt};
use crate::ports::{Clock, UserRepository};

pub const ANALYTICS_EVENT: &str = "analytics/process.triggered";

const LESSON_XP: u32 = 50;
const READING_XP: u32 = 25;
/// Average sitting assumed when estimating the number of sessions.
const ASSUMED_SESSION_MINUTES: u32 = 30;

/// XP earned by one completed activity. Quizzes earn their score percentage.
pub fn xp_for(kind: ActivityKind, percentage: Option<f64>) -> u32 {
    match kind {
        ActivityKind::Lesson => LESSON_XP,
        ActivityKind::Reading => READING_XP,
        ActivityKind::Quiz => percentage
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0).floor() as u32)
            .unwrap_or(0),
    }
}

/// Level 1 below 100 XP, then `floor(sqrt(xp / 100)) + 1`.
pub fn level_for(total_xp: u32) -> u32 {
    if total_xp < 100 {
        return 1;
    }
    (f64::from(total_xp) / 100.0).sqrt().floor() as u32 + 1
}

/// The streak after studying on `today`.
pub fn next_streak(current: StudyStreak, today: NaiveDate) -> StudyStreak {
    let fresh = StudyStreak {
        days: 1,
        started_on: Some(today),
    };
    let Some(started_on) = current.started_on.filter(|_| current.days > 0) else {
        return fresh;
    };

    let last_active = started_on + chrono::Duration::days(i64::from(current.days) - 1);
    match (today - last_active).num_days() {
        0 => current,
        1 => StudyStreak {
            days: current.days + 1,
            started_on: Some(started_on),
        },
        _ => fresh,
    }
}

fn average_session_minutes(total_minutes: u32) -> u32 {
    let sessions = (total_minutes / ASSUMED_SESSION_MINUTES).max(1);
    total_minutes / sessions
}

/// One completed activity as it affects analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub user_id: Uuid,
    pub activity_type: ActivityKind,
    #[serde(default)]
    pub time_spent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

pub struct AnalyticsService {
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
}

impl AnalyticsService {
    pub fn new(users: Arc<dyn UserRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { users, clock }
    }

    /// Adds the activity's XP and minutes to the user's totals and extends the streak.
    pub async fn update_user_analytics(&self, record: &ActivityRecord) -> DomainResult<AnalyticsSnapshot> {
        let user = self.load(record.user_id).await?;
        let current = user.analytics;

        let total_xp = current
            .total_xp
            .saturating_add(xp_for(record.activity_type, record.percentage));
        // `time_spent` is client-reported.
        let total_study_minutes = current.total_study_minutes.saturating_add(record.time_spent);
        let snapshot = AnalyticsSnapshot {
            total_xp,
            current_level: level_for(total_xp),
            total_study_minutes,
            average_session_minutes: average_session_minutes(total_study_minutes),
        };

        self.users
            .update_analytics(user.id, snapshot)
            .await
            .repository(|| format!("Failed to update analytics for user {}", user.id))?;

        let streak = next_streak(user.streak, self.clock.today());
        self.users
            .update_streak(user.id, streak)
            .await
            .repository(|| format!("Failed to update streak for user {}", user.id))?;

        if snapshot.current_level > current.current_level {
            info!(user_id = %user.id, level = snapshot.current_level, "User levelled up.");
        }
        Ok(snapshot)
    }

    /// Recomputes the derived fields from the stored totals without adding XP.
    pub async fn refresh(&self, user_id: Uuid) -> DomainResult<AnalyticsSnapshot> {
        let user = self.load(user_id).await?;
        let snapshot = AnalyticsSnapshot {
            current_level: level_for(user.analytics.total_xp),
            average_session_minutes: average_session_minutes(user.analytics.total_study_minutes),
            ..user.analytics
        };
        if snapshot != user.analytics {
            self.users
                .update_analytics(user.id, snapshot)
                .await
                .repository(|| format!("Failed to update analytics for user {}", user.id))?;
        }
        Ok(snapshot)
    }

    async fn load(&self, user_id: Uuid) -> DomainResult<User> {
        self.users
            .get_by_id(user_id)
            .await
            .repository(|| format!("Failed to fetch user {}", user_id))?
            .ok_or_else(|| DomainError::not_found("User", user_id.to_string()))
    }
}
