//! crates/tutor_core/src/session.rs
//!
//! Resolves the single active chat session for a (user, lesson) pair.
//!
//! Creation is serialized per pair inside this process; the repository's
//! uniqueness rule covers concurrent processes. When the repository reports a
//! conflict the session created by the other writer is read back and used.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{ChatSession, Lesson, NewChatSession, SessionSnapshot, User};
use crate::error::{DomainError, DomainResult, PortResultExt};
use crate::ports::{ChatSessionRepository, Clock, PortError};

type PairKey = (Uuid, String);

/// One async lock per (user, lesson) pair, dropped once nobody holds it.
#[derive(Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<PairKey, Arc<AsyncMutex<()>>>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: Uuid, lesson_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // Only the map itself holds idle entries.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((user_id, lesson_id.to_string()))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of pairs currently tracked.
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

pub struct SessionManager {
    sessions: Arc<dyn ChatSessionRepository>,
    clock: Arc<dyn Clock>,
    locks: PairLocks,
}

impl SessionManager {
    pub fn new(sessions: Arc<dyn ChatSessionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            clock,
            locks: PairLocks::new(),
        }
    }

    /// Returns the active session for (user, lesson), creating it on first use.
    /// An existing session gets `last_activity` stamped before it is returned.
    pub async fn get_or_create_active_session(
        &self,
        user: &User,
        lesson: &Lesson,
    ) -> DomainResult<ChatSession> {
        let _guard = self.locks.acquire(user.id, &lesson.id).await;

        if let Some(session) = self.find_active(user.id, &lesson.id).await? {
            return self.touch(session).await;
        }

        let now = self.clock.now();
        let new_session = NewChatSession {
            user_id: user.id,
            lesson_id: lesson.id.clone(),
            snapshot: SessionSnapshot {
                user_level: user.level,
                lesson_title: lesson.title.clone(),
            },
            created_at: now,
        };

        match self.sessions.create(new_session).await {
            Ok(session) => {
                info!(
                    session_id = %session.id,
                    user_id = %user.id,
                    lesson_id = %lesson.id,
                    "Created chat session."
                );
                Ok(session)
            }
            Err(PortError::Conflict(detail)) => {
                warn!(
                    user_id = %user.id,
                    lesson_id = %lesson.id,
                    "Concurrent session creation detected ({}); using the existing session.",
                    detail
                );
                let session = self.find_active(user.id, &lesson.id).await?.ok_or_else(|| {
                    DomainError::Internal(format!(
                        "Session for user {} and lesson {} conflicted but could not be read back",
                        user.id, lesson.id
                    ))
                })?;
                self.touch(session).await
            }
            Err(e) => Err(e).repository(|| {
                format!(
                    "Failed to create session for user {} and lesson {}",
                    user.id, lesson.id
                )
            }),
        }
    }

    async fn find_active(&self, user_id: Uuid, lesson_id: &str) -> DomainResult<Option<ChatSession>> {
        self.sessions
            .get_active(user_id, lesson_id)
            .await
            .repository(|| {
                format!(
                    "Failed to fetch active session for user {} and lesson {}",
                    user_id, lesson_id
                )
            })
    }

    async fn touch(&self, mut session: ChatSession) -> DomainResult<ChatSession> {
        let now = self.clock.now();
        self.sessions
            .touch(session.id, now)
            .await
            .repository(|| format!("Failed to update last activity for session {}", session.id))?;
        session.last_activity = now;
        Ok(session)
    }
}
