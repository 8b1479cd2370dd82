//! crates/tutor_core/src/users.rs
//!
//! Mirrors the identity provider's user lifecycle into the local user table.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::domain::{NewUser, OnboardingStatus, ProfilePatch, SkillLevel, User};
use crate::error::{DomainError, DomainResult, PortResultExt};
use crate::ports::{Clock, Mailer, UserRepository};

pub const USER_CREATED_EVENT: &str = "clerk/user.created";
pub const USER_UPDATED_EVENT: &str = "clerk/user.updated";
pub const USER_DELETED_EVENT: &str = "clerk/user.deleted";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderEmail {
    pub email_address: String,
}

/// The user object carried by the provider's webhook.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderUser {
    pub id: String,
    #[serde(default)]
    pub email_addresses: Vec<ProviderEmail>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Webhook envelope: `{ "type": "user.created", "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderUserEvent {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub data: ProviderUser,
}

impl ProviderUser {
    fn primary_email(&self) -> Option<&str> {
        self.email_addresses
            .first()
            .map(|e| e.email_address.as_str())
            .filter(|e| !e.trim().is_empty())
    }

    /// `user_` plus the first eight characters of the provider id.
    pub fn default_username(&self) -> String {
        format!("user_{}", self.id.chars().take(8).collect::<String>())
    }

    fn to_new_user(&self) -> NewUser {
        NewUser {
            external_id: self.id.clone(),
            email: self.primary_email().unwrap_or_default().to_string(),
            first_name: self.first_name.clone().unwrap_or_default(),
            last_name: self.last_name.clone().unwrap_or_default(),
            username: non_empty(&self.username).unwrap_or_else(|| self.default_username()),
            onboarding: OnboardingStatus::NotStarted,
            level: SkillLevel::Beginner,
        }
    }

    fn to_patch(&self) -> ProfilePatch {
        ProfilePatch {
            email: self.primary_email().map(str::to_string),
            first_name: non_empty(&self.first_name),
            last_name: non_empty(&self.last_name),
            username: non_empty(&self.username),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.trim().is_empty()).map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    AlreadyExists,
    Updated,
    Anonymized,
    NotFound,
}

impl SyncOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            SyncOutcome::Created => "User created",
            SyncOutcome::AlreadyExists => "User already exists",
            SyncOutcome::Updated => "User updated",
            SyncOutcome::Anonymized => "User anonymized",
            SyncOutcome::NotFound => "User not found, nothing to delete",
        }
    }
}

pub struct UserSyncService {
    users: Arc<dyn UserRepository>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
}

impl UserSyncService {
    pub fn new(users: Arc<dyn UserRepository>, mailer: Arc<dyn Mailer>, clock: Arc<dyn Clock>) -> Self {
        Self { users, mailer, clock }
    }

    /// Resolves the learner behind an authenticated request.
    pub async fn resolve(&self, external_id: &str) -> DomainResult<User> {
        self.find(external_id)
            .await?
            .ok_or_else(|| DomainError::not_found("User", external_id))
    }

    pub async fn user_created(&self, user: &ProviderUser) -> DomainResult<SyncOutcome> {
        if self.find(&user.id).await?.is_some() {
            info!(external_id = %user.id, "User already exists; skipping create.");
            return Ok(SyncOutcome::AlreadyExists);
        }

        let created = self.create(user).await?;
        if created.email_preferences.welcome {
            // Best effort: a failed email never fails the sync.
            if let Err(e) = self.mailer.send_welcome(&created).await {
                error!(user_id = %created.id, "Failed to send welcome email: {}", e);
            }
        }
        Ok(SyncOutcome::Created)
    }

    pub async fn user_updated(&self, user: &ProviderUser) -> DomainResult<SyncOutcome> {
        let Some(existing) = self.find(&user.id).await? else {
            info!(external_id = %user.id, "User not found on update; creating it.");
            self.create(user).await?;
            return Ok(SyncOutcome::Created);
        };

        let patch = user.to_patch();
        if !patch.is_empty() {
            self.users
                .update_profile(existing.id, patch)
                .await
                .repository(|| format!("Failed to update user {}", existing.id))?;
        }
        Ok(SyncOutcome::Updated)
    }

    /// Anonymizes instead of deleting so chat history keeps its owner.
    pub async fn user_deleted(&self, user: &ProviderUser) -> DomainResult<SyncOutcome> {
        let Some(existing) = self.find(&user.id).await? else {
            info!(external_id = %user.id, "User not found for deletion.");
            return Ok(SyncOutcome::NotFound);
        };

        self.users
            .anonymize(existing.id, self.clock.now())
            .await
            .repository(|| format!("Failed to anonymize user {}", existing.id))?;
        info!(user_id = %existing.id, "User anonymized.");
        Ok(SyncOutcome::Anonymized)
    }

    async fn find(&self, external_id: &str) -> DomainResult<Option<User>> {
        self.users
            .get_by_external_id(external_id)
            .await
            .repository(|| format!("Failed to fetch user {}", external_id))
    }

    async fn create(&self, user: &ProviderUser) -> DomainResult<User> {
        let created = self
            .users
            .create(user.to_new_user())
            .await
            .repository(|| format!("Failed to create user {}", user.id))?;
        info!(user_id = %created.id, external_id = %user.id, "User created.");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AnalyticsSnapshot;
    use crate::testing::{FakeMailer, FixedClock, InMemoryStore};
    use serde_json::json;

    fn provider_user(id: &str) -> ProviderUser {
        serde_json::from_value(json!({
            "id": id,
            "email_addresses": [{ "email_address": "ana@example.com", "id": "e1" }],
            "first_name": "Ana",
            "last_name": null,
            "username": null
        }))
        .unwrap()
    }

    fn service(store: &Arc<InMemoryStore>, mailer: &Arc<FakeMailer>) -> UserSyncService {
        UserSyncService::new(store.clone(), mailer.clone(), Arc::new(FixedClock::default()))
    }

    #[tokio::test]
    async fn created_user_gets_defaults_and_a_welcome_email() {
        let store = Arc::new(InMemoryStore::default());
        let mailer = Arc::new(FakeMailer::default());

        let outcome = service(&store, &mailer)
            .user_created(&provider_user("user_2abcdefghijk"))
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Created);
        let user = store.user_by_external_id("user_2abcdefghijk").unwrap();
        assert_eq!(user.username, "user_user_2ab");
        assert_eq!(user.level, SkillLevel::Beginner);
        assert_eq!(user.onboarding, OnboardingStatus::NotStarted);
        assert_eq!(user.analytics, AnalyticsSnapshot::default());
        assert_eq!(mailer.welcomed(), vec![user.id]);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_no_op() {
        let store = Arc::new(InMemoryStore::default());
        let mailer = Arc::new(FakeMailer::default());
        let sync = service(&store, &mailer);

        sync.user_created(&provider_user("ext-1")).await.unwrap();
        let outcome = sync.user_created(&provider_user("ext-1")).await.unwrap();

        assert_eq!(outcome, SyncOutcome::AlreadyExists);
        assert_eq!(store.user_count(), 1);
        assert_eq!(mailer.welcomed().len(), 1);
    }

    #[tokio::test]
    async fn welcome_email_failure_does_not_fail_the_sync() {
        let store = Arc::new(InMemoryStore::default());
        let mailer = Arc::new(FakeMailer::failing());

        let outcome = service(&store, &mailer).user_created(&provider_user("ext-1")).await;
        assert_eq!(outcome.unwrap(), SyncOutcome::Created);
    }

    #[tokio::test]
    async fn update_patches_only_present_fields() {
        let store = Arc::new(InMemoryStore::default());
        let mailer = Arc::new(FakeMailer::default());
        let sync = service(&store, &mailer);
        sync.user_created(&provider_user("ext-1")).await.unwrap();

        let mut changed = provider_user("ext-1");
        changed.email_addresses.clear();
        changed.first_name = Some("".into());
        changed.last_name = Some("Putri".into());
        assert_eq!(sync.user_updated(&changed).await.unwrap(), SyncOutcome::Updated);

        let user = store.user_by_external_id("ext-1").unwrap();
        assert_eq!(user.email, "ana@example.com");
        assert_eq!(user.first_name, "Ana");
        assert_eq!(user.last_name, "Putri");
    }

    #[tokio::test]
    async fn update_of_unknown_user_creates_it() {
        let store = Arc::new(InMemoryStore::default());
        let mailer = Arc::new(FakeMailer::default());

        let outcome = service(&store, &mailer).user_updated(&provider_user("ext-9")).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Created);
        assert!(store.user_by_external_id("ext-9").is_some());
        assert!(mailer.welcomed().is_empty());
    }

    #[tokio::test]
    async fn delete_anonymizes_and_unlinks() {
        let store = Arc::new(InMemoryStore::default());
        let mailer = Arc::new(FakeMailer::default());
        let sync = service(&store, &mailer);
        sync.user_created(&provider_user("ext-1")).await.unwrap();
        let id = store.user_by_external_id("ext-1").unwrap().id;

        assert_eq!(
            sync.user_deleted(&provider_user("ext-1")).await.unwrap(),
            SyncOutcome::Anonymized
        );
        assert!(store.user_by_external_id("ext-1").is_none());
        let user = store.user(id).unwrap();
        assert_eq!(user.email, "deleted@example.com");
        assert!(user.username.starts_with("deleted_user_"));

        assert_eq!(
            sync.user_deleted(&provider_user("ext-1")).await.unwrap(),
            SyncOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn resolve_unknown_user_is_not_found() {
        let store = Arc::new(InMemoryStore::default());
        let mailer = Arc::new(FakeMailer::default());
        let err = service(&store, &mailer).resolve("nobody").await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { resource: "User", .. }));
    }

    #[test]
    fn webhook_envelope_parses() {
        let event: ProviderUserEvent = serde_json::from_value(json!({
            "type": "user.created",
            "object": "event",
            "data": { "id": "abc", "email_addresses": [] }
        }))
        .unwrap();
        assert_eq!(event.kind.as_deref(), Some("user.created"));
        assert_eq!(event.data.default_username(), "user_abc");
    }
}
