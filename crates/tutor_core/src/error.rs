//! crates/tutor_core/src/error.rs
//!
//! Domain-level failures returned by the core services. Each carries a stable
//! machine-readable code so the HTTP boundary can render it without leaking
//! internals.

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{0}")]
    Validation(String),

    #[error("{context}: {source}")]
    Repository {
        context: String,
        #[source]
        source: PortError,
    },

    #[error("{context}: {source}")]
    Search {
        context: String,
        #[source]
        source: PortError,
    },

    #[error("{context}: {source}")]
    Generation {
        context: String,
        #[source]
        source: PortError,
    },

    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        DomainError::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Stable code rendered to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::NotFound { .. } => "NOT_FOUND",
            DomainError::Validation(_) => "VALIDATION_ERROR",
            DomainError::Repository { .. } => "REPOSITORY_ERROR",
            DomainError::Search { .. } => "VECTOR_SERVICE_ERROR",
            DomainError::Generation { .. } => "AI_SERVICE_ERROR",
            DomainError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the boundary should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            DomainError::NotFound { .. } => 404,
            DomainError::Validation(_) => 400,
            _ => 500,
        }
    }

    /// Message safe to show to a client.
    pub fn public_message(&self) -> String {
        match self {
            DomainError::NotFound { .. } | DomainError::Validation(_) => self.to_string(),
            DomainError::Repository { context, .. }
            | DomainError::Search { context, .. }
            | DomainError::Generation { context, .. } => context.clone(),
            DomainError::Internal(_) => "An unexpected error occurred".to_string(),
        }
    }
}

/// Attaches operation context to port failures, picking the taxonomy bucket.
pub(crate) trait PortResultExt<T> {
    fn repository(self, context: impl FnOnce() -> String) -> DomainResult<T>;
    fn search(self, context: impl FnOnce() -> String) -> DomainResult<T>;
    fn generation(self, context: impl FnOnce() -> String) -> DomainResult<T>;
}

impl<T> PortResultExt<T> for Result<T, PortError> {
    fn repository(self, context: impl FnOnce() -> String) -> DomainResult<T> {
        self.map_err(|source| DomainError::Repository {
            context: context(),
            source,
        })
    }

    fn search(self, context: impl FnOnce() -> String) -> DomainResult<T> {
        self.map_err(|source| DomainError::Search {
            context: context(),
            source,
        })
    }

    fn generation(self, context: impl FnOnce() -> String) -> DomainResult<T> {
        self.map_err(|source| DomainError::Generation {
            context: context(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DomainError::not_found("Lesson", "l1").code(), "NOT_FOUND");
        assert_eq!(DomainError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(DomainError::Internal("x".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn not_found_names_resource_and_id() {
        let err = DomainError::not_found("Lesson", "l1");
        assert_eq!(err.to_string(), "Lesson with ID l1 not found");
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn port_context_is_kept_but_source_is_not_public() {
        let err: DomainResult<()> = Err(PortError::Unexpected("pool timed out".into()))
            .repository(|| "Failed to save message for session s1".to_string());
        let err = err.unwrap_err();

        assert_eq!(err.code(), "REPOSITORY_ERROR");
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("pool timed out"));
        assert_eq!(err.public_message(), "Failed to save message for session s1");
    }

    #[test]
    fn internal_errors_render_generically() {
        let err = DomainError::Internal("panic in task".into());
        assert_eq!(err.public_message(), "An unexpected error occurred");
    }
}
