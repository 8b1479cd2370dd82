pub mod analytics;
pub mod chat;
pub mod codec;
pub mod domain;
pub mod error;
pub mod events;
pub mod message;
pub mod ports;
pub mod prompt;
pub mod recommendation;
pub mod retriever;
pub mod session;
pub mod tools;
pub mod users;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chat::{ChatEvent, ChatEventStream, ChatService, ChatTurn};
pub use domain::{ChatSession, Lesson, User};
pub use error::{DomainError, DomainResult};
pub use message::{Role, UiMessage, UiPart};
pub use ports::{PortError, PortResult};
pub use recommendation::{RecommendationJob, RecommendationService, RecommendationTicket};
pub use retriever::ContextRetriever;
pub use session::SessionManager;
