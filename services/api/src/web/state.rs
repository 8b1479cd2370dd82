//! services/api/src/web/state.rs
//!
//! Defines the application's shared state: the core services, wired once at
//! startup from the port implementations and passed to all handlers.

use std::sync::Arc;
use tutor_core::analytics::AnalyticsService;
use tutor_core::events::EventService;
use tutor_core::ports::{
    ChatMessageRepository, ChatSessionRepository, Clock, CourseRepository, JobDispatcher,
    LearningSessionRepository, LessonRepository, Mailer, RecommendationRepository,
    TextGenerator, UserRepository, VectorSearch,
};
use tutor_core::tools::ResourceSearchTool;
use tutor_core::users::UserSyncService;
use tutor_core::{ChatService, ContextRetriever, RecommendationService, SessionManager};

//=========================================================================================
// Ports (the adapters the services are built from)
//=========================================================================================

/// One implementation per port. In production most repositories are the same
/// `DbAdapter`; tests pass in-memory fakes.
pub struct Ports {
    pub users: Arc<dyn UserRepository>,
    pub lessons: Arc<dyn LessonRepository>,
    pub courses: Arc<dyn CourseRepository>,
    pub sessions: Arc<dyn ChatSessionRepository>,
    pub messages: Arc<dyn ChatMessageRepository>,
    pub recommendations: Arc<dyn RecommendationRepository>,
    pub sittings: Arc<dyn LearningSessionRepository>,
    pub vectors: Arc<dyn VectorSearch>,
    pub generator: Arc<dyn TextGenerator>,
    pub jobs: Arc<dyn JobDispatcher>,
    pub mailer: Arc<dyn Mailer>,
    pub clock: Arc<dyn Clock>,
}

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub recommendations: Arc<RecommendationService>,
    pub users: Arc<UserSyncService>,
    pub analytics: Arc<AnalyticsService>,
    pub events: Arc<EventService>,
    /// Shared secret expected in `x-jobs-secret` on `POST /api/jobs`.
    pub jobs_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(ports: Ports, jobs_secret: Option<String>) -> Self {
        let retriever = ContextRetriever::new(ports.vectors.clone());

        let chat = ChatService::new(
            ports.lessons,
            ports.messages,
            SessionManager::new(ports.sessions, ports.clock.clone()),
            retriever.clone(),
            ports.generator,
            ports.clock.clone(),
        )
        .with_tool(Arc::new(ResourceSearchTool::new(retriever.clone())));

        let recommendations = RecommendationService::new(
            retriever,
            ports.courses,
            ports.recommendations,
            ports.jobs.clone(),
        );

        let analytics = Arc::new(AnalyticsService::new(ports.users.clone(), ports.clock.clone()));
        let events = EventService::new(
            ports.users.clone(),
            ports.sittings,
            analytics.clone(),
            ports.jobs,
            ports.clock.clone(),
        );
        let users = UserSyncService::new(ports.users, ports.mailer, ports.clock);

        Self {
            chat: Arc::new(chat),
            recommendations: Arc::new(recommendations),
            users: Arc::new(users),
            analytics,
            events: Arc::new(events),
            jobs_secret: jobs_secret.map(Arc::from),
        }
    }
}
