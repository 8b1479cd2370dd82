pub mod chat;
pub mod events;
pub mod jobs;
pub mod middleware;
pub mod recommendations;
pub mod rest;
pub mod routes;
pub mod state;

pub use jobs::run_local_jobs;
pub use middleware::require_user;
pub use routes::{cors_layer, create_router};
pub use state::{AppState, Ports};
