pub mod db;
pub mod generator;
pub mod jobs;
pub mod mailer;
pub mod vector;

pub use db::DbAdapter;
pub use generator::OpenAiChatAdapter;
pub use jobs::{dispatcher_for, InngestDispatcher, LocalJobQueue, QueuedJob};
pub use mailer::LogMailer;
pub use vector::UpstashVectorAdapter;
