//! services/api/src/adapters/mailer.rs
//!
//! Outbound mail. Delivery happens outside this service; welcome mails are
//! recorded in the log.

use async_trait::async_trait;
use tracing::info;
use tutor_core::domain::User;
use tutor_core::ports::{Mailer, PortResult};

#[derive(Clone, Copy, Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_welcome(&self, user: &User) -> PortResult<()> {
        if !user.email_preferences.welcome {
            return Ok(());
        }
        info!(user_id = %user.id, email = %user.email, "Welcome email would be sent.");
        Ok(())
    }
}
