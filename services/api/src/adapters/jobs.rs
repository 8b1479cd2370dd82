//! services/api/src/adapters/jobs.rs
//!
//! Job dispatch. With an Inngest event key, events are posted to the Inngest
//! event API and come back through `POST /api/jobs`. Without one, they are pushed
//! onto an in-process queue drained by a worker task.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tutor_core::ports::{JobDispatcher, PortError, PortResult};
use uuid::Uuid;

use crate::config::JobRunnerConfig;

//=========================================================================================
// Inngest
//=========================================================================================

#[derive(Deserialize)]
struct SendEventResponse {
    #[serde(default)]
    ids: Vec<String>,
}

/// Sends events to the Inngest event API.
#[derive(Clone)]
pub struct InngestDispatcher {
    http: Client,
    base_url: String,
    event_key: String,
}

impl InngestDispatcher {
    pub fn new(http: Client, base_url: String, event_key: String) -> Self {
        Self {
            http,
            base_url,
            event_key,
        }
    }

    fn event_url(&self) -> String {
        format!("{}/e/{}", self.base_url.trim_end_matches('/'), self.event_key)
    }
}

#[async_trait]
impl JobDispatcher for InngestDispatcher {
    async fn send(&self, event_name: &str, payload: Value) -> PortResult<String> {
        let response = self
            .http
            .post(self.event_url())
            .json(&json!({ "name": event_name, "data": payload }))
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("event send failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PortError::Unauthorized);
        }
        if !status.is_success() {
            return Err(PortError::Unexpected(format!(
                "event API returned {}",
                status
            )));
        }

        let body: SendEventResponse = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("unreadable event response: {}", e)))?;
        body.ids
            .into_iter()
            .next()
            .ok_or_else(|| PortError::Unexpected("event API returned no id".to_string()))
    }
}

//=========================================================================================
// In-process queue
//=========================================================================================

/// A job waiting on the in-process queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: String,
    pub name: String,
    pub data: Value,
}

/// Hands jobs to a local worker over an unbounded channel.
#[derive(Clone)]
pub struct LocalJobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
}

impl LocalJobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobDispatcher for LocalJobQueue {
    async fn send(&self, event_name: &str, payload: Value) -> PortResult<String> {
        let id = format!("local-{}", Uuid::new_v4().simple());
        self.tx
            .send(QueuedJob {
                id: id.clone(),
                name: event_name.to_string(),
                data: payload,
            })
            .map_err(|_| PortError::Unexpected("local job worker has stopped".to_string()))?;
        info!(job_id = %id, event = event_name, "Queued job locally.");
        Ok(id)
    }
}

/// Picks the dispatcher for the configured runner. The receiver is returned when
/// jobs stay in-process and must be drained by a worker.
pub fn dispatcher_for(
    config: &JobRunnerConfig,
    http: Client,
) -> (Arc<dyn JobDispatcher>, Option<mpsc::UnboundedReceiver<QueuedJob>>) {
    match &config.event_key {
        Some(key) => {
            let dispatcher: Arc<dyn JobDispatcher> = Arc::new(InngestDispatcher::new(
                http,
                config.base_url.clone(),
                key.clone(),
            ));
            (dispatcher, None)
        }
        None => {
            let (queue, rx) = LocalJobQueue::new();
            let dispatcher: Arc<dyn JobDispatcher> = Arc::new(queue);
            (dispatcher, Some(rx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_queue_hands_jobs_to_the_receiver() {
        let (queue, mut rx) = LocalJobQueue::new();
        let id = queue
            .send("analytics/process.triggered", json!({ "userId": "u1" }))
            .await
            .unwrap();

        let job = rx.recv().await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.name, "analytics/process.triggered");
        assert_eq!(job.data["userId"], "u1");
    }

    #[tokio::test]
    async fn local_queue_fails_once_the_worker_is_gone() {
        let (queue, rx) = LocalJobQueue::new();
        drop(rx);
        let err = queue.send("x", Value::Null).await.unwrap_err();
        assert!(matches!(err, PortError::Unexpected(_)));
    }

    #[test]
    fn runner_choice_follows_the_event_key() {
        let local = JobRunnerConfig {
            event_key: None,
            base_url: "https://inn.gs".into(),
        };
        assert!(dispatcher_for(&local, Client::new()).1.is_some());

        let remote = JobRunnerConfig {
            event_key: Some("key".into()),
            ..local
        };
        assert!(dispatcher_for(&remote, Client::new()).1.is_none());
    }

    #[test]
    fn event_url_embeds_the_key() {
        let d = InngestDispatcher::new(Client::new(), "https://inn.gs/".into(), "abc".into());
        assert_eq!(d.event_url(), "https://inn.gs/e/abc");
    }
}
