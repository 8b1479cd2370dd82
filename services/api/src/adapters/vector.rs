//! services/api/src/adapters/vector.rs
//!
//! Vector search over the Upstash Vector REST API. Queries are sent as raw text
//! (`data`) so the index embeds them server-side. Lesson and course chunks live in
//! the main index; resource chunks live in their own index and are queried
//! without a filter.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use tutor_core::ports::{
    PortError, PortResult, SearchResult, SearchScope, SourceMetadata, VectorSearch,
};

use crate::config::VectorIndexConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    data: &'a str,
    top_k: usize,
    include_metadata: bool,
    include_data: bool,
    include_vectors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    result: Vec<QueryHit>,
}

#[derive(Deserialize)]
struct QueryHit {
    id: Value,
    score: f32,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

impl QueryHit {
    fn to_domain(self) -> SearchResult {
        let id = match self.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        // Chunk text may be stored as the vector's data or under metadata.content.
        let content = self.data.or_else(|| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let metadata = self.metadata.and_then(|m| {
            serde_json::from_value::<SourceMetadata>(m)
                .map_err(|e| debug!(%id, "Unreadable chunk metadata: {}", e))
                .ok()
        });
        SearchResult {
            id,
            score: self.score,
            content,
            metadata,
        }
    }
}

/// An adapter that implements `VectorSearch` against two Upstash indexes.
#[derive(Clone)]
pub struct UpstashVectorAdapter {
    http: Client,
    content_index: VectorIndexConfig,
    resource_index: VectorIndexConfig,
}

impl UpstashVectorAdapter {
    pub fn new(http: Client, content_index: VectorIndexConfig, resource_index: VectorIndexConfig) -> Self {
        Self {
            http,
            content_index,
            resource_index,
        }
    }

    fn target(&self, scope: &SearchScope) -> (&VectorIndexConfig, Option<String>) {
        match scope {
            SearchScope::Resources if self.resource_index != self.content_index => {
                (&self.resource_index, None)
            }
            _ => (&self.content_index, Some(scope.filter_expression())),
        }
    }
}

fn query_url(base: &str) -> String {
    format!("{}/query-data", base.trim_end_matches('/'))
}

#[async_trait]
impl VectorSearch for UpstashVectorAdapter {
    async fn query(
        &self,
        text: &str,
        scope: &SearchScope,
        top_k: usize,
    ) -> PortResult<Vec<SearchResult>> {
        let (index, filter) = self.target(scope);
        let body = QueryRequest {
            data: text,
            top_k,
            include_metadata: true,
            include_data: true,
            include_vectors: false,
            filter,
        };

        let response = self
            .http
            .post(query_url(&index.url))
            .bearer_auth(&index.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("vector query failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PortError::Unauthorized);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, "Vector index rejected the query.");
            return Err(PortError::Unexpected(format!(
                "vector index returned {}: {}",
                status, detail
            )));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("unreadable vector response: {}", e)))?;
        Ok(parsed.result.into_iter().map(QueryHit::to_domain).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tutor_core::ports::ChunkKind;

    fn index(url: &str) -> VectorIndexConfig {
        VectorIndexConfig {
            url: url.into(),
            token: "t".into(),
        }
    }

    #[test]
    fn hits_carry_content_and_typed_metadata() {
        let response: QueryResponse = serde_json::from_value(json!({
            "result": [{
                "id": "lesson-1-0",
                "score": 0.91,
                "data": "Variables hold values.",
                "metadata": { "id": "lesson-1", "type": "lesson", "chunkIndex": 0 }
            }]
        }))
        .unwrap();

        let hit = response.result.into_iter().next().unwrap().to_domain();
        assert_eq!(hit.id, "lesson-1-0");
        assert_eq!(hit.content.as_deref(), Some("Variables hold values."));
        let metadata = hit.metadata.unwrap();
        assert_eq!(metadata.kind, ChunkKind::Lesson);
        assert_eq!(metadata.id, "lesson-1");
    }

    #[test]
    fn content_falls_back_to_metadata_and_bad_metadata_is_dropped() {
        let hit = QueryHit {
            id: json!(42),
            score: 0.5,
            data: None,
            metadata: Some(json!({ "content": "from metadata" })),
        }
        .to_domain();
        assert_eq!(hit.id, "42");
        assert_eq!(hit.content.as_deref(), Some("from metadata"));
        assert!(hit.metadata.is_none());
    }

    #[test]
    fn resources_use_their_own_index_without_a_filter() {
        let adapter = UpstashVectorAdapter::new(Client::new(), index("https://main"), index("https://res"));
        let (target, filter) = adapter.target(&SearchScope::Resources);
        assert_eq!(target.url, "https://res");
        assert!(filter.is_none());

        let (target, filter) = adapter.target(&SearchScope::Lesson("l1".into()));
        assert_eq!(target.url, "https://main");
        assert_eq!(filter.as_deref(), Some("type = 'lesson' AND id = 'l1'"));
    }

    #[test]
    fn query_url_ignores_trailing_slash() {
        assert_eq!(query_url("https://idx.upstash.io/"), "https://idx.upstash.io/query-data");
    }
}
