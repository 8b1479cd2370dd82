//! crates/tutor_core/src/tools.rs
//!
//! Tools offered to the generator during a chat turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::ports::ChatTool;
use crate::retriever::{ContextRetriever, RESOURCE_TOP_K};

pub const SEARCH_RESOURCES: &str = "searchResources";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResourcesInput {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceHit {
    rank: usize,
    relevance_score: f32,
    content: String,
    url: String,
    chunk_index: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResourcesOutput {
    query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    total_results: usize,
    resources: Vec<ResourceHit>,
}

/// Searches supplementary course resources. Retrieval failures are reported
/// to the model inside the output instead of failing the turn.
pub struct ResourceSearchTool {
    retriever: ContextRetriever,
}

impl ResourceSearchTool {
    pub fn new(retriever: ContextRetriever) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl ChatTool for ResourceSearchTool {
    fn name(&self) -> &str {
        SEARCH_RESOURCES
    }

    fn description(&self) -> &str {
        "Search for relevant learning resources and course material for a question. \
         Use it when the learner asks about a specific topic or concept, or needs \
         additional learning material."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search keywords used to find relevant learning resources"
                },
                "topK": {
                    "type": "integer",
                    "description": "Number of results to return (default: 5)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn call(&self, input: Value) -> Result<Value, String> {
        let input: SearchResourcesInput = serde_json::from_value(input)
            .map_err(|e| format!("Invalid searchResources input: {}", e))?;
        let top_k = input.top_k.unwrap_or(RESOURCE_TOP_K);

        let output = match self.retriever.resources(&input.query, Some(top_k)).await {
            Ok(results) => SearchResourcesOutput {
                query: input.query,
                error: None,
                total_results: results.len(),
                resources: results
                    .into_iter()
                    .enumerate()
                    .map(|(index, result)| ResourceHit {
                        rank: index + 1,
                        relevance_score: result.score,
                        content: result
                            .content
                            .filter(|c| !c.trim().is_empty())
                            .unwrap_or_else(|| "No content available".to_string()),
                        url: result
                            .metadata
                            .as_ref()
                            .and_then(|m| m.url.clone())
                            .unwrap_or_else(|| "No URL available".to_string()),
                        chunk_index: result.metadata.map(|m| m.chunk_index).unwrap_or(0),
                    })
                    .collect(),
            },
            Err(e) => {
                warn!(query = %input.query, "Resource search failed: {}", e);
                SearchResourcesOutput {
                    query: input.query,
                    error: Some("Failed to search learning resources".to_string()),
                    total_results: 0,
                    resources: Vec::new(),
                }
            }
        };

        serde_json::to_value(output).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ChunkKind, SearchScope, SourceMetadata};
    use crate::testing::{hit, FakeVectorSearch};
    use std::sync::Arc;

    #[tokio::test]
    async fn formats_ranked_resources() {
        let mut with_url = hit("r1", 0.91, "Ownership explained");
        with_url.metadata = Some(SourceMetadata {
            id: "r1".into(),
            kind: ChunkKind::Resource,
            chunk_index: 4,
            url: Some("https://example.org/ownership".into()),
        });
        let index = Arc::new(FakeVectorSearch::with_results(vec![
            hit("r2", 0.4, ""),
            with_url,
        ]));
        let tool = ResourceSearchTool::new(ContextRetriever::new(index.clone()));

        let output = tool
            .call(json!({ "query": "ownership", "topK": 2 }))
            .await
            .unwrap();

        assert_eq!(output["query"], "ownership");
        assert_eq!(output["totalResults"], 2);
        assert!(output.get("error").is_none());
        assert_eq!(output["resources"][0]["rank"], 1);
        assert_eq!(output["resources"][0]["url"], "https://example.org/ownership");
        assert_eq!(output["resources"][0]["chunkIndex"], 4);
        assert_eq!(output["resources"][1]["content"], "No content available");
        assert_eq!(output["resources"][1]["url"], "No URL available");

        let calls = index.calls();
        assert_eq!(calls[0].1, SearchScope::Resources);
        assert_eq!(calls[0].2, 2);
    }

    #[tokio::test]
    async fn top_k_defaults_to_five() {
        let index = Arc::new(FakeVectorSearch::default());
        let tool = ResourceSearchTool::new(ContextRetriever::new(index.clone()));

        tool.call(json!({ "query": "traits" })).await.unwrap();
        assert_eq!(index.calls()[0].2, 5);
    }

    #[tokio::test]
    async fn retrieval_failure_is_reported_in_the_output() {
        let tool = ResourceSearchTool::new(ContextRetriever::new(Arc::new(FakeVectorSearch::failing())));

        let output = tool.call(json!({ "query": "traits" })).await.unwrap();
        assert_eq!(output["error"], "Failed to search learning resources");
        assert_eq!(output["totalResults"], 0);
        assert_eq!(output["resources"], json!([]));
    }

    #[tokio::test]
    async fn malformed_input_is_a_tool_error() {
        let tool = ResourceSearchTool::new(ContextRetriever::new(Arc::new(FakeVectorSearch::default())));
        let err = tool.call(json!({ "topK": 3 })).await.unwrap_err();
        assert!(err.starts_with("Invalid searchResources input"));
    }
}
