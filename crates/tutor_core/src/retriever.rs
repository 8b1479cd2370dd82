//! crates/tutor_core/src/retriever.rs
//!
//! Scoped relevance search over the vector index.

use std::sync::Arc;
use tracing::debug;

use crate::error::{DomainResult, PortResultExt};
use crate::ports::{SearchResult, SearchScope, VectorSearch};

/// In-lesson context for a chat turn.
pub const LESSON_TOP_K: usize = 3;
/// Candidate courses for a recommendation.
pub const COURSE_TOP_K: usize = 10;
/// Supplementary resources offered through the search tool.
pub const RESOURCE_TOP_K: usize = 5;

impl SearchScope {
    pub fn default_top_k(&self) -> usize {
        match self {
            SearchScope::Lesson(_) => LESSON_TOP_K,
            SearchScope::Courses => COURSE_TOP_K,
            SearchScope::Resources => RESOURCE_TOP_K,
        }
    }

    /// The metadata filter in the index's SQL-like filter syntax.
    pub fn filter_expression(&self) -> String {
        match self {
            SearchScope::Lesson(lesson_id) => format!(
                "type = 'lesson' AND id = '{}'",
                lesson_id.replace('\\', "\\\\").replace('\'', "\\'")
            ),
            SearchScope::Courses => "type = 'course'".to_string(),
            SearchScope::Resources => "type = 'resource'".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ContextRetriever {
    index: Arc<dyn VectorSearch>,
}

impl ContextRetriever {
    pub fn new(index: Arc<dyn VectorSearch>) -> Self {
        Self { index }
    }

    /// Searches `scope` for `query`, best match first. `top_k` falls back to the
    /// scope's default. No hits is an empty list, not an error.
    pub async fn search(
        &self,
        query: &str,
        scope: &SearchScope,
        top_k: Option<usize>,
    ) -> DomainResult<Vec<SearchResult>> {
        let top_k = top_k.unwrap_or_else(|| scope.default_top_k()).max(1);
        let mut results = self
            .index
            .query(query, scope, top_k)
            .await
            .search(|| match scope {
                SearchScope::Lesson(id) => format!("Failed to search context for lesson {}", id),
                SearchScope::Courses => "Failed to search course recommendations".to_string(),
                SearchScope::Resources => "Failed to search resources".to_string(),
            })?;

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(top_k);
        debug!(hits = results.len(), filter = %scope.filter_expression(), "Vector search finished.");
        Ok(results)
    }

    pub async fn lesson_context(&self, query: &str, lesson_id: &str) -> DomainResult<Vec<SearchResult>> {
        self.search(query, &SearchScope::Lesson(lesson_id.to_string()), None)
            .await
    }

    pub async fn course_matches(&self, query: &str) -> DomainResult<Vec<SearchResult>> {
        self.search(query, &SearchScope::Courses, None).await
    }

    pub async fn resources(&self, query: &str, top_k: Option<usize>) -> DomainResult<Vec<SearchResult>> {
        self.search(query, &SearchScope::Resources, top_k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use crate::testing::{hit, FakeVectorSearch};

    #[test]
    fn each_scope_has_its_own_filter() {
        assert_eq!(
            SearchScope::Lesson("l1".into()).filter_expression(),
            "type = 'lesson' AND id = 'l1'"
        );
        assert_eq!(SearchScope::Courses.filter_expression(), "type = 'course'");
        assert_eq!(SearchScope::Resources.filter_expression(), "type = 'resource'");
    }

    #[test]
    fn lesson_filter_escapes_quotes() {
        assert_eq!(
            SearchScope::Lesson("o'brien".into()).filter_expression(),
            "type = 'lesson' AND id = 'o\\'brien'"
        );
    }

    #[test]
    fn default_top_k_per_scope() {
        assert_eq!(SearchScope::Lesson("x".into()).default_top_k(), 3);
        assert_eq!(SearchScope::Courses.default_top_k(), 10);
        assert_eq!(SearchScope::Resources.default_top_k(), 5);
    }

    #[tokio::test]
    async fn results_come_back_best_first_and_capped() {
        let index = Arc::new(FakeVectorSearch::with_results(vec![
            hit("a", 0.2, "low"),
            hit("b", 0.9, "high"),
            hit("c", 0.5, "mid"),
            hit("d", 0.7, "upper"),
        ]));
        let retriever = ContextRetriever::new(index.clone());

        let results = retriever.lesson_context("closures", "l1").await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["b", "d", "c"]);

        let calls = index.calls();
        assert_eq!(calls[0].1, SearchScope::Lesson("l1".into()));
        assert_eq!(calls[0].2, 3);
    }

    #[tokio::test]
    async fn no_hits_is_an_empty_list() {
        let retriever = ContextRetriever::new(Arc::new(FakeVectorSearch::default()));
        assert!(retriever.course_matches("databases").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_failure_is_a_search_error() {
        let retriever = ContextRetriever::new(Arc::new(FakeVectorSearch::failing()));
        let err = retriever.resources("anything", Some(5)).await.unwrap_err();
        assert!(matches!(err, DomainError::Search { .. }));
        assert_eq!(err.public_message(), "Failed to search resources");
    }
}
