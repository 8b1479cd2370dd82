//! crates/tutor_core/src/recommendation.rs
//!
//! Course recommendations. A request only dispatches a background job; the job
//! searches the course index and overwrites the learner's single
//! recommendation record with the outcome.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::{Recommendation, RecommendationStatus, RecommendationUpsert};
use crate::error::{DomainResult, PortResultExt};
use crate::ports::{CourseRepository, JobDispatcher, RecommendationRepository, SearchResult};
use crate::retriever::ContextRetriever;

pub const RECOMMENDATION_EVENT: &str = "course/recommendation.triggered";

const NO_MATCHES_MESSAGE: &str = "No relevant courses found for your query.";
const FAILED_MESSAGE: &str = "Failed to generate recommendations. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Processing,
    Failed,
}

/// What the caller gets back immediately after asking for recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationTicket {
    pub status: RequestStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Payload of the recommendation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationJob {
    pub query: String,
    pub user_id: Uuid,
}

/// Explanation for a set of matches, bucketed by the best score.
pub fn recommendation_reason(results: &[SearchResult]) -> String {
    let top_score = results.first().map(|r| r.score).unwrap_or(0.0);
    let count = results.len();
    if top_score > 0.8 {
        format!(
            "Found {} highly relevant courses based on your query with excellent content match.",
            count
        )
    } else if top_score > 0.6 {
        format!(
            "Found {} relevant courses that align well with your learning interests.",
            count
        )
    } else {
        format!("Found {} courses that may be related to your query.", count)
    }
}

pub struct RecommendationService {
    retriever: ContextRetriever,
    courses: Arc<dyn CourseRepository>,
    records: Arc<dyn RecommendationRepository>,
    jobs: Arc<dyn JobDispatcher>,
}

impl RecommendationService {
    pub fn new(
        retriever: ContextRetriever,
        courses: Arc<dyn CourseRepository>,
        records: Arc<dyn RecommendationRepository>,
        jobs: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            retriever,
            courses,
            records,
            jobs,
        }
    }

    /// Dispatches the recommendation job and returns at once. Only a failed
    /// dispatch yields a `failed` ticket.
    pub async fn request_recommendations(&self, query: &str, user_id: Uuid) -> RecommendationTicket {
        let payload = json!({ "query": query, "userId": user_id });
        match self.jobs.send(RECOMMENDATION_EVENT, payload).await {
            Ok(job_id) => {
                info!(%user_id, %job_id, "Recommendation job dispatched.");
                RecommendationTicket {
                    status: RequestStatus::Processing,
                    message: "Recommendations are being processed".to_string(),
                    job_id: Some(job_id),
                }
            }
            Err(e) => {
                error!(%user_id, "Failed to dispatch recommendation job: {}", e);
                RecommendationTicket {
                    status: RequestStatus::Failed,
                    message: "Failed to process recommendation request".to_string(),
                    job_id: None,
                }
            }
        }
    }

    /// The learner's current record, if a job has ever written one.
    pub async fn latest(&self, user_id: Uuid) -> DomainResult<Option<Recommendation>> {
        self.records
            .get_for_user(user_id)
            .await
            .repository(|| format!("Failed to fetch recommendation for user {}", user_id))
    }

    /// The background stage. On any failure the record is overwritten as
    /// `failed` and the error is returned to the job runner.
    pub async fn process_recommendations(&self, job: &RecommendationJob) -> DomainResult<()> {
        self.write(job, RecommendationStatus::InProgress, None, Vec::new(), "Searching for matching courses.")
            .await?;

        match self.find_courses(job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(user_id = %job.user_id, "Recommendation processing failed: {}", e);
                if let Err(write_err) = self
                    .write(job, RecommendationStatus::Failed, None, Vec::new(), FAILED_MESSAGE)
                    .await
                {
                    error!(user_id = %job.user_id, "Failed to mark recommendation as failed: {}", write_err);
                }
                Err(e)
            }
        }
    }

    async fn find_courses(&self, job: &RecommendationJob) -> DomainResult<()> {
        let results = self.retriever.course_matches(&job.query).await?;
        if results.is_empty() {
            return self
                .write(job, RecommendationStatus::Completed, None, Vec::new(), NO_MATCHES_MESSAGE)
                .await;
        }

        let mut ids: Vec<String> = Vec::new();
        for id in results.iter().filter_map(|r| r.metadata.as_ref().map(|m| m.id.clone())) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let found = self
            .courses
            .get_by_ids(&ids)
            .await
            .repository(|| "Failed to fetch recommended courses".to_string())?;
        // Keep the ranking order of the search, dropping ids with no course.
        let courses: Vec<String> = ids
            .into_iter()
            .filter(|id| found.iter().any(|course| &course.id == id))
            .collect();

        let message = format!("Found {} courses that match your query.", courses.len());
        self.write(
            job,
            RecommendationStatus::Completed,
            Some(recommendation_reason(&results)),
            courses,
            &message,
        )
        .await
    }

    async fn write(
        &self,
        job: &RecommendationJob,
        status: RecommendationStatus,
        reason: Option<String>,
        courses: Vec<String>,
        message: &str,
    ) -> DomainResult<()> {
        self.records
            .upsert(RecommendationUpsert {
                user_id: job.user_id,
                query: job.query.clone(),
                reason,
                courses,
                status,
                message: message.to_string(),
            })
            .await
            .repository(|| format!("Failed to save recommendation for user {}", job.user_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Course;
    use crate::error::DomainError;
    use crate::ports::{ChunkKind, SourceMetadata};
    use crate::testing::{FakeDispatcher, FakeVectorSearch, InMemoryStore};

    fn course_hit(id: &str, score: f32) -> SearchResult {
        SearchResult {
            id: format!("{}-chunk", id),
            score,
            content: Some(format!("About {}", id)),
            metadata: Some(SourceMetadata {
                id: id.to_string(),
                kind: ChunkKind::Course,
                chunk_index: 0,
                url: None,
            }),
        }
    }

    fn service(
        store: &Arc<InMemoryStore>,
        index: FakeVectorSearch,
        jobs: &Arc<FakeDispatcher>,
    ) -> RecommendationService {
        RecommendationService::new(
            ContextRetriever::new(Arc::new(index)),
            store.clone(),
            store.clone(),
            jobs.clone(),
        )
    }

    fn job(query: &str) -> RecommendationJob {
        RecommendationJob {
            query: query.into(),
            user_id: Uuid::from_u128(7),
        }
    }

    #[tokio::test]
    async fn request_dispatches_and_returns_a_ticket() {
        let store = Arc::new(InMemoryStore::default());
        let jobs = Arc::new(FakeDispatcher::default());
        let ticket = service(&store, FakeVectorSearch::default(), &jobs)
            .request_recommendations("rust for beginners", Uuid::from_u128(7))
            .await;

        assert_eq!(ticket.status, RequestStatus::Processing);
        assert_eq!(ticket.job_id.as_deref(), Some("job-1"));
        let sent = jobs.sent();
        assert_eq!(sent[0].0, RECOMMENDATION_EVENT);
        assert_eq!(sent[0].1["query"], "rust for beginners");
        assert!(store.recommendation_for(Uuid::from_u128(7)).is_none());
    }

    #[tokio::test]
    async fn failed_dispatch_fails_closed() {
        let store = Arc::new(InMemoryStore::default());
        let jobs = Arc::new(FakeDispatcher::failing());
        let ticket = service(&store, FakeVectorSearch::default(), &jobs)
            .request_recommendations("rust", Uuid::from_u128(7))
            .await;

        assert_eq!(ticket.status, RequestStatus::Failed);
        assert!(ticket.job_id.is_none());
    }

    #[tokio::test]
    async fn no_matches_complete_with_empty_courses() {
        let store = Arc::new(InMemoryStore::default());
        let jobs = Arc::new(FakeDispatcher::default());
        service(&store, FakeVectorSearch::default(), &jobs)
            .process_recommendations(&job("intro to databases"))
            .await
            .unwrap();

        let record = store.recommendation_for(Uuid::from_u128(7)).unwrap();
        assert_eq!(record.status, RecommendationStatus::Completed);
        assert!(record.courses.is_empty());
        assert_eq!(record.message, "No relevant courses found for your query.");
    }

    #[tokio::test]
    async fn high_score_uses_highly_relevant_reason() {
        let store = Arc::new(InMemoryStore::default());
        store.add_course(Course {
            id: "c1".into(),
            title: "Rust Basics".into(),
            description: None,
        });
        store.add_course(Course {
            id: "c2".into(),
            title: "Async Rust".into(),
            description: None,
        });
        let jobs = Arc::new(FakeDispatcher::default());
        let index = FakeVectorSearch::with_results(vec![
            course_hit("c2", 0.7),
            course_hit("c1", 0.85),
            course_hit("c1", 0.8),
            course_hit("gone", 0.5),
        ]);

        service(&store, index, &jobs)
            .process_recommendations(&job("rust"))
            .await
            .unwrap();

        let record = store.recommendation_for(Uuid::from_u128(7)).unwrap();
        assert_eq!(record.status, RecommendationStatus::Completed);
        assert_eq!(record.courses, vec!["c1".to_string(), "c2".to_string()]);
        assert!(record.reason.unwrap().contains("highly relevant"));
        assert_eq!(record.message, "Found 2 courses that match your query.");
    }

    #[test]
    fn reason_buckets_by_top_score() {
        assert!(recommendation_reason(&[course_hit("a", 0.81)]).contains("highly relevant"));
        assert!(recommendation_reason(&[course_hit("a", 0.8)]).contains(" relevant courses that align"));
        assert!(recommendation_reason(&[course_hit("a", 0.6)]).contains("may be related"));
    }

    #[tokio::test]
    async fn processing_twice_keeps_a_single_record() {
        let store = Arc::new(InMemoryStore::default());
        let jobs = Arc::new(FakeDispatcher::default());
        let service = service(&store, FakeVectorSearch::default(), &jobs);

        service.process_recommendations(&job("sql")).await.unwrap();
        service.process_recommendations(&job("sql")).await.unwrap();

        assert_eq!(store.recommendation_count(), 1);
    }

    #[tokio::test]
    async fn latest_reads_back_the_processed_record() {
        let store = Arc::new(InMemoryStore::default());
        let jobs = Arc::new(FakeDispatcher::default());
        let service = service(&store, FakeVectorSearch::default(), &jobs);

        assert!(service.latest(Uuid::from_u128(7)).await.unwrap().is_none());
        service.process_recommendations(&job("graphs")).await.unwrap();

        let record = service.latest(Uuid::from_u128(7)).await.unwrap().unwrap();
        assert_eq!(record.query, "graphs");
        assert_eq!(record.status, RecommendationStatus::Completed);
    }

    #[tokio::test]
    async fn search_failure_marks_failed_and_propagates() {
        let store = Arc::new(InMemoryStore::default());
        let jobs = Arc::new(FakeDispatcher::default());

        let err = service(&store, FakeVectorSearch::failing(), &jobs)
            .process_recommendations(&job("rust"))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Search { .. }));
        let record = store.recommendation_for(Uuid::from_u128(7)).unwrap();
        assert_eq!(record.status, RecommendationStatus::Failed);
        assert!(record.courses.is_empty());
        assert_eq!(
            record.message,
            "Failed to generate recommendations. Please try again later."
        );
    }
}
