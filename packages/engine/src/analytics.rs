use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{normalise_path, PageViewFeedEntry};
use crate::storage::{EngineStore, StoreResult};

/// Page-view counts for one path, as returned by the external analytics
/// collaborator (§4.7). Keyed by `(organisation_id, domain_id, path)`
/// upstream; the source is only asked for one domain at a time.
#[derive(Debug, Clone)]
pub struct PageViewSample {
    pub path: String,
    pub views_7d: i64,
    pub views_28d: i64,
    pub views_180d: i64,
}

/// External collaborator capability (Design Note §9 "dynamic dispatch over
/// integrations"): "give me up to `limit` page-view rows for this domain,
/// starting at `offset`, ranked by recency of traffic." One implementation
/// talks to Google Analytics; tests substitute a canned in-memory source.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn fetch_page_views(
        &self,
        organisation_id: Uuid,
        domain_id: i64,
        offset: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<PageViewSample>>;
}

/// Phase sizes for the three-phase ingest (§4.7): top 100 synchronously,
/// the next 900 and the following 1000 in the background.
const TOP_PHASE_SIZE: i64 = 100;
const MID_PHASE_SIZE: i64 = 900;
const TAIL_PHASE_SIZE: i64 = 1000;

/// Computes `priority_score = clamp(log(1+views_7d) / log(1+max_views_7d), 0, 1)`
/// (§4.7). Returns 0 when there's no traffic signal at all (`max_views_7d <= 0`)
/// rather than dividing by `log(1) == 0`.
pub fn priority_score(views_7d: i64, max_views_7d: i64) -> f64 {
    if max_views_7d <= 0 || views_7d <= 0 {
        return 0.0;
    }
    let score = (1.0 + views_7d as f64).ln() / (1.0 + max_views_7d as f64).ln();
    score.clamp(0.0, 1.0)
}

/// Progressive priority feed (§4.7): ingests external page-view data phase
/// by phase and reprioritises the matching *pending* tasks after each phase.
/// Running/terminal tasks are left untouched by design.
#[derive(Clone)]
pub struct AnalyticsService {
    store: Arc<dyn EngineStore>,
    source: Arc<dyn AnalyticsSource>,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn EngineStore>, source: Arc<dyn AnalyticsSource>) -> Self {
        Self { store, source }
    }

    /// Runs the top-100 phase synchronously, then spawns the remaining two
    /// phases in the background (§4.7, §2 "three-phase ingest"). Errors in
    /// the background phases are logged, not propagated — a slow or flaky
    /// analytics provider must never block job progress.
    pub async fn ingest_for_domain(&self, organisation_id: Uuid, domain_id: i64) -> StoreResult<()> {
        self.run_phase(organisation_id, domain_id, 0, TOP_PHASE_SIZE).await?;

        let background = self.clone();
        tokio::spawn(async move {
            if let Err(err) = background.run_phase(organisation_id, domain_id, TOP_PHASE_SIZE, MID_PHASE_SIZE).await
            {
                warn!(%organisation_id, domain_id, error = %err, "analytics mid-phase ingest failed");
            }
            if let Err(err) = background
                .run_phase(organisation_id, domain_id, TOP_PHASE_SIZE + MID_PHASE_SIZE, TAIL_PHASE_SIZE)
                .await
            {
                warn!(%organisation_id, domain_id, error = %err, "analytics tail-phase ingest failed");
            }
        });

        Ok(())
    }

    async fn run_phase(
        &self,
        organisation_id: Uuid,
        domain_id: i64,
        offset: i64,
        limit: i64,
    ) -> StoreResult<()> {
        let samples = self
            .source
            .fetch_page_views(organisation_id, domain_id, offset, limit)
            .await
            .map_err(crate::error::EngineError::Transient)?;

        if samples.is_empty() {
            return Ok(());
        }

        let max_views_7d = samples.iter().map(|s| s.views_7d).max().unwrap_or(0);
        let running_jobs = self.store.running_job_ids_for_domain(domain_id).await?;

        for sample in &samples {
            self.store
                .upsert_page_view_entry(PageViewFeedEntry {
                    organisation_id,
                    domain_id,
                    path: sample.path.clone(),
                    page_views_7d: sample.views_7d,
                    page_views_28d: sample.views_28d,
                    page_views_180d: sample.views_180d,
                    updated_at: Utc::now(),
                })
                .await?;

            if running_jobs.is_empty() {
                continue;
            }

            let score = priority_score(sample.views_7d, max_views_7d);
            let path = normalise_path(&sample.path);
            let page_id = self.store.upsert_page(domain_id, &path, score).await?.id;
            let updated = self.store.reprioritise_pending(&running_jobs, page_id, score).await?;
            if updated > 0 {
                info!(domain_id, path = %sample.path, score, updated, "reprioritised pending tasks");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    struct FixedSource {
        samples: Vec<PageViewSample>,
    }

    #[async_trait]
    impl AnalyticsSource for FixedSource {
        async fn fetch_page_views(
            &self,
            _organisation_id: Uuid,
            _domain_id: i64,
            offset: i64,
            limit: i64,
        ) -> anyhow::Result<Vec<PageViewSample>> {
            let start = offset.max(0) as usize;
            Ok(self.samples.iter().skip(start).take(limit as usize).cloned().collect())
        }
    }

    #[test]
    fn priority_score_is_zero_with_no_traffic_signal() {
        assert_eq!(priority_score(0, 0), 0.0);
        assert_eq!(priority_score(5, 0), 0.0);
    }

    #[test]
    fn priority_score_ranks_top_page_at_one() {
        let score = priority_score(1000, 1000);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn priority_score_is_monotonic_in_views() {
        let low = priority_score(10, 1000);
        let high = priority_score(500, 1000);
        assert!(high > low);
    }

    #[tokio::test]
    async fn ingest_reprioritises_pending_tasks_for_running_jobs() {
        let store: Arc<dyn EngineStore> = Arc::new(MemoryStore::new());
        let domain = store.upsert_domain("example.com").await.unwrap();
        let page = store.upsert_page(domain.id, "/home", 0.5).await.unwrap();

        let job = crate::domain::Job {
            id: crate::ids::JobId::new(),
            organisation_id: Uuid::now_v7(),
            domain_id: domain.id,
            status: crate::domain::JobStatus::Running,
            total_tasks: 1,
            completed_tasks: 0,
            failed_tasks: 0,
            skipped_tasks: 0,
            concurrency: 20,
            max_pages: 0,
            find_links: true,
            use_sitemap: true,
            source_type: crate::domain::SourceType::Dashboard,
            source_detail: None,
            source_info: serde_json::json!({}),
            scheduler_id: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            stats: serde_json::json!({}),
        };
        let job = store.insert_job(job).await.unwrap();
        store.enqueue_task(job.id, page.id, Some("root"), None, 0.5).await.unwrap();

        let source = Arc::new(FixedSource {
            samples: vec![PageViewSample { path: "/home".to_string(), views_7d: 900, views_28d: 2000, views_180d: 5000 }],
        });
        let service = AnalyticsService::new(store.clone(), source);
        service.ingest_for_domain(job.organisation_id, domain.id).await.unwrap();

        let tasks = store.list_tasks(job.id, None, None, None, 10, 0).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].priority_score > 0.5);
    }
}
