use std::sync::Arc;

use uuid::Uuid;

use crate::storage::{EngineStore, StoreResult};

/// Per-org daily page-quota bookkeeping (§4.8). A thin façade over
/// [`EngineStore`]'s `quota_remaining`/`increment_quota`, keeping the
/// compare-and-increment vocabulary out of the Job Manager and Worker Pool.
#[derive(Clone)]
pub struct QuotaService {
    store: Arc<dyn EngineStore>,
}

/// Result of crossing the plan limit mid-job (§4.8, §9 Open Question 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    WithinLimit { used: i64 },
    Exceeded { used: i64, limit: i64 },
}

impl QuotaService {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// `GetDailyQuotaRemaining` (§4.8), used at job creation.
    pub async fn remaining(&self, organisation_id: Uuid, limit: i64) -> StoreResult<i64> {
        self.store.quota_remaining(organisation_id, limit).await
    }

    /// Compare-and-increment called from inside the worker before
    /// `Complete` (§4.8). Returns whether the new counter crosses `limit`.
    pub async fn increment_and_check(&self, organisation_id: Uuid, limit: i64) -> StoreResult<QuotaOutcome> {
        let counter = self.store.increment_quota(organisation_id).await?;
        if counter.pages_used > limit {
            Ok(QuotaOutcome::Exceeded { used: counter.pages_used, limit })
        } else {
            Ok(QuotaOutcome::WithinLimit { used: counter.pages_used })
        }
    }
}
