//! ResultRepository - durable job outcomes
//!
//! Each terminal job outcome is persisted twice: under `job:result:{id}` with
//! a bounded TTL, and head-pushed onto the rolling
//! `jobs:history:completed` / `jobs:history:failed` lists, trimmed to the
//! configured bound (newest first).

use cg_common::{JobResultRecord, JobStatus};
use cg_store::KvStore;
use std::sync::Arc;
use tracing::warn;

const RESULT_KEY_PREFIX: &str = "job:result:";
pub const HISTORY_COMPLETED_KEY: &str = "jobs:history:completed";
pub const HISTORY_FAILED_KEY: &str = "jobs:history:failed";

pub struct ResultRepository {
    store: Arc<dyn KvStore>,
    result_ttl_secs: u64,
    history_limit: usize,
}

impl ResultRepository {
    pub fn new(store: Arc<dyn KvStore>, result_ttl_secs: u64, history_limit: usize) -> Self {
        Self {
            store,
            result_ttl_secs: result_ttl_secs.max(60),
            history_limit: history_limit.max(1),
        }
    }

    fn result_key(job_id: &str) -> String {
        format!("{}{}", RESULT_KEY_PREFIX, job_id)
    }

    fn history_key(status: JobStatus) -> &'static str {
        match status {
            JobStatus::Failed => HISTORY_FAILED_KEY,
            _ => HISTORY_COMPLETED_KEY,
        }
    }

    /// Persist a terminal record: per-id key with TTL plus the rolling
    /// history list, trimmed to the bound.
    pub async fn save(&self, record: &JobResultRecord) -> crate::Result<()> {
        let raw = serde_json::to_string(record)?;

        self.store
            .set_ex(&Self::result_key(&record.job_id), &raw, self.result_ttl_secs)
            .await?;

        let history_key = Self::history_key(record.status);
        self.store.lpush(history_key, &raw).await?;
        self.store
            .ltrim(history_key, 0, self.history_limit as isize - 1)
            .await?;

        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> crate::Result<Option<JobResultRecord>> {
        match self.store.get(&Self::result_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read history, newest first, optionally filtered by queue name.
    pub async fn history(
        &self,
        status: JobStatus,
        limit: usize,
        queue: Option<&str>,
    ) -> crate::Result<Vec<JobResultRecord>> {
        let key = Self::history_key(status);
        let raw_entries = self.store.lrange(key, 0, -1).await?;

        let mut records = Vec::with_capacity(limit.min(raw_entries.len()));
        for raw in raw_entries {
            let record: JobResultRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable history entry");
                    continue;
                }
            };
            if let Some(queue) = queue {
                if record.queue_name != queue {
                    continue;
                }
            }
            records.push(record);
            if records.len() >= limit {
                break;
            }
        }
        Ok(records)
    }

    pub async fn history_len(&self, status: JobStatus) -> crate::Result<usize> {
        Ok(self.store.llen(Self::history_key(status)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_common::{CacheInfo, Verb};
    use cg_store::MemoryStore;
    use indexmap::IndexMap;

    fn record(job_id: &str, queue: &str, status: JobStatus) -> JobResultRecord {
        JobResultRecord {
            job_id: job_id.to_string(),
            queue_name: queue.to_string(),
            verb: Verb::POST,
            url: "/courses".to_string(),
            status,
            success: status == JobStatus::Completed,
            status_code: Some(200),
            body: None,
            headers: None,
            request_body: None,
            query: IndexMap::new(),
            cache: CacheInfo::default(),
            error: None,
            attempts_made: 1,
            finished_at: chrono::Utc::now().timestamp_millis(),
            worker_id: Some("standard-default-1".to_string()),
            result: Some(serde_json::json!({"ok": true})),
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let repo = ResultRepository::new(Arc::new(MemoryStore::new()), 3600, 100);
        repo.save(&record("j1", "standard", JobStatus::Completed))
            .await
            .unwrap();

        let loaded = repo.get("j1").await.unwrap().unwrap();
        assert_eq!(loaded.job_id, "j1");
        assert!(loaded.success);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_first() {
        let repo = ResultRepository::new(Arc::new(MemoryStore::new()), 3600, 5);
        for i in 0..8 {
            repo.save(&record(&format!("j{}", i), "standard", JobStatus::Completed))
                .await
                .unwrap();
        }

        assert_eq!(repo.history_len(JobStatus::Completed).await.unwrap(), 5);
        let history = repo.history(JobStatus::Completed, 50, None).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].job_id, "j7");
    }

    #[tokio::test]
    async fn failed_records_land_on_the_failure_list() {
        let repo = ResultRepository::new(Arc::new(MemoryStore::new()), 3600, 100);
        repo.save(&record("j1", "standard", JobStatus::Failed))
            .await
            .unwrap();

        assert_eq!(repo.history_len(JobStatus::Failed).await.unwrap(), 1);
        assert_eq!(repo.history_len(JobStatus::Completed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn history_filters_by_queue() {
        let repo = ResultRepository::new(Arc::new(MemoryStore::new()), 3600, 100);
        repo.save(&record("j1", "standard", JobStatus::Completed))
            .await
            .unwrap();
        repo.save(&record("j2", "vip", JobStatus::Completed))
            .await
            .unwrap();

        let history = repo
            .history(JobStatus::Completed, 50, Some("vip"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].job_id, "j2");
    }
}
