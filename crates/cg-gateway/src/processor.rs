//! JobProcessor - per-job execution: cache lookup, bus dispatch, persistence
//!
//! For each dequeued job: a valid cache entry completes the job without a
//! bus round-trip; otherwise the request-reply dispatch runs under the
//! queue's timeout. Terminal outcomes are persisted through the result
//! repository and pushed into the status fabric. Cache and persistence
//! failures never fail the job.

use cg_common::{
    CacheInfo, ErrorInfo, ErrorKind, Job, JobResultRecord, JobStatus, QueueDefinition,
};
use cg_bus::{BusClient, BusError};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::{self, ResponseCache};
use crate::results::ResultRepository;
use crate::status::StatusFabric;

/// Reserved echo subject: dispatch is synthesized locally instead of hitting
/// the bus.
pub const TEST_ECHO_SUBJECT: &str = "queue.test";

/// A failed dispatch attempt, classified for the result record.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl DispatchFailure {
    fn timeout(message: String) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message,
            status_code: None,
        }
    }

    fn http(status_code: u16, message: String) -> Self {
        Self {
            kind: ErrorKind::Http,
            message,
            status_code: Some(status_code),
        }
    }

    fn exception(message: String) -> Self {
        Self {
            kind: ErrorKind::Exception,
            message,
            status_code: None,
        }
    }
}

pub struct JobProcessor {
    bus: Arc<dyn BusClient>,
    cache: Arc<dyn ResponseCache>,
    results: Arc<ResultRepository>,
    fabric: Arc<StatusFabric>,
}

impl JobProcessor {
    pub fn new(
        bus: Arc<dyn BusClient>,
        cache: Arc<dyn ResponseCache>,
        results: Arc<ResultRepository>,
        fabric: Arc<StatusFabric>,
    ) -> Self {
        Self {
            bus,
            cache,
            results,
            fabric,
        }
    }

    /// Run one attempt of a job. `attempt` is 1-based. On success the
    /// completion record and status are written here; failures are returned
    /// so the worker can apply the queue's retry policy.
    pub async fn process(
        &self,
        job: &mut Job,
        def: &QueueDefinition,
        worker_id: &str,
        attempt: u32,
    ) -> std::result::Result<(), DispatchFailure> {
        let queue_name = def.name.as_str();
        job.worker_id = Some(worker_id.to_string());
        job.attempts = attempt;
        self.fabric.mark_processing(&job.id, queue_name);

        let started = Instant::now();
        let cacheable = cache::admits(job);
        let key = cacheable.then(|| cache::cache_key(job));

        // Cache hit: complete without a bus dispatch.
        if let Some(key) = &key {
            if let Some(value) = self.cache.get(key) {
                debug!(job_id = %job.id, key = %key, "Cache hit - skipping dispatch");
                let record = self.build_success_record(
                    job,
                    def,
                    value,
                    attempt,
                    CacheInfo {
                        hit: true,
                        key: Some(key.clone()),
                    },
                );
                self.persist(&record).await;
                self.fabric.mark_completed(&job.id, queue_name);
                return Ok(());
            }
        }

        let value = self.dispatch(job, def).await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if cacheable {
            self.cache.record_response_time(elapsed_ms);
        }
        if let Some(key) = &key {
            self.cache
                .set(key, value.clone(), cache::ttl_for_path(&job.normalized_path));
        }

        let record = self.build_success_record(
            job,
            def,
            value,
            attempt,
            CacheInfo {
                hit: false,
                key,
            },
        );
        self.persist(&record).await;
        self.fabric.mark_completed(&job.id, queue_name);

        info!(
            job_id = %job.id,
            queue = %queue_name,
            worker = %worker_id,
            elapsed_ms = elapsed_ms,
            "Job completed"
        );
        Ok(())
    }

    /// The bus round-trip, bounded by the queue's job timeout.
    async fn dispatch(
        &self,
        job: &Job,
        def: &QueueDefinition,
    ) -> std::result::Result<Value, DispatchFailure> {
        let Some(subject) = job.subject.clone() else {
            return Err(DispatchFailure {
                kind: ErrorKind::Unknown,
                message: "job has no bus subject".to_string(),
                status_code: None,
            });
        };
        let payload = job.payload.clone().unwrap_or(Value::Null);

        if subject == TEST_ECHO_SUBJECT {
            return Ok(serde_json::json!({
                "success": true,
                "echo": payload,
                "jobId": job.id,
                "processedAt": Utc::now().timestamp_millis(),
            }));
        }

        let timeout = Duration::from_millis(def.job_timeout_ms());
        let value = self
            .bus
            .request(&subject, payload, timeout)
            .await
            .map_err(|e| match e {
                BusError::Timeout { .. } => DispatchFailure::timeout(e.to_string()),
                other => DispatchFailure::exception(other.to_string()),
            })?;

        // A structured error from the bus peer fails the job even though the
        // transport succeeded.
        if let Some(failure) = classify_peer_error(&value) {
            return Err(failure);
        }

        Ok(value)
    }

    /// Worker-side bookkeeping for a non-terminal failure: the job goes back
    /// to the delayed set, so its visible status returns to queued.
    pub fn note_retry(&self, job: &Job, def: &QueueDefinition, failure: &DispatchFailure, attempt: u32) {
        warn!(
            job_id = %job.id,
            queue = %def.name,
            attempt = attempt,
            max_attempts = def.attempts,
            kind = ?failure.kind,
            error = %failure.message,
            "Attempt failed - scheduling retry"
        );
        self.fabric.mark_queued(&job.id, &def.name);
    }

    /// Terminal failure: write the failed record (per-id and history) and
    /// push the final status.
    pub async fn record_failure(
        &self,
        job: &Job,
        def: &QueueDefinition,
        failure: &DispatchFailure,
        attempts_made: u32,
    ) {
        error!(
            job_id = %job.id,
            queue = %def.name,
            attempts = attempts_made,
            kind = ?failure.kind,
            error = %failure.message,
            "Job failed terminally"
        );

        let record = JobResultRecord {
            job_id: job.id.clone(),
            queue_name: def.name.clone(),
            verb: job.verb,
            url: job.raw_url.clone(),
            status: JobStatus::Failed,
            success: false,
            status_code: failure.status_code,
            body: None,
            headers: None,
            request_body: job.body.clone(),
            query: job.query_params.clone(),
            cache: CacheInfo::default(),
            error: Some(ErrorInfo {
                kind: failure.kind,
                message: failure.message.clone(),
                status_code: failure.status_code,
                stack: None,
            }),
            attempts_made,
            finished_at: Utc::now().timestamp_millis(),
            worker_id: job.worker_id.clone(),
            result: None,
        };

        self.persist(&record).await;
        self.fabric.mark_failed(&job.id, &def.name);
    }

    /// Completion follow-up: re-read the persisted record and re-emit the
    /// completed status. Harmless because the fabric is timestamp-monotonic.
    pub async fn reemit_completion(&self, job_id: &str, queue_name: &str) {
        match self.results.get(job_id).await {
            Ok(Some(_)) => self.fabric.mark_completed(job_id, queue_name),
            Ok(None) => {}
            Err(e) => debug!(job_id = %job_id, error = %e, "Completion follow-up read failed"),
        }
    }

    fn build_success_record(
        &self,
        job: &Job,
        def: &QueueDefinition,
        value: Value,
        attempts_made: u32,
        cache_info: CacheInfo,
    ) -> JobResultRecord {
        let status_code = value
            .get("statusCode")
            .and_then(|v| v.as_u64())
            .map(|v| v as u16)
            .unwrap_or(200);

        JobResultRecord {
            job_id: job.id.clone(),
            queue_name: def.name.clone(),
            verb: job.verb,
            url: job.raw_url.clone(),
            status: JobStatus::Completed,
            success: true,
            status_code: Some(status_code),
            body: Some(value.clone()),
            headers: None,
            request_body: job.body.clone(),
            query: job.query_params.clone(),
            cache: cache_info,
            error: None,
            attempts_made,
            finished_at: Utc::now().timestamp_millis(),
            worker_id: job.worker_id.clone(),
            result: Some(value),
        }
    }

    /// Persistence failures are logged and swallowed: the status fabric and
    /// the broker still know the outcome.
    async fn persist(&self, record: &JobResultRecord) {
        if let Err(e) = self.results.save(record).await {
            error!(job_id = %record.job_id, error = %e, "Failed to persist job result");
        }
    }
}

/// Detect a structured error reply from the bus peer: an explicit error
/// object, or a 4xx/5xx `statusCode`.
fn classify_peer_error(value: &Value) -> Option<DispatchFailure> {
    let status_code = value
        .get("statusCode")
        .and_then(|v| v.as_u64())
        .map(|v| v as u16);

    if let Some(code) = status_code {
        if code >= 400 {
            let message = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("downstream error")
                .to_string();
            return Some(DispatchFailure::http(code, message));
        }
    }

    if let Some(err) = value.get("error") {
        if !err.is_null() {
            let code = err
                .get("statusCode")
                .and_then(|v| v.as_u64())
                .map(|v| v as u16);
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .or_else(|| err.as_str())
                .unwrap_or("downstream error")
                .to_string();
            return Some(match code {
                Some(code) => DispatchFailure::http(code, message),
                None => DispatchFailure::exception(message),
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn peer_error_classification() {
        assert!(classify_peer_error(&json!({"ok": true})).is_none());
        assert!(classify_peer_error(&json!({"statusCode": 201})).is_none());

        let failure = classify_peer_error(&json!({"statusCode": 404, "message": "not found"}))
            .expect("http error");
        assert_eq!(failure.kind, ErrorKind::Http);
        assert_eq!(failure.status_code, Some(404));

        let failure = classify_peer_error(&json!({"error": {"message": "boom"}}))
            .expect("exception error");
        assert_eq!(failure.kind, ErrorKind::Exception);

        let failure = classify_peer_error(&json!({"error": {"statusCode": 502, "message": "bad"}}))
            .expect("http error");
        assert_eq!(failure.status_code, Some(502));
    }
}
