//! Request/response DTOs for the gateway HTTP API.

use cg_common::{ErrorInfo, JobResultRecord, JobStatusUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Poll response: live status fabric state plus the persisted result when
/// the job reached a terminal state.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// The captured request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Raw result duplicate, kept for legacy pollers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returnvalue: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<i64>,
}

impl JobStatusResponse {
    pub fn from_parts(
        job_id: &str,
        status: Option<JobStatusUpdate>,
        record: Option<JobResultRecord>,
    ) -> Option<Self> {
        if status.is_none() && record.is_none() {
            return None;
        }

        let status_str = status
            .as_ref()
            .map(|s| s.status.to_string())
            .or_else(|| record.as_ref().map(|r| r.status.to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        let queue_name = status
            .as_ref()
            .map(|s| s.queue_name.clone())
            .or_else(|| record.as_ref().map(|r| r.queue_name.clone()));

        let record_ref = record.as_ref();
        Some(Self {
            id: job_id.to_string(),
            queue_name,
            status: status_str,
            progress: status.as_ref().and_then(|s| s.progress),
            data: record_ref.and_then(|r| r.request_body.clone()),
            result: record_ref.and_then(|r| r.result.clone()),
            error: record_ref.and_then(|r| r.error.clone()),
            returnvalue: record_ref.and_then(|r| r.result.clone()),
            failed_reason: record_ref
                .and_then(|r| r.error.as_ref())
                .map(|e| e.message.clone()),
            processed_on: status.as_ref().map(|s| s.timestamp),
            finished_on: record_ref.map(|r| r.finished_at),
        })
    }
}

/// Batch poll query: comma-separated job ids, capped at 50.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchStatusQuery {
    pub ids: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
    pub processing: usize,
    pub not_found: usize,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusResponse {
    pub summary: BatchStatusSummary,
    pub jobs: Vec<JobStatusResponse>,
}

/// History query: `limit` clamps to [1, 500], default 50.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub queue: Option<String>,
}

impl HistoryQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueDetailResponse {
    #[serde(flatten)]
    pub definition: cg_common::QueueDefinition,
    pub counts: crate::broker::QueueCounts,
    pub active_workers: usize,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerActionResponse {
    pub queue: String,
    pub workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueControlStatusResponse {
    pub enabled: bool,
    pub exclusions: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExclusionRequest {
    pub prefix: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExclusionQuery {
    pub prefix: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealthEntry {
    pub queue: String,
    pub enabled: bool,
    pub counts: crate::broker::QueueCounts,
    pub workers: usize,
    pub configured_workers: u32,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    /// UP or DEGRADED.
    pub status: String,
    pub store_reachable: bool,
    pub bus_connected: bool,
    pub queues: Vec<QueueHealthEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status_code: u16,
    pub message: String,
}
