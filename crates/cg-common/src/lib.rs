use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Job Types
// ============================================================================

/// HTTP verbs the gateway intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Verb {
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
}

impl Verb {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Verb::GET),
            "POST" => Some(Verb::POST),
            "PUT" => Some(Verb::PUT),
            "PATCH" => Some(Verb::PATCH),
            "DELETE" => Some(Verb::DELETE),
            _ => None,
        }
    }

    /// Write methods carry a JSON body; read methods do not.
    pub fn has_body(&self) -> bool {
        matches!(self, Verb::POST | Verb::PUT | Verb::PATCH)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::GET => "GET",
            Verb::POST => "POST",
            Verb::PUT => "PUT",
            Verb::PATCH => "PATCH",
            Verb::DELETE => "DELETE",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured HTTP request frozen as a message with routing metadata.
///
/// Created by the interception pipeline, consumed by queue workers. `subject`
/// and `payload` are attached exactly once, immediately before enqueue; after
/// that `id`, `verb`, `normalized_path` and `subject` never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub verb: Verb,
    /// Path without query string, lower-cased, no trailing slash.
    pub normalized_path: String,
    pub raw_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Query parameters in arrival order; repeated keys keep every value.
    #[serde(default)]
    pub query_params: IndexMap<String, Vec<String>>,
    /// Parameters bound by the matching path template.
    #[serde(default)]
    pub route_params: HashMap<String, String>,
    /// Headers with lower-cased keys.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Best-effort subject from the bearer token payload. Never validated here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub client_ip: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Sidecar context, carrying at least the validated auth payload when a
    /// guard populated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Message-bus subject resolved by the routing table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Payload shape resolved by the routing rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    /// Set when a worker takes the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Job {
    /// Generate a time-lexicographic job id: `yyyymmddHHMMSS` plus six random
    /// base36 characters.
    pub fn generate_id() -> String {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        use rand::Rng;
        let mut rng = rand::rng();
        let suffix: String = (0..6)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        format!("{}{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
    }
}

/// Normalize a request path: strip the query string, force a leading slash,
/// lower-case, and trim trailing slashes (a lone root stays `/`).
pub fn normalize_path(path: &str) -> String {
    let without_query = path.split('?').next().unwrap_or("");
    let mut p = if without_query.starts_with('/') {
        without_query.to_string()
    } else {
        format!("/{}", without_query)
    };
    p = p.to_lowercase();
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

// ============================================================================
// Queue Configuration
// ============================================================================

/// Definition of one named priority queue.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueDefinition {
    /// Globally unique queue name.
    pub name: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
    /// Higher wins when load ties.
    #[serde(default)]
    pub priority: i32,
    /// Per-job processing timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum delivery attempts (including the first).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Base retry delay in milliseconds (doubles per attempt).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// In-flight jobs each worker may run in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Worker group size for this queue.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Exact paths or `/prefix/*` wildcards this queue admits.
    #[serde(default)]
    pub url_patterns: Vec<String>,
    /// Artificial delay before processing each job, in milliseconds.
    #[serde(default)]
    pub processing_delay_ms: u64,
    /// Retention cap for completed jobs.
    #[serde(default = "default_keep")]
    pub keep_completed: usize,
    /// Retention cap for failed jobs.
    #[serde(default = "default_keep")]
    pub keep_failed: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_concurrency() -> u32 {
    5
}
fn default_workers() -> u32 {
    1
}
fn default_keep() -> usize {
    100
}
fn default_enabled() -> bool {
    true
}

impl QueueDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            label: String::new(),
            priority: 0,
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            concurrency: default_concurrency(),
            workers: default_workers(),
            url_patterns: Vec::new(),
            processing_delay_ms: 0,
            keep_completed: default_keep(),
            keep_failed: default_keep(),
            enabled: true,
        }
    }

    pub fn job_timeout_ms(&self) -> u64 {
        (self.timeout_secs * 1000).max(1)
    }
}

/// Partial update applied to a queue definition by the admin API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueDefinitionPatch {
    pub label: Option<String>,
    pub priority: Option<i32>,
    pub timeout_secs: Option<u64>,
    pub attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub concurrency: Option<u32>,
    pub workers: Option<u32>,
    pub url_patterns: Option<Vec<String>>,
    pub processing_delay_ms: Option<u64>,
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
    pub enabled: Option<bool>,
}

impl QueueDefinitionPatch {
    /// Whether this patch touches a field bound at broker-queue construction.
    pub fn requires_rebuild(&self) -> bool {
        self.priority.is_some()
            || self.timeout_secs.is_some()
            || self.attempts.is_some()
            || self.retry_delay_ms.is_some()
            || self.keep_completed.is_some()
            || self.keep_failed.is_some()
    }

    pub fn apply(&self, def: &mut QueueDefinition) {
        if let Some(v) = &self.label {
            def.label = v.clone();
        }
        if let Some(v) = self.priority {
            def.priority = v;
        }
        if let Some(v) = self.timeout_secs {
            def.timeout_secs = v;
        }
        if let Some(v) = self.attempts {
            def.attempts = v;
        }
        if let Some(v) = self.retry_delay_ms {
            def.retry_delay_ms = v;
        }
        if let Some(v) = self.concurrency {
            def.concurrency = v.max(1);
        }
        if let Some(v) = self.workers {
            def.workers = v;
        }
        if let Some(v) = &self.url_patterns {
            def.url_patterns = v.clone();
        }
        if let Some(v) = self.processing_delay_ms {
            def.processing_delay_ms = v;
        }
        if let Some(v) = self.keep_completed {
            def.keep_completed = v;
        }
        if let Some(v) = self.keep_failed {
            def.keep_failed = v;
        }
        if let Some(v) = self.enabled {
            def.enabled = v;
        }
    }
}

/// The full persisted queue-system configuration. The in-memory copy inside
/// the registry is the authoritative live state; this JSON shape is what goes
/// under the `queues:config` key.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueSystemConfig {
    pub queues: Vec<QueueDefinition>,
    pub default_queue: String,
    /// Global job TTL in seconds.
    pub job_ttl_secs: u64,
    /// Poll endpoint long-poll budget in seconds.
    pub polling_timeout_secs: u64,
}

impl Default for QueueSystemConfig {
    fn default() -> Self {
        let mut critical = QueueDefinition::new("critical");
        critical.label = "Critical operations".to_string();
        critical.priority = 10;
        critical.timeout_secs = 20;
        critical.workers = 2;
        critical.url_patterns = vec![
            "/auth/*".to_string(),
            "/atomic-enrollment/*".to_string(),
        ];

        let mut standard = QueueDefinition::new("standard");
        standard.label = "Standard operations".to_string();
        standard.priority = 5;

        let mut background = QueueDefinition::new("background");
        background.label = "Background operations".to_string();
        background.priority = 1;
        background.timeout_secs = 120;
        background.url_patterns = vec![
            "/reports/*".to_string(),
            "/statistics/*".to_string(),
        ];

        Self {
            queues: vec![critical, standard, background],
            default_queue: "standard".to_string(),
            job_ttl_secs: 3600,
            polling_timeout_secs: 30,
        }
    }
}

impl QueueSystemConfig {
    pub fn get(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// Change event published on the config channel after every mutation, so
/// other gateway instances reload from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChangeEvent {
    /// Mutation kind: `created`, `updated`, `removed`, `workers`, `reloaded`.
    #[serde(rename = "type")]
    pub kind: String,
    pub queue_name: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Originating gateway instance, so receivers can skip their own events.
    pub instance_id: String,
}

// ============================================================================
// Job Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Progress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Progress => "progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single status observation for a job. A newer timestamp strictly
/// supersedes an older one for the same job id.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    pub queue_name: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl JobStatusUpdate {
    pub fn now(job_id: &str, status: JobStatus, queue_name: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            progress: None,
            estimated_time_remaining: None,
            queue_name: queue_name.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// ============================================================================
// Job Results
// ============================================================================

/// Error classification for a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Deadline breach.
    Timeout,
    /// Downstream returned a non-2xx/3xx status.
    Http,
    /// General throw, including a normalized stack.
    Exception,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Cache metadata carried on a result record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Terminal outcome of a job, persisted per id and on the rolling history
/// lists.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobResultRecord {
    pub job_id: String,
    pub queue_name: String,
    pub verb: Verb,
    pub url: String,
    pub status: JobStatus,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
    #[serde(default)]
    pub query: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub cache: CacheInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub attempts_made: u32,
    /// Epoch milliseconds.
    pub finished_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// The raw result returned by the bus peer (or the cached copy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_strips_query_and_trailing_slash() {
        assert_eq!(normalize_path("/Courses/?page=1"), "/courses");
        assert_eq!(normalize_path("courses"), "/courses");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//"), "/");
        assert_eq!(normalize_path("/a/b/"), "/a/b");
    }

    #[test]
    fn job_ids_are_time_lexicographic() {
        let id = Job::generate_id();
        assert_eq!(id.len(), 20);
        assert!(id[..14].chars().all(|c| c.is_ascii_digit()));
        assert!(id[14..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn patch_detects_rebuild_fields() {
        let patch = QueueDefinitionPatch {
            priority: Some(7),
            ..Default::default()
        };
        assert!(patch.requires_rebuild());

        let patch = QueueDefinitionPatch {
            workers: Some(3),
            url_patterns: Some(vec!["/vip/*".to_string()]),
            ..Default::default()
        };
        assert!(!patch.requires_rebuild());
    }

    #[test]
    fn patch_clamps_concurrency() {
        let mut def = QueueDefinition::new("q");
        let patch = QueueDefinitionPatch {
            concurrency: Some(0),
            ..Default::default()
        };
        patch.apply(&mut def);
        assert_eq!(def.concurrency, 1);
    }

    #[test]
    fn default_config_has_default_queue() {
        let cfg = QueueSystemConfig::default();
        assert!(cfg.get(&cfg.default_queue).is_some());
    }

    #[test]
    fn status_updates_serialize_camel_case() {
        let update = JobStatusUpdate::now("j1", JobStatus::Queued, "standard");
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["queueName"], "standard");
    }
}
