//! InterceptionPipeline - the fail-open HTTP entry point
//!
//! Every domain request lands here. Admissible requests are frozen into a
//! job, routed onto a queue and answered with an immediate `202 Accepted`
//! bearing the job id. Anything else - queue system disabled, excluded path,
//! no routing rule, missing field, unavailable queue, or any error along the
//! way - falls back to the synchronous dispatcher. The client is never
//! denied service because of the queue.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cg_bus::{BusClient, BusError};
use cg_common::{normalize_path, Job, Verb};
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::AuthResolverChain;
use crate::idempotency::{IdempotencyOutcome, IdempotencyService};
use crate::queue_router::QueueRouter;
use crate::registry::QueueRegistry;
use crate::routing::{Resolution, RoutingError, RoutingTable};
use crate::status::StatusFabric;

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// Paths never intercepted regardless of configuration.
const BUILT_IN_EXCLUSIONS: &[&str] = &[
    "/queues",
    "/admin",
    "/queue-control",
    "/health",
    "/metrics",
    "/monitoring",
    "/jobs",
    "/ws",
    "/internal",
    "/static",
];

const MAX_BODY_BYTES: usize = 1024 * 1024;

// ============================================================================
// Queue Control
// ============================================================================

/// Global interception switch plus the runtime-editable exclusion list.
pub struct QueueControl {
    enabled: AtomicBool,
    exclusions: RwLock<Vec<String>>,
}

impl QueueControl {
    pub fn new(enabled: bool, configured_exclusions: Vec<String>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            exclusions: RwLock::new(configured_exclusions),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        BUILT_IN_EXCLUSIONS
            .iter()
            .any(|prefix| path.starts_with(prefix))
            || self
                .exclusions
                .read()
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn exclusions(&self) -> Vec<String> {
        self.exclusions.read().clone()
    }

    pub fn add_exclusion(&self, prefix: String) {
        let mut exclusions = self.exclusions.write();
        if !exclusions.contains(&prefix) {
            exclusions.push(prefix);
        }
    }

    pub fn remove_exclusion(&self, prefix: &str) -> bool {
        let mut exclusions = self.exclusions.write();
        let before = exclusions.len();
        exclusions.retain(|p| p != prefix);
        exclusions.len() != before
    }
}

// ============================================================================
// Synchronous fallback dispatcher
// ============================================================================

/// Bus-only synchronous handler. There is no HTTP loopback: requests the
/// queue cannot take still go straight to the downstream service over the
/// bus, and unroutable requests get their terminal status here.
pub struct SyncDispatcher {
    routing: Arc<RoutingTable>,
    bus: Arc<dyn BusClient>,
    request_timeout: Duration,
}

impl SyncDispatcher {
    pub fn new(
        routing: Arc<RoutingTable>,
        bus: Arc<dyn BusClient>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            routing,
            bus,
            request_timeout,
        }
    }

    pub async fn forward(&self, mut job: Job) -> Response {
        match self.routing.resolve(&mut job) {
            Ok(Some(resolution)) => self.dispatch(&job, resolution).await,
            Ok(None) => error_response(
                StatusCode::NOT_FOUND,
                &format!("Cannot {} {}", job.verb, job.normalized_path),
            ),
            Err(RoutingError::MissingField(field)) => error_response(
                StatusCode::BAD_REQUEST,
                &format!("Missing required field: {}", field),
            ),
        }
    }

    async fn dispatch(&self, job: &Job, resolution: Resolution) -> Response {
        debug!(
            job_id = %job.id,
            subject = %resolution.subject,
            "Synchronous bus dispatch"
        );
        match self
            .bus
            .request(&resolution.subject, resolution.payload, self.request_timeout)
            .await
        {
            Ok(value) => {
                let status = value
                    .get("statusCode")
                    .and_then(|v| v.as_u64())
                    .and_then(|code| StatusCode::from_u16(code as u16).ok())
                    .unwrap_or(StatusCode::OK);
                (status, Json(value)).into_response()
            }
            Err(BusError::Timeout { .. }) => error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Downstream service did not respond in time",
            ),
            Err(e) => {
                warn!(subject = %resolution.subject, error = %e, "Synchronous dispatch failed");
                error_response(StatusCode::BAD_GATEWAY, "Downstream service unavailable")
            }
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "statusCode": status.as_u16(),
            "message": message,
            "timestamp": Utc::now().timestamp_millis(),
        })),
    )
        .into_response()
}

// ============================================================================
// Interception pipeline
// ============================================================================

pub struct InterceptionPipeline {
    routing: Arc<RoutingTable>,
    registry: Arc<QueueRegistry>,
    queue_router: Arc<QueueRouter>,
    fabric: Arc<StatusFabric>,
    idempotency: Arc<dyn IdempotencyService>,
    control: Arc<QueueControl>,
    sync: Arc<SyncDispatcher>,
    auth_chain: AuthResolverChain,
}

impl InterceptionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        routing: Arc<RoutingTable>,
        registry: Arc<QueueRegistry>,
        queue_router: Arc<QueueRouter>,
        fabric: Arc<StatusFabric>,
        idempotency: Arc<dyn IdempotencyService>,
        control: Arc<QueueControl>,
        sync: Arc<SyncDispatcher>,
    ) -> Self {
        Self {
            routing,
            registry,
            queue_router,
            fabric,
            idempotency,
            control,
            sync,
            auth_chain: AuthResolverChain::standard(),
        }
    }

    pub fn control(&self) -> &Arc<QueueControl> {
        &self.control
    }

    /// The top-level handler for every non-gateway route.
    pub async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();

        let Some(verb) = Verb::parse(parts.method.as_str()) else {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        };

        let body_value = if verb.has_body() {
            read_json_body(body).await
        } else {
            None
        };

        let job = self.build_job(verb, &parts.uri, &parts.headers, body_value);

        if !self.control.is_enabled() {
            debug!(path = %job.normalized_path, "Queue system disabled - forwarding synchronously");
            return self.sync.forward(job).await;
        }
        if self.control.is_excluded(&job.normalized_path) {
            return self.sync.forward(job).await;
        }

        match self.try_enqueue(job.clone()).await {
            Ok(response) => response,
            Err(fallback) => {
                match &fallback {
                    FallbackReason::NoRoute => {
                        info!(verb = %job.verb, path = %job.normalized_path, "No routing rule - synchronous fallback");
                    }
                    FallbackReason::MissingField(field) => {
                        info!(field = %field, path = %job.normalized_path, "Payload field missing - synchronous fallback");
                    }
                    FallbackReason::QueueUnavailable(queue) => {
                        warn!(queue = %queue, path = %job.normalized_path, "Queue unavailable - synchronous fallback");
                    }
                }
                self.sync.forward(job).await
            }
        }
    }

    async fn try_enqueue(
        &self,
        mut job: Job,
    ) -> std::result::Result<Response, FallbackReason> {
        let resolution = match self.routing.resolve(&mut job) {
            Ok(Some(resolution)) => resolution,
            Ok(None) => return Err(FallbackReason::NoRoute),
            Err(RoutingError::MissingField(field)) => {
                return Err(FallbackReason::MissingField(field))
            }
        };

        // Idempotent operations short-circuit to the stored acceptance.
        let idempotency_key = job.headers.get(IDEMPOTENCY_HEADER).cloned();
        if let Some(key) = &idempotency_key {
            if let IdempotencyOutcome::Replayed(mut stored) = self.idempotency.begin(key).await {
                if let Some(info) = stored.get_mut("idempotency") {
                    info["isNew"] = json!(false);
                }
                debug!(key = %key, "Replaying idempotent acceptance");
                return Ok((StatusCode::ACCEPTED, Json(stored)).into_response());
            }
        }

        let result = self
            .enqueue_resolved(&mut job, resolution, idempotency_key.as_deref())
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(reason) => {
                if let Some(key) = &idempotency_key {
                    self.idempotency.abandon(key);
                }
                Err(reason)
            }
        }
    }

    async fn enqueue_resolved(
        &self,
        job: &mut Job,
        resolution: Resolution,
        idempotency_key: Option<&str>,
    ) -> std::result::Result<Response, FallbackReason> {
        // Subject and payload are attached exactly once, right before
        // enqueue; from here on they are immutable.
        job.subject = Some(resolution.subject.clone());
        job.payload = Some(resolution.payload);

        let queue_name = self.queue_router.choose_queue(&job.normalized_path).await;
        let counts = self
            .registry
            .handle(&queue_name)
            .await
            .map(|q| q.counts())
            .unwrap_or_default();

        let def = match self.registry.enqueue(&queue_name, job.clone()).await {
            Ok(def) => def,
            Err(e) => {
                warn!(queue = %queue_name, error = %e, "Enqueue failed");
                return Err(FallbackReason::QueueUnavailable(queue_name));
            }
        };

        self.fabric.mark_queued(&job.id, &queue_name);

        let mut accepted = json!({
            "jobId": job.id,
            "status": "queued",
            "queueType": queue_name,
            "checkStatusUrl": format!("/queues/job/{}/status", job.id),
            "estimatedTime": estimate_wait(counts.load(), &def),
            "metadata": {
                "priority": def.priority,
                "timeout": def.job_timeout_ms(),
                "retryCount": 0,
            },
            "timestamp": Utc::now().timestamp_millis(),
        });

        if let Some(key) = idempotency_key {
            accepted["idempotency"] = json!({"isNew": true, "key": key});
            self.idempotency.complete(key, accepted.clone());
        }

        info!(
            job_id = %job.id,
            verb = %job.verb,
            path = %job.normalized_path,
            queue = %queue_name,
            subject = %job.subject.as_deref().unwrap_or_default(),
            "Request accepted as job"
        );

        Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
    }

    fn build_job(
        &self,
        verb: Verb,
        uri: &axum::http::Uri,
        header_map: &HeaderMap,
        body: Option<Value>,
    ) -> Job {
        let headers = flatten_headers(header_map);
        let context = self.auth_chain.resolve(&headers);
        let client_ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| headers.get("x-real-ip").cloned())
            .unwrap_or_else(|| "unknown".to_string());

        Job {
            id: Job::generate_id(),
            verb,
            normalized_path: normalize_path(uri.path()),
            raw_url: uri.to_string(),
            body,
            query_params: parse_query(uri.query()),
            route_params: HashMap::new(),
            headers,
            user_id: context.user_id.clone(),
            client_ip,
            created_at: Utc::now().timestamp_millis(),
            context: context.claims,
            subject: None,
            payload: None,
            attempts: 0,
            queue_name: None,
            worker_id: None,
        }
    }
}

enum FallbackReason {
    NoRoute,
    MissingField(String),
    QueueUnavailable(String),
}

/// Rough wait estimate surfaced on the acceptance response.
fn estimate_wait(load: u64, def: &cg_common::QueueDefinition) -> String {
    let parallelism = (def.workers.max(1) * def.concurrency.max(1)) as u64;
    let rounds = load / parallelism + 1;
    let seconds = rounds * def.timeout_secs.max(1) / 2;
    format!("~{}s", seconds.clamp(1, 600))
}

/// Lower-case header keys; repeated headers join with `", "`.
fn flatten_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in header_map {
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

/// Query parameters in arrival order, every value kept.
fn parse_query(query: Option<&str>) -> IndexMap<String, Vec<String>> {
    let mut params: IndexMap<String, Vec<String>> = IndexMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        params
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
    params
}

async fn read_json_body(body: Body) -> Option<Value> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await.ok()?;
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_exclusions_cover_gateway_surfaces() {
        let control = QueueControl::new(true, vec![]);
        assert!(control.is_excluded("/queues/job/x/status"));
        assert!(control.is_excluded("/admin/queues"));
        assert!(control.is_excluded("/health"));
        assert!(!control.is_excluded("/courses"));
    }

    #[test]
    fn configured_exclusions_are_editable() {
        let control = QueueControl::new(true, vec!["/legacy".to_string()]);
        assert!(control.is_excluded("/legacy/thing"));

        control.add_exclusion("/beta".to_string());
        assert!(control.is_excluded("/beta/x"));

        assert!(control.remove_exclusion("/beta"));
        assert!(!control.is_excluded("/beta/x"));
        assert!(!control.remove_exclusion("/beta"));
    }

    #[test]
    fn toggle_flips_the_switch() {
        let control = QueueControl::new(true, vec![]);
        assert!(!control.toggle());
        assert!(!control.is_enabled());
        assert!(control.toggle());
        assert!(control.is_enabled());
    }

    #[test]
    fn query_parsing_keeps_order_and_repeats() {
        let params = parse_query(Some("b=2&a=1&b=3&flag"));
        assert_eq!(params["b"], vec!["2".to_string(), "3".to_string()]);
        assert_eq!(params["a"], vec!["1".to_string()]);
        assert_eq!(params["flag"], vec!["".to_string()]);
        let keys: Vec<&String> = params.keys().collect();
        assert_eq!(keys[0], "b");
    }

    #[test]
    fn estimate_is_bounded() {
        let def = cg_common::QueueDefinition::new("q");
        let estimate = estimate_wait(0, &def);
        assert!(estimate.starts_with('~') && estimate.ends_with('s'));
        let estimate = estimate_wait(1_000_000, &def);
        assert_eq!(estimate, "~600s");
    }
}
