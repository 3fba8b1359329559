//! Gateway HTTP API
//!
//! HTTP endpoints for:
//! - Job polling (single, batch) and result history
//! - Queue administration (CRUD, worker control, health)
//! - Queue-control (global switch and exclusion list)
//! - The WebSocket push channel
//! - The interception fallback that turns every other request into a job

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cg_bus::BusClient;
use cg_common::{JobStatus, QueueDefinition, QueueDefinitionPatch};
use cg_store::KvStore;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod model;
pub mod ws;

use crate::cache::ResponseCache;
use crate::intercept::{InterceptionPipeline, QueueControl};
use crate::registry::QueueRegistry;
use crate::results::ResultRepository;
use crate::status::StatusFabric;
use crate::worker::WorkerPool;
use crate::GatewayError;
use model::{
    BatchStatusQuery, BatchStatusResponse, BatchStatusSummary, ErrorBody, ExclusionQuery,
    ExclusionRequest, HealthCheckResponse, HistoryQuery, JobStatusResponse,
    QueueControlStatusResponse, QueueDetailResponse, QueueHealthEntry, WorkerActionResponse,
};

const BATCH_POLL_CAP: usize = 50;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<InterceptionPipeline>,
    pub registry: Arc<QueueRegistry>,
    pub worker_pool: Arc<WorkerPool>,
    pub fabric: Arc<StatusFabric>,
    pub results: Arc<ResultRepository>,
    pub cache: Arc<dyn ResponseCache>,
    pub control: Arc<QueueControl>,
    pub store: Arc<dyn KvStore>,
    pub bus: Arc<dyn BusClient>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Campusgate API",
        version = "0.1.0",
        description = "Asynchronous request gateway: job polling, history, queue administration and control"
    ),
    paths(
        job_status_handler,
        batch_status_handler,
        success_history_handler,
        failure_history_handler,
        create_queue_handler,
        list_queues_handler,
        get_queue_handler,
        update_queue_handler,
        delete_queue_handler,
        workers_status_handler,
        pause_all_handler,
        resume_all_handler,
        pause_queue_handler,
        resume_queue_handler,
        add_worker_handler,
        remove_worker_handler,
        queue_health_handler,
        cache_metrics_handler,
        cache_metrics_reset_handler,
        queue_control_status_handler,
        queue_control_enable_handler,
        queue_control_disable_handler,
        queue_control_toggle_handler,
        list_exclusions_handler,
        add_exclusion_handler,
        remove_exclusion_handler,
    ),
    components(schemas(
        JobStatusResponse,
        BatchStatusResponse,
        BatchStatusSummary,
        QueueDetailResponse,
        WorkerActionResponse,
        QueueControlStatusResponse,
        HealthCheckResponse,
        QueueHealthEntry,
        ErrorBody,
        cg_common::QueueDefinition,
        cg_common::QueueDefinitionPatch,
        crate::broker::QueueCounts,
        crate::worker::QueueWorkerStatus,
        crate::worker::WorkerStatus,
        crate::cache::CacheMetricsSnapshot,
        crate::status::StatusStatistics,
    )),
    tags(
        (name = "jobs", description = "Job polling and history"),
        (name = "admin", description = "Queue administration"),
        (name = "queue-control", description = "Interception switch and exclusions"),
    )
)]
pub struct ApiDoc;

/// Create the full gateway router. Everything not matched by a gateway
/// route falls through to the interception pipeline.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Job polling and history
        .route("/queues/job/{id}/status", get(job_status_handler))
        .route("/queues/status", get(batch_status_handler))
        .route("/queues/results/success", get(success_history_handler))
        .route("/queues/results/failure", get(failure_history_handler))
        // Queue administration
        .route("/admin/queues", post(create_queue_handler).get(list_queues_handler))
        .route(
            "/admin/queues/{name}",
            get(get_queue_handler)
                .put(update_queue_handler)
                .delete(delete_queue_handler),
        )
        // Worker control
        .route("/admin/queues/workers", get(workers_status_handler))
        .route("/admin/queues/workers/pause-all", post(pause_all_handler))
        .route("/admin/queues/workers/resume-all", post(resume_all_handler))
        .route("/admin/queues/workers/{queue}/pause", post(pause_queue_handler))
        .route("/admin/queues/workers/{queue}/resume", post(resume_queue_handler))
        .route(
            "/admin/queues/workers/{queue}",
            post(add_worker_handler).delete(remove_worker_handler),
        )
        // Health and cache metrics
        .route("/admin/queues/health/check", get(queue_health_handler))
        .route("/admin/cache/metrics", get(cache_metrics_handler))
        .route("/admin/cache/metrics/reset", post(cache_metrics_reset_handler))
        // Queue control
        .route("/queue-control/status", get(queue_control_status_handler))
        .route("/queue-control/enable", post(queue_control_enable_handler))
        .route("/queue-control/disable", post(queue_control_disable_handler))
        .route("/queue-control/toggle", post(queue_control_toggle_handler))
        .route(
            "/queue-control/exclusions",
            get(list_exclusions_handler)
                .post(add_exclusion_handler)
                .delete(remove_exclusion_handler),
        )
        // Push channel
        .route("/jobs", get(ws::jobs_ws_handler))
        // Everything else is intercepted
        .fallback(intercept_fallback)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn intercept_fallback(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> Response {
    state.pipeline.handle(request).await
}

fn error_status(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::QueueExists(_) | GatewayError::DefaultQueueRemoval(_) => StatusCode::CONFLICT,
        GatewayError::QueueNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Worker(_) | GatewayError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_json(error: GatewayError) -> Response {
    let status = error_status(&error);
    (
        status,
        Json(ErrorBody {
            status_code: status.as_u16(),
            message: error.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Job polling
// ============================================================================

/// Poll one job: live status plus the persisted result when terminal.
#[utoipa::path(
    get,
    path = "/queues/job/{id}/status",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job state", body = JobStatusResponse),
        (status = 404, description = "Unknown job", body = ErrorBody)
    )
)]
async fn job_status_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let status = state.fabric.get_status(&id);
    let record = match state.results.get(&id).await {
        Ok(record) => record,
        Err(e) => {
            warn!(job_id = %id, error = %e, "Result lookup failed during poll");
            None
        }
    };

    match JobStatusResponse::from_parts(&id, status, record) {
        Some(response) => Json(response).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "id": id,
                "status": "not_found",
                "message": "Job not found or expired",
            })),
        )
            .into_response(),
    }
}

/// Batch poll: `?ids=a,b,c`, capped at 50 ids.
#[utoipa::path(
    get,
    path = "/queues/status",
    tag = "jobs",
    params(("ids" = String, Query, description = "Comma-separated job ids (max 50)")),
    responses(
        (status = 200, description = "Summary plus per-job records", body = BatchStatusResponse),
        (status = 400, description = "Too many ids", body = ErrorBody)
    )
)]
async fn batch_status_handler(
    State(state): State<AppState>,
    Query(query): Query<BatchStatusQuery>,
) -> Response {
    let ids: Vec<&str> = query
        .ids
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    if ids.len() > BATCH_POLL_CAP {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                status_code: 400,
                message: format!("At most {} ids per batch poll", BATCH_POLL_CAP),
            }),
        )
            .into_response();
    }

    let mut jobs = Vec::with_capacity(ids.len());
    let mut summary = BatchStatusSummary {
        total: ids.len(),
        completed: 0,
        failed: 0,
        queued: 0,
        processing: 0,
        not_found: 0,
    };

    for id in ids {
        let status = state.fabric.get_status(id);
        let record = state.results.get(id).await.unwrap_or_else(|e| {
            warn!(job_id = %id, error = %e, "Result lookup failed during batch poll");
            None
        });

        match JobStatusResponse::from_parts(id, status, record) {
            Some(response) => {
                match response.status.as_str() {
                    "completed" => summary.completed += 1,
                    "failed" => summary.failed += 1,
                    "processing" | "progress" => summary.processing += 1,
                    _ => summary.queued += 1,
                }
                jobs.push(response);
            }
            None => summary.not_found += 1,
        }
    }

    Json(BatchStatusResponse { summary, jobs }).into_response()
}

/// Completed-job history, newest first.
#[utoipa::path(
    get,
    path = "/queues/results/success",
    tag = "jobs",
    params(
        ("limit" = Option<usize>, Query, description = "Clamped to [1, 500], default 50"),
        ("queue" = Option<String>, Query, description = "Filter by queue name")
    ),
    responses((status = 200, description = "History records"))
)]
async fn success_history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    history_response(&state, JobStatus::Completed, query).await
}

/// Failed-job history, newest first.
#[utoipa::path(
    get,
    path = "/queues/results/failure",
    tag = "jobs",
    params(
        ("limit" = Option<usize>, Query, description = "Clamped to [1, 500], default 50"),
        ("queue" = Option<String>, Query, description = "Filter by queue name")
    ),
    responses((status = 200, description = "History records"))
)]
async fn failure_history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    history_response(&state, JobStatus::Failed, query).await
}

async fn history_response(state: &AppState, status: JobStatus, query: HistoryQuery) -> Response {
    match state
        .results
        .history(status, query.effective_limit(), query.queue.as_deref())
        .await
    {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_json(e),
    }
}

// ============================================================================
// Queue administration
// ============================================================================

/// Create a queue.
#[utoipa::path(
    post,
    path = "/admin/queues",
    tag = "admin",
    request_body = QueueDefinition,
    responses(
        (status = 201, description = "Queue created", body = QueueDefinition),
        (status = 409, description = "Name already exists", body = ErrorBody)
    )
)]
async fn create_queue_handler(
    State(state): State<AppState>,
    Json(def): Json<QueueDefinition>,
) -> Response {
    match state.registry.create(def.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(def)).into_response(),
        Err(e) => error_json(e),
    }
}

/// List queue definitions.
#[utoipa::path(
    get,
    path = "/admin/queues",
    tag = "admin",
    responses((status = 200, description = "All queue definitions"))
)]
async fn list_queues_handler(State(state): State<AppState>) -> Response {
    Json(state.registry.list().await).into_response()
}

/// One queue with live counts and worker count.
#[utoipa::path(
    get,
    path = "/admin/queues/{name}",
    tag = "admin",
    params(("name" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Queue detail", body = QueueDetailResponse),
        (status = 404, description = "Unknown queue", body = ErrorBody)
    )
)]
async fn get_queue_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(definition) = state.registry.get(&name).await else {
        return error_json(GatewayError::QueueNotFound(name));
    };
    let counts = state
        .registry
        .handle(&name)
        .await
        .map(|q| q.counts())
        .unwrap_or_default();
    let active_workers = state.worker_pool.worker_count(&name).await;

    Json(QueueDetailResponse {
        definition,
        counts,
        active_workers,
    })
    .into_response()
}

/// Apply a partial update to a queue definition.
#[utoipa::path(
    put,
    path = "/admin/queues/{name}",
    tag = "admin",
    params(("name" = String, Path, description = "Queue name")),
    request_body = QueueDefinitionPatch,
    responses(
        (status = 200, description = "Merged definition", body = QueueDefinition),
        (status = 404, description = "Unknown queue", body = ErrorBody)
    )
)]
async fn update_queue_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<QueueDefinitionPatch>,
) -> Response {
    match state.registry.update(&name, patch).await {
        Ok(def) => Json(def).into_response(),
        Err(e) => error_json(e),
    }
}

/// Remove a queue (its broker queue is closed and its workers stopped).
#[utoipa::path(
    delete,
    path = "/admin/queues/{name}",
    tag = "admin",
    params(("name" = String, Path, description = "Queue name")),
    responses(
        (status = 204, description = "Queue removed"),
        (status = 404, description = "Unknown queue", body = ErrorBody),
        (status = 409, description = "Default queue cannot be removed", body = ErrorBody)
    )
)]
async fn delete_queue_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.remove(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_json(e),
    }
}

// ============================================================================
// Worker control
// ============================================================================

/// Worker status snapshot for every queue.
#[utoipa::path(
    get,
    path = "/admin/queues/workers",
    tag = "admin",
    responses((status = 200, description = "Per-queue worker status"))
)]
async fn workers_status_handler(State(state): State<AppState>) -> Response {
    Json(state.worker_pool.status().await).into_response()
}

/// Pause every worker; in-flight jobs finish.
#[utoipa::path(
    post,
    path = "/admin/queues/workers/pause-all",
    tag = "admin",
    responses((status = 200, description = "All workers paused"))
)]
async fn pause_all_handler(State(state): State<AppState>) -> Response {
    state.worker_pool.pause_all();
    Json(serde_json::json!({"paused": true})).into_response()
}

/// Resume every worker.
#[utoipa::path(
    post,
    path = "/admin/queues/workers/resume-all",
    tag = "admin",
    responses((status = 200, description = "All workers resumed"))
)]
async fn resume_all_handler(State(state): State<AppState>) -> Response {
    state.worker_pool.resume_all();
    Json(serde_json::json!({"paused": false})).into_response()
}

/// Pause one queue's workers.
#[utoipa::path(
    post,
    path = "/admin/queues/workers/{queue}/pause",
    tag = "admin",
    params(("queue" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Queue paused"),
        (status = 404, description = "Unknown queue", body = ErrorBody)
    )
)]
async fn pause_queue_handler(State(state): State<AppState>, Path(queue): Path<String>) -> Response {
    match state.worker_pool.pause_queue(&queue).await {
        Ok(()) => Json(serde_json::json!({"queue": queue, "paused": true})).into_response(),
        Err(e) => error_json(e),
    }
}

/// Resume one queue's workers.
#[utoipa::path(
    post,
    path = "/admin/queues/workers/{queue}/resume",
    tag = "admin",
    params(("queue" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Queue resumed"),
        (status = 404, description = "Unknown queue", body = ErrorBody)
    )
)]
async fn resume_queue_handler(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Response {
    match state.worker_pool.resume_queue(&queue).await {
        Ok(()) => Json(serde_json::json!({"queue": queue, "paused": false})).into_response(),
        Err(e) => error_json(e),
    }
}

/// Add one worker to a queue.
#[utoipa::path(
    post,
    path = "/admin/queues/workers/{queue}",
    tag = "admin",
    params(("queue" = String, Path, description = "Queue name")),
    responses(
        (status = 201, description = "Worker added", body = WorkerActionResponse),
        (status = 400, description = "Worker cap reached", body = ErrorBody),
        (status = 404, description = "Unknown queue", body = ErrorBody)
    )
)]
async fn add_worker_handler(State(state): State<AppState>, Path(queue): Path<String>) -> Response {
    match state.worker_pool.add_worker(&queue).await {
        Ok(worker_id) => {
            let workers = state.worker_pool.worker_count(&queue).await;
            (
                StatusCode::CREATED,
                Json(WorkerActionResponse {
                    queue,
                    workers,
                    worker_id: Some(worker_id),
                }),
            )
                .into_response()
        }
        Err(e) => error_json(e),
    }
}

/// Remove the most-recently-added worker from a queue.
#[utoipa::path(
    delete,
    path = "/admin/queues/workers/{queue}",
    tag = "admin",
    params(("queue" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Worker removed", body = WorkerActionResponse),
        (status = 400, description = "No workers to remove", body = ErrorBody),
        (status = 404, description = "Unknown queue", body = ErrorBody)
    )
)]
async fn remove_worker_handler(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Response {
    match state.worker_pool.remove_worker(&queue).await {
        Ok(()) => {
            let workers = state.worker_pool.worker_count(&queue).await;
            Json(WorkerActionResponse {
                queue,
                workers,
                worker_id: None,
            })
            .into_response()
        }
        Err(e) => error_json(e),
    }
}

// ============================================================================
// Health and cache
// ============================================================================

/// Queue-system health: store reachability, bus connection, per-queue counts
/// and worker totals.
#[utoipa::path(
    get,
    path = "/admin/queues/health/check",
    tag = "admin",
    responses((status = 200, description = "Health report", body = HealthCheckResponse))
)]
async fn queue_health_handler(State(state): State<AppState>) -> Response {
    let store_reachable = state.store.ping().await;
    let bus_connected = state.bus.is_connected();

    let mut queues = Vec::new();
    for def in state.registry.list().await {
        let counts = state
            .registry
            .handle(&def.name)
            .await
            .map(|q| q.counts())
            .unwrap_or_default();
        let workers = state.worker_pool.worker_count(&def.name).await;
        queues.push(QueueHealthEntry {
            queue: def.name.clone(),
            enabled: def.enabled,
            counts,
            workers,
            configured_workers: def.workers,
        });
    }

    let status = if store_reachable && bus_connected {
        "UP"
    } else {
        "DEGRADED"
    };

    Json(HealthCheckResponse {
        status: status.to_string(),
        store_reachable,
        bus_connected,
        queues,
    })
    .into_response()
}

/// Response-cache metrics.
#[utoipa::path(
    get,
    path = "/admin/cache/metrics",
    tag = "admin",
    responses((status = 200, description = "Cache metrics", body = crate::cache::CacheMetricsSnapshot))
)]
async fn cache_metrics_handler(State(state): State<AppState>) -> Response {
    Json(state.cache.metrics()).into_response()
}

/// Reset the cache counters (entries are kept).
#[utoipa::path(
    post,
    path = "/admin/cache/metrics/reset",
    tag = "admin",
    responses((status = 200, description = "Counters reset"))
)]
async fn cache_metrics_reset_handler(State(state): State<AppState>) -> Response {
    state.cache.reset_metrics();
    Json(serde_json::json!({"reset": true})).into_response()
}

// ============================================================================
// Queue control
// ============================================================================

/// Interception status: global switch plus configured exclusions.
#[utoipa::path(
    get,
    path = "/queue-control/status",
    tag = "queue-control",
    responses((status = 200, description = "Control status", body = QueueControlStatusResponse))
)]
async fn queue_control_status_handler(State(state): State<AppState>) -> Response {
    Json(QueueControlStatusResponse {
        enabled: state.control.is_enabled(),
        exclusions: state.control.exclusions(),
    })
    .into_response()
}

/// Enable interception.
#[utoipa::path(
    post,
    path = "/queue-control/enable",
    tag = "queue-control",
    responses((status = 200, description = "Interception enabled"))
)]
async fn queue_control_enable_handler(State(state): State<AppState>) -> Response {
    state.control.enable();
    Json(serde_json::json!({"enabled": true})).into_response()
}

/// Disable interception: every request flows synchronously.
#[utoipa::path(
    post,
    path = "/queue-control/disable",
    tag = "queue-control",
    responses((status = 200, description = "Interception disabled"))
)]
async fn queue_control_disable_handler(State(state): State<AppState>) -> Response {
    state.control.disable();
    Json(serde_json::json!({"enabled": false})).into_response()
}

/// Toggle interception.
#[utoipa::path(
    post,
    path = "/queue-control/toggle",
    tag = "queue-control",
    responses((status = 200, description = "New state"))
)]
async fn queue_control_toggle_handler(State(state): State<AppState>) -> Response {
    let enabled = state.control.toggle();
    Json(serde_json::json!({"enabled": enabled})).into_response()
}

/// List configured exclusion prefixes.
#[utoipa::path(
    get,
    path = "/queue-control/exclusions",
    tag = "queue-control",
    responses((status = 200, description = "Exclusion prefixes"))
)]
async fn list_exclusions_handler(State(state): State<AppState>) -> Response {
    Json(state.control.exclusions()).into_response()
}

/// Add an exclusion prefix.
#[utoipa::path(
    post,
    path = "/queue-control/exclusions",
    tag = "queue-control",
    request_body = ExclusionRequest,
    responses((status = 201, description = "Exclusion added"))
)]
async fn add_exclusion_handler(
    State(state): State<AppState>,
    Json(request): Json<ExclusionRequest>,
) -> Response {
    state.control.add_exclusion(request.prefix.clone());
    (
        StatusCode::CREATED,
        Json(serde_json::json!({"prefix": request.prefix})),
    )
        .into_response()
}

/// Remove an exclusion prefix (`?prefix=/foo`).
#[utoipa::path(
    delete,
    path = "/queue-control/exclusions",
    tag = "queue-control",
    params(("prefix" = String, Query, description = "Prefix to remove")),
    responses(
        (status = 200, description = "Exclusion removed"),
        (status = 404, description = "Unknown prefix", body = ErrorBody)
    )
)]
async fn remove_exclusion_handler(
    State(state): State<AppState>,
    Query(query): Query<ExclusionQuery>,
) -> Response {
    if state.control.remove_exclusion(&query.prefix) {
        Json(serde_json::json!({"prefix": query.prefix, "removed": true})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                status_code: 404,
                message: format!("Exclusion not found: {}", query.prefix),
            }),
        )
            .into_response()
    }
}
