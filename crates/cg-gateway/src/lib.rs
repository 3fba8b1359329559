//! Campusgate Gateway Core
//!
//! This crate provides the asynchronous request gateway with:
//! - RoutingTable: verb+path-template resolution into bus subject + payload
//! - BrokerQueue: in-process priority queues with delayed retry and pause
//! - QueueRegistry: runtime-mutable queue set with persisted config and
//!   cross-instance change events
//! - QueueRouter: load-based queue selection by URL pattern
//! - LruResponseCache: LRU+TTL response cache with policy-driven admission
//! - WorkerPool: per-queue worker groups with pause/resume/scale control
//! - JobProcessor: cache lookup, bus dispatch with timeout, result persistence
//! - ResultRepository: per-job result records plus bounded rolling history
//! - StatusFabric: in-memory job status with subscriber fan-out
//! - InterceptionPipeline: the fail-open HTTP entry point returning 202s
//! - API: HTTP endpoints for polling, history, queue admin and the WebSocket
//!   push channel

pub mod api;
pub mod auth;
pub mod broker;
pub mod cache;
pub mod error;
pub mod idempotency;
pub mod intercept;
pub mod processor;
pub mod queue_router;
pub mod registry;
pub mod results;
pub mod routing;
pub mod status;
pub mod worker;

pub use broker::{BrokerQueue, QueueCounts, TakenJob};
pub use cache::{CacheMetricsSnapshot, LruResponseCache, ResponseCache};
pub use error::GatewayError;
pub use idempotency::{IdempotencyOutcome, IdempotencyService, InMemoryIdempotency};
pub use intercept::{InterceptionPipeline, QueueControl, SyncDispatcher};
pub use processor::{DispatchFailure, JobProcessor};
pub use queue_router::QueueRouter;
pub use registry::{QueueEventListener, QueueRegistry};
pub use results::ResultRepository;
pub use routing::{Resolution, RoutingError, RoutingTable};
pub use status::{StatusFabric, StatusStatistics};
pub use worker::WorkerPool;

pub type Result<T> = std::result::Result<T, GatewayError>;
