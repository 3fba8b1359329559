//! Gateway logging
//!
//! Structured logging tuned for the gateway's event-heavy output: every job
//! transition logs discrete events with `job_id`, `queue` and `worker`
//! fields rather than long-lived spans.
//!
//! - JSON output for production (LOG_FORMAT=json), flattened so `job_id`
//!   lands as a top-level field for log aggregation
//! - Human-readable compact output for development (default)
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: "json" for JSON output, anything else for text
//! - `RUST_LOG`: overrides the default filter entirely
//!   (e.g. `RUST_LOG=cg_gateway=trace,cg_bus=debug`)

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Default filter when `RUST_LOG` is unset: gateway crates at info, client
/// libraries and per-request HTTP tracing quieted to warnings. The bus and
/// store clients retry internally and would otherwise flood reconnect noise
/// into every incident.
const DEFAULT_DIRECTIVES: &str =
    "info,tower_http=warn,hyper=warn,async_nats=warn,redis=warn";

/// Initialize logging for a gateway process.
///
/// Reads LOG_FORMAT for the output format and RUST_LOG for filtering,
/// falling back to the gateway defaults above.
pub fn init_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_ansi(true),
            )
            .init();
    }

    tracing::info!(service = %service_name, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse() {
        let filter = EnvFilter::try_new(DEFAULT_DIRECTIVES);
        assert!(filter.is_ok());
    }
}
