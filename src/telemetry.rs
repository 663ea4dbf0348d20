use std::sync::{Once, OnceLock};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::error::TelemetryError;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<String> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

/// Installs the JSON log subscriber. `RUST_LOG` overrides the default filter.
/// Does nothing if the host already installed a global subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,aigw=debug")),
        )
        .json()
        .try_init();
}

/// Installs the process-wide Prometheus recorder on first call and returns
/// its handle for rendering the scrape output.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(err.to_string());
            }
        }
    });
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    Err(TelemetryError::MetricsRecorder(
        METRICS_ERROR
            .get()
            .cloned()
            .unwrap_or_else(|| "recorder unavailable".to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_handle_is_shared_and_renders_counters() {
        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();
        metrics::counter!("aigw_route_no_match_total").increment(1);
        assert!(first.render().contains("aigw_route_no_match_total"));
        assert!(second.render().contains("aigw_route_no_match_total"));
    }

    #[test]
    fn tracing_init_is_repeatable() {
        init_tracing();
        init_tracing();
    }
}
