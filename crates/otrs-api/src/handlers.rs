//! Route handlers.

use std::sync::atomic::Ordering;
use std::time::UNIX_EPOCH;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use otrs_core::Sample;
use otrs_metrics::{CONTENT_TYPE, render};

use crate::ApiState;

/// GET metrics_path: render the current registry snapshot.
///
/// Samples that fail validation are dropped from the body and counted in
/// `exporter_render_errors_total`. A family registered with two kinds
/// cannot be rendered coherently and fails the scrape with 500.
pub async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    let snapshot = state.registry.snapshot().await;
    let meta = snapshot.meta_samples();
    let exporter = exporter_samples(&state);

    let samples = snapshot
        .collector_samples()
        .chain(meta.iter())
        .chain(exporter.iter());

    match render(samples, state.render) {
        Ok(rendered) => {
            if !rendered.skipped.is_empty() {
                warn!(dropped = rendered.skipped.len(), "scrape rendered with dropped samples");
                state
                    .render_errors
                    .fetch_add(rendered.skipped.len() as u64, Ordering::Relaxed);
            }
            debug!(bytes = rendered.body.len(), "scrape served");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, CONTENT_TYPE)],
                rendered.body,
            )
                .into_response()
        }
        Err(e) => {
            state.render_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to render metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("failed to render metrics: {e}\n"),
            )
                .into_response()
        }
    }
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok\n"
}

fn exporter_samples(state: &ApiState) -> Vec<Sample> {
    let start = state
        .start_time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    vec![
        Sample::gauge("exporter_build_info", 1.0).with_label("version", env!("CARGO_PKG_VERSION")),
        Sample::gauge("exporter_start_time_seconds", start),
        Sample::counter(
            "exporter_render_errors_total",
            state.render_errors.load(Ordering::Relaxed) as f64,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use otrs_core::CollectionError;
    use otrs_metrics::{CycleStats, Registry, RenderOptions};

    fn test_state() -> ApiState {
        ApiState::new(Arc::new(Registry::new(Duration::from_secs(300))), RenderOptions::default())
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn empty_registry_serves_exporter_meta_only() {
        let resp = prometheus_metrics(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert_eq!(content_type, CONTENT_TYPE);

        let body = body_text(resp).await;
        assert!(body.contains("exporter_build_info{version="));
        assert!(body.contains("exporter_render_errors_total 0\n"));
        assert!(!body.contains("exporter_collector_"));
        assert!(!body.contains("otrs_"));
    }

    #[tokio::test]
    async fn collector_samples_and_meta_rendered() {
        let state = test_state();
        state
            .registry
            .publish(
                "service",
                Ok(vec![Sample::gauge("otrs_service_up", 1.0).with_label("service", "web")]),
                SystemTime::now(),
                CycleStats::default(),
            )
            .await;
        state
            .registry
            .publish(
                "ticketstats",
                Err(CollectionError::ConnectionLost("refused".to_string())),
                SystemTime::now(),
                CycleStats::default(),
            )
            .await;

        let body = body_text(prometheus_metrics(State(state)).await).await;
        assert!(body.contains("otrs_service_up{service=\"web\"} 1\n"));
        assert!(body.contains("exporter_collector_stale{collector=\"ticketstats\"} 1\n"));
        assert!(body.contains("exporter_collector_stale{collector=\"service\"} 0\n"));
        assert!(body.contains("exporter_collector_last_success_timestamp_seconds{collector=\"service\"}"));
        assert!(!body.contains("exporter_collector_last_success_timestamp_seconds{collector=\"ticketstats\"}"));
    }

    #[tokio::test]
    async fn malformed_samples_counted() {
        let state = test_state();
        state
            .registry
            .publish(
                "maillog",
                Ok(vec![Sample::gauge("bad name", 1.0), Sample::counter("mail_fetch_success_total", 4.0)]),
                SystemTime::now(),
                CycleStats::default(),
            )
            .await;

        let body = body_text(prometheus_metrics(State(state.clone())).await).await;
        assert!(body.contains("mail_fetch_success_total 4\n"));
        assert_eq!(state.render_errors.load(Ordering::Relaxed), 1);

        // The counter is read before rendering, so it lags by one scrape.
        let body = body_text(prometheus_metrics(State(state.clone())).await).await;
        assert!(body.contains("exporter_render_errors_total 1\n"));
        assert_eq!(state.render_errors.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn conflicting_kinds_fail_scrape() {
        let state = test_state();
        let now = SystemTime::now();
        state
            .registry
            .publish("a", Ok(vec![Sample::gauge("shared_metric", 1.0)]), now, CycleStats::default())
            .await;
        state
            .registry
            .publish("b", Ok(vec![Sample::counter("shared_metric", 2.0)]), now, CycleStats::default())
            .await;

        let resp = prometheus_metrics(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.render_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        assert_eq!(healthz().await, "ok\n");
    }
}
