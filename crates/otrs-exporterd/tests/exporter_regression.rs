//! Exporter regression tests.
//!
//! Drives the assembled router with in-process requests: scrape before any
//! collection, liveness, custom paths, and a real mail log collector
//! flowing through the scheduler into a scrape.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use otrs_api::{ApiState, build_router};
use otrs_collectors::MailLogCollector;
use otrs_core::{ExporterConfig, MailLogConfig};
use otrs_metrics::{CONTENT_TYPE, Registry, RenderOptions};
use otrs_scheduler::Scheduler;

fn test_state() -> ApiState {
    ApiState::new(
        Arc::new(Registry::new(Duration::from_secs(300))),
        RenderOptions::default(),
    )
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn scrape_before_first_cycle_serves_exporter_meta() {
    let router = build_router(test_state(), "/metrics");

    let resp = router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("content-type").unwrap(), CONTENT_TYPE);

    let body = body_text(resp).await;
    assert!(body.contains("# TYPE exporter_build_info gauge"));
    assert!(body.contains("exporter_start_time_seconds "));
    assert!(!body.contains("otrs_"));
    assert!(!body.contains("mail_fetch_"));
}

#[tokio::test]
async fn healthz_answers_ok() {
    let router = build_router(test_state(), "/metrics");

    let resp = router.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "ok\n");
}

#[tokio::test]
async fn custom_metrics_path() {
    let router = build_router(test_state(), "/otrs/metrics");

    let resp = router.clone().oneshot(get("/otrs/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mail_log_counts_reach_scrape() {
    let mut log = tempfile::NamedTempFile::new().unwrap();
    writeln!(log, "[Kernel::System::MailAccount::POP3] 3 messages fetched").unwrap();
    writeln!(log, "[Kernel::System::MailAccount::POP3] Got no email").unwrap();
    writeln!(log, "[Kernel::System::MailAccount::POP3] fetched 2 emails").unwrap();
    log.flush().unwrap();

    let config = MailLogConfig {
        path: log.path().to_path_buf(),
        from_start: true,
        ..Default::default()
    };
    let collector = MailLogCollector::new(&config, Duration::from_secs(5)).unwrap();

    let state = test_state();
    let mut scheduler = Scheduler::new(Arc::clone(&state.registry), 3);
    scheduler.schedule(collector, Duration::from_secs(1)).unwrap();

    // First cycle runs within a tenth of the interval.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let router = build_router(state, "/metrics");
    let body = body_text(router.oneshot(get("/metrics")).await.unwrap()).await;
    assert!(body.contains("mail_fetch_success_total 2\n"), "{body}");
    assert!(body.contains("mail_fetch_failure_total 1\n"), "{body}");
    assert!(body.contains("exporter_collector_stale{collector=\"maillog\"} 0\n"));
    assert!(body.contains("exporter_collector_errors_total{collector=\"maillog\"} 0\n"));

    scheduler.stop(Duration::from_secs(1)).await.unwrap();
}

#[test]
fn example_config_parses_and_validates() {
    let config: ExporterConfig =
        toml::from_str(include_str!("../otrs-exporter.example.toml")).unwrap();
    config.validate().unwrap();
    assert_eq!(config.services.len(), 3);
    assert!(!config.database.is_configured());
}
