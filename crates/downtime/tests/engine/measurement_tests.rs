use std::time::Duration;

use downtime::error::ProbeError;
use downtime::model::{ErrorKind, ResponseBody};
use downtime::probe::ProbeRequest;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{BUDGET, engine, engine_with};
use crate::fixtures::{Reply, TestServer, closed_port_url};

#[tokio::test]
async fn test_fast_200_is_ok() {
    let server = TestServer::start(Reply::json(200, r#"{"status":"up"}"#)).await;
    let request = ProbeRequest::get(&server.url("/health"), BUDGET).unwrap();

    let result = engine().measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(result.ok);
    assert_eq!(result.status, Some(200));
    assert_eq!(result.status_text.as_deref(), Some("OK"));
    assert_eq!(result.error, None);
    assert!(result.duration < Duration::from_secs(2));
    assert_eq!(result.body, Some(ResponseBody::Json(json!({ "status": "up" }))));
}

#[tokio::test]
async fn test_redirect_is_ok_and_not_followed() {
    let server = TestServer::start(Reply::Respond {
        status: 302,
        headers: vec![("location".into(), "http://127.0.0.1:1/elsewhere".into())],
        body: Vec::new(),
    })
    .await;
    let request = ProbeRequest::get(&server.url("/"), BUDGET).unwrap();

    let result = engine().measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(result.ok);
    assert_eq!(result.status, Some(302));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_server_error_is_not_ok_but_has_status() {
    let server = TestServer::start(Reply::json(503, r#"{"error":"maintenance"}"#)).await;
    let request = ProbeRequest::get(&server.url("/"), BUDGET).unwrap();

    let result = engine().measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.status, Some(503));
    assert_eq!(result.error, None);
}

#[tokio::test]
async fn test_connection_refused() {
    let request = ProbeRequest::get(&closed_port_url().await, BUDGET).unwrap();

    let result = engine().measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.status, None);
    assert_eq!(result.error, Some(ErrorKind::ConnectionRefused));
    assert_eq!(result.status_or_sentinel(), 599);
    let serialized = serde_json::to_value(&result).unwrap();
    assert_eq!(serialized["error"], "ECONNREFUSED");
    assert!(serialized.get("status").is_none());
}

#[tokio::test]
async fn test_slow_headers_time_out_at_budget() {
    let server = TestServer::start(Reply::ok("late").delayed(Duration::from_secs(10))).await;
    let budget = Duration::from_millis(300);
    let request = ProbeRequest::get(&server.url("/slow"), budget).unwrap();

    let result = engine().measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.error, Some(ErrorKind::Timeout));
    assert_eq!(result.status, None);
    assert!(result.duration >= budget, "{:?}", result.duration);
    assert!(result.duration < Duration::from_secs(2), "{:?}", result.duration);
}

#[tokio::test]
async fn test_stalled_body_trips_idle_timer() {
    let server = TestServer::start(Reply::StalledBody { declared: 1_000, sent: b"partial".to_vec() }).await;
    let engine = engine_with(|config| config.response_idle_timeout_ms = Some(200));
    let request = ProbeRequest::get(&server.url("/stream"), BUDGET).unwrap();

    let result = engine.measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.error, Some(ErrorKind::Timeout));
    assert_eq!(result.body, None);
    assert!(result.duration < Duration::from_secs(2), "{:?}", result.duration);
}

#[tokio::test]
async fn test_body_over_cap_is_rejected_without_partial_body() {
    let server = TestServer::start(Reply::ok(&"x".repeat(64 * 1024))).await;
    let engine = engine_with(|config| config.max_body_bytes = 1_024);
    let request = ProbeRequest::get(&server.url("/big"), BUDGET).unwrap();

    let result = engine.measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.error, Some(ErrorKind::MaxBodyExceeded));
    assert_eq!(result.status, None);
    assert_eq!(result.body, None);
}

#[tokio::test]
async fn test_gzip_body_is_decoded() {
    let server = TestServer::start(Reply::gzip_json(r#"{"checks":[1,2,3]}"#)).await;
    let request = ProbeRequest::get(&server.url("/gz"), BUDGET).unwrap();

    let result = engine().measure(&request, &CancellationToken::new()).await.unwrap();

    assert!(result.ok);
    assert_eq!(result.body, Some(ResponseBody::Json(json!({ "checks": [1, 2, 3] }))));
}

#[tokio::test]
async fn test_cancellation_aborts_in_flight_attempt() {
    let server = TestServer::start(Reply::ok("late").delayed(Duration::from_secs(10))).await;
    let request = ProbeRequest::get(&server.url("/"), BUDGET).unwrap();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = engine().measure(&request, &cancel).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.error, Some(ErrorKind::Aborted));
    assert!(result.duration < Duration::from_secs(2));
}

#[tokio::test]
async fn test_programmer_errors_are_rejected_synchronously() {
    let engine = engine();
    let cancel = CancellationToken::new();

    let empty = engine.measure_target("", "GET", &[], BUDGET, &cancel).await;
    assert!(matches!(empty, Err(ProbeError::EmptyTarget)));

    let scheme = engine.measure_target("gopher://old.example", "GET", &[], BUDGET, &cancel).await;
    assert!(matches!(scheme, Err(ProbeError::UnsupportedScheme(_))));
}
