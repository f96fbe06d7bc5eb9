use downtime::probe::ProbeRequest;
use tokio_util::sync::CancellationToken;

use super::{BUDGET, engine_with};
use crate::fixtures::{Reply, TestServer};

#[tokio::test]
async fn test_host_gets_pool_after_threshold() {
    let server = TestServer::start(Reply::ok("up")).await;
    let engine = engine_with(|config| config.host_hot_threshold = 3);
    let request = ProbeRequest::get(&server.url("/"), BUDGET).unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        assert!(engine.measure(&request, &cancel).await.unwrap().ok);
    }
    assert!(!engine.connections().is_pooled("127.0.0.1"));
    assert_eq!(engine.connections().activity("127.0.0.1").unwrap().count, 2);

    assert!(engine.measure(&request, &cancel).await.unwrap().ok);
    assert!(engine.connections().is_pooled("127.0.0.1"));
    assert_eq!(engine.connections().pool_count(), 1);

    // Pooled or not, the measurement itself behaves the same
    assert!(engine.measure(&request, &cancel).await.unwrap().ok);
    assert_eq!(engine.connections().pool_count(), 1);
}

#[tokio::test]
async fn test_shutdown_drops_pools_but_keeps_measuring() {
    let server = TestServer::start(Reply::ok("up")).await;
    let engine = engine_with(|config| config.host_hot_threshold = 1);
    let request = ProbeRequest::get(&server.url("/"), BUDGET).unwrap();
    let cancel = CancellationToken::new();

    assert!(engine.measure(&request, &cancel).await.unwrap().ok);
    assert_eq!(engine.connections().pool_count(), 1);

    engine.connections().shutdown();
    assert_eq!(engine.connections().pool_count(), 0);
    assert!(engine.measure(&request, &cancel).await.unwrap().ok);
    assert_eq!(engine.connections().pool_count(), 0);
}
