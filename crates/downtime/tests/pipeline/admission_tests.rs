use std::sync::{Arc, Mutex};
use std::time::Duration;

use downtime::error::GateError;
use downtime::gate::AdmissionGate;
use downtime::model::ProbeMessage;
use downtime::queue::{MemoryBroker, WorkPublisher};
use downtime::sink::MemorySink;
use tokio_util::sync::CancellationToken;

use super::{eventually, pool, settings};
use crate::fixtures::{Reply, TestServer};

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let gate = AdmissionGate::new(1).unwrap();
    let held = gate.acquire().await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for id in 0..5 {
        let waiter_gate = gate.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let _permit = waiter_gate.acquire().await.unwrap();
            order.lock().unwrap().push(id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }));
        let queued = gate.clone();
        eventually(move || queued.waiting() == id + 1).await;
    }

    drop(held);
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3, 4]);
    assert_eq!(gate.available(), 1);
}

#[tokio::test]
async fn test_available_stays_within_bounds_under_load() {
    let gate = AdmissionGate::new(3).unwrap();
    let peak = Arc::new(Mutex::new(0usize));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let gate = gate.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                let in_use = gate.max() - gate.available();
                let mut peak = peak.lock().unwrap();
                *peak = (*peak).max(in_use);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(*peak.lock().unwrap() <= 3);
    assert_eq!(gate.available(), 3);
    assert_eq!(gate.release(), Err(GateError::OverRelease { max: 3 }));
}

#[tokio::test]
async fn test_pool_keeps_polling_while_gate_is_full() {
    let server = TestServer::start(Reply::ok("slow").delayed(Duration::from_millis(300))).await;
    let broker = MemoryBroker::new(1);
    let messages: Vec<ProbeMessage> = (0..6).map(|i| ProbeMessage::new(server.url(&format!("/{i}")))).collect();
    broker.publisher(super::TOPIC).publish(&messages).await.unwrap();

    let sink = MemorySink::new();
    let pool = pool(&broker, &sink, settings(2));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    // Every message is received up front; only two are measured at a time
    eventually(|| pool.pending() == 6 && pool.gate().waiting() == 4).await;
    assert_eq!(pool.gate().available(), 0);

    eventually(|| sink.len() == 6).await;
    eventually(|| pool.pending() == 0).await;
    shutdown.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(broker.committed(super::GROUP, super::TOPIC, 0), Some(6));
}
