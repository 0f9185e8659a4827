//! Outbound requests: responses, timeouts, late replies and connection loss.

use std::time::Duration;

use packlink_client::{ConnectionState, PackagerConnection, PackagerMethod, ReconnectPolicy};
use packlink_core::Error;
use serde_json::json;

use super::mock_packager::MockPackager;
use crate::{eventually, open_and_wait, test_connection};

#[tokio::test]
async fn test_request_resolves_with_peer_result() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    let result = connection
        .send_request("echo", Some(json!({ "x": 1 })), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result, json!({ "x": 1 }));
    assert_eq!(connection.pending_request_count(), 0);

    let sent = packager.recv().await.unwrap();
    assert_eq!(sent["version"], 2);
    assert_eq!(sent["method"], "echo");
    assert!(sent["id"].is_u64());

    connection.close().await;
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    for _ in 0..3 {
        connection.request("echo", None).await.unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(packager.recv().await.unwrap()["id"].as_u64().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 3);

    connection.close().await;
}

#[tokio::test]
async fn test_error_response_is_reported_as_remote_error() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    let pending = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .send_request(PackagerMethod::CaptureHeap, None, Duration::from_secs(2))
                .await
        }
    });

    let request = packager.recv().await.unwrap();
    assert_eq!(request["method"], "captureHeap");
    packager.send(json!({ "version": 2, "id": request["id"], "error": "out of memory" }));

    let err = pending.await.unwrap().unwrap_err();
    match err {
        Error::Remote { method, message } => {
            assert_eq!(method, "captureHeap");
            assert_eq!(message, "out of memory");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    connection.close().await;
}

#[tokio::test]
async fn test_timeout_then_late_response_is_ignored() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    let err = connection
        .send_request("slow", None, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(connection.pending_request_count(), 0);

    // The peer answers after the caller gave up.
    let request = packager.recv().await.unwrap();
    packager.send(json!({ "version": 2, "id": request["id"], "result": "too late" }));

    // The connection keeps working and the late reply reaches nobody.
    let result = connection
        .send_request("echo", Some(json!("still here")), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result, json!("still here"));
    assert_eq!(connection.pending_request_count(), 0);

    connection.close().await;
}

#[tokio::test]
async fn test_connection_loss_rejects_outstanding_requests() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    let spawn_slow = |name: &'static str| {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request(name, None, Duration::from_secs(10))
                .await
        })
    };
    let first = spawn_slow("slowOne");
    let second = spawn_slow("slowTwo");

    packager.recv().await.unwrap();
    packager.recv().await.unwrap();
    assert_eq!(connection.pending_request_count(), 2);

    packager.drop_connection();

    let first = first.await.unwrap().unwrap_err();
    let second = second.await.unwrap().unwrap_err();
    assert!(matches!(first, Error::ConnectionLost));
    assert!(matches!(second, Error::ConnectionLost));
    assert_eq!(connection.pending_request_count(), 0);

    connection.close().await;
}

#[tokio::test]
async fn test_requests_after_loss_fail_fast_until_reconnected() {
    let mut packager = MockPackager::start().await;
    let connection = PackagerConnection::builder()
        .reconnect_policy(ReconnectPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            max_attempts: 3,
        })
        .build();
    open_and_wait(&connection, &packager).await;

    let pending = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .send_request("slowOne", None, Duration::from_secs(10))
                .await
        }
    });
    packager.recv().await.unwrap();

    packager.drop_connection();

    let lost = pending.await.unwrap().unwrap_err();
    assert!(matches!(lost, Error::ConnectionLost));
    assert_ne!(connection.state(), ConnectionState::Connected);

    let started = std::time::Instant::now();
    let err = connection
        .send_request("slowTwo", None, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(connection.pending_request_count(), 0);

    connection.close().await;
}

#[tokio::test]
async fn test_close_rejects_outstanding_requests() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    let pending = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .send_request("slow", None, Duration::from_secs(10))
                .await
        }
    });
    packager.recv().await.unwrap();
    assert!(eventually(|| connection.pending_request_count() == 1).await);

    connection.close().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn test_notification_reaches_peer() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    connection.send_notification("appReady", Some(json!({ "pid": 42 })));

    let frame = packager.recv().await.unwrap();
    assert_eq!(
        frame,
        json!({ "version": 2, "method": "appReady", "params": { "pid": 42 } })
    );

    connection.close().await;
}
