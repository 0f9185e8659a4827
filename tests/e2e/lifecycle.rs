//! Open / close / reconnect behavior against the mock packager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use packlink_client::{ConnectionEvent, ConnectionState, PackagerConnection, PackagerMethod};
use packlink_core::{Error, Result};
use serde_json::{json, Value};

use super::mock_packager::MockPackager;
use crate::{eventually, fast_policy, open_and_wait, test_connection, wait_for_event, CLIENT_ID};

#[tokio::test]
async fn test_open_sends_client_id() {
    let packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    let uri = packager.last_uri().unwrap();
    assert_eq!(uri, format!("/message?clientid={CLIENT_ID}"));

    connection.close().await;
}

#[tokio::test]
async fn test_second_open_is_ignored() {
    let packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    connection.open(&packager.url(), "other");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(packager.connection_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);

    connection.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    connection.close().await;
    connection.close().await;

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_open());
    let err = connection.request("echo", None).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn test_reopen_after_close() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;
    connection.close().await;

    open_and_wait(&connection, &packager).await;
    assert_eq!(packager.connection_count(), 2);

    let result = connection.request("echo", Some(json!(1))).await.unwrap();
    assert_eq!(result, json!(1));
    let _ = packager.recv().await;

    connection.close().await;
}

#[tokio::test]
async fn test_reconnects_after_drop_and_keeps_handlers() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    let reloads = Arc::new(AtomicUsize::new(0));
    connection.register_notification_handler(PackagerMethod::Reload, {
        let reloads = Arc::clone(&reloads);
        move |_: Option<Value>| -> Result<()> {
            reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let mut events = connection.subscribe();
    open_and_wait(&connection, &packager).await;

    packager.drop_connection();

    let reconnecting = wait_for_event(&mut events, |e| {
        matches!(e, ConnectionEvent::Reconnecting { .. })
    })
    .await;
    assert!(matches!(
        reconnecting,
        Some(ConnectionEvent::Reconnecting { attempt: 1, max_attempts: 5 })
    ));
    assert!(wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::Connected))
        .await
        .is_some());
    assert_eq!(packager.connection_count(), 2);

    packager.send(json!({ "version": 2, "method": "reload" }));
    assert!(eventually(|| reloads.load(Ordering::SeqCst) == 1).await);

    let result = connection.request("echo", Some(json!("again"))).await.unwrap();
    assert_eq!(result, json!("again"));
    let _ = packager.recv().await;

    connection.close().await;
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let packager = MockPackager::start().await;
    let connection = PackagerConnection::builder()
        .reconnect_policy(fast_policy(2))
        .build();
    let mut events = connection.subscribe();
    open_and_wait(&connection, &packager).await;

    packager.shutdown();

    let mut attempts = Vec::new();
    let reason = loop {
        match wait_for_event(&mut events, |e| {
            matches!(
                e,
                ConnectionEvent::Reconnecting { .. } | ConnectionEvent::PermanentlyDisconnected { .. }
            )
        })
        .await
        {
            Some(ConnectionEvent::Reconnecting { attempt, .. }) => attempts.push(attempt),
            Some(ConnectionEvent::PermanentlyDisconnected { reason }) => break reason,
            other => panic!("expected reconnect events, got {other:?}"),
        }
    };

    assert_eq!(attempts, vec![1, 2]);
    assert!(reason.contains("2 attempt(s)"), "reason: {reason}");
    assert!(eventually(|| connection.state() == ConnectionState::Disconnected).await);
    assert!(eventually(|| !connection.is_open()).await);

    connection.close().await;
}

#[tokio::test]
async fn test_state_follows_connection_lifecycle() {
    let packager = MockPackager::start().await;
    let connection = test_connection();
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    connection.open(&packager.url(), CLIENT_ID);
    assert_eq!(connection.state(), ConnectionState::Connecting);
    connection
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
        .await
        .unwrap();

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
