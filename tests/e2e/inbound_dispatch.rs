//! Requests and notifications sent by the packager to the client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use packlink_client::dispatch::REQUEST_NOT_SUPPORTED;
use packlink_client::{PackagerMethod, Responder};
use packlink_core::Result;
use serde_json::{json, Value};

use super::mock_packager::MockPackager;
use crate::{eventually, open_and_wait, test_connection};

fn is_response_to(id: u64) -> impl Fn(&Value) -> bool {
    move |frame| frame["id"] == id && frame.get("method").is_none()
}

#[tokio::test]
async fn test_inbound_request_is_answered_with_same_id() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    connection.register_request_handler(
        "echo",
        |params: Option<Value>, responder: Responder| -> Result<()> {
            responder.respond(params.unwrap_or(Value::Null))
        },
    );
    open_and_wait(&connection, &packager).await;

    packager.send(json!({ "version": 2, "id": 5, "method": "echo", "params": [1, 2] }));

    let response = packager.recv_matching(is_response_to(5)).await.unwrap();
    assert_eq!(response, json!({ "version": 2, "id": 5, "result": [1, 2] }));

    connection.close().await;
}

#[tokio::test]
async fn test_unknown_method_gets_error_response() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    open_and_wait(&connection, &packager).await;

    packager.send(json!({ "version": 2, "id": 42, "method": "nope" }));

    let response = packager.recv_matching(is_response_to(42)).await.unwrap();
    assert!(response.get("result").is_none());
    assert!(response["error"].as_str().unwrap().contains("nope"));

    connection.close().await;
}

#[tokio::test]
async fn test_request_for_notification_only_method_is_rejected() {
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
    open_and_wait(&connection, &packager).await;

    packager.send(json!({ "version": 2, "id": 3, "method": "reload" }));

    let response = packager.recv_matching(is_response_to(3)).await.unwrap();
    assert_eq!(response["error"], REQUEST_NOT_SUPPORTED);
    assert_eq!(reloads.load(Ordering::SeqCst), 0);

    connection.close().await;
}

#[tokio::test]
async fn test_inbound_messages_dispatch_in_arrival_order() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    connection.register_notification_handler("note", {
        let log = Arc::clone(&log);
        move |params: Option<Value>| -> Result<()> {
            let tag = params
                .and_then(|p| p["tag"].as_str().map(str::to_string))
                .unwrap_or_default();
            log.lock().unwrap().push(tag);
            Ok(())
        }
    });
    connection.register_request_handler("ask", {
        let log = Arc::clone(&log);
        move |_: Option<Value>, responder: Responder| -> Result<()> {
            log.lock().unwrap().push("r1".to_string());
            responder.respond(json!("ok"))
        }
    });
    open_and_wait(&connection, &packager).await;

    packager.send(json!({ "version": 2, "method": "note", "params": { "tag": "n1" } }));
    packager.send(json!({ "version": 2, "id": 1, "method": "ask" }));
    packager.send(json!({ "version": 2, "method": "note", "params": { "tag": "n2" } }));

    packager.recv_matching(is_response_to(1)).await.unwrap();
    assert!(eventually(|| log.lock().unwrap().len() == 3).await);
    assert_eq!(*log.lock().unwrap(), vec!["n1", "r1", "n2"]);

    connection.close().await;
}

#[tokio::test]
async fn test_malformed_frames_do_not_break_the_connection() {
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
    open_and_wait(&connection, &packager).await;

    packager.send_text("{not json");
    packager.send(json!({ "version": 1, "method": "reload" }));
    packager.send(json!({ "version": 2, "id": 9, "result": 1, "error": "both" }));
    packager.send(json!({ "version": 2, "method": "reload" }));

    assert!(eventually(|| reloads.load(Ordering::SeqCst) == 1).await);

    let result = connection.request("echo", Some(json!(true))).await.unwrap();
    assert_eq!(result, json!(true));
    let _ = packager.recv().await;

    connection.close().await;
}

#[tokio::test]
async fn test_panicking_handler_still_answers_and_connection_survives() {
    let mut packager = MockPackager::start().await;
    let connection = test_connection();
    connection.register_request_handler(
        "explode",
        |_: Option<Value>, _responder: Responder| -> Result<()> { panic!("boom") },
    );
    connection.register_request_handler(
        "echo",
        |params: Option<Value>, responder: Responder| -> Result<()> {
            responder.respond(params.unwrap_or(Value::Null))
        },
    );
    open_and_wait(&connection, &packager).await;

    packager.send(json!({ "version": 2, "id": 7, "method": "explode" }));
    let failed = packager.recv_matching(is_response_to(7)).await.unwrap();
    assert!(failed.get("error").is_some());

    packager.send(json!({ "version": 2, "id": 8, "method": "echo", "params": "alive" }));
    let answered = packager.recv_matching(is_response_to(8)).await.unwrap();
    assert_eq!(answered["result"], "alive");

    connection.close().await;
}
