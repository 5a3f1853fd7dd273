use std::sync::Arc;

use serde_json::{json, Value};

use ddp::client::FindOptions;
use ddp::sync::Mutex;

use crate::utils::{connected_client, eventually, settle};

#[tokio::test]
async fn vent_events_route_to_their_listener() {
    let (client, server) = connected_client("S1").await;

    let received = Arc::new(Mutex::new(Vec::<Value>::new()));
    let handle = client.vent_subscribe("stream-notify-room", vec![json!("general")]);
    let received_in = received.clone();
    handle.listen(move |payload| {
        received_in.lock().push(payload);
    });

    // The vent id rides as the publication's first parameter.
    let sub = server.wait_for_msg(0, "sub").await;
    assert_eq!(sub["params"][0], json!(handle.vent_id()));
    assert_eq!(sub["params"][1], json!("general"));

    server.send(json!({
        "msg": "changed",
        "collection": "stream-notify-room",
        "id": handle.vent_id(),
        "__vent": "1",
        "e": {"kind": "typing", "user": "ada"}
    }));

    eventually(|| received.lock().len() == 1).await;
    assert_eq!(received.lock()[0], json!({"kind": "typing", "user": "ada"}));

    // Vent frames never touch the document store.
    assert_eq!(
        client
            .find("stream-notify-room", None, FindOptions::default())
            .unwrap()
            .count(),
        0
    );
}

#[tokio::test]
async fn ordinary_changed_frames_bypass_the_dispatcher() {
    let (client, server) = connected_client("S1").await;

    let received = Arc::new(Mutex::new(Vec::<Value>::new()));
    let handle = client.vent_subscribe("stream-notify-room", vec![]);
    let received_in = received.clone();
    handle.listen(move |payload| {
        received_in.lock().push(payload);
    });
    server.wait_for_msg(0, "sub").await;

    server.send(json!({"msg": "added", "collection": "items", "id": "x", "fields": {"a": 1}}));
    server.send(json!({"msg": "changed", "collection": "items", "id": "x", "fields": {"a": 2}}));

    eventually(|| {
        client
            .find("items", None, FindOptions::default())
            .map(|c| c.count() == 1)
            .unwrap_or(false)
    })
    .await;
    settle().await;
    assert!(received.lock().is_empty());

    // reset() drops the listener; later events go nowhere.
    client.vent_reset();
    server.send(json!({
        "msg": "changed",
        "collection": "stream-notify-room",
        "id": handle.vent_id(),
        "__vent": "1",
        "e": {}
    }));
    settle().await;
    assert!(received.lock().is_empty());
}
