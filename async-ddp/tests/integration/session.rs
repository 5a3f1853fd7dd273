use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use ddp::client::{CursorCallbacks, FindOptions, SubscriptionCallbacks};
use ddp::sync::Mutex;

use crate::utils::{connected_client, eventually, settle, test_builder};

#[tokio::test]
async fn connect_subscribe_ready() {
    let (client, server) = connected_client("S1").await;

    let ready_count = Arc::new(AtomicUsize::new(0));
    let ready_in = ready_count.clone();
    let handle = client.subscribe(
        "things",
        vec![],
        SubscriptionCallbacks::new().on_ready(move || {
            ready_in.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert!(!handle.ready());

    let sub = server.wait_for_msg(0, "sub").await;
    assert_eq!(sub["name"], "things");
    server.send(json!({"msg": "ready", "subs": [sub["id"]]}));

    eventually(|| handle.ready()).await;
    eventually(|| ready_count.load(Ordering::SeqCst) == 1).await;

    // A duplicate ready frame must not refire the callback.
    server.send(json!({"msg": "ready", "subs": [sub["id"]]}));
    settle().await;
    assert_eq!(ready_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_reuse_preserves_collections() {
    let (client, server) = connected_client("S1").await;

    client.subscribe("things", vec![], SubscriptionCallbacks::new());
    server.wait_for_msg(0, "sub").await;
    server.send(json!({"msg": "added", "collection": "things", "id": "a", "fields": {}}));
    eventually(|| {
        client
            .find("things", None, FindOptions::default())
            .map(|c| c.count() == 1)
            .unwrap_or(false)
    })
    .await;

    server.drop_connection();
    let connect = server.accept_connection(2, "S1").await;
    assert_eq!(connect["session"], "S1");

    client.wait_for_connection().await;
    settle().await;

    // Same session: the mirror is authoritative, nothing was cleared and
    // no subscription was re-sent.
    assert_eq!(
        client.find("things", None, FindOptions::default()).unwrap().count(),
        1
    );
    assert!(server.msgs_for(1, "sub").is_empty());
}

#[tokio::test]
async fn cold_session_clears_and_resubscribes_in_order() {
    let (client, server) = connected_client("S1").await;

    client.subscribe("alpha", vec![], SubscriptionCallbacks::new());
    client.subscribe("beta", vec![json!(7)], SubscriptionCallbacks::new());
    server.wait_for_frame(0, |v| v["msg"] == "sub" && v["name"] == "beta").await;
    server.send(json!({"msg": "added", "collection": "things", "id": "a", "fields": {}}));
    eventually(|| {
        client
            .find("things", None, FindOptions::default())
            .map(|c| c.count() == 1)
            .unwrap_or(false)
    })
    .await;

    server.drop_connection();
    server.accept_connection(2, "S2").await;
    client.wait_for_connection().await;

    // Fresh session: mirror emptied, active set replayed in insertion
    // order.
    eventually(|| {
        client
            .find("things", None, FindOptions::default())
            .map(|c| c.count() == 0)
            .unwrap_or(false)
    })
    .await;
    eventually(|| server.msgs_for(1, "sub").len() == 2).await;
    let subs = server.msgs_for(1, "sub");
    assert_eq!(subs[0]["name"], "alpha");
    assert_eq!(subs[1]["name"], "beta");
    assert_eq!(subs[1]["params"], json!([7]));
}

#[tokio::test]
async fn method_replays_ahead_of_subscriptions() {
    let (client, server) = connected_client("S1").await;

    client.subscribe("things", vec![], SubscriptionCallbacks::new());
    server.wait_for_msg(0, "sub").await;

    let outcome = Arc::new(Mutex::new(None));
    let outcome_in = outcome.clone();
    client.call_with_callback("inc", vec![json!(1)], move |result| {
        *outcome_in.lock() = Some(result);
    });
    let method = server.wait_for_msg(0, "method").await;
    let method_id = method["id"].clone();

    // The socket drops before the result arrives.
    server.drop_connection();
    server.accept_connection(2, "S2").await;

    // The pending method is the first frame after connect, ahead of the
    // re-subscription.
    let replayed = server.wait_for_msg(1, "method").await;
    assert_eq!(replayed["id"], method_id);
    eventually(|| !server.msgs_for(1, "sub").is_empty()).await;
    let frames = server.frames_for(1);
    let method_index = frames.iter().position(|v| v["msg"] == "method").unwrap();
    let sub_index = frames.iter().position(|v| v["msg"] == "sub").unwrap();
    assert!(method_index < sub_index);

    server.send(json!({"msg": "result", "id": method_id, "result": 2}));
    eventually(|| outcome.lock().is_some()).await;
    assert_eq!(outcome.lock().clone().unwrap(), Ok(json!(2)));
}

#[tokio::test]
async fn nothing_is_sent_while_disconnected() {
    let (builder, server, _storage) = test_builder();
    let client = Arc::new(builder.build().unwrap());

    // The handshake is out but unanswered: the session is not connected
    // and the queue must hold everything back.
    server.wait_for_msg(0, "connect").await;
    client.call_with_callback("inc", vec![], |_| {});
    client.subscribe("things", vec![], SubscriptionCallbacks::new());
    settle().await;
    assert!(server.msgs_for(0, "method").is_empty());
    assert!(server.msgs_for(0, "sub").is_empty());

    server.send(json!({"msg": "connected", "session": "S1"}));
    server.wait_for_msg(0, "method").await;
    server.wait_for_msg(0, "sub").await;

    // FIFO: enqueue order survives the stall.
    let frames = server.frames_for(0);
    let method_index = frames.iter().position(|v| v["msg"] == "method").unwrap();
    let sub_index = frames.iter().position(|v| v["msg"] == "sub").unwrap();
    assert!(method_index < sub_index);
}

#[tokio::test]
async fn self_initiated_unsub_echo_is_swallowed() {
    let (client, server) = connected_client("S1").await;

    let errors = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let (errors_in, stops_in) = (errors.clone(), stops.clone());
    let handle = client.subscribe(
        "things",
        vec![],
        SubscriptionCallbacks::new()
            .on_error(move |_| {
                errors_in.fetch_add(1, Ordering::SeqCst);
            })
            .on_stop(move |_| {
                stops_in.fetch_add(1, Ordering::SeqCst);
            }),
    );
    let sub = server.wait_for_msg(0, "sub").await;
    server.send(json!({"msg": "ready", "subs": [sub["id"]]}));
    eventually(|| handle.ready()).await;

    handle.stop();
    let unsub = server.wait_for_msg(0, "unsub").await;
    assert_eq!(unsub["id"], sub["id"]);
    eventually(|| stops.load(Ordering::SeqCst) == 1).await;

    // The echo arrives; neither callback may fire again.
    server.send(json!({"msg": "nosub", "id": sub["id"]}));
    settle().await;
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_nosub_delivers_error_then_stop() {
    let (client, server) = connected_client("S1").await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (error_log, stop_log) = (log.clone(), log.clone());
    client.subscribe(
        "secrets",
        vec![],
        SubscriptionCallbacks::new()
            .on_error(move |err| {
                error_log.lock().push(format!("error:{}", err.code().unwrap_or_default()));
            })
            .on_stop(move |err| {
                stop_log.lock().push(format!(
                    "stop:{}",
                    err.map(|e| e.code().unwrap_or_default()).unwrap_or_default()
                ));
            }),
    );
    let sub = server.wait_for_msg(0, "sub").await;
    server.send(json!({
        "msg": "nosub",
        "id": sub["id"],
        "error": {"error": "not-authorized", "reason": "nope"}
    }));

    eventually(|| log.lock().len() == 2).await;
    assert_eq!(
        log.lock().clone(),
        vec!["error:not-authorized".to_string(), "stop:not-authorized".to_string()]
    );
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (_client, server) = connected_client("S1").await;
    server.send(json!({"msg": "ping", "id": "p1"}));
    let pong = server.wait_for_msg(0, "pong").await;
    assert_eq!(pong["id"], "p1");
}

#[tokio::test]
async fn cursor_observer_filters_on_post_image() {
    let (client, server) = connected_client("S1").await;

    server.send(json!({
        "msg": "added", "collection": "items", "id": "x", "fields": {"color": "red"}
    }));
    eventually(|| {
        client
            .find("items", None, FindOptions::default())
            .map(|c| c.count() == 1)
            .unwrap_or(false)
    })
    .await;

    let changes = Arc::new(AtomicUsize::new(0));
    let removals = Arc::new(AtomicUsize::new(0));
    let (changes_in, removals_in) = (changes.clone(), removals.clone());
    let cursor = client
        .find("items", Some(json!({"color": "red"})), FindOptions::default())
        .unwrap();
    let observer = cursor.observe(
        CursorCallbacks::new()
            .on_changed(move |_, _| {
                changes_in.fetch_add(1, Ordering::SeqCst);
            })
            .on_removed(move |_, _| {
                removals_in.fetch_add(1, Ordering::SeqCst);
            }),
    );

    // red -> blue: the post-image no longer matches, so the filtered
    // changed channel stays silent.
    server.send(json!({
        "msg": "changed", "collection": "items", "id": "x", "fields": {"color": "blue"}
    }));
    settle().await;
    assert_eq!(changes.load(Ordering::SeqCst), 0);

    // blue -> red again: post-image matches, the callback fires.
    server.send(json!({
        "msg": "changed", "collection": "items", "id": "x", "fields": {"color": "red"}
    }));
    eventually(|| changes.load(Ordering::SeqCst) == 1).await;

    // The removed channel is unfiltered.
    server.send(json!({"msg": "removed", "collection": "items", "id": "x"}));
    eventually(|| removals.load(Ordering::SeqCst) == 1).await;

    observer.stop();
}

#[tokio::test]
async fn reactive_rerun_reuses_identical_subscription() {
    let (client, server) = connected_client("S1").await;

    let param = Arc::new(Mutex::new(json!("north")));
    let dep = client.tracker().new_dependency();
    let (param_in, dep_in) = (param.clone(), dep.clone());
    let session = client.session().clone();
    let computation = client.autorun(move || {
        dep_in.depend();
        let value = param_in.lock().clone();
        session.subscribe("rooms", vec![value], SubscriptionCallbacks::new());
    });

    server.wait_for_msg(0, "sub").await;
    assert_eq!(server.msgs_for(0, "sub").len(), 1);

    // Rerun with the same params: the subscription is reused, nothing new
    // goes on the wire.
    dep.changed();
    settle().await;
    assert_eq!(server.msgs_for(0, "sub").len(), 1);
    assert!(server.msgs_for(0, "unsub").is_empty());

    // Rerun with different params: the old subscription is torn down and
    // a new one opened.
    *param.lock() = json!("south");
    dep.changed();
    eventually(|| server.msgs_for(0, "sub").len() == 2).await;
    eventually(|| server.msgs_for(0, "unsub").len() == 1).await;
    assert_eq!(server.msgs_for(0, "sub")[1]["params"], json!(["south"]));

    computation.stop();
    eventually(|| server.msgs_for(0, "unsub").len() == 2).await;
}

#[tokio::test]
async fn disconnect_disarms_reconnect_until_requested() {
    let (client, server) = connected_client("S1").await;

    client.disconnect();
    eventually(|| !client.status().connected).await;
    settle().await;
    assert_eq!(server.connects(), 1);

    client.reconnect();
    server.accept_connection(2, "S2").await;
    client.wait_for_connection().await;
    assert!(client.status().connected);
}
