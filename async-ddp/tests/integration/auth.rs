use std::sync::Arc;

use serde_json::json;

use ddp::client::{AuthEvent, KeyStorage, UserSelector};
use ddp::sync::Mutex;

use crate::utils::{eventually, test_builder};

const TOKEN_KEY: &str = "Meteor.loginToken";
const EXPIRES_KEY: &str = "Meteor.loginTokenExpires";
const USER_KEY: &str = "Meteor.userId";

fn collect_auth_events(client: &ddp::client::Client) -> Arc<Mutex<Vec<AuthEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_in = events.clone();
    client.on_auth_event(move |event| {
        events_in.lock().push(event.clone());
    });
    events
}

#[tokio::test]
async fn password_login_persists_all_three_keys() {
    let (builder, server, storage) = test_builder();
    let client = Arc::new(builder.build().unwrap());
    server.accept_connection(1, "S1").await;
    client.wait_for_connection().await;

    let login_task = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .login_with_password(UserSelector::Auto("ada@example.com".into()), "hunter2")
                .await
        })
    };

    let login = server.wait_for_msg(0, "method").await;
    assert_eq!(login["method"], "login");
    let params = &login["params"][0];
    assert_eq!(params["user"], json!({"email": "ada@example.com"}));
    // Never cleartext on the wire.
    assert_eq!(params["password"]["algorithm"], "sha-256");
    assert!(params["password"]["digest"].is_string());

    server.send(json!({
        "msg": "result",
        "id": login["id"],
        "result": {"id": "u1", "token": "tok9", "tokenExpires": {"$date": 4_000_000_000_000_i64}}
    }));

    let user_id = login_task.await.unwrap().unwrap();
    assert_eq!(user_id, "u1");
    assert_eq!(client.get_auth_token().as_deref(), Some("tok9"));
    eventually(|| client.user_id().as_deref() == Some("u1")).await;
    assert_eq!(storage.get_item(TOKEN_KEY).await.unwrap().as_deref(), Some("tok9"));
    assert_eq!(storage.get_item(USER_KEY).await.unwrap().as_deref(), Some("u1"));
    assert!(storage.get_item(EXPIRES_KEY).await.unwrap().is_some());

    // Logout removes everything it wrote.
    let logout_task = {
        let client = client.clone();
        tokio::spawn(async move { client.logout().await })
    };
    let logout = server
        .wait_for_frame(0, |v| v["msg"] == "method" && v["method"] == "logout")
        .await;
    server.send(json!({"msg": "result", "id": logout["id"]}));
    logout_task.await.unwrap();

    assert_eq!(client.get_auth_token(), None);
    assert_eq!(storage.get_item(TOKEN_KEY).await.unwrap(), None);
    assert_eq!(storage.get_item(EXPIRES_KEY).await.unwrap(), None);
    assert_eq!(storage.get_item(USER_KEY).await.unwrap(), None);
}

#[tokio::test]
async fn resume_rejection_clears_identity_and_does_not_retry() {
    let (builder, server, storage) = test_builder();
    storage.set_item(TOKEN_KEY, "tok1").await.unwrap();
    storage.set_item(USER_KEY, "u1").await.unwrap();

    let client = Arc::new(builder.build().unwrap());
    let events = collect_auth_events(&client);
    server.accept_connection(1, "S1").await;

    // The stored identity resumes automatically after the handshake.
    let login = server.wait_for_frame(0, |v| v["msg"] == "method" && v["method"] == "login").await;
    assert_eq!(login["params"][0], json!({"resume": "tok1"}));

    server.send(json!({
        "msg": "result",
        "id": login["id"],
        "error": {"error": "token-expired", "reason": "Your session has expired"}
    }));

    eventually(|| storage_cleared(&storage)).await;
    eventually(|| {
        events.lock().iter().any(|e| {
            matches!(e, AuthEvent::LoginFailure(f)
                if f.is_logout_triggered && f.error.as_deref() == Some("token-expired"))
        })
    })
    .await;
    assert_eq!(client.get_auth_token(), None);
    assert_eq!(client.user_id(), None);
    assert!(!client.logging_in());

    // No retry: well past the first backoff steps, exactly one login
    // went out.
    tokio::time::sleep(std::time::Duration::from_millis(700)).await;
    let logins = server
        .frames_for(0)
        .into_iter()
        .filter(|v| v["msg"] == "method" && v["method"] == "login")
        .count();
    assert_eq!(logins, 1);
}

fn storage_cleared(storage: &Arc<ddp::client::MemoryKeyStorage>) -> bool {
    futures::executor::block_on(async {
        let token = storage.get_item(TOKEN_KEY).await.unwrap();
        let user = storage.get_item(USER_KEY).await.unwrap();
        token.is_none() && user.is_none()
    })
}

#[tokio::test]
async fn rate_limited_resume_retries_after_the_reset_window() {
    let (builder, server, storage) = test_builder();
    storage.set_item(TOKEN_KEY, "tok1").await.unwrap();

    let client = Arc::new(builder.build().unwrap());
    let events = collect_auth_events(&client);
    server.accept_connection(1, "S1").await;

    let login = server.wait_for_frame(0, |v| v["msg"] == "method" && v["method"] == "login").await;
    server.send(json!({
        "msg": "result",
        "id": login["id"],
        "error": {
            "error": "too-many-requests",
            "reason": "Error, too many requests",
            "details": {"timeToReset": 100}
        }
    }));

    // The failure surfaces once, without a logout.
    eventually(|| {
        events.lock().iter().any(|e| {
            matches!(e, AuthEvent::LoginFailure(f)
                if !f.is_logout_triggered && f.error.as_deref() == Some("too-many-requests"))
        })
    })
    .await;
    // The token survives a rate limit.
    assert_eq!(storage.get_item(TOKEN_KEY).await.unwrap().as_deref(), Some("tok1"));

    // After timeToReset (+grace) the resume goes out again.
    eventually(|| {
        server
            .frames_for(0)
            .into_iter()
            .filter(|v| v["msg"] == "method" && v["method"] == "login")
            .count()
            >= 2
    })
    .await;
    let second = server
        .frames_for(0)
        .into_iter()
        .filter(|v| v["msg"] == "method" && v["method"] == "login")
        .nth(1)
        .unwrap();
    assert_eq!(second["params"][0], json!({"resume": "tok1"}));
}

#[tokio::test]
async fn transient_resume_failure_retries_with_backoff() {
    let (builder, server, storage) = test_builder();
    storage.set_item(TOKEN_KEY, "tok1").await.unwrap();

    let client = Arc::new(builder.build().unwrap());
    server.accept_connection(1, "S1").await;

    let login_frames = |server: &crate::utils::MockServer| {
        server
            .frames_for(0)
            .into_iter()
            .filter(|v| v["msg"] == "method" && v["method"] == "login")
            .collect::<Vec<_>>()
    };

    // Fail the first two resumes with a retryable error; each failure
    // schedules another attempt on the doubling backoff.
    for attempt in 0..2 {
        eventually(|| login_frames(&server).len() > attempt).await;
        let login = login_frames(&server)[attempt].clone();
        server.send(json!({
            "msg": "result",
            "id": login["id"],
            "error": {"error": "internal-error", "reason": "try later"}
        }));
    }

    eventually(|| login_frames(&server).len() >= 3).await;
    let third = login_frames(&server)[2].clone();
    server.send(json!({
        "msg": "result",
        "id": third["id"],
        "result": {"id": "u1", "token": "tok1"}
    }));
    eventually(|| client.user_id().as_deref() == Some("u1")).await;
    assert_eq!(client.get_auth_token().as_deref(), Some("tok1"));
}
