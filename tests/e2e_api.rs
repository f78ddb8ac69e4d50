use std::sync::Arc;
use std::time::Duration;

use claudehaus::config::ConfigStore;
use claudehaus::{run, Settings};
use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::sleep;

struct TestServer {
    base: String,
    token: String,
    handle: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());
    let token = config.create_token("e2e").unwrap();

    let port = find_free_port().await;
    let handle = tokio::spawn({
        let config = config.clone();
        async move {
            run(
                config,
                Settings {
                    host: "127.0.0.1".into(),
                    port,
                },
            )
            .await
            .unwrap();
        }
    });

    let server = TestServer {
        base: format!("http://127.0.0.1:{port}"),
        token,
        handle,
        _dir: dir,
    };

    let client = Client::new();
    for _ in 0..100 {
        if client.get(server.url("/health")).send().await.is_ok() {
            return server;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("server did not come up");
}

#[tokio::test]
async fn health_is_open_but_api_is_not() {
    let server = start_server().await;
    let client = Client::new();

    let response = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    let response = client.get(server.url("/api/sessions")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(server.url("/api/sessions"))
        .bearer_auth(&server.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.handle.abort();
}

#[tokio::test]
async fn token_creation_and_verification() {
    let server = start_server().await;
    let client = Client::new();

    let response = client
        .post(server.url("/api/tokens"))
        .bearer_auth(&server.token)
        .json(&json!({ "name": "ci" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let created: Value = response.json().await.unwrap();
    let secret = created["token"].as_str().unwrap().to_string();
    assert_eq!(secret.len(), 64);

    let tokens: Value = client
        .get(server.url("/api/tokens"))
        .bearer_auth(&server.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(tokens
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t["name"] == "ci"));

    let response = client
        .post(server.url("/api/tokens/verify"))
        .json(&json!({ "token": "a".repeat(64) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(server.url("/api/tokens/verify"))
        .json(&json!({ "token": secret }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permission_request_rendezvous() {
    let server = start_server().await;
    let client = Client::new();

    let hook = tokio::spawn({
        let client = client.clone();
        let url = server.url("/api/hooks/PermissionRequest");
        let token = server.token.clone();
        async move {
            client
                .post(url)
                .bearer_auth(token)
                .json(&json!({
                    "session_id": "s1",
                    "cwd": "/tmp/p",
                    "tool_name": "Bash",
                    "tool_input": { "cmd": "ls" },
                    "prompt": "run ls"
                }))
                .send()
                .await
                .unwrap()
        }
    });

    let approval_id = {
        let mut found = None;
        for _ in 0..250 {
            let approvals: Value = client
                .get(server.url("/api/sessions/s1/approvals"))
                .bearer_auth(&server.token)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if let Some(id) = approvals[0]["id"].as_str() {
                found = Some(id.to_string());
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        found.expect("approval never appeared")
    };

    let response = client
        .post(server.url(&format!("/api/approvals/{approval_id}")))
        .bearer_auth(&server.token)
        .json(&json!({ "decision": "allow" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let hook_response = hook.await.unwrap();
    assert_eq!(hook_response.status(), 200);
    let envelope: Value = hook_response.json().await.unwrap();
    assert_eq!(
        envelope,
        json!({
            "hookSpecificOutput": {
                "hookEventName": "PermissionRequest",
                "decision": { "behavior": "allow" }
            }
        })
    );

    let session: Value = client
        .get(server.url("/api/sessions/s1"))
        .bearer_auth(&server.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["pending_count"], 0);
    assert_eq!(session["has_pending"], false);

    server.handle.abort();
}

#[tokio::test]
async fn timed_out_request_passes_through() {
    let server = start_server().await;
    let client = Client::new();

    let response = client
        .patch(server.url("/api/settings"))
        .bearer_auth(&server.token)
        .json(&json!({ "approval_timeout_seconds": 0, "approval_timeout_behavior": "passthrough" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(server.url("/api/hooks/PermissionRequest"))
        .bearer_auth(&server.token)
        .json(&json!({
            "session_id": "s1",
            "cwd": "/tmp/p",
            "tool_name": "Bash",
            "tool_input": { "cmd": "ls" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().is_empty());

    server.handle.abort();
}
