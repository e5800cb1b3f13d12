//! End-to-end tests: the real harness driving the fake dev server binary.
//!
//! The harness runs `env <devharness-fake> <flags> <manifests>`, so these
//! tests cover command construction, banner discovery, RPC dispatch and
//! graceful shutdown against an actual child process.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use devharness_core::rpc::{GET_NAMESPACE, LOCAL_SERVICE};
use devharness_core::{
    CaptureSink, Harness, HarnessConfig, HarnessError, LogLevel, StringValue, Toolchain,
};
use devharness_test_utils::serial;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fake_config() -> HarnessConfig {
    HarnessConfig::new()
        .with_toolchain(Toolchain::new("env", env!("CARGO_BIN_EXE_devharness-fake")))
        .with_startup_timeout(Duration::from_secs(15))
        .with_rpc_timeout(Duration::from_secs(10))
}

async fn fetch(url: &str) -> String {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    client
        .get(url)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn calls_reach_the_default_module() {
    let _guard = serial().await;
    let mut harness = Harness::start(fake_config()).await.unwrap();

    let response: Value = harness
        .call("memcache", "Set", &json!({"key": "a", "value": 1}))
        .await
        .unwrap();
    assert_eq!(response, json!({"key": "a", "value": 1}));

    let err = harness
        .call::<_, Value>("failing", "Get", &json!({}))
        .await
        .unwrap_err();
    match err {
        HarnessError::RpcStatus { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "backend exploded");
        }
        other => panic!("expected RpcStatus, got {other:?}"),
    }

    // The fake rejects local-service calls with a 400; this must not get there.
    harness.set_namespace("ns1");
    let namespace: StringValue = harness
        .call(LOCAL_SERVICE, GET_NAMESPACE, &json!({}))
        .await
        .unwrap();
    assert_eq!(namespace.as_str(), "ns1");

    let pid = harness.pid().unwrap();
    harness.close().await.unwrap();
    assert!(harness.pid().is_none());
    assert!(!devharness_test_utils::process_alive(pid));
}

#[tokio::test]
async fn configured_modules_get_their_own_addresses() {
    let _guard = serial().await;
    let dir = tempfile::tempdir().unwrap();
    let worker = dir.path().join("worker.yaml");
    std::fs::write(&worker, "application: e2e\nmodule: worker\n").unwrap();

    let mut harness = Harness::start(
        fake_config()
            .with_app_id("e2e")
            .with_component("worker", &worker),
    )
    .await
    .unwrap();

    let worker_url = harness.component_url("worker").unwrap().to_string();
    let default_url = harness.default_url().unwrap().to_string();
    assert_ne!(worker_url, default_url);
    assert_eq!(fetch(&worker_url).await, "worker");
    assert_eq!(fetch(&default_url).await, "default");
    assert_eq!(fetch(harness.admin_url().unwrap()).await, "admin");

    harness.close().await.unwrap();
}

#[tokio::test]
async fn component_named_default_takes_the_rpc_route() {
    let _guard = serial().await;
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("app.yaml");
    std::fs::write(&app, "application: e2e\nmodule: default\n").unwrap();

    let mut harness = Harness::start(
        fake_config()
            .with_app_id("e2e")
            .with_component("default", &app),
    )
    .await
    .unwrap();

    assert!(harness.component_url("harness-helper").is_some());
    let default_url = harness.default_url().unwrap().to_string();
    assert_eq!(fetch(&default_url).await, "default");

    harness.close().await.unwrap();
}

#[tokio::test]
async fn export_reads_what_the_server_wrote_on_shutdown() {
    let _guard = serial().await;
    let mut harness = Harness::start(fake_config()).await.unwrap();

    let _: Value = harness.call("memcache", "Set", &json!({})).await.unwrap();
    let _: Value = harness.call("taskqueue", "Add", &json!({})).await.unwrap();

    let bytes = harness.close_and_export("calls.json").await.unwrap();
    let calls: Vec<String> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(calls, vec!["memcache.Set", "taskqueue.Add"]);
    assert!(!harness.is_open());
}

#[tokio::test]
async fn child_level_mirrors_server_stderr() {
    let _guard = serial().await;
    let sink = CaptureSink::new();
    let mut harness = Harness::start(
        fake_config()
            .with_log_level(LogLevel::Child)
            .with_sink(Arc::new(sink.clone())),
    )
    .await
    .unwrap();
    harness.close().await.unwrap();

    let lines = sink.lines();
    assert!(
        lines.iter().any(|l| l.starts_with("CHILD: Starting API server at: http://127.0.0.1:")),
        "{lines:?}"
    );
    assert!(
        lines.iter().any(|l| l.contains("Skipping SDK update check")),
        "{lines:?}"
    );
}
