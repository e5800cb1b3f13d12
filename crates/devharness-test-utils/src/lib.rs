//! Shared test utilities for devharness integration tests.
//!
//! - [`serial`]: process-wide lock. The admission gate allows one harness
//!   per process, so every test that starts one must hold this first.
//! - [`StubServer`]: a shell script standing in for the dev server. It
//!   prints whatever banners it is given on stderr and then sleeps.
//! - [`RecordingBackend`]: an in-process `/call` endpoint that records
//!   every request it receives.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use serde::Deserialize;
use tokio::sync::{MutexGuard, oneshot};
use tokio::task::JoinHandle;

// ===========================================================================
// Serialization
// ===========================================================================

static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Hold for the whole test when it starts a harness.
pub async fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().await
}

// ===========================================================================
// Banners
// ===========================================================================

pub fn api_banner(address: &str) -> String {
    format!("Starting API server at: {address}")
}

pub fn admin_banner(address: &str) -> String {
    format!("Starting admin server at: {address}")
}

pub fn module_banner(name: &str, address: &str) -> String {
    format!("Starting module \"{name}\" running at: {address}")
}

/// API, admin and `default` module banners with placeholder addresses.
pub fn standard_banners(default_address: &str) -> Vec<String> {
    vec![
        "INFO     Skipping SDK update check.".to_string(),
        api_banner("http://localhost:1"),
        module_banner("default", default_address),
        admin_banner("http://localhost:2"),
    ]
}

// ===========================================================================
// Stub server script
// ===========================================================================

/// A generated stand-in for the dev server executable.
///
/// Run it with `Toolchain::new("sh", stub.script())`; the dev server flags
/// arrive as ignored positional arguments.
#[derive(Debug)]
pub struct StubServer {
    script: PathBuf,
    pid_file: PathBuf,
}

impl StubServer {
    /// Write a script into `dir` that records its pid, prints `banners` on
    /// stderr, and then execs `sleep 30` so signals reach the same process.
    pub fn write(dir: &Path, banners: &[String]) -> anyhow::Result<Self> {
        Self::write_with_tail(dir, banners, "exec sleep 30")
    }

    /// Like [`write`](Self::write) but ends with `tail` instead of sleeping.
    pub fn write_with_tail(dir: &Path, banners: &[String], tail: &str) -> anyhow::Result<Self> {
        let script = dir.join("dev_appserver_stub.sh");
        let pid_file = dir.join("stub.pid");

        let mut body = String::from("#!/bin/sh\n");
        body.push_str(&format!("echo $$ > {}\n", shell_quote(&pid_file.to_string_lossy())));
        for banner in banners {
            body.push_str(&format!("echo {} >&2\n", shell_quote(banner)));
        }
        body.push_str(tail);
        body.push('\n');

        std::fs::write(&script, body)
            .with_context(|| format!("failed to write stub script {}", script.display()))?;
        Ok(Self { script, pid_file })
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Pid the script recorded, once it has started.
    pub fn pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Whether a process with `pid` still exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs the existence check only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

// ===========================================================================
// Recording backend
// ===========================================================================

/// Requests to this service are answered with a 500.
pub const FAILING_SERVICE: &str = "failing";
pub const FAILURE_BODY: &str = "backend exploded";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub service: String,
    pub method: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    s: String,
    m: String,
}

type Calls = Arc<Mutex<Vec<RecordedCall>>>;

/// `POST /call?s=&m=` server that echoes the body back with 200, except
/// for [`FAILING_SERVICE`].
#[derive(Debug)]
pub struct RecordingBackend {
    addr: SocketAddr,
    calls: Calls,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RecordingBackend {
    pub async fn start() -> anyhow::Result<Self> {
        let calls: Calls = Arc::default();
        let app = Router::new()
            .route("/call", post(record_call))
            .with_state(Arc::clone(&calls));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind recording backend")?;
        let addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "recording backend stopped");
            }
        });

        Ok(Self {
            addr,
            calls,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether any call for `service` was received.
    pub fn saw_service(&self, service: &str) -> bool {
        self.calls().iter().any(|c| c.service == service)
    }
}

impl Drop for RecordingBackend {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.abort();
    }
}

async fn record_call(
    State(calls): State<Calls>,
    Query(params): Query<CallParams>,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    calls
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(RecordedCall {
            service: params.s.clone(),
            method: params.m,
            body: body.to_vec(),
        });

    if params.s == FAILING_SERVICE {
        (StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY.as_bytes().to_vec())
    } else {
        (StatusCode::OK, body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(r#"Starting module "a" running at: x"#), r#"'Starting module "a" running at: x'"#);
    }

    #[test]
    fn stub_script_contains_banners() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubServer::write(dir.path(), &standard_banners("http://localhost:3")).unwrap();
        let text = std::fs::read_to_string(stub.script()).unwrap();
        assert!(text.starts_with("#!/bin/sh\n"));
        assert!(text.contains("Starting API server at: http://localhost:1"));
        assert!(text.trim_end().ends_with("exec sleep 30"));
        assert_eq!(stub.pid(), None);
    }
}
