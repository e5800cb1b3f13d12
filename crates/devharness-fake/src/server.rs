//! HTTP side of the fake dev server: one listener per component, startup
//! banners on stderr, and `POST /call` for RPCs.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;

/// Requests for this service are answered with a 500.
pub const FAILING_SERVICE: &str = "failing";
/// Reserved for calls the harness must resolve itself.
pub const LOCAL_SERVICE: &str = "__go__";
/// Written under the storage path on shutdown: every `service.method` seen.
pub const CALL_LOG: &str = "calls.json";

const DEFAULT_MODULE: &str = "default";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub api_port: u16,
    pub admin_port: u16,
    pub storage_path: Option<PathBuf>,
    pub clear_datastore: bool,
    pub skip_sdk_update_check: bool,
    pub manifests: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// Module declared by a manifest's `module:` line, `default` when absent.
pub fn module_name(manifest: &str) -> String {
    manifest
        .lines()
        .filter_map(|line| line.trim().strip_prefix("module:"))
        .map(|name| name.trim().trim_matches(|c| c == '"' || c == '\''))
        .find(|name| !name.is_empty())
        .unwrap_or(DEFAULT_MODULE)
        .to_string()
}

fn read_module_name(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    Ok(module_name(&text))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppState {
    component: Arc<str>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl AppState {
    pub fn new(component: &str, calls: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            component: Arc::from(component),
            calls,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    s: String,
    m: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/call", post(call))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> String {
    state.component.to_string()
}

async fn call(
    State(state): State<AppState>,
    Query(params): Query<CallParams>,
    body: Bytes,
) -> axum::response::Response {
    tracing::info!(component = %state.component, service = %params.s, method = %params.m, "call");
    state
        .calls
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(format!("{}.{}", params.s, params.m));

    match params.s.as_str() {
        LOCAL_SERVICE => (
            StatusCode::BAD_REQUEST,
            format!("{LOCAL_SERVICE}.{} must not reach the server", params.m),
        )
            .into_response(),
        FAILING_SERVICE => (StatusCode::INTERNAL_SERVER_ERROR, "backend exploded").into_response(),
        _ => (StatusCode::OK, body).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Bind every component, announce them, and serve until a shutdown signal.
pub async fn run(config: ServerConfig) -> Result<()> {
    if config.manifests.is_empty() {
        bail!("at least one manifest is required");
    }
    let modules = config
        .manifests
        .iter()
        .map(|m| read_module_name(m))
        .collect::<Result<Vec<_>>>()?;

    if let Some(storage) = &config.storage_path {
        prepare_storage(storage, config.clear_datastore)?;
    }
    if config.skip_sdk_update_check {
        eprintln!("INFO     Skipping SDK update check.");
    }

    // Installed before any banner so a prompt SIGTERM is still graceful.
    let mut signal = ShutdownSignal::install()?;

    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let (stop, stopped) = watch::channel(false);
    let mut servers = JoinSet::new();

    let api = bind(config.host, config.api_port).await?;
    eprintln!("Starting API server at: http://{}", api.local_addr()?);
    serve(&mut servers, api, AppState::new("API", Arc::clone(&calls)), stopped.clone());

    for (index, module) in modules.iter().enumerate() {
        // Only the first module may take the fixed port.
        let port = if index == 0 { config.port } else { 0 };
        let listener = bind(config.host, port).await?;
        eprintln!(
            "Starting module \"{module}\" running at: http://{}",
            listener.local_addr()?
        );
        serve(&mut servers, listener, AppState::new(module, Arc::clone(&calls)), stopped.clone());
    }

    let admin = bind(config.host, config.admin_port).await?;
    eprintln!("Starting admin server at: http://{}", admin.local_addr()?);
    serve(&mut servers, admin, AppState::new("admin", Arc::clone(&calls)), stopped);

    signal.wait().await;
    tracing::info!("shutting down");
    let _ = stop.send(true);

    while let Some(joined) = servers.join_next().await {
        joined.context("server task panicked")??;
    }

    if let Some(storage) = &config.storage_path {
        let seen = calls.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let path = storage.join(CALL_LOG);
        std::fs::write(&path, serde_json::to_vec_pretty(&seen)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    tracing::info!("fake dev server stopped");
    Ok(())
}

fn prepare_storage(storage: &Path, clear: bool) -> Result<()> {
    if clear && storage.exists() {
        std::fs::remove_dir_all(storage)
            .with_context(|| format!("failed to clear {}", storage.display()))?;
    }
    std::fs::create_dir_all(storage)
        .with_context(|| format!("failed to create {}", storage.display()))
}

async fn bind(host: IpAddr, port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::new(host, port);
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

fn serve(
    servers: &mut JoinSet<Result<()>>,
    listener: TcpListener,
    state: AppState,
    mut stopped: watch::Receiver<bool>,
) {
    let app = build_router(state);
    servers.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.wait_for(|stop| *stop).await;
            })
            .await?;
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?,
        })
    }

    async fn wait(&mut self) {
        #[cfg(unix)]
        let terminate = self.terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = terminate => tracing::info!("received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "ctrl-c handler failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn app(component: &str) -> (Router, Arc<Mutex<Vec<String>>>) {
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();
        (build_router(AppState::new(component, Arc::clone(&calls))), calls)
    }

    async fn post_call(app: Router, service: &str, method: &str, body: &'static str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/call?s={service}&m={method}"))
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn module_name_from_manifest() {
        assert_eq!(module_name("application: x\nmodule: worker\n"), "worker");
        assert_eq!(module_name("module: \"quoted\"\n"), "quoted");
        assert_eq!(module_name("application: x\n"), "default");
        assert_eq!(module_name("module:\nmodule: second\n"), "second");
    }

    #[tokio::test]
    async fn call_echoes_body_and_records() {
        let (app, calls) = app("default");
        let (status, body) = post_call(app, "memcache", "Get", r#"{"key":"k"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"key":"k"}"#);
        assert_eq!(*calls.lock().unwrap(), vec!["memcache.Get".to_string()]);
    }

    #[tokio::test]
    async fn failing_service_returns_500() {
        let (app, _) = app("default");
        let (status, body) = post_call(app, FAILING_SERVICE, "Get", "{}").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "backend exploded");
    }

    #[tokio::test]
    async fn local_service_is_rejected() {
        let (app, _) = app("default");
        let (status, body) = post_call(app, LOCAL_SERVICE, "GetNamespace", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("GetNamespace"));
    }

    #[tokio::test]
    async fn index_names_the_component() {
        let (app, _) = app("worker");
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"worker");
    }

    #[test]
    fn clearing_storage_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("data.datastore");
        std::fs::create_dir_all(&storage).unwrap();
        std::fs::write(storage.join("old"), "x").unwrap();

        prepare_storage(&storage, true).unwrap();
        assert!(storage.is_dir());
        assert!(!storage.join("old").exists());
    }
}
