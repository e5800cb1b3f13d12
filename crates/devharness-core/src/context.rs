//! The user-facing harness handle.
//!
//! A [`Harness`] owns one running dev server: the admission permit, the
//! child and its workspace, the discovered addresses, and the request
//! headers that stand in for the identity of an incoming request.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::admission::{AdmissionGate, AdmissionPermit};
use crate::config::{ComponentSpec, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::identity::{RequestHeaders, User};
use crate::logging::{LogLevel, LogSink, Logger, TracingSink};
use crate::manifest::DefaultTemplates;
use crate::readiness::{ADMIN_SERVER, API_SERVER, ComponentAddresses};
use crate::rpc::{NamespaceMods, RpcClient};
use crate::supervisor::{self, DEFAULT_MODULE, ProcessSupervisor};

/// A running dev server plus the request context used to talk to it.
///
/// Always finish with [`close`](Self::close). Dropping an open harness
/// kills the child without waiting for it.
pub struct Harness {
    app_id: String,
    components: Vec<ComponentSpec>,
    logger: Logger,
    headers: RequestHeaders,
    addresses: ComponentAddresses,
    rpc: RpcClient,
    // Dropped before the permit so the child is signalled first.
    supervisor: ProcessSupervisor,
    permit: AdmissionPermit,
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("app_id", &self.app_id)
            .field("addresses", &self.addresses)
            .field("headers", &self.headers)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Start a dev server for `config` and wait until every component is
    /// ready.
    ///
    /// Fails with [`HarnessError::AlreadyRunning`] while another harness in
    /// this process is open. On any failure the child, the workspace and
    /// the admission permit are all released before returning.
    pub async fn start(config: HarnessConfig) -> Result<Self> {
        config.validate()?;

        let gate = AdmissionGate::global();
        let permit = match config.admission_wait {
            Some(wait) => gate.acquire(wait).await?,
            None => gate.try_acquire()?,
        };

        let sink: Arc<dyn LogSink> = config
            .sink
            .clone()
            .unwrap_or_else(|| Arc::new(TracingSink));
        let logger = Logger::new(config.log_level, sink);

        let (mut supervisor, addresses) =
            supervisor::launch(&config, &DefaultTemplates, logger.clone()).await?;

        let rpc = match addresses
            .get(DEFAULT_MODULE)
            .ok_or_else(|| {
                HarnessError::ConfigInvalid(format!("no address for module {DEFAULT_MODULE:?}"))
            })
            .and_then(|address| RpcClient::new(address, config.rpc_timeout))
        {
            Ok(rpc) => rpc,
            Err(e) => {
                supervisor.abort().await;
                return Err(e);
            }
        };

        info!(
            app_id = config.app_id(),
            pid = supervisor.pid(),
            components = addresses.len(),
            "harness ready"
        );
        Ok(Self {
            app_id: config.app_id().to_string(),
            components: config.components,
            logger,
            headers: RequestHeaders::new(),
            addresses,
            rpc,
            supervisor,
            permit,
        })
    }

    /// Whether [`close`](Self::close) has not run yet.
    pub fn is_open(&self) -> bool {
        self.permit.is_held()
    }

    /// Stop the child, remove the workspace, and release the admission
    /// permit. Safe to call again; later calls do nothing.
    ///
    /// The permit is released even when the child exits abnormally; that
    /// failure is still returned.
    pub async fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let result = self.supervisor.teardown().await;
        self.permit.release();
        if let Err(e) = &result {
            warn!(error = %e, "harness closed with error");
        }
        result
    }

    /// Stop the child, read `relative` from its storage directory, then
    /// finish closing as [`close`](Self::close) does.
    ///
    /// The file layout under the storage directory belongs to the backend.
    pub async fn close_and_export(&mut self, relative: impl AsRef<Path>) -> Result<Vec<u8>> {
        let Some(storage) = self.supervisor.storage_dir() else {
            return Err(HarnessError::workspace(
                relative.as_ref(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "harness already closed"),
            ));
        };
        let path = storage.join(relative);

        let terminated = self.supervisor.terminate().await;
        let exported = tokio::fs::read(&path)
            .await
            .map_err(|e| HarnessError::workspace(&path, e));
        self.supervisor.remove_workspace();
        self.permit.release();

        terminated?;
        exported
    }

    // -----------------------------------------------------------------------
    // Identity and namespace
    // -----------------------------------------------------------------------

    /// Act as `user` on subsequent requests, replacing any previous user.
    pub fn login(&mut self, user: &User) {
        self.headers.login(user);
    }

    pub fn logout(&mut self) {
        self.headers.logout();
    }

    pub fn current_user(&self) -> Option<User> {
        self.headers.user()
    }

    pub fn current_namespace(&self) -> &str {
        self.headers.namespace()
    }

    /// Set the namespace for subsequent calls; `""` clears it.
    pub fn set_namespace(&mut self, namespace: &str) {
        self.headers.set_namespace(namespace);
    }

    pub fn default_namespace(&self) -> &str {
        self.headers.default_namespace()
    }

    pub fn headers(&self) -> &RequestHeaders {
        &self.headers
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn fully_qualified_app_id(&self) -> String {
        format!("dev~{}", self.app_id)
    }

    pub fn components(&self) -> &[ComponentSpec] {
        &self.components
    }

    // -----------------------------------------------------------------------
    // Addresses
    // -----------------------------------------------------------------------

    pub fn addresses(&self) -> &ComponentAddresses {
        &self.addresses
    }

    /// Address announced by `name` (`"API"`, `"admin"`, or a module).
    pub fn component_url(&self, name: &str) -> Option<&str> {
        self.addresses.get(name)
    }

    pub fn api_url(&self) -> Option<&str> {
        self.component_url(API_SERVER)
    }

    pub fn admin_url(&self) -> Option<&str> {
        self.component_url(ADMIN_SERVER)
    }

    /// The module RPCs are sent to.
    pub fn default_url(&self) -> Option<&str> {
        self.component_url(DEFAULT_MODULE)
    }

    /// Workspace directory, while the harness is open.
    pub fn workspace(&self) -> Option<&Path> {
        self.supervisor.workspace()
    }

    /// Child pid, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    // -----------------------------------------------------------------------
    // RPC
    // -----------------------------------------------------------------------

    pub fn namespace_mods_mut(&mut self) -> &mut NamespaceMods {
        self.rpc.namespace_mods_mut()
    }

    /// Typed call against the default module.
    pub async fn call<Req, Resp>(&self, service: &str, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.rpc.call(&self.headers, service, method, request).await
    }

    /// Call with a pre-marshaled body; no pseudo-calls, no namespace hooks.
    pub async fn call_raw(&self, service: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        self.rpc.call_raw(service, method, body).await
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    pub fn log_level(&self) -> LogLevel {
        self.logger.threshold()
    }

    pub fn log(&self, level: LogLevel, message: impl fmt::Display) {
        self.logger.log(level, &message.to_string());
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warning, message);
    }

    pub fn critical(&self, message: impl fmt::Display) {
        self.log(LogLevel::Critical, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, message);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(app_id = %self.app_id, "harness dropped without close()");
        }
    }
}
