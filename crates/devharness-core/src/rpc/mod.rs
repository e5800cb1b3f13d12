//! RPC proxy to the running dev server.
//!
//! Requests are marshaled with [`codec`] and POSTed to
//! `<default module>/call?s=<service>&m=<method>`. Calls to the reserved
//! [`LOCAL_SERVICE`] are answered from the harness's headers instead and
//! never reach the network. Nothing is retried.

pub mod codec;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::identity::RequestHeaders;

pub use codec::{StringValue, marshal, unmarshal};

/// Service name whose methods are resolved in-process.
pub const LOCAL_SERVICE: &str = "__go__";
pub const GET_NAMESPACE: &str = "GetNamespace";
pub const GET_DEFAULT_NAMESPACE: &str = "GetDefaultNamespace";

/// Answer a pseudo-call from `headers`, or `None` when `method` is not one.
pub fn resolve_local(method: &str, headers: &RequestHeaders) -> Option<StringValue> {
    let value = match method {
        GET_NAMESPACE => headers.namespace(),
        GET_DEFAULT_NAMESPACE => headers.default_namespace(),
        _ => return None,
    };
    Some(StringValue::new(value))
}

// ---------------------------------------------------------------------------
// Namespace hooks
// ---------------------------------------------------------------------------

/// Rewrites an outgoing request so it targets a namespace.
pub type NamespaceHook = Arc<dyn Fn(&mut Value, &str) + Send + Sync>;

/// Per-service namespace hooks.
#[derive(Clone, Default)]
pub struct NamespaceMods {
    hooks: HashMap<String, NamespaceHook>,
}

impl NamespaceMods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, service: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(&mut Value, &str) + Send + Sync + 'static,
    {
        self.hooks.insert(service.into(), Arc::new(hook));
        self
    }

    /// Hook that sets the top-level string field `name`.
    pub fn field(name: impl Into<String>) -> impl Fn(&mut Value, &str) + Send + Sync + 'static {
        let name = name.into();
        move |request: &mut Value, namespace: &str| {
            if let Value::Object(fields) = request {
                fields.insert(name.clone(), Value::String(namespace.to_string()));
            }
        }
    }

    pub fn contains(&self, service: &str) -> bool {
        self.hooks.contains_key(service)
    }

    /// Apply the hook for `service`, if any. Returns whether one ran.
    pub fn apply(&self, service: &str, request: &mut Value, namespace: &str) -> bool {
        match self.hooks.get(service) {
            Some(hook) => {
                hook(request, namespace);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for NamespaceMods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<_> = self.hooks.keys().collect();
        services.sort();
        f.debug_struct("NamespaceMods")
            .field("services", &services)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client bound to one component address.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    call_url: String,
    namespace_mods: NamespaceMods,
}

impl RpcClient {
    /// Build a client for `address`, with `timeout` applied to every call.
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let base = base_url(address);
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if is_loopback(&base) {
            // Loopback is never proxied.
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| HarnessError::ConfigInvalid(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            call_url: format!("{}/call", base.trim_end_matches('/')),
            namespace_mods: NamespaceMods::default(),
        })
    }

    pub fn with_namespace_mods(mut self, mods: NamespaceMods) -> Self {
        self.namespace_mods = mods;
        self
    }

    pub fn namespace_mods(&self) -> &NamespaceMods {
        &self.namespace_mods
    }

    pub fn namespace_mods_mut(&mut self) -> &mut NamespaceMods {
        &mut self.namespace_mods
    }

    pub fn call_url(&self) -> &str {
        &self.call_url
    }

    /// One round trip with an already-marshaled body.
    pub async fn call_raw(&self, service: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let transport = |source| HarnessError::RpcTransport {
            service: service.to_string(),
            method: method.to_string(),
            source,
        };

        debug!(service, method, bytes = body.len(), "rpc call");
        let response = self
            .http
            .post(&self.call_url)
            .query(&[("s", service), ("m", method)])
            .body(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.bytes().await.map_err(transport)?;
            debug!(service, method, status = status.as_u16(), "rpc failed");
            return Err(HarnessError::RpcStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }

    /// Typed call. Pseudo-calls are answered from `headers`; otherwise the
    /// current namespace is injected when a hook exists for `service`.
    pub async fn call<Req, Resp>(
        &self,
        headers: &RequestHeaders,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        if service == LOCAL_SERVICE {
            if let Some(answer) = resolve_local(method, headers) {
                debug!(method, "resolved locally");
                return unmarshal(&marshal(&answer)?);
            }
        }

        let namespace = headers.namespace();
        let body = if !namespace.is_empty() && self.namespace_mods.contains(service) {
            let mut value = serde_json::to_value(request)?;
            self.namespace_mods.apply(service, &mut value, namespace);
            marshal(&value)?
        } else {
            marshal(request)?
        };

        let response = self.call_raw(service, method, body).await?;
        unmarshal(&response)
    }
}

/// Accept bare `host:port` announcements as well as full URLs.
fn base_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

fn is_loopback(url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(url) else {
        return false;
    };
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback()),
        None => false,
    }
}
