//! Address discovery: wait until every component has announced itself.
//!
//! # Architecture
//!
//! ```text
//! child stderr
//!     |
//!     v
//! AddressScanner (spawned task, lives as long as the stream)
//!     |   ScanEvent::Address { name, address }
//!     |   ScanEvent::ReadError(io::Error)
//!     |   ScanEvent::Closed
//!     v
//! mpsc channel
//!     |
//!     v
//! ReadinessBarrier::await_all(deadline) --> ComponentAddresses
//! ```
//!
//! The dev server prints one banner per sub-service on every boot:
//!
//! ```text
//! Starting API server at: http://localhost:40231
//! Starting module "default" running at: http://localhost:37105
//! Starting admin server at: http://localhost:46617
//! ```

pub mod barrier;
pub mod scanner;

use std::path::PathBuf;

use regex::Regex;

use crate::config::ComponentSpec;

pub use barrier::{ComponentAddresses, ReadinessBarrier};
pub use scanner::{AddressScanner, ScanEvent};

/// Endpoint name of the API server.
pub const API_SERVER: &str = "API";
/// Endpoint name of the admin server.
pub const ADMIN_SERVER: &str = "admin";

/// One required component and, once announced, its address.
#[derive(Debug, Clone)]
pub struct ComponentEndpoint {
    name: String,
    pattern: Regex,
    manifest: Option<PathBuf>,
    address: Option<String>,
}

impl ComponentEndpoint {
    fn with_pattern(name: &str, pattern: &str, manifest: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            pattern: Regex::new(pattern).expect("discovery pattern must compile"),
            manifest,
            address: None,
        }
    }

    /// The built-in API server.
    pub fn api() -> Self {
        Self::with_pattern(API_SERVER, r"Starting API server at: (\S+)", None)
    }

    /// The built-in admin server.
    pub fn admin() -> Self {
        Self::with_pattern(ADMIN_SERVER, r"Starting admin server at: (\S+)", None)
    }

    /// A module, matched by its quoted name.
    pub fn module(name: &str, manifest: Option<PathBuf>) -> Self {
        let pattern = format!(
            r#"Starting module "{}" (?:running|server) at: (\S+)"#,
            regex::escape(name)
        );
        Self::with_pattern(name, &pattern, manifest)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> Option<&PathBuf> {
        self.manifest.as_ref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.address.is_some()
    }

    /// The address token this endpoint's banner carries in `line`, if any.
    pub fn extract(&self, line: &str) -> Option<String> {
        self.pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Record the address. Only the first call has any effect.
    pub(crate) fn resolve(&mut self, address: String) -> bool {
        if self.address.is_some() {
            return false;
        }
        self.address = Some(address);
        true
    }
}

/// Every endpoint a harness must see before it is usable: API, admin, the
/// implicit module, then one per configured component, in that order.
pub fn required_endpoints(implicit_module: &str, components: &[ComponentSpec]) -> Vec<ComponentEndpoint> {
    let mut endpoints = vec![
        ComponentEndpoint::api(),
        ComponentEndpoint::admin(),
        ComponentEndpoint::module(implicit_module, None),
    ];
    endpoints.extend(
        components
            .iter()
            .map(|c| ComponentEndpoint::module(&c.name, Some(c.manifest.clone()))),
    );
    endpoints
}
