//! Error taxonomy for the harness.
//!
//! Every failure is surfaced to the caller from the operation that detected
//! it. Nothing in this crate retries.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// A component that never announced its address before the deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingComponent {
    /// Endpoint name (`API`, `admin`, or the module name).
    pub name: String,
    /// Manifest of the configured component this endpoint belongs to, if any.
    pub manifest: Option<PathBuf>,
}

impl std::fmt::Display for MissingComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.manifest {
            Some(path) => write!(f, "{} ({})", self.name, path.display()),
            None => f.write_str(&self.name),
        }
    }
}

fn join_missing(missing: &[MissingComponent]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors produced while starting, using, or tearing down a harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Another harness holds the process-wide admission permit.
    #[error("a harness is already running in this process; make sure to call close()")]
    AlreadyRunning,

    /// The harness configuration is unusable.
    #[error("invalid harness configuration: {0}")]
    ConfigInvalid(String),

    /// The interpreter or the server executable could not be found.
    #[error("could not find {what}: {detail}")]
    DependencyNotFound { what: &'static str, detail: String },

    /// The host OS has no known command-line shape.
    #[error("harness is not supported on platform {0:?}")]
    UnsupportedPlatform(String),

    /// Temporary workspace could not be created, written, or read.
    #[error("workspace error at {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// One or more components never reported an address.
    #[error("timeout starting child process; no address for: {}", join_missing(.missing))]
    StartupTimeout { missing: Vec<MissingComponent> },

    /// The diagnostic stream closed before every component was ready.
    #[error("child process exited before becoming ready; no address for: {}", join_missing(.missing))]
    ExitedBeforeReady { missing: Vec<MissingComponent> },

    /// Reading the child's diagnostic stream failed.
    #[error("error reading child process stderr: {0}")]
    StartupIo(#[source] std::io::Error),

    /// Waiting for the child failed or it exited abnormally.
    #[error("error closing child process: {detail}")]
    ChildExit {
        detail: String,
        status: Option<ExitStatus>,
    },

    /// The HTTP round trip itself failed.
    #[error("rpc {service}.{method} transport error: {source}")]
    RpcTransport {
        service: String,
        method: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with something other than 200.
    #[error("got status {status}; body: {body:?}")]
    RpcStatus { status: u16, body: String },

    /// Marshaling the request or unmarshaling the response failed.
    #[error("rpc codec error: {0}")]
    RpcCodec(#[from] serde_json::Error),
}

impl HarnessError {
    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }
}
