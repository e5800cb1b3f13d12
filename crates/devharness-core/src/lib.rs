//! Process-level test harness for a local multi-component dev server.
//!
//! [`Harness::start`] launches the dev server as a child process, waits
//! until every component has announced its address on stderr, and hands
//! back a handle that proxies RPCs to the default module while carrying
//! the identity and namespace headers a real request would have.
//!
//! ```text
//! Harness::start(config)
//!     |
//!     v
//! AdmissionGate::global().try_acquire()      one harness per process
//!     |
//!     v
//! supervisor::launch ---> workspace + manifests + child
//!     |                         |
//!     |                    stderr lines
//!     |                         v
//!     |                  AddressScanner --ScanEvent--> ReadinessBarrier
//!     v
//! Harness { RpcClient, RequestHeaders, ... }
//!     |
//!     |   call(service, method, &req) --> POST <default>/call?s=&m=
//!     |   close()                     --> SIGTERM, wait, rm workspace, release
//! ```

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod logging;
pub mod manifest;
pub mod readiness;
pub mod rpc;
pub mod supervisor;
pub mod toolchain;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use config::{ComponentSpec, HarnessConfig};
pub use context::Harness;
pub use error::{HarnessError, MissingComponent, Result};
pub use identity::User;
pub use logging::{CaptureSink, LogLevel, LogSink, TracingSink};
pub use rpc::{NamespaceMods, StringValue};
pub use toolchain::Toolchain;
