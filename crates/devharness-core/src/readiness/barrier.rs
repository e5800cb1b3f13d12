//! The readiness barrier.
//!
//! Success is declared only once every required endpoint holds an address
//! taken from the child's own announcement. Any other outcome is a
//! failure, and a failed barrier never turns into a success.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{ComponentEndpoint, ScanEvent};
use crate::error::{HarnessError, MissingComponent, Result};

/// Resolved addresses, in the order the endpoints were declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentAddresses {
    entries: Vec<(String, String)>,
}

impl ComponentAddresses {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, addr)| addr.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Waits for a fixed set of endpoints to resolve.
#[derive(Debug)]
pub struct ReadinessBarrier {
    endpoints: Vec<ComponentEndpoint>,
}

impl ReadinessBarrier {
    pub fn new(endpoints: Vec<ComponentEndpoint>) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &[ComponentEndpoint] {
        &self.endpoints
    }

    fn all_resolved(&self) -> bool {
        self.endpoints.iter().all(ComponentEndpoint::is_resolved)
    }

    fn missing(&self) -> Vec<MissingComponent> {
        self.endpoints
            .iter()
            .filter(|e| !e.is_resolved())
            .map(|e| MissingComponent {
                name: e.name().to_string(),
                manifest: e.manifest().cloned(),
            })
            .collect()
    }

    /// Apply one announcement. Unknown names and repeats are ignored.
    pub fn apply(&mut self, name: &str, address: String) {
        if let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.name() == name) {
            if endpoint.resolve(address) {
                debug!(component = name, address = endpoint.address(), "endpoint resolved");
            }
        }
    }

    /// Consume events until every endpoint is resolved, the stream fails or
    /// closes, or `deadline` passes.
    ///
    /// The caller owns the child and must kill it on any error.
    pub async fn await_all(
        mut self,
        events: &mut mpsc::Receiver<ScanEvent>,
        deadline: Instant,
    ) -> Result<ComponentAddresses> {
        loop {
            if self.all_resolved() {
                let entries: Vec<(String, String)> = self
                    .endpoints
                    .into_iter()
                    .filter_map(|e| {
                        let address = e.address?;
                        Some((e.name, address))
                    })
                    .collect();
                info!(components = entries.len(), "all components ready");
                return Ok(ComponentAddresses { entries });
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_elapsed) => {
                    return Err(HarnessError::StartupTimeout {
                        missing: self.missing(),
                    });
                }
                Ok(None) | Ok(Some(ScanEvent::Closed)) => {
                    return Err(HarnessError::ExitedBeforeReady {
                        missing: self.missing(),
                    });
                }
                Ok(Some(ScanEvent::ReadError(e))) => return Err(HarnessError::StartupIo(e)),
                Ok(Some(ScanEvent::Address { name, address })) => self.apply(&name, address),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::config::ComponentSpec;
    use crate::readiness::required_endpoints;

    fn barrier_with(components: &[ComponentSpec]) -> ReadinessBarrier {
        ReadinessBarrier::new(required_endpoints("default", components))
    }

    fn address(name: &str, address: &str) -> ScanEvent {
        ScanEvent::Address {
            name: name.to_string(),
            address: address.to_string(),
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn resolves_once_every_endpoint_reports() {
        let components = vec![ComponentSpec::new("worker", "/tmp/worker.yaml")];
        let (tx, mut rx) = mpsc::channel(16);
        for event in [
            address("worker", "http://localhost:4"),
            address("API", "http://localhost:1"),
            address("API", "http://localhost:99"),
            address("admin", "http://localhost:2"),
            address("default", "http://localhost:3"),
        ] {
            tx.send(event).await.unwrap();
        }

        let addrs = barrier_with(&components)
            .await_all(&mut rx, soon())
            .await
            .unwrap();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs.get("API"), Some("http://localhost:1"));
        assert_eq!(addrs.get("worker"), Some("http://localhost:4"));
        let order: Vec<_> = addrs.iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["API", "admin", "default", "worker"]);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_naming_unresolved_components() {
        let components = vec![ComponentSpec::new("worker", "/apps/worker.yaml")];
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(address("API", "http://localhost:1")).await.unwrap();
        tx.send(address("admin", "http://localhost:2")).await.unwrap();
        tx.send(address("default", "http://localhost:3")).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(15);
        let err = barrier_with(&components)
            .await_all(&mut rx, deadline)
            .await
            .unwrap_err();
        match err {
            HarnessError::StartupTimeout { missing } => {
                assert_eq!(
                    missing,
                    vec![MissingComponent {
                        name: "worker".to_string(),
                        manifest: Some(PathBuf::from("/apps/worker.yaml")),
                    }]
                );
            }
            other => panic!("expected StartupTimeout, got {other:?}"),
        }
        drop(tx);
    }

    #[tokio::test]
    async fn closed_stream_before_ready_is_an_error() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(address("API", "http://localhost:1")).await.unwrap();
        tx.send(ScanEvent::Closed).await.unwrap();

        let err = barrier_with(&[]).await_all(&mut rx, soon()).await.unwrap_err();
        match err {
            HarnessError::ExitedBeforeReady { missing } => {
                let names: Vec<_> = missing.iter().map(|m| m.name.as_str()).collect();
                assert_eq!(names, vec!["admin", "default"]);
            }
            other => panic!("expected ExitedBeforeReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_error_is_propagated() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(ScanEvent::ReadError(std::io::Error::other("pipe broke")))
            .await
            .unwrap();

        let err = barrier_with(&[]).await_all(&mut rx, soon()).await.unwrap_err();
        assert!(matches!(err, HarnessError::StartupIo(_)), "got {err:?}");
        assert!(err.to_string().contains("pipe broke"));
    }

    #[test]
    fn unknown_names_are_ignored() {
        let mut barrier = barrier_with(&[]);
        barrier.apply("nobody", "http://localhost:1".to_string());
        assert!(barrier.endpoints().iter().all(|e| !e.is_resolved()));
    }
}
