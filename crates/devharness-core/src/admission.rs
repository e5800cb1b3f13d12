//! Process-wide admission control.
//!
//! The dev server binds host ports and owns an on-disk workspace, so only
//! one harness may run per process. The gate is a single-permit semaphore
//! reached through [`AdmissionGate::global`]; holding an [`AdmissionPermit`]
//! is what entitles a harness to spawn its child.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::error::{HarnessError, Result};

static GLOBAL: LazyLock<AdmissionGate> = LazyLock::new(AdmissionGate::new);

/// Counting gate with capacity one.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionGate {
    /// A fresh, independent gate. Harnesses always use [`Self::global`].
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// The gate shared by every harness in this process.
    pub fn global() -> &'static AdmissionGate {
        &GLOBAL
    }

    /// Take the permit or fail with [`HarnessError::AlreadyRunning`].
    pub fn try_acquire(&self) -> Result<AdmissionPermit> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                debug!("admission permit acquired");
                Ok(AdmissionPermit {
                    permit: Some(permit),
                })
            }
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(HarnessError::AlreadyRunning)
            }
        }
    }

    /// Take the permit, waiting up to `wait` for the current holder.
    pub async fn acquire(&self, wait: Duration) -> Result<AdmissionPermit> {
        let acquired = tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned()).await;
        match acquired {
            Ok(Ok(permit)) => {
                debug!("admission permit acquired after waiting");
                Ok(AdmissionPermit {
                    permit: Some(permit),
                })
            }
            Ok(Err(_)) | Err(_) => Err(HarnessError::AlreadyRunning),
        }
    }

    /// Whether the permit is currently free.
    pub fn is_available(&self) -> bool {
        self.permits.available_permits() > 0
    }
}

/// Proof of admission. Returned to the gate on [`release`](Self::release)
/// or on drop, whichever comes first.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionPermit {
    /// Return the permit. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if self.permit.take().is_some() {
            debug!("admission permit released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release();
    }
}
