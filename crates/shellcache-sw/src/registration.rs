//! Worker records and the registration that tracks installing, waiting and
//! active workers for a scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::namespace::CacheNamespace;
use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

/// A service worker record.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Cache namespace the worker owns.
    pub namespace: CacheNamespace,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new record.
    pub fn new(id: ServiceWorkerId, namespace: CacheNamespace) -> Self {
        Self {
            id,
            namespace,
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Begin installing `worker`. Any previous installing worker becomes redundant.
    pub fn start_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        let previous = self.installing.replace(worker);
        previous.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Transition installing to waiting. A worker already waiting is replaced.
    pub fn install_complete(&mut self) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = self
            .installing
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no installing worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Installed);
        let previous = self.waiting.replace(worker);
        Ok(previous.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        }))
    }

    /// Discard the installing worker after a failed install.
    ///
    /// The active worker is left untouched.
    pub fn install_failed(&mut self, error: impl Into<String>) -> Option<ServiceWorker> {
        self.installing.take().map(|mut worker| {
            worker.error = Some(error.into());
            worker.set_state(ServiceWorkerState::Redundant);
            worker
        })
    }

    /// Promote the waiting worker to active in the `Activating` state.
    ///
    /// Returns the retired active worker, now redundant.
    pub fn begin_activation(&mut self) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activating);

        let retired = self.active.replace(worker);
        Ok(retired.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        }))
    }

    /// Finish activation of the active worker.
    pub fn finish_activation(&mut self) -> Result<(), ServiceWorkerError> {
        match self.active {
            Some(ref mut worker) if worker.state == ServiceWorkerState::Activating => {
                worker.set_state(ServiceWorkerState::Activated);
                Ok(())
            }
            _ => Err(ServiceWorkerError::StateError(
                "no activating worker".to_string(),
            )),
        }
    }

    /// Install an already-activated worker directly (host restart).
    pub fn restore_active(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Activated);
        self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// State of a worker held by this registration.
    pub fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
            .map(|w| w.state)
    }

    /// Unregister: every worker becomes redundant.
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
            .map(|mut worker| {
                worker.set_state(ServiceWorkerState::Redundant);
                worker
            })
            .collect()
    }
}
