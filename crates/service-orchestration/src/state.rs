//! Per-resource readiness state.
//!
//! Each resource owns one [`StateCell`]. Only the task running that resource
//! writes to it; everyone else reads snapshots or waits for the cell to
//! settle. The [`StateBoard`] is the read-only collection of all cells.

use crate::{Error, Result};
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Lifecycle state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReadinessState {
    /// Declared, waiting for its producers
    Pending = 0,
    /// Started, readiness not yet confirmed
    Starting = 1,
    /// Readiness confirmed
    Ready = 2,
    /// Failed to start, failed readiness, or a producer failed
    Failed = 3,
    /// Stopped by shutdown or cancelled before starting
    Stopped = 4,
}

impl ReadinessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadinessState::Pending,
            1 => ReadinessState::Starting,
            2 => ReadinessState::Ready,
            3 => ReadinessState::Failed,
            _ => ReadinessState::Stopped,
        }
    }

    /// Whether the state is one a dependent can act on
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ReadinessState::Ready | ReadinessState::Failed | ReadinessState::Stopped
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// States only move forward; the single exception is that a ready or
    /// failed resource can be stopped. Nothing returns to pending.
    pub fn can_transition_to(self, next: ReadinessState) -> bool {
        use ReadinessState::*;
        matches!(
            (self, next),
            (Pending, Starting | Failed | Stopped)
                | (Starting, Ready | Failed | Stopped)
                | (Ready | Failed, Stopped)
        )
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadinessState::Pending => "pending",
            ReadinessState::Starting => "starting",
            ReadinessState::Ready => "ready",
            ReadinessState::Failed => "failed",
            ReadinessState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a resource ended up failed
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// A producer failed, so this resource was never started
    #[error("upstream resource '{producer}' failed")]
    Upstream {
        /// The failed producer
        producer: String,
    },
    /// Readiness was not confirmed in time
    #[error("readiness timed out after {timeout:?}")]
    Timeout {
        /// Configured timeout
        timeout: Duration,
    },
    /// The readiness probe reported a failure
    #[error("readiness probe failed: {reason}")]
    ProbeFailed {
        /// Last probe error
        reason: String,
    },
    /// The backing process exited while starting
    #[error("exited during startup: {reason}")]
    Crashed {
        /// Exit description
        reason: String,
    },
    /// The launcher could not start the resource
    #[error("start failed: {reason}")]
    StartFailed {
        /// Launcher error
        reason: String,
    },
    /// A parameter could not be resolved
    #[error("parameter '{parameter}' unavailable: {reason}")]
    SecretUnavailable {
        /// Parameter name
        parameter: String,
        /// Why it could not be resolved
        reason: String,
    },
    /// Environment or reference resolution failed
    #[error("resolution failed: {reason}")]
    Resolution {
        /// Resolution error
        reason: String,
    },
}

impl FailureCause {
    /// Classify an error raised while preparing or starting a resource
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::SecretUnavailable { parameter, reason } => FailureCause::SecretUnavailable {
                parameter: parameter.clone(),
                reason: reason.clone(),
            },
            Error::StartFailed { reason, .. } => FailureCause::StartFailed {
                reason: reason.clone(),
            },
            Error::NoLauncher(_) | Error::Io(_) => FailureCause::StartFailed {
                reason: error.to_string(),
            },
            Error::Timeout { timeout, .. } => FailureCause::Timeout { timeout: *timeout },
            Error::ProbeFailed { reason, .. } => FailureCause::ProbeFailed {
                reason: reason.clone(),
            },
            Error::UpstreamFailed { producer, .. } => FailureCause::Upstream {
                producer: producer.clone(),
            },
            Error::Resolution { reason, .. } => FailureCause::Resolution {
                reason: reason.clone(),
            },
            other => FailureCause::Resolution {
                reason: other.to_string(),
            },
        }
    }

    /// Convert into the error reported for `resource`
    pub fn into_error(self, resource: &str) -> Error {
        let resource = resource.to_string();
        match self {
            FailureCause::Upstream { producer } => Error::UpstreamFailed { resource, producer },
            FailureCause::Timeout { timeout } => Error::Timeout { resource, timeout },
            FailureCause::ProbeFailed { reason } => Error::ProbeFailed { resource, reason },
            FailureCause::Crashed { reason } => Error::ProbeFailed {
                resource,
                reason: format!("process exited: {reason}"),
            },
            FailureCause::StartFailed { reason } => Error::StartFailed { resource, reason },
            FailureCause::SecretUnavailable { parameter, reason } => {
                Error::SecretUnavailable { parameter, reason }
            }
            FailureCause::Resolution { reason } => Error::Resolution { resource, reason },
        }
    }
}

/// Single-writer state of one resource
pub struct StateCell {
    name: String,
    state: AtomicU8,
    failure: Mutex<Option<FailureCause>>,
    settled_tx: Mutex<Option<oneshot::Sender<()>>>,
    settled_rx: Shared<oneshot::Receiver<()>>,
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure", &self.failure())
            .finish()
    }
}

impl StateCell {
    /// New cell in the pending state
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            name: name.into(),
            state: AtomicU8::new(ReadinessState::Pending as u8),
            failure: Mutex::new(None),
            settled_tx: Mutex::new(Some(tx)),
            settled_rx: rx.shared(),
        }
    }

    /// Resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> ReadinessState {
        ReadinessState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Failure cause, if the resource failed
    pub fn failure(&self) -> Option<FailureCause> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move to `next`.
    ///
    /// Settling (ready, failed or stopped) wakes every task waiting in
    /// [`StateCell::settled`].
    pub fn transition(&self, next: ReadinessState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                resource: self.name.clone(),
                from: current,
                to: next,
            });
        }

        self.state.store(next as u8, Ordering::Release);
        debug!("{}: {} -> {}", self.name, current, next);

        if next.is_settled() {
            let tx = self
                .settled_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    /// Record `cause` and move to failed
    pub fn fail(&self, cause: FailureCause) -> Result<()> {
        // Stored first so readers that observe Failed also see the cause
        let previous = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cause);
        let result = self.transition(ReadinessState::Failed);
        if result.is_err() {
            *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = previous;
        }
        result
    }

    /// Wait until the resource is ready, failed or stopped
    pub async fn settled(&self) -> ReadinessState {
        let _ = self.settled_rx.clone().await;
        self.state()
    }
}

/// Read-only view of every resource's state
#[derive(Debug, Clone, Default)]
pub struct StateBoard {
    cells: Arc<IndexMap<String, Arc<StateCell>>>,
}

impl StateBoard {
    /// Board with one pending cell per name
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cells = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), Arc::new(StateCell::new(name)))
            })
            .collect();
        Self {
            cells: Arc::new(cells),
        }
    }

    /// Cell of a resource
    pub fn cell(&self, name: &str) -> Option<&Arc<StateCell>> {
        self.cells.get(name)
    }

    /// Current state of a resource
    pub fn state(&self, name: &str) -> Option<ReadinessState> {
        self.cells.get(name).map(|cell| cell.state())
    }

    /// Failure cause of a resource
    pub fn failure(&self, name: &str) -> Option<FailureCause> {
        self.cells.get(name).and_then(|cell| cell.failure())
    }

    /// Current state of every resource
    pub fn snapshot(&self) -> IndexMap<String, ReadinessState> {
        self.cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.state()))
            .collect()
    }
}
