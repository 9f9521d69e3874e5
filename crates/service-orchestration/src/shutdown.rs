//! Cooperative shutdown signal and timer helpers.

use async_io::Timer;
use futures::future::{Either, select};
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

/// Process-wide shutdown request.
///
/// Cloning shares the same signal. Triggering is permanent: every current
/// and future [`Shutdown::wait`] completes immediately.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl Shutdown {
    /// New, untriggered signal
    pub fn new() -> Self {
        // Nothing is ever sent: closing the channel is the signal
        let (tx, rx) = async_channel::bounded(1);
        Self { tx, rx }
    }

    /// Request shutdown
    pub fn trigger(&self) {
        self.tx.close();
    }

    /// Whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        self.rx.is_closed()
    }

    /// Wait until shutdown is requested
    pub async fn wait(&self) {
        let _ = self.rx.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `future` for at most `duration`; `None` on timeout
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Option<F::Output> {
    let future = pin!(future);
    match select(future, Timer::after(duration)).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

/// Sleep for `duration`; returns `false` if shutdown interrupted the sleep
pub(crate) async fn sleep_unless_shutdown(duration: Duration, shutdown: &Shutdown) -> bool {
    let wait = pin!(shutdown.wait());
    match select(Timer::after(duration), wait).await {
        Either::Left(_) => true,
        Either::Right(_) => false,
    }
}
