//! Readiness probing.
//!
//! A [`ReadinessProbe`] performs one check attempt. [`observe`] drives a
//! probe under a [`ProbePolicy`]: it retries transient failures with
//! exponential backoff, enforces the overall timeout, watches the backing
//! process for crashes and yields progress reports until exactly one
//! terminal report.

mod probes;

pub use probes::{DefaultProbes, ProbeFactory};

use crate::shutdown::{sleep_unless_shutdown, timeout};
use crate::{Liveness, ReadinessState, ResourceHandle, Shutdown};
use app_model::ProbePolicy;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a single probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The resource is ready
    Ready,
    /// Not ready yet; worth retrying (connection refused, not listening)
    NotReady(String),
    /// Will never become ready; do not retry
    Fatal(String),
}

/// One readiness check of a started resource
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Perform one check attempt
    async fn check(&self) -> ProbeOutcome;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Why readiness was not reached
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessFailure {
    /// The overall timeout elapsed
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Configured timeout
        timeout: Duration,
    },
    /// The probe failed fatally or ran out of attempts
    #[error("probe failed after {attempts} attempt(s): {reason}")]
    ProbeFailed {
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },
    /// The backing process exited
    #[error("exited: {reason}")]
    Crashed {
        /// Exit description
        reason: String,
    },
    /// Shutdown was requested while probing
    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Progress of a readiness observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReport {
    /// Probing has begun
    Starting,
    /// A transient failure; the next attempt follows after `delay`
    Retrying {
        /// Failed attempt number, starting at 1
        attempt: u32,
        /// Backoff before the next attempt
        delay: Duration,
        /// Why the attempt failed
        reason: String,
    },
    /// Readiness confirmed
    Ready {
        /// Attempts it took
        attempts: u32,
    },
    /// Readiness will not be reached
    Failed(ReadinessFailure),
}

impl ProbeReport {
    /// Whether this is the last report of the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProbeReport::Ready { .. } | ProbeReport::Failed(_))
    }

    /// State the resource is in when this report is emitted
    pub fn state(&self) -> ReadinessState {
        match self {
            ProbeReport::Starting | ProbeReport::Retrying { .. } => ReadinessState::Starting,
            ProbeReport::Ready { .. } => ReadinessState::Ready,
            ProbeReport::Failed(ReadinessFailure::Cancelled) => ReadinessState::Stopped,
            ProbeReport::Failed(_) => ReadinessState::Failed,
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Start,
    Attempt { attempt: u32, delay: Duration },
    Done,
}

struct Observation {
    probe: Box<dyn ReadinessProbe>,
    handle: Arc<dyn ResourceHandle>,
    policy: ProbePolicy,
    shutdown: Shutdown,
    started: Instant,
    phase: Phase,
}

impl Observation {
    fn remaining(&self) -> Duration {
        self.policy.timeout.saturating_sub(self.started.elapsed())
    }

    async fn attempt(&mut self, attempt: u32, delay: Duration) -> ProbeReport {
        let timed_out = ProbeReport::Failed(ReadinessFailure::Timeout {
            timeout: self.policy.timeout,
        });

        if !delay.is_zero() {
            // The backoff never outlasts the timeout
            let remaining = self.remaining();
            if !sleep_unless_shutdown(delay.min(remaining), &self.shutdown).await {
                return ProbeReport::Failed(ReadinessFailure::Cancelled);
            }
            if delay >= remaining {
                return timed_out;
            }
        }
        if self.shutdown.is_triggered() {
            return ProbeReport::Failed(ReadinessFailure::Cancelled);
        }
        if let Liveness::Exited(reason) = self.handle.liveness().await {
            return ProbeReport::Failed(ReadinessFailure::Crashed { reason });
        }

        let remaining = self.remaining();
        if remaining.is_zero() {
            return timed_out;
        }

        // A started attempt always runs to completion before shutdown is observed
        match timeout(remaining, self.probe.check()).await {
            None => timed_out,
            Some(ProbeOutcome::Ready) => ProbeReport::Ready { attempts: attempt },
            Some(ProbeOutcome::Fatal(reason)) => ProbeReport::Failed(ReadinessFailure::ProbeFailed {
                attempts: attempt,
                reason,
            }),
            Some(ProbeOutcome::NotReady(reason)) if attempt >= self.policy.max_attempts => {
                ProbeReport::Failed(ReadinessFailure::ProbeFailed {
                    attempts: attempt,
                    reason,
                })
            }
            Some(ProbeOutcome::NotReady(reason)) => ProbeReport::Retrying {
                attempt,
                delay: self.policy.backoff(attempt),
                reason,
            },
        }
    }
}

/// Observe a resource's readiness.
///
/// Yields [`ProbeReport::Starting`], any number of
/// [`ProbeReport::Retrying`], then exactly one terminal report, and ends.
pub fn observe(
    probe: Box<dyn ReadinessProbe>,
    handle: Arc<dyn ResourceHandle>,
    policy: ProbePolicy,
    shutdown: Shutdown,
) -> BoxStream<'static, ProbeReport> {
    let observation = Observation {
        probe,
        handle,
        policy,
        shutdown,
        started: Instant::now(),
        phase: Phase::Start,
    };

    stream::unfold(observation, |mut observation| async move {
        let report = match observation.phase {
            Phase::Done => return None,
            Phase::Start => {
                observation.started = Instant::now();
                ProbeReport::Starting
            }
            Phase::Attempt { attempt, delay } => observation.attempt(attempt, delay).await,
        };

        observation.phase = match &report {
            ProbeReport::Starting => Phase::Attempt {
                attempt: 1,
                delay: Duration::ZERO,
            },
            ProbeReport::Retrying { attempt, delay, .. } => Phase::Attempt {
                attempt: attempt + 1,
                delay: *delay,
            },
            _ => Phase::Done,
        };
        Some((report, observation))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogStream, Result, RunningResource};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProbe {
        outcomes: Mutex<Vec<ProbeOutcome>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(mut outcomes: Vec<ProbeOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ReadinessProbe for ScriptedProbe {
        async fn check(&self) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| ProbeOutcome::NotReady("connection refused".to_string()))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct StubHandle {
        info: RunningResource,
        exited: bool,
    }

    #[async_trait]
    impl ResourceHandle for StubHandle {
        fn info(&self) -> &RunningResource {
            &self.info
        }

        async fn liveness(&self) -> Liveness {
            if self.exited {
                Liveness::Exited("exit status: 1".to_string())
            } else {
                Liveness::Running
            }
        }

        async fn stop(&self, _grace: Duration) -> Result<()> {
            Ok(())
        }

        async fn logs(&self) -> Result<LogStream> {
            Ok(stream::empty().boxed())
        }
    }

    fn handle(exited: bool) -> Arc<dyn ResourceHandle> {
        Arc::new(StubHandle {
            info: RunningResource::new("svc", "project"),
            exited,
        })
    }

    fn fast_policy(max_attempts: u32) -> ProbePolicy {
        ProbePolicy {
            timeout: Duration::from_secs(5),
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[smol_potat::test]
    async fn test_transient_failures_are_retried() {
        let probe = ScriptedProbe::new(vec![
            ProbeOutcome::NotReady("refused".to_string()),
            ProbeOutcome::NotReady("refused".to_string()),
            ProbeOutcome::Ready,
        ]);
        let reports: Vec<ProbeReport> =
            observe(Box::new(probe), handle(false), fast_policy(3), Shutdown::new())
                .collect()
                .await;

        assert_eq!(reports.len(), 4);
        assert_eq!(reports[0], ProbeReport::Starting);
        assert!(matches!(reports[1], ProbeReport::Retrying { attempt: 1, .. }));
        assert!(matches!(reports[2], ProbeReport::Retrying { attempt: 2, .. }));
        assert_eq!(reports[3], ProbeReport::Ready { attempts: 3 });
        assert_eq!(reports[3].state(), ReadinessState::Ready);
    }

    #[smol_potat::test]
    async fn test_attempts_are_bounded() {
        let probe = ScriptedProbe::new(vec![]);
        let reports: Vec<ProbeReport> =
            observe(Box::new(probe), handle(false), fast_policy(3), Shutdown::new())
                .collect()
                .await;

        let last = reports.last().unwrap();
        assert!(matches!(
            last,
            ProbeReport::Failed(ReadinessFailure::ProbeFailed { attempts: 3, .. })
        ));
        assert_eq!(reports.iter().filter(|r| r.is_terminal()).count(), 1);
    }

    #[smol_potat::test]
    async fn test_fatal_failure_is_not_retried() {
        let probe = Arc::new(ScriptedProbe::new(vec![ProbeOutcome::Fatal(
            "invalid config".to_string(),
        )]));

        struct Shared(Arc<ScriptedProbe>);
        #[async_trait]
        impl ReadinessProbe for Shared {
            async fn check(&self) -> ProbeOutcome {
                self.0.check().await
            }
            fn describe(&self) -> String {
                self.0.describe()
            }
        }

        let reports: Vec<ProbeReport> = observe(
            Box::new(Shared(probe.clone())),
            handle(false),
            fast_policy(5),
            Shutdown::new(),
        )
        .collect()
        .await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            reports.last(),
            Some(ProbeReport::Failed(ReadinessFailure::ProbeFailed { attempts: 1, .. }))
        ));
    }

    #[smol_potat::test]
    async fn test_timeout_fails_the_resource() {
        let policy = ProbePolicy {
            timeout: Duration::from_millis(50),
            max_attempts: u32::MAX,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        };
        let reports: Vec<ProbeReport> = observe(
            Box::new(ScriptedProbe::new(vec![])),
            handle(false),
            policy,
            Shutdown::new(),
        )
        .collect()
        .await;

        assert_eq!(
            reports.last(),
            Some(&ProbeReport::Failed(ReadinessFailure::Timeout {
                timeout: Duration::from_millis(50)
            }))
        );
    }

    #[smol_potat::test]
    async fn test_backoff_is_cut_short_by_timeout() {
        let policy = ProbePolicy {
            timeout: Duration::from_millis(100),
            max_attempts: 10,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
        };
        let start = Instant::now();
        let reports: Vec<ProbeReport> = observe(
            Box::new(ScriptedProbe::new(vec![])),
            handle(false),
            policy,
            Shutdown::new(),
        )
        .collect()
        .await;

        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(
            reports.last(),
            Some(&ProbeReport::Failed(ReadinessFailure::Timeout {
                timeout: Duration::from_millis(100)
            }))
        );
    }

    #[smol_potat::test]
    async fn test_crashed_process_fails_without_probing() {
        let probe = ScriptedProbe::new(vec![ProbeOutcome::Ready]);
        let reports: Vec<ProbeReport> =
            observe(Box::new(probe), handle(true), fast_policy(3), Shutdown::new())
                .collect()
                .await;

        assert!(matches!(
            reports.last(),
            Some(ProbeReport::Failed(ReadinessFailure::Crashed { .. }))
        ));
    }

    #[smol_potat::test]
    async fn test_shutdown_cancels_between_attempts() {
        let shutdown = Shutdown::new();
        let policy = ProbePolicy {
            timeout: Duration::from_secs(60),
            max_attempts: 10,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
        };
        let mut reports = observe(
            Box::new(ScriptedProbe::new(vec![])),
            handle(false),
            policy,
            shutdown.clone(),
        );

        assert_eq!(reports.next().await, Some(ProbeReport::Starting));
        assert!(matches!(
            reports.next().await,
            Some(ProbeReport::Retrying { .. })
        ));

        shutdown.trigger();
        let last = reports.next().await.unwrap();
        assert_eq!(last, ProbeReport::Failed(ReadinessFailure::Cancelled));
        assert_eq!(last.state(), ReadinessState::Stopped);
        assert_eq!(reports.next().await, None);
    }
}
