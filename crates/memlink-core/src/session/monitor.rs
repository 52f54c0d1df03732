//! Monitoring loop
//!
//! One background task polls every element of every loaded variable, one
//! read at a time, then sleeps until the next sweep. The sleep is split into
//! short slices so a stop request is honoured within one slice.

use std::sync::PoisonError;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ParameterSample, SessionEngine, SessionError};

/// Handle to the running monitoring task
pub(super) struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Outcome of one sweep over the variable set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Successful reads, in read order
    pub samples: Vec<ParameterSample>,
    /// Variables cut short by a read timeout
    pub timeouts: usize,
    /// Element reads that failed for another reason
    pub failures: usize,
    /// Sweep stopped early (cancelled, or no session could be held)
    pub aborted: bool,
}

impl SessionEngine {
    /// One pass over all loaded variables and elements.
    ///
    /// Reads are strictly sequential. A timeout skips the rest of that
    /// variable until the next sweep; losing every device or failing to
    /// initialize ends the sweep.
    pub async fn sweep(&self, cancel: Option<&CancellationToken>) -> SweepReport {
        let mut report = SweepReport::default();

        for variable in self.variables() {
            for index in 0..variable.element_count {
                if cancel.is_some_and(CancellationToken::is_cancelled) {
                    report.aborted = true;
                    return report;
                }

                match self.read_variable(&variable, index).await {
                    Ok(sample) => {
                        self.notify_sample(&sample);
                        report.samples.push(sample);
                    }
                    Err(SessionError::Timeout { .. }) => {
                        warn!(variable = %variable.name, index, "Read timed out, skipping variable this sweep");
                        report.timeouts += 1;
                        break;
                    }
                    Err(e @ (SessionError::NoDevices
                    | SessionError::NotInitialized
                    | SessionError::TransportLost)) => {
                        warn!(error = %e, "Sweep aborted");
                        report.aborted = true;
                        return report;
                    }
                    Err(e) => {
                        warn!(variable = %variable.name, index, error = %e, "Read failed");
                        report.failures += 1;
                    }
                }
            }
        }

        debug!(
            samples = report.samples.len(),
            timeouts = report.timeouts,
            failures = report.failures,
            "Sweep complete"
        );
        report
    }

    /// Read every element once, outside the monitoring loop
    pub async fn refresh_all(&self) -> Vec<ParameterSample> {
        self.sweep(None).await.samples
    }

    /// Start the background monitoring loop. Must be called from within a
    /// tokio runtime.
    pub fn start_monitoring(&self, poll_interval: Option<Duration>) -> Result<(), SessionError> {
        let mut slot = self
            .monitor_slot()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return Err(SessionError::MonitoringActive);
        }
        if self.connected_devices().is_empty() {
            return Err(SessionError::NoDevices);
        }

        let interval = poll_interval.unwrap_or_else(|| self.config().poll_interval());
        let slice = self.config().stop_slice();
        let token = CancellationToken::new();
        let engine = self.clone();
        let loop_token = token.clone();

        let sweeps = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Monitoring started");
            'outer: loop {
                if loop_token.is_cancelled() {
                    break;
                }
                engine.sweep(Some(&loop_token)).await;

                let wake_at = Instant::now() + interval;
                loop {
                    if loop_token.is_cancelled() {
                        break 'outer;
                    }
                    let now = Instant::now();
                    if now >= wake_at {
                        break;
                    }
                    tokio::time::sleep(slice.min(wake_at - now)).await;
                }
            }
            info!("Monitoring stopped");
        });

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = sweeps.await {
                error!(error = %e, "Monitoring loop died, ending session");
                if engine.is_session_active() {
                    engine.end_session(engine.config().response_timeout()).await;
                }
            }
        });

        *slot = Some(MonitorTask { token, handle });
        Ok(())
    }

    /// A monitoring loop is running
    pub fn is_monitoring(&self) -> bool {
        self.monitor_slot()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stop the loop, wait a bounded time for it to exit, then end the
    /// session. Returns whether the loop exited in time.
    ///
    /// The wait covers at least one unanswered read plus one sleep slice,
    /// so a loop blocked on a silent device still counts as stopped.
    pub async fn stop_monitoring(&self) -> bool {
        let task = self
            .monitor_slot()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            debug!("Monitoring not running");
            return false;
        };

        task.token.cancel();
        let joined = match tokio::time::timeout(self.config().stop_wait(), task.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Monitoring task ended abnormally");
                true
            }
            Err(_) => {
                warn!("Monitoring task did not stop in time");
                false
            }
        };

        if self.is_session_active() {
            self.end_session(self.config().response_timeout()).await;
        }
        joined
    }
}
