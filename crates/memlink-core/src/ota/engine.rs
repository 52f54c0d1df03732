//! OTA job state machine and transfer workflow

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    chunk_frame, command_frame, validate_firmware, FirmwareInfo, OtaConfig, OtaDirective,
    OtaError, OtaStatus,
};
use crate::session::SessionEngine;

type StatusCallback = Arc<dyn Fn(OtaStatus, &str) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;
type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    status: Option<StatusCallback>,
    progress: Option<ProgressCallback>,
    log: Option<LogCallback>,
}

/// Point-in-time view of the OTA engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaStatusSnapshot {
    /// Current state
    pub status: OtaStatus,
    /// Terminal state of the most recent job
    pub last_outcome: Option<OtaStatus>,
    /// Percent, 0 to 100
    pub progress: u8,
    /// Image of the current or last job
    pub firmware: Option<FirmwareInfo>,
    /// Devices the current or last job was sent to
    pub target_devices: Vec<String>,
    /// Id of the current or last job
    pub job_id: Option<Uuid>,
    /// Message of the last failure
    pub last_error: Option<String>,
}

struct JobState {
    status: OtaStatus,
    last_outcome: Option<OtaStatus>,
    progress: u8,
    firmware: Option<FirmwareInfo>,
    target_devices: Vec<String>,
    job_id: Option<Uuid>,
    last_error: Option<String>,
    cancel: CancellationToken,
}

struct Shared {
    session: SessionEngine,
    config: OtaConfig,
    state: Mutex<JobState>,
    callbacks: RwLock<Callbacks>,
}

/// Drives firmware updates to connected devices. Clones share one job.
#[derive(Clone)]
pub struct OtaEngine {
    shared: Arc<Shared>,
}

/// Stage result: `false` means the job was cancelled
type StageResult = Result<bool>;

impl OtaEngine {
    /// Create an idle engine sending through `session`
    pub fn new(session: SessionEngine, config: OtaConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                session,
                config,
                state: Mutex::new(JobState {
                    status: OtaStatus::Idle,
                    last_outcome: None,
                    progress: 0,
                    firmware: None,
                    target_devices: Vec::new(),
                    job_id: None,
                    last_error: None,
                    cancel: CancellationToken::new(),
                }),
                callbacks: RwLock::new(Callbacks::default()),
            }),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &OtaConfig {
        &self.shared.config
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current job state
    pub fn status(&self) -> OtaStatus {
        self.state().status
    }

    /// Progress of the current job in percent
    pub fn progress(&self) -> u8 {
        self.state().progress
    }

    /// Copy of the whole job state
    pub fn status_snapshot(&self) -> OtaStatusSnapshot {
        let state = self.state();
        OtaStatusSnapshot {
            status: state.status,
            last_outcome: state.last_outcome,
            progress: state.progress,
            firmware: state.firmware.clone(),
            target_devices: state.target_devices.clone(),
            job_id: state.job_id,
            last_error: state.last_error.clone(),
        }
    }

    /// Called on every status change with its message
    pub fn set_status_callback<F>(&self, callback: F)
    where
        F: Fn(OtaStatus, &str) + Send + Sync + 'static,
    {
        self.callbacks_mut().status = Some(Arc::new(callback));
    }

    /// Called on every progress update
    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.callbacks_mut().progress = Some(Arc::new(callback));
    }

    /// Receives one `[STATUS] message` line per status change
    pub fn set_log_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks_mut().log = Some(Arc::new(callback));
    }

    fn callbacks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> (Option<StatusCallback>, Option<ProgressCallback>, Option<LogCallback>) {
        let callbacks = self
            .shared
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        (
            callbacks.status.clone(),
            callbacks.progress.clone(),
            callbacks.log.clone(),
        )
    }

    fn record_status(&self, status: OtaStatus) {
        let mut state = self.state();
        state.status = status;
        if matches!(
            status,
            OtaStatus::Completed | OtaStatus::Failed | OtaStatus::Cancelled
        ) {
            state.last_outcome = Some(status);
        }
    }

    fn set_status(&self, status: OtaStatus, message: &str) {
        self.record_status(status);
        self.notify_status(status, message);
    }

    // Callbacks run with no lock held so they may query the engine.
    fn notify_status(&self, status: OtaStatus, message: &str) {
        info!(status = %status, "{}", message);

        let (on_status, _, on_log) = self.callbacks();
        if let Some(cb) = on_status {
            cb(status, message);
        }
        if let Some(cb) = on_log {
            cb(&format!("[{}] {}", status.as_str().to_uppercase(), message));
        }
    }

    fn set_progress(&self, progress: u8) {
        let progress = progress.min(100);
        self.state().progress = progress;
        let (_, on_progress, _) = self.callbacks();
        if let Some(cb) = on_progress {
            cb(progress);
        }
    }

    /// Report a terminal state, then settle back to `Idle`
    fn finish(&self, outcome: OtaStatus, message: &str) {
        if outcome == OtaStatus::Failed {
            self.state().last_error = Some(message.to_string());
        }
        self.set_status(outcome, message);
        self.set_status(OtaStatus::Idle, "Ready for next update");
    }

    /// Validate a firmware file without starting a job
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<FirmwareInfo, OtaError> {
        validate_firmware(path.as_ref(), self.shared.config.effective_chunk_size())
    }

    /// Start an update job in the background. `device_ids` of `None` or an
    /// empty list targets every connected device.
    ///
    /// Returns `false` if a job is already running, the firmware is invalid,
    /// or there is no device to update.
    pub fn start_update(&self, path: impl AsRef<Path>, device_ids: Option<Vec<String>>) -> bool {
        let path: PathBuf = path.as_ref().to_path_buf();

        {
            let mut state = self.state();
            if state.status != OtaStatus::Idle {
                warn!(status = %state.status, "{}", OtaError::Busy(state.status));
                return false;
            }
            state.status = OtaStatus::Validating;
            state.last_error = None;
        }
        self.set_status(OtaStatus::Validating, "Validating firmware file...");

        let firmware = match self.validate(&path) {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "Firmware validation failed");
                self.finish(OtaStatus::Failed, &format!("Firmware validation failed: {}", e));
                return false;
            }
        };

        let targets = match device_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.shared.session.connected_devices(),
        };
        if targets.is_empty() {
            self.finish(OtaStatus::Failed, &OtaError::NoTargets.to_string());
            return false;
        }

        let job_id = Uuid::new_v4();
        let token = CancellationToken::new();
        {
            let mut state = self.state();
            state.firmware = Some(firmware.clone());
            state.target_devices = targets.clone();
            state.job_id = Some(job_id);
            state.progress = 0;
            state.cancel = token.clone();
        }
        info!(%job_id, file = %firmware.file_name, targets = ?targets, "OTA job started");

        let engine = self.clone();
        let job = tokio::spawn(async move {
            engine.run_job(firmware, targets, token).await;
        });
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = job.await {
                engine.recover_aborted_job(&e);
            }
        });
        true
    }

    /// Request cancellation. Only honoured while preparing or transferring.
    pub fn cancel_update(&self) -> bool {
        let state = self.state();
        if state.status.is_cancellable() {
            state.cancel.cancel();
            info!(status = %state.status, "OTA cancellation requested");
            true
        } else {
            warn!(status = %state.status, "OTA cancellation ignored");
            false
        }
    }

    async fn run_job(&self, firmware: FirmwareInfo, targets: Vec<String>, token: CancellationToken) {
        match self.workflow(&firmware, &targets, &token).await {
            Ok(true) => info!(file = %firmware.file_name, "OTA job completed"),
            Ok(false) => self.finish(OtaStatus::Cancelled, "Update cancelled"),
            Err(e) => {
                error!(error = ?e, "OTA job failed");
                self.finish(OtaStatus::Failed, &format!("OTA update failed: {:#}", e));
            }
        }
    }

    /// The job task died without reaching a terminal state. The state is
    /// forced to `Failed` then `Idle` before any callback runs, so a
    /// callback that panics again cannot leave the engine busy.
    fn recover_aborted_job(&self, e: &tokio::task::JoinError) {
        let message = if e.is_panic() {
            "OTA update failed: workflow panicked".to_string()
        } else {
            format!("OTA update failed: {}", e)
        };
        error!(error = %e, "OTA job task aborted");
        {
            let mut state = self.state();
            state.last_error = Some(message.clone());
            state.last_outcome = Some(OtaStatus::Failed);
            state.status = OtaStatus::Idle;
        }

        let notified = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.notify_status(OtaStatus::Failed, &message);
            self.notify_status(OtaStatus::Idle, "Ready for next update");
        }));
        if notified.is_err() {
            error!("OTA status callback panicked during recovery");
        }
    }

    async fn workflow(
        &self,
        firmware: &FirmwareInfo,
        targets: &[String],
        token: &CancellationToken,
    ) -> StageResult {
        let stages_ok = self.prepare(firmware, targets, token).await?
            && self.transfer(firmware, targets, token).await?
            && self.verify(firmware, targets, token).await?
            && self.install(targets, token).await?;
        if !stages_ok {
            return Ok(false);
        }

        self.set_status(OtaStatus::Completed, "Update completed successfully!");
        self.set_progress(100);
        self.broadcast_directive(targets, OtaDirective::Reboot, json!({}));
        self.set_status(OtaStatus::Idle, "Ready for next update");
        Ok(true)
    }

    fn broadcast_directive(&self, targets: &[String], directive: OtaDirective, data: serde_json::Value) {
        let frame = command_frame(directive, data);
        for device_id in targets {
            self.send(device_id, &frame);
        }
    }

    fn send(&self, device_id: &str, frame: &str) {
        if !self.shared.session.send_to_device(device_id, frame) {
            warn!(device_id, "OTA frame not delivered");
        }
    }

    /// Sleep unless cancelled first; returns `false` on cancellation
    async fn settle(&self, delay: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn prepare(
        &self,
        firmware: &FirmwareInfo,
        targets: &[String],
        token: &CancellationToken,
    ) -> StageResult {
        self.set_status(OtaStatus::Preparing, "Preparing devices for update...");
        self.set_progress(5);

        let frame = command_frame(
            OtaDirective::Prepare,
            json!({
                "firmware_size": firmware.file_size,
                "chunk_size": firmware.chunk_size,
                "chunks": firmware.chunk_count,
                "version": firmware.version,
            }),
        );
        for device_id in targets {
            if token.is_cancelled() {
                return Ok(false);
            }
            self.send(device_id, &frame);
            if !self.settle(self.shared.config.prepare_settle(), token).await {
                return Ok(false);
            }
        }
        if token.is_cancelled() {
            return Ok(false);
        }

        self.set_progress(10);
        info!(targets = ?targets, "Devices prepared for update");
        Ok(true)
    }

    async fn transfer(
        &self,
        firmware: &FirmwareInfo,
        targets: &[String],
        token: &CancellationToken,
    ) -> StageResult {
        self.set_status(OtaStatus::Transferring, "Transferring firmware...");

        let mut file = tokio::fs::File::open(&firmware.file_path)
            .await
            .with_context(|| format!("opening {}", firmware.file_path.display()))?;
        let mut buffer = vec![0u8; firmware.chunk_size];
        let total = firmware.chunk_count.max(1);
        let mut sent: u64 = 0;

        loop {
            if token.is_cancelled() {
                return Ok(false);
            }

            let n = read_chunk(&mut file, &mut buffer)
                .await
                .with_context(|| format!("reading chunk {}", sent))?;
            if n == 0 {
                break;
            }

            let frame = chunk_frame(sent, &buffer[..n]);
            for device_id in targets {
                self.send(device_id, &frame);
            }
            sent += 1;
            self.set_progress((10 + sent.min(total) * 70 / total) as u8);

            if !self.settle(self.shared.config.chunk_delay(), token).await {
                return Ok(false);
            }
        }

        info!(chunks = sent, "Firmware transfer complete");
        Ok(!token.is_cancelled())
    }

    async fn verify(
        &self,
        firmware: &FirmwareInfo,
        targets: &[String],
        token: &CancellationToken,
    ) -> StageResult {
        self.set_status(OtaStatus::Verifying, "Verifying firmware on device...");
        self.set_progress(85);

        if self.shared.config.verify_checksum {
            let frame = command_frame(OtaDirective::Verify, json!({ "checksum": firmware.checksum }));
            for device_id in targets {
                if token.is_cancelled() {
                    return Ok(false);
                }
                self.send(device_id, &frame);
                tokio::time::sleep(self.shared.config.verify_settle()).await;
            }
        } else {
            info!("Checksum verification disabled");
        }

        self.set_progress(90);
        Ok(!token.is_cancelled())
    }

    async fn install(&self, targets: &[String], token: &CancellationToken) -> StageResult {
        self.set_status(OtaStatus::Installing, "Installing firmware...");
        self.set_progress(95);

        let frame = command_frame(OtaDirective::Install, json!({}));
        for device_id in targets {
            if token.is_cancelled() {
                return Ok(false);
            }
            self.send(device_id, &frame);
            tokio::time::sleep(self.shared.config.install_settle()).await;
        }

        info!("Firmware installation initiated");
        Ok(!token.is_cancelled())
    }
}

/// Fill `buffer` from `file`, stopping early only at end of file
async fn read_chunk(file: &mut tokio::fs::File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ChannelTransport, SessionConfig};

    fn engine() -> OtaEngine {
        let session = SessionEngine::new(Arc::new(ChannelTransport::new()), SessionConfig::default());
        OtaEngine::new(session, OtaConfig::default())
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected() {
        let ota = engine();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = statuses.clone();
        ota.set_status_callback(move |status, _| seen.lock().unwrap().push(status));

        assert!(!ota.start_update("/nonexistent/fw_v1.bin", Some(vec!["gw".into()])));
        assert_eq!(ota.status(), OtaStatus::Idle);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![OtaStatus::Validating, OtaStatus::Failed, OtaStatus::Idle]
        );
        assert!(ota.status_snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn test_no_targets_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("fw.bin");
        std::fs::write(&image, [1u8; 16]).unwrap();

        let ota = engine();
        assert!(!ota.start_update(&image, None));
        assert_eq!(ota.status(), OtaStatus::Idle);
        assert_eq!(ota.status_snapshot().last_outcome, Some(OtaStatus::Failed));
    }

    #[test]
    fn test_cancel_when_idle_is_ignored() {
        assert!(!engine().cancel_update());
    }
}
