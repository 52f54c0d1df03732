//! Session engine
//!
//! Request/response correlation works through a single pending slot: the
//! caller parks a oneshot sender tagged with the expected acknowledgement
//! kind, broadcasts the command, and waits. The inbound frame handler fills
//! the slot when a matching acknowledgement arrives. Anything else is dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::monitor::MonitorTask;
use super::{
    ParameterSample, SessionConfig, SessionError, SessionState, Transport, WriteRequest,
};
use crate::address_map::{AddressMap, LoadReport, MatchKind, Variable, VariableDefinition};
use crate::protocol::{
    decode_response, encode_end, encode_init, encode_mem_read, encode_mem_write, format_address,
    ElementType, Response, ResponseKind,
};

/// Callback invoked for every value read from the device
pub type SampleCallback = Arc<dyn Fn(&ParameterSample) + Send + Sync>;

/// Per-device session bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSession {
    /// `init` acknowledged and not yet ended
    pub initialized: bool,
    /// Token used in `init`/`end`
    pub connection_id: String,
    /// Last frame sent to or received from the device
    pub last_activity: DateTime<Utc>,
}

impl DeviceSession {
    fn new(connection_id: &str) -> Self {
        Self {
            initialized: false,
            connection_id: connection_id.to_string(),
            last_activity: Utc::now(),
        }
    }
}

/// Frame and byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// Device registry and session flag, guarded together by one lock
struct Registry {
    devices: BTreeMap<String, DeviceSession>,
    state: SessionState,
}

impl Registry {
    /// Drop a device; losing the last one ends the session
    fn remove(&mut self, device_id: &str) -> bool {
        let removed = self.devices.remove(device_id).is_some();
        if self.devices.is_empty() && self.state == SessionState::Initialized {
            warn!("Last device gone, session reset to uninitialized");
            self.state = SessionState::Uninitialized;
        }
        removed
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        let initialized = state == SessionState::Initialized;
        for device in self.devices.values_mut() {
            device.initialized = initialized;
        }
    }
}

/// Request waiting for its acknowledgement
struct PendingRequest {
    expected: ResponseKind,
    deadline: Instant,
    slot: oneshot::Sender<Response>,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    registry: Mutex<Registry>,
    pending: Mutex<Option<PendingRequest>>,
    /// Serializes every request so only one is ever outstanding
    request_gate: tokio::sync::Mutex<()>,
    address_map: RwLock<AddressMap>,
    on_sample: RwLock<Option<SampleCallback>>,
    counters: Counters,
    monitor: Mutex<Option<MonitorTask>>,
}

/// Debug session engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionEngine {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionEngine {
    /// Create an engine with no devices and no variables
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                registry: Mutex::new(Registry {
                    devices: BTreeMap::new(),
                    state: SessionState::Uninitialized,
                }),
                pending: Mutex::new(None),
                request_gate: tokio::sync::Mutex::new(()),
                address_map: RwLock::new(AddressMap::new()),
                on_sample: RwLock::new(None),
                counters: Counters::default(),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub(super) fn monitor_slot(&self) -> &Mutex<Option<MonitorTask>> {
        &self.shared.monitor
    }

    // ----- device registry -------------------------------------------------

    /// Register a newly connected device
    pub fn connect(&self, device_id: &str) {
        let mut registry = lock(&self.shared.registry);
        registry
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceSession::new(&self.shared.config.connection_id));
        info!(device_id, total = registry.devices.len(), "Device connected");
    }

    /// Forget a device after the transport reports it gone
    pub fn disconnect(&self, device_id: &str) {
        let now_empty = {
            let mut registry = lock(&self.shared.registry);
            if registry.remove(device_id) {
                info!(device_id, total = registry.devices.len(), "Device disconnected");
            }
            registry.devices.is_empty()
        };
        if now_empty {
            // Wake any waiter instead of letting it run into its timeout.
            lock(&self.shared.pending).take();
        }
    }

    /// Ids of the connected devices, sorted
    pub fn connected_devices(&self) -> Vec<String> {
        lock(&self.shared.registry).devices.keys().cloned().collect()
    }

    /// Session bookkeeping for one device
    pub fn device_session(&self, device_id: &str) -> Option<DeviceSession> {
        lock(&self.shared.registry).devices.get(device_id).cloned()
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        lock(&self.shared.registry).state
    }

    /// Session is initialized
    pub fn is_session_active(&self) -> bool {
        self.session_state() == SessionState::Initialized
    }

    /// Traffic since the engine was created
    pub fn counters(&self) -> TrafficCounters {
        let c = &self.shared.counters;
        TrafficCounters {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
        }
    }

    // ----- variables and callbacks ------------------------------------------

    /// Replace the variable set
    pub fn load_variables(&self, definitions: &[VariableDefinition]) -> LoadReport {
        self.shared
            .address_map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .load(definitions)
    }

    /// Run `f` against the current address map
    pub fn with_address_map<R>(&self, f: impl FnOnce(&AddressMap) -> R) -> R {
        let map = self
            .shared
            .address_map
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&map)
    }

    /// Snapshot of the loaded variables
    pub fn variables(&self) -> Vec<Variable> {
        self.with_address_map(|map| map.variables().to_vec())
    }

    /// Parameter name for an address, `Unknown_0x...` when unmapped
    pub fn resolve_address(&self, address: u32) -> String {
        self.with_address_map(|map| map.resolve_address(address))
    }

    /// Set the callback receiving every value read by the monitoring loop
    /// or by [`SessionEngine::refresh_all`]
    pub fn set_sample_callback<F>(&self, callback: F)
    where
        F: Fn(&ParameterSample) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_sample
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub(super) fn notify_sample(&self, sample: &ParameterSample) {
        let callback = self
            .shared
            .on_sample
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(sample);
        }
    }

    // ----- outbound ---------------------------------------------------------

    fn record_sent(&self, frame: &str) {
        let c = &self.shared.counters;
        c.frames_sent.fetch_add(1, Ordering::Relaxed);
        c.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
    }

    /// Send a frame to one device. A failed send drops the device.
    pub fn send_to_device(&self, device_id: &str, frame: &str) -> bool {
        let mut registry = lock(&self.shared.registry);
        match self.shared.transport.send(device_id, frame) {
            Ok(()) => {
                self.record_sent(frame);
                let config_id = &self.shared.config.connection_id;
                registry
                    .devices
                    .entry(device_id.to_string())
                    .or_insert_with(|| DeviceSession::new(config_id))
                    .last_activity = Utc::now();
                true
            }
            Err(e) => {
                warn!(device_id, error = %e, "Send failed, dropping device");
                registry.remove(device_id);
                false
            }
        }
    }

    /// Send a frame to every connected device, dropping those that fail.
    /// Returns the number of devices reached.
    pub fn broadcast(&self, frame: &str) -> usize {
        let mut registry = lock(&self.shared.registry);
        let mut failed = Vec::new();
        let mut reached = 0;

        for (device_id, device) in registry.devices.iter_mut() {
            match self.shared.transport.send(device_id, frame) {
                Ok(()) => {
                    self.record_sent(frame);
                    device.last_activity = Utc::now();
                    reached += 1;
                }
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Broadcast send failed, dropping device");
                    failed.push(device_id.clone());
                }
            }
        }
        for device_id in failed {
            registry.remove(&device_id);
        }
        reached
    }

    // ----- inbound ----------------------------------------------------------

    /// Entry point for every inbound frame from the transport
    pub fn handle_frame(&self, device_id: &str, frame: &str) {
        let c = &self.shared.counters;
        c.frames_received.fetch_add(1, Ordering::Relaxed);
        c.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);

        if let Some(device) = lock(&self.shared.registry).devices.get_mut(device_id) {
            device.last_activity = Utc::now();
        }

        let response = decode_response(frame);
        let Some(kind) = response.kind() else {
            warn!(device_id, frame, "Ignoring malformed frame");
            return;
        };

        let mut pending = lock(&self.shared.pending);
        let matches = pending
            .as_ref()
            .is_some_and(|p| p.expected == kind && Instant::now() <= p.deadline);
        if !matches {
            debug!(device_id, ?kind, "Unsolicited response dropped");
            return;
        }
        if let Some(request) = pending.take() {
            // The waiter may have given up in the meantime.
            let _ = request.slot.send(response);
        }
    }

    // ----- request/response -------------------------------------------------

    /// Broadcast a command and wait for the matching acknowledgement.
    /// Callers must hold the request gate.
    async fn request(
        &self,
        frame: &str,
        expected: ResponseKind,
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.shared.pending);
            if pending.is_some() {
                debug!("Discarding stale pending request");
            }
            *pending = Some(PendingRequest {
                expected,
                deadline: Instant::now() + timeout,
                slot: tx,
            });
        }

        if self.broadcast(frame) == 0 {
            lock(&self.shared.pending).take();
            return Err(SessionError::NoDevices);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::TransportLost),
            Err(_) => {
                lock(&self.shared.pending).take();
                Err(SessionError::Timeout {
                    expected,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Open the debug session on all connected devices
    pub async fn initialize_session(&self, timeout: Duration) -> bool {
        let _gate = self.shared.request_gate.lock().await;
        self.initialize_locked(timeout).await
    }

    /// Close the debug session
    pub async fn end_session(&self, timeout: Duration) -> bool {
        let _gate = self.shared.request_gate.lock().await;
        self.end_locked(timeout).await
    }

    async fn initialize_locked(&self, timeout: Duration) -> bool {
        if self.connected_devices().is_empty() {
            warn!("Cannot initialize session: no devices connected");
            return false;
        }

        let connection_id = &self.shared.config.connection_id;
        if self.is_session_active() {
            self.end_locked(timeout).await;
        } else {
            // Clear any session the device may still hold from a previous run.
            self.broadcast(&encode_end(connection_id));
        }

        match self
            .request(&encode_init(connection_id), ResponseKind::Init, timeout)
            .await
        {
            Ok(Response::InitAck { con_id }) => {
                if con_id != *connection_id {
                    debug!(sent = %connection_id, received = %con_id, "Init ack carries a different token");
                }
                lock(&self.shared.registry).set_state(SessionState::Initialized);
                info!("Debug session initialized");
                true
            }
            Ok(other) => {
                warn!(?other, "Unexpected response to init");
                false
            }
            Err(e) => {
                warn!(error = %e, "Session initialization failed");
                false
            }
        }
    }

    async fn end_locked(&self, timeout: Duration) -> bool {
        let result = self
            .request(
                &encode_end(&self.shared.config.connection_id),
                ResponseKind::End,
                timeout,
            )
            .await;
        lock(&self.shared.registry).set_state(SessionState::Uninitialized);

        match result {
            Ok(_) => {
                info!("Debug session ended");
                true
            }
            Err(e) => {
                warn!(error = %e, "Session end not acknowledged");
                false
            }
        }
    }

    async fn ensure_initialized(&self) -> Result<(), SessionError> {
        if self.is_session_active() {
            return Ok(());
        }
        debug!("Session not initialized, initializing before request");
        if self.initialize_locked(self.shared.config.response_timeout()).await {
            Ok(())
        } else if self.connected_devices().is_empty() {
            Err(SessionError::NoDevices)
        } else {
            Err(SessionError::NotInitialized)
        }
    }

    // ----- reads and writes -------------------------------------------------

    /// Read element `index` of `variable`
    pub async fn read_variable(
        &self,
        variable: &Variable,
        index: u32,
    ) -> Result<ParameterSample, SessionError> {
        let _gate = self.shared.request_gate.lock().await;
        self.ensure_initialized().await?;

        let address = variable
            .element_address(index)
            .ok_or_else(|| SessionError::ElementOutOfRange {
                name: variable.name.clone(),
                index,
            })?;
        let frame = encode_mem_read(address, variable.element_type.bit_width());

        let response = self
            .request(&frame, ResponseKind::MemRead, self.shared.config.response_timeout())
            .await?;
        let (responded, value, raw_value) = match response {
            Response::MemReadAck {
                address,
                value,
                raw_value,
            } => (address, value, raw_value),
            other => return Err(SessionError::UnexpectedResponse(format!("{:?}", other))),
        };

        let resolution = self.with_address_map(|map| map.resolve(responded));
        if responded != address {
            warn!(
                requested = %format_address(address),
                responded = %format_address(responded),
                resolved = %resolution.name,
                "Read response address mismatch"
            );
        }
        let name = if resolution.kind == MatchKind::Unknown && responded == address {
            variable.element_name(index)
        } else {
            resolution.name
        };

        let value = value.decode(variable.element_type)?;
        Ok(ParameterSample {
            name,
            address: responded,
            value,
            raw_value,
            timestamp: Utc::now(),
        })
    }

    /// Write one value. Failures and timeouts both yield `false`.
    pub async fn write_variable(&self, address: u32, value: f64, element_type: ElementType) -> bool {
        let _gate = self.shared.request_gate.lock().await;
        if let Err(e) = self.ensure_initialized().await {
            warn!(address = %format_address(address), error = %e, "Write skipped");
            return false;
        }

        let frame = match encode_mem_write(address, element_type.bit_width(), value, element_type) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(address = %format_address(address), error = %e, "Cannot encode write");
                return false;
            }
        };

        match self
            .request(&frame, ResponseKind::MemWrite, self.shared.config.response_timeout())
            .await
        {
            Ok(Response::MemWriteAck {
                address: acked,
                success,
            }) => {
                if acked != address {
                    debug!(
                        requested = %format_address(address),
                        acked = %format_address(acked),
                        "Write ack for different address"
                    );
                }
                if success {
                    info!(address = %format_address(address), value, "Write acknowledged");
                } else {
                    warn!(address = %format_address(address), value, "Device rejected write");
                }
                success
            }
            Ok(other) => {
                warn!(?other, "Unexpected response to write");
                false
            }
            Err(e) => {
                warn!(address = %format_address(address), error = %e, "Write failed");
                false
            }
        }
    }

    /// Write several values in order, pausing between writes.
    /// One failure does not stop the remaining writes.
    pub async fn write_values(&self, requests: &[WriteRequest]) -> Vec<bool> {
        let mut results = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.shared.config.write_delay()).await;
            }
            results.push(
                self.write_variable(request.address, request.value, request.element_type)
                    .await,
            );
        }
        let failed = results.iter().filter(|ok| !**ok).count();
        info!(total = results.len(), failed, "Bulk write finished");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ChannelTransport, TransportError};

    struct RejectingTransport;

    impl Transport for RejectingTransport {
        fn send(&self, device_id: &str, _frame: &str) -> Result<(), TransportError> {
            Err(TransportError::SendFailed(device_id.to_string()))
        }
    }

    fn engine() -> (SessionEngine, Arc<ChannelTransport>) {
        let transport = Arc::new(ChannelTransport::new());
        let engine = SessionEngine::new(transport.clone(), SessionConfig::default());
        (engine, transport)
    }

    #[test]
    fn test_connect_disconnect() {
        let (engine, _transport) = engine();
        engine.connect("b");
        engine.connect("a");
        engine.connect("a");
        assert_eq!(engine.connected_devices(), vec!["a", "b"]);
        engine.disconnect("a");
        assert_eq!(engine.connected_devices(), vec!["b"]);
    }

    #[test]
    fn test_losing_last_device_resets_session() {
        let (engine, _transport) = engine();
        engine.connect("a");
        lock(&engine.shared.registry).set_state(SessionState::Initialized);
        assert!(engine.is_session_active());
        engine.disconnect("a");
        assert_eq!(engine.session_state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_broadcast_drops_failing_devices() {
        let engine = SessionEngine::new(Arc::new(RejectingTransport), SessionConfig::default());
        engine.connect("a");
        engine.connect("b");
        assert_eq!(engine.broadcast("{}"), 0);
        assert!(engine.connected_devices().is_empty());
    }

    #[test]
    fn test_send_creates_device_entry() {
        let (engine, transport) = engine();
        let mut rx = transport.register("gw");
        assert!(engine.send_to_device("gw", "frame"));
        assert_eq!(rx.try_recv().unwrap(), "frame");
        assert!(engine.device_session("gw").is_some());
        assert_eq!(engine.counters().frames_sent, 1);
        assert_eq!(engine.counters().bytes_sent, 5);
    }

    #[test]
    fn test_unsolicited_response_is_ignored() {
        let (engine, _transport) = engine();
        engine.handle_frame("gw", r#"{"res":"init","con_id":"01"}"#);
        engine.handle_frame("gw", "garbage");
        assert!(lock(&engine.shared.pending).is_none());
        assert_eq!(engine.counters().frames_received, 2);
    }

    #[tokio::test]
    async fn test_initialize_without_devices_fails() {
        let (engine, _transport) = engine();
        assert!(!engine.initialize_session(Duration::from_millis(10)).await);
        assert_eq!(engine.session_state(), SessionState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_times_out() {
        let (engine, transport) = engine();
        let _rx = transport.register("gw");
        engine.connect("gw");
        assert!(!engine.initialize_session(Duration::from_secs(5)).await);
        assert!(!engine.is_session_active());
        assert!(lock(&engine.shared.pending).is_none());
    }
}
