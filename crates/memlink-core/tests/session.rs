//! Tests for the session engine against a simulated device

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use memlink_core::address_map::{Variable, VariableDefinition};
use memlink_core::protocol::ElementType;
use memlink_core::session::{
    ChannelTransport, SessionConfig, SessionEngine, SessionError, SessionState, Transport,
    TransportError, WriteRequest,
};
use memlink_core::sim::{SimulatedDevice, SimulatedLink};
use pretty_assertions::assert_eq;

fn engine_with_device(device: SimulatedDevice) -> (SessionEngine, SimulatedLink) {
    let transport = Arc::new(ChannelTransport::new());
    let engine = SessionEngine::new(transport.clone(), SessionConfig::default());
    let link = device.attach(&engine, &transport, "gw-1");
    (engine, link)
}

/// Forwards to a channel transport and records whether a read was sent
/// while the device still had one unanswered.
struct OverlapTracker {
    inner: Arc<ChannelTransport>,
    device: Mutex<Option<Arc<Mutex<SimulatedDevice>>>>,
    reads_sent: AtomicU64,
    overlaps: AtomicU64,
}

impl Transport for OverlapTracker {
    fn send(&self, device_id: &str, frame: &str) -> Result<(), TransportError> {
        if frame.contains(r#""cmd":"mem_read""#) {
            let sent = self.reads_sent.fetch_add(1, Ordering::SeqCst);
            if let Some(device) = self.device.lock().unwrap().as_ref() {
                if device.lock().unwrap().reads_served() != sent {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.inner.send(device_id, frame)
    }
}

#[tokio::test(start_paused = true)]
async fn test_monitoring_keeps_one_read_outstanding() {
    let tracker = Arc::new(OverlapTracker {
        inner: Arc::new(ChannelTransport::new()),
        device: Mutex::new(None),
        reads_sent: AtomicU64::new(0),
        overlaps: AtomicU64::new(0),
    });
    let engine = SessionEngine::new(tracker.clone(), SessionConfig::default());
    let link = SimulatedDevice::new()
        .with_response_delay(Duration::from_millis(50))
        .attach(&engine, &tracker.inner, "gw-1");
    *tracker.device.lock().unwrap() = Some(link.device());

    engine.load_variables(&[
        VariableDefinition::new("table", "0x100", 3, "uint16_t"),
        VariableDefinition::new("gain", "0x200", 1, "float"),
    ]);

    engine.start_monitoring(Some(Duration::from_millis(20))).unwrap();
    assert!(engine.is_monitoring());
    assert_eq!(
        engine.start_monitoring(None),
        Err(SessionError::MonitoringActive)
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(engine.stop_monitoring().await);
    assert!(!engine.is_monitoring());

    assert!(tracker.reads_sent.load(Ordering::SeqCst) >= 8);
    assert_eq!(tracker.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(engine.session_state(), SessionState::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_variable_is_skipped_for_the_sweep() {
    let mut device = SimulatedDevice::new();
    device.silence(0x100);
    device.set_value(0x104, 9.0, ElementType::U32).unwrap();
    device.set_value(0x200, -3.0, ElementType::I8).unwrap();
    let (engine, _link) = engine_with_device(device);

    engine.load_variables(&[
        VariableDefinition::new("stuck", "0x100", 2, "uint32_t"),
        VariableDefinition::new("trim", "0x200", 1, "int8_t"),
    ]);

    let report = engine.sweep(None).await;
    assert_eq!(report.timeouts, 1);
    assert!(!report.aborted);
    assert_eq!(report.samples.len(), 1);
    assert_eq!(report.samples[0].name, "trim");
    assert_eq!(report.samples[0].value, -3.0);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_session_lifecycle() {
    let (engine, link) = engine_with_device(SimulatedDevice::new());

    assert!(engine.initialize_session(Duration::from_secs(1)).await);
    assert_eq!(engine.session_state(), SessionState::Initialized);
    assert!(engine.device_session("gw-1").unwrap().initialized);
    assert!(link.with_device(|d| d.is_session_open()));

    // Re-initializing ends the running session first.
    assert!(engine.initialize_session(Duration::from_secs(1)).await);

    assert!(engine.end_session(Duration::from_secs(1)).await);
    assert_eq!(engine.session_state(), SessionState::Uninitialized);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!link.with_device(|d| d.is_session_open()));
}

#[tokio::test(start_paused = true)]
async fn test_read_initializes_automatically() {
    let mut device = SimulatedDevice::new();
    device.set_value(0x2000_0008, 1234.0, ElementType::U32).unwrap();
    let (engine, _link) = engine_with_device(device);

    let var = Variable::new("V", 0x2000_0000, 4, ElementType::U32);
    let sample = engine.read_variable(&var, 2).await.unwrap();
    assert!(engine.is_session_active());
    assert_eq!(sample.address, 0x2000_0008);
    assert_eq!(sample.value, 1234.0);
    assert_eq!(sample.raw_value, "0b00000000000000000000010011010010");
    // Not loaded into the map, so the sample is named after the variable.
    assert_eq!(sample.name, "V[2]");

    assert_eq!(
        engine.read_variable(&var, 4).await,
        Err(SessionError::ElementOutOfRange {
            name: "V".to_string(),
            index: 4
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_accepts_response_for_other_address() {
    let transport = Arc::new(ChannelTransport::new());
    let engine = SessionEngine::new(transport.clone(), SessionConfig::default());
    engine.load_variables(&[VariableDefinition::new("a", "0x100", 2, "uint8_t")]);

    let mut outbox = transport.register("dev");
    engine.connect("dev");
    let device = engine.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let reply = if frame.contains("\"init\"") {
                r#"{"res":"init","con_id":"01"}"#
            } else if frame.contains("\"mem_read\"") {
                r#"{"res":"mem_read","add":"0x00000101","value":"0b00000111"}"#
            } else {
                continue;
            };
            device.handle_frame("dev", reply);
        }
    });

    let var = engine.variables()[0].clone();
    let sample = engine.read_variable(&var, 0).await.unwrap();
    assert_eq!(sample.address, 0x101);
    assert_eq!(sample.name, "a[1]");
    assert_eq!(sample.value, 7.0);
}

#[tokio::test(start_paused = true)]
async fn test_writes_report_success_and_failure() {
    let (engine, link) = engine_with_device(SimulatedDevice::new());

    assert!(engine.write_variable(0x300, 512.0, ElementType::I16).await);
    assert_eq!(link.with_device(|d| d.value(0x300, ElementType::I16)), Some(512.0));

    assert!(engine.write_variable(0x310, 2.5, ElementType::F32).await);
    assert_eq!(link.with_device(|d| d.value(0x310, ElementType::F32)), Some(2.5));

    link.with_device(|d| d.set_reject_writes(true));
    assert!(!engine.write_variable(0x300, 1.0, ElementType::I16).await);
    assert_eq!(link.with_device(|d| d.value(0x300, ElementType::I16)), Some(512.0));
}

#[tokio::test(start_paused = true)]
async fn test_bulk_write_continues_past_failures() {
    let (engine, link) = engine_with_device(SimulatedDevice::new());
    let var = Variable::new("table", 0x400, 3, ElementType::U8);

    let requests: Vec<WriteRequest> = (0..3)
        .map(|i| WriteRequest::for_element(&var, i, f64::from(i) * 10.0).unwrap())
        .chain([WriteRequest::new(0x500, f64::NAN, ElementType::U8)])
        .chain([WriteRequest::new(0x501, 300.0, ElementType::U8)])
        .collect();

    let started = tokio::time::Instant::now();
    let results = engine.write_values(&requests).await;
    assert_eq!(results, vec![true, true, true, false, true]);
    assert!(started.elapsed() >= Duration::from_millis(800));

    assert_eq!(link.with_device(|d| d.value(0x402, ElementType::U8)), Some(20.0));
    assert_eq!(link.with_device(|d| d.value(0x501, ElementType::U8)), Some(255.0));
}

#[tokio::test(start_paused = true)]
async fn test_operations_without_devices() {
    let engine = SessionEngine::new(Arc::new(ChannelTransport::new()), SessionConfig::default());
    let var = Variable::new("x", 0x10, 1, ElementType::U8);

    assert!(!engine.initialize_session(Duration::from_secs(1)).await);
    assert!(!engine.write_variable(0x10, 1.0, ElementType::U8).await);
    assert_eq!(engine.read_variable(&var, 0).await, Err(SessionError::NoDevices));
    assert_eq!(engine.start_monitoring(None), Err(SessionError::NoDevices));
}

#[tokio::test(start_paused = true)]
async fn test_losing_the_device_mid_request() {
    let transport = Arc::new(ChannelTransport::new());
    let engine = SessionEngine::new(transport.clone(), SessionConfig::default());
    let _outbox = transport.register("dev");
    engine.connect("dev");

    let reader = engine.clone();
    let read = tokio::spawn(async move {
        let var = Variable::new("x", 0x10, 1, ElementType::U8);
        reader.read_variable(&var, 0).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.disconnect("dev");

    let started = tokio::time::Instant::now();
    assert_eq!(read.await.unwrap(), Err(SessionError::NoDevices));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.session_state(), SessionState::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_all_notifies_callback() {
    let mut device = SimulatedDevice::new();
    device.set_value(0x600, 1.0, ElementType::U8).unwrap();
    device.set_value(0x601, 2.0, ElementType::U8).unwrap();
    let (engine, _link) = engine_with_device(device);
    engine.load_variables(&[VariableDefinition::new("pair", "0x600", 2, "uint8")]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.set_sample_callback(move |sample| {
        sink.lock().unwrap().push((sample.name.clone(), sample.value));
    });

    let samples = engine.refresh_all().await;
    assert_eq!(samples.len(), 2);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("pair[0]".to_string(), 1.0), ("pair[1]".to_string(), 2.0)]
    );

    let counters = engine.counters();
    assert!(counters.frames_sent >= 4);
    assert!(counters.frames_received >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_lands_within_one_sleep_slice() {
    let (engine, _link) = engine_with_device(SimulatedDevice::new());
    engine.load_variables(&[VariableDefinition::new("v", "0x10", 1, "uint8_t")]);

    engine.start_monitoring(Some(Duration::from_secs(60))).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(engine.is_monitoring());

    let started = tokio::time::Instant::now();
    assert!(engine.stop_monitoring().await);
    assert!(started.elapsed() <= engine.config().stop_slice());
    assert!(!engine.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_read_is_unanswered() {
    let mut device = SimulatedDevice::new();
    device.silence(0x10);
    let (engine, _link) = engine_with_device(device);
    engine.load_variables(&[VariableDefinition::new("v", "0x10", 1, "uint8_t")]);

    engine.start_monitoring(None).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The loop is blocked on a read that only times out after 5s.
    assert!(engine.stop_monitoring().await);
    assert!(!engine.is_monitoring());
    assert_eq!(engine.session_state(), SessionState::Uninitialized);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_sample_callback_ends_session() {
    let (engine, link) = engine_with_device(SimulatedDevice::new());
    engine.load_variables(&[VariableDefinition::new("v", "0x10", 1, "uint8_t")]);
    engine.set_sample_callback(|sample| panic!("sample sink failed on {}", sample.name));

    engine.start_monitoring(None).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(!engine.is_monitoring());
    assert_eq!(engine.session_state(), SessionState::Uninitialized);
    assert!(!link.with_device(|d| d.is_session_open()));

    engine.set_sample_callback(|_| {});
    engine.start_monitoring(None).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.stop_monitoring().await);
}
