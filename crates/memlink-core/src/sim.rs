//! Simulated device
//!
//! Answers `init`/`end`/`mem_read`/`mem_write` frames the way device
//! firmware does, backed by a sparse memory of element cells. Useful for
//! exercising the session engine without hardware.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::{
    decode_value, encode_value, format_address, parse_address, BitWidth, CodecError, ElementType,
    BINARY_PREFIX,
};
use crate::session::{ChannelTransport, SessionEngine};

/// In-memory stand-in for a device
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    /// Element address -> value text as it goes over the wire
    cells: HashMap<u32, String>,
    session_open: bool,
    response_delay: Duration,
    /// Addresses whose reads are never answered
    silent: HashSet<u32>,
    reject_writes: bool,
    ota_frames: Vec<JsonValue>,
    reads_served: u64,
    writes_served: u64,
}

impl SimulatedDevice {
    /// Device with empty memory and instant replies
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `delay`
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Delay applied to every reply
    pub fn response_delay(&self) -> Duration {
        self.response_delay
    }

    /// Store `value` at `address` encoded for `element_type`
    pub fn set_value(
        &mut self,
        address: u32,
        value: f64,
        element_type: ElementType,
    ) -> Result<(), CodecError> {
        let text = encode_value(value, element_type.bit_width(), element_type)?;
        self.cells.insert(address, text);
        Ok(())
    }

    /// Store value text verbatim (`0b...` or `0x...`)
    pub fn set_raw(&mut self, address: u32, text: &str) {
        self.cells.insert(address, text.to_string());
    }

    /// Decode the cell at `address`
    pub fn value(&self, address: u32, element_type: ElementType) -> Option<f64> {
        self.cells
            .get(&address)
            .and_then(|text| decode_value(text, element_type).ok())
    }

    /// Stored text of the cell at `address`
    pub fn raw(&self, address: u32) -> Option<&str> {
        self.cells.get(&address).map(String::as_str)
    }

    /// Never answer reads of `address`
    pub fn silence(&mut self, address: u32) {
        self.silent.insert(address);
    }

    /// Acknowledge writes with a failure state instead of storing them
    pub fn set_reject_writes(&mut self, reject: bool) {
        self.reject_writes = reject;
    }

    /// An `init` was acknowledged and not yet ended
    pub fn is_session_open(&self) -> bool {
        self.session_open
    }

    /// OTA directive and chunk frames received so far
    pub fn ota_frames(&self) -> &[JsonValue] {
        &self.ota_frames
    }

    /// Reads answered so far
    pub fn reads_served(&self) -> u64 {
        self.reads_served
    }

    /// Writes acknowledged so far
    pub fn writes_served(&self) -> u64 {
        self.writes_served
    }

    /// Handle one inbound frame, returning the reply if there is one
    pub fn respond(&mut self, frame: &str) -> Option<String> {
        let message: JsonValue = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Simulated device ignoring malformed frame");
                return None;
            }
        };

        if message.get("type").is_some() {
            self.ota_frames.push(message);
            return None;
        }

        let field = |key: &str| message.get(key).and_then(JsonValue::as_str);
        let reply = match field("cmd")? {
            "init" => {
                self.session_open = true;
                json!({ "res": "init", "con_id": field("con_id").unwrap_or_default() })
            }
            "end" => {
                self.session_open = false;
                json!({ "res": "end", "con_id": field("con_id").unwrap_or_default() })
            }
            "mem_read" => {
                let address = parse_address(field("add")?).ok()?;
                if self.silent.contains(&address) {
                    trace!(address = %format_address(address), "Read left unanswered");
                    return None;
                }
                let value = self
                    .cells
                    .get(&address)
                    .cloned()
                    .unwrap_or_else(|| zero_pattern(field("size")));
                self.reads_served += 1;
                json!({ "res": "mem_read", "add": format_address(address), "value": value })
            }
            "mem_write" => {
                let address = parse_address(field("add")?).ok()?;
                let state = if self.reject_writes {
                    "failure"
                } else {
                    self.cells.insert(address, field("data")?.to_string());
                    "success"
                };
                self.writes_served += 1;
                json!({ "res": "mem_write", "add": format_address(address), "state": state })
            }
            other => {
                debug!(cmd = other, "Simulated device ignoring unknown command");
                return None;
            }
        };
        Some(reply.to_string())
    }

    /// Connect this device to `engine` under `device_id`.
    ///
    /// Frames the engine sends are answered after the response delay and
    /// fed back through [`SessionEngine::handle_frame`].
    pub fn attach(
        self,
        engine: &SessionEngine,
        transport: &ChannelTransport,
        device_id: &str,
    ) -> SimulatedLink {
        let device = Arc::new(Mutex::new(self));
        let mut outbox = transport.register(device_id);
        engine.connect(device_id);

        let task = {
            let device = device.clone();
            let engine = engine.clone();
            let device_id = device_id.to_string();
            tokio::spawn(async move {
                while let Some(frame) = outbox.recv().await {
                    let (reply, delay) = {
                        let mut device = device.lock().unwrap_or_else(PoisonError::into_inner);
                        (device.respond(&frame), device.response_delay)
                    };
                    if let Some(reply) = reply {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        engine.handle_frame(&device_id, &reply);
                    }
                }
                debug!(device_id = %device_id, "Simulated device link closed");
            })
        };

        SimulatedLink { device, task }
    }
}

/// A simulated device wired to an engine
pub struct SimulatedLink {
    device: Arc<Mutex<SimulatedDevice>>,
    task: JoinHandle<()>,
}

impl SimulatedLink {
    /// Run `f` against the device state
    pub fn with_device<R>(&self, f: impl FnOnce(&mut SimulatedDevice) -> R) -> R {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut device)
    }

    /// Shared handle to the attached device
    pub fn device(&self) -> Arc<Mutex<SimulatedDevice>> {
        self.device.clone()
    }

    /// Stop answering frames
    pub fn detach(self) {
        self.task.abort();
    }
}

fn zero_pattern(size: Option<&str>) -> String {
    let bits = size
        .and_then(|s| s.parse::<u32>().ok())
        .and_then(BitWidth::from_bits)
        .map_or(32, |w| w.bits());
    format!("{}{}", BINARY_PREFIX, "0".repeat(bits as usize))
}
