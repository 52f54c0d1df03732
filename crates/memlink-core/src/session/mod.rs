//! Debug Session Engine
//!
//! Owns the connected-device registry and the init/end session state
//! machine, correlates requests with acknowledgements, and runs the
//! monitoring loop that polls every loaded variable.
//!
//! The protocol is half-duplex: at most one read or write is outstanding at
//! any time, and a response is matched to its request by kind only.

mod engine;
mod error;
mod monitor;
mod transport;

pub use engine::{DeviceSession, SampleCallback, SessionEngine, TrafficCounters};
pub use error::SessionError;
pub use monitor::SweepReport;
pub use transport::{ChannelTransport, Transport, TransportError};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address_map::Variable;
use crate::protocol::{ElementType, DEFAULT_CONNECTION_ID, DEFAULT_TIMEOUT_MS};

/// Default delay between monitoring sweeps in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Granularity of the inter-sweep sleep; stop requests land within one slice
pub const DEFAULT_STOP_SLICE_MS: u64 = 100;

/// State of the logical debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session; reads and writes will initialize first
    Uninitialized,
    /// `init` acknowledged, reads and writes allowed
    Initialized,
}

/// Session engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Token sent in `init`/`end` frames
    pub connection_id: String,
    /// Acknowledgement timeout for init/end/read/write
    pub response_timeout_ms: u64,
    /// Delay between monitoring sweeps
    pub poll_interval_ms: u64,
    /// Slice length of the inter-sweep sleep
    pub stop_slice_ms: u64,
    /// How long `stop_monitoring` waits for the loop to exit. Raised to
    /// `response_timeout_ms + stop_slice_ms` when shorter.
    pub join_timeout_ms: u64,
    /// Pause between consecutive writes of a bulk write
    pub write_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection_id: DEFAULT_CONNECTION_ID.to_string(),
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stop_slice_ms: DEFAULT_STOP_SLICE_MS,
            join_timeout_ms: 2000,
            write_delay_ms: 200,
        }
    }
}

impl SessionConfig {
    /// Acknowledgement timeout
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Delay between sweeps
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Never zero
    pub fn stop_slice(&self) -> Duration {
        Duration::from_millis(self.stop_slice_ms.max(1))
    }

    /// Configured join bound
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Effective bound on joining the monitoring loop
    pub fn stop_wait(&self) -> Duration {
        self.join_timeout()
            .max(self.response_timeout() + self.stop_slice())
    }

    /// Pause between bulk writes
    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }
}

/// One value read from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSample {
    /// Resolved parameter name (`name` or `name[i]`)
    pub name: String,
    /// Address reported by the device
    pub address: u32,
    /// Decoded value
    pub value: f64,
    /// Value text exactly as received
    pub raw_value: String,
    /// When the response arrived
    pub timestamp: DateTime<Utc>,
}

/// A single entry of a bulk write
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Target address
    pub address: u32,
    /// Value to write
    pub value: f64,
    /// Element type
    pub element_type: ElementType,
}

impl WriteRequest {
    /// Write `value` to `address` as `element_type`
    pub fn new(address: u32, value: f64, element_type: ElementType) -> Self {
        Self {
            address,
            value,
            element_type,
        }
    }

    /// Write `value` to element `index` of `variable`
    pub fn for_element(variable: &Variable, index: u32, value: f64) -> Option<Self> {
        variable
            .element_address(index)
            .map(|address| Self::new(address, value, variable.element_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connection_id, "01");
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.stop_slice(), Duration::from_millis(100));
    }

    #[test]
    fn test_stop_wait_covers_an_unanswered_read() {
        let config = SessionConfig::default();
        assert_eq!(config.join_timeout(), Duration::from_secs(2));
        assert_eq!(config.stop_wait(), Duration::from_millis(5100));

        let config = SessionConfig {
            response_timeout_ms: 100,
            join_timeout_ms: 3000,
            ..SessionConfig::default()
        };
        assert_eq!(config.stop_wait(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"poll_interval_ms": 50}"#).unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.response_timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_write_request_for_element() {
        let var = Variable::new("table", 0x100, 4, ElementType::I16);
        let request = WriteRequest::for_element(&var, 2, -3.0).unwrap();
        assert_eq!(request.address, 0x104);
        assert_eq!(request.element_type, ElementType::I16);
        assert!(WriteRequest::for_element(&var, 4, 0.0).is_none());
    }
}
