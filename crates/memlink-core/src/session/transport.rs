//! Device transport abstraction
//!
//! The engine never touches sockets. Whatever front end accepts device
//! connections (websocket server, serial bridge, ...) implements
//! [`Transport`] for the outbound direction and feeds inbound frames to
//! [`SessionEngine::handle_frame`](super::SessionEngine::handle_frame).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Errors raised while handing a frame to the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No outbox registered for the device
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Receiving half was dropped
    #[error("Channel to device {0} is closed")]
    Closed(String),

    /// Any other transport failure
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Outbound half of a message-oriented duplex channel to many devices
pub trait Transport: Send + Sync {
    /// Queue one whole text frame for `device_id`.
    ///
    /// Must not block: the engine may call this while holding its
    /// registry lock.
    fn send(&self, device_id: &str, frame: &str) -> Result<(), TransportError>;
}

/// Transport backed by one unbounded channel per device.
///
/// A connection handler calls [`ChannelTransport::register`] when a device
/// connects and forwards everything from the returned receiver to the wire.
#[derive(Default)]
pub struct ChannelTransport {
    outboxes: Mutex<HashMap<String, UnboundedSender<String>>>,
}

impl ChannelTransport {
    /// Transport with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the outbox for a device, replacing any previous one
    pub fn register(&self, device_id: &str) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        self.outboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), tx);
        rx
    }

    /// Drop a device's outbox
    pub fn unregister(&self, device_id: &str) {
        self.outboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id);
    }

    /// Device has an outbox
    pub fn is_registered(&self, device_id: &str) -> bool {
        self.outboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(device_id)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, device_id: &str, frame: &str) -> Result<(), TransportError> {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outboxes
            .get(device_id)
            .ok_or_else(|| TransportError::UnknownDevice(device_id.to_string()))?;

        if sender.send(frame.to_string()).is_err() {
            outboxes.remove(device_id);
            return Err(TransportError::Closed(device_id.to_string()));
        }
        Ok(())
    }
}
