//! # MemLink Core Library
//!
//! Remote memory access and firmware update for embedded devices.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The text-frame command protocol (`init`, `end`, `mem_read`, `mem_write`)
//!   with bit-width, sign and float aware value encoding
//! - An address map translating variable names to device memory addresses
//! - A debug session engine with request/response correlation and a
//!   polling monitor loop
//! - A chunked OTA firmware update workflow
//!
//! The engine is transport agnostic: a front end (websocket server, serial
//! bridge) implements [`session::Transport`] and feeds inbound frames to
//! [`session::SessionEngine::handle_frame`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use memlink_core::prelude::*;
//!
//! let transport = Arc::new(ChannelTransport::new());
//! let engine = SessionEngine::new(transport.clone(), SessionConfig::default());
//!
//! let (defs, _) = VariableDefinition::parse_csv(&std::fs::read_to_string("vars.csv")?);
//! engine.load_variables(&defs);
//! engine.set_sample_callback(|s| tracing::info!(name = %s.name, value = s.value));
//! engine.start_monitoring(None)?;
//! ```

pub mod address_map;
pub mod config;
pub mod ota;
pub mod protocol;
pub mod session;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::address_map::{AddressMap, Variable, VariableDefinition};
    pub use crate::config::EngineConfig;
    pub use crate::ota::{FirmwareInfo, OtaConfig, OtaEngine, OtaStatus};
    pub use crate::protocol::{BitWidth, ElementType, Response};
    pub use crate::session::{
        ChannelTransport, ParameterSample, SessionConfig, SessionEngine, SessionError,
        SessionState, Transport, WriteRequest,
    };
    pub use crate::sim::SimulatedDevice;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
