//! # HomeKit Data Stream (HDS)
//!
//! Bulk-transfer transport of the HomeKit Accessory Protocol: framed,
//! chunked byte streams between a controller and an accessory, carried
//! either over a dedicated, encrypted TCP connection or tunneled through
//! HAP characteristic writes and reads.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │     Application (DataStreamDelegate + completions)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Characteristic handlers (TLV8 setup / HAP transport)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  DataStreamServer (dispatch, setup transaction)         │
//! ├────────────────────────────┬────────────────────────────┤
//! │  TCP leg (matchmaking,     │  HAP leg (write/read       │
//! │  ChaCha20-Poly1305)        │  pairing, interrupts)      │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Platform (TcpStreamManager, TimerService)              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Processing Model
//!
//! Everything runs on one cooperative context. Legs never block: when the
//! socket has no bytes or no space they return and resume on the next
//! readiness event. Delegate callbacks may call back into the stream; a
//! teardown requested from a callback is deferred until it returns.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod characteristics;
pub mod crypto;
pub mod error;
pub mod platform;
pub mod stream;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

use std::time::Duration;

pub use error::{Error, Result};
pub use stream::{DataStreamDelegate, DataStreamId, DataStreamRequest, DataStreamServer, HapSession, StreamControl};

/// Data Stream version reported by the Version characteristic
pub const VERSION: &str = "1.0";

/// Size of the frame header (type + 24-bit length)
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a frame may declare
pub const MAX_PAYLOAD_BYTES: usize = (1 << 20) - 1;

/// Size of the Poly1305 tag trailing encrypted frames
pub const AUTH_TAG_LEN: usize = 16;

/// Largest payload of the first frame of a stream
pub const MAX_INITIAL_DATA_BYTES: usize = 128;

/// Time a controller has to complete setup and connect
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Time an accepted TCP connection has to deliver its first frame
pub const TCP_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Lowest TCP listener port allowed for Data Stream
pub const TCP_MINIMUM_PORT: u16 = 32768;

/// Default largest write the controller may issue over the HAP leg
pub const DEFAULT_MAX_CONTROLLER_TRANSPORT_MTU: u32 = 1024;

/// Response space kept free for TLV items around a HAP leg read payload
pub const HAP_READ_OVERHEAD_BYTES: usize = 32;

/// Response buffer cap for HAP leg reads over Thread
pub const THREAD_MAX_BUFFER_BYTES: usize = 1024;

/// Configuration for Data Stream transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStreamConfig {
    /// Number of stream slots (setup requests, connections and streams)
    pub max_streams: usize,
    /// Setup request lifetime
    pub setup_timeout: Duration,
    /// Unmatched TCP connection lifetime
    pub tcp_stream_timeout: Duration,
    /// Largest controller write advertised for the HAP leg
    pub max_controller_transport_mtu: u32,
}

impl Default for DataStreamConfig {
    fn default() -> Self {
        Self {
            max_streams: 4,
            setup_timeout: SETUP_TIMEOUT,
            tcp_stream_timeout: TCP_STREAM_TIMEOUT,
            max_controller_transport_mtu: DEFAULT_MAX_CONTROLLER_TRANSPORT_MTU,
        }
    }
}

impl DataStreamConfig {
    /// Check the configuration for values the transports cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_streams == 0 {
            return Err(Error::config("max_streams must be at least 1"));
        }
        if self.setup_timeout.is_zero() || self.tcp_stream_timeout.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.max_controller_transport_mtu as usize <= FRAME_HEADER_LEN {
            return Err(Error::config("max_controller_transport_mtu too small"));
        }
        Ok(())
    }
}
