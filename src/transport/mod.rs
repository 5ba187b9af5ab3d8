//! HomeKit Data Stream transport legs.
//!
//! A Data Stream is either carried over its own TCP connection (frames are
//! encrypted with keys derived from the HAP session) or tunneled through
//! writes and reads of the Data Stream HAP Transport characteristic (frames
//! are plaintext, the HAP session already protects them).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │          DataStreamServer (dispatch)           │
//! ├───────────────────────┬────────────────────────┤
//! │  TcpTransport         │  HapTransport          │
//! │  matchmaking, AEAD    │  write/read pairing,   │
//! │  listener supervisor  │  interrupts            │
//! ├───────────────────────┴────────────────────────┤
//! │  Transmission (one frame, one direction)       │
//! ├────────────────────────────────────────────────┤
//! │  Frame header codec                            │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one leg is installed per server; [`DataStreamTransport`] is the
//! interface the dispatch layer talks to.

mod frame;
mod hap;
mod tcp;
mod transmission;

pub use frame::{encode_unencrypted, read_u24, FrameHeader, FrameType};
pub use hap::{HapReadResponse, HapTransport, InterruptState};
pub use tcp::TcpTransport;
pub use transmission::{ChunkBuffer, Completion, CompletionHandler, Transmission, TransmissionState};

use std::fmt;
use std::sync::Arc;

use crate::crypto::SALT_SIZE;
use crate::error::Result;
use crate::platform::{StreamPriority, TimerId};
use crate::stream::{DataStreamId, DataStreamRequest, HapSession};

/// Transport a Data Stream is carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Data Stream not supported
    #[default]
    None,
    Tcp,
    Hap,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::None => write!(f, "none"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Hap => write!(f, "hap"),
        }
    }
}

/// Parameters the controller supplies when setting up a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerSetupParams {
    /// Required for TCP, forbidden for HAP
    pub controller_key_salt: Option<[u8; SALT_SIZE]>,
}

/// Parameters the accessory returns once setup completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessorySetupParams {
    /// TCP listener the controller connects to
    pub listener_port: Option<u16>,
    /// HAP session identifier, never 0
    pub session_identifier: Option<u8>,
    pub accessory_key_salt: Option<[u8; SALT_SIZE]>,
}

/// Operations every transport leg provides to the dispatch layer.
pub trait DataStreamTransport: Send {
    fn kind(&self) -> TransportKind;

    /// Register a setup request of `session` for service `service_index`.
    ///
    /// # Errors
    ///
    /// * `InvalidData` - setup parameters don't fit the transport
    /// * `OutOfResources` - all slots are in use
    fn setup_begin(
        &mut self,
        service_index: usize,
        session: &Arc<HapSession>,
        params: &ControllerSetupParams,
    ) -> Result<()>;

    /// Drop the setup request in progress, if any.
    fn setup_cancel(&mut self);

    /// Finish the setup request in progress.
    ///
    /// # Errors
    ///
    /// `InvalidState` when no setup is in progress, e.g. because it timed out.
    fn setup_complete(&mut self) -> Result<AccessorySetupParams>;

    /// Context of an accepted stream; `None` for stale ids.
    fn request_context(&self, id: DataStreamId) -> Option<DataStreamRequest>;

    /// Tear down a stream. Stale ids are ignored.
    fn invalidate(&mut self, id: DataStreamId);

    /// Tear down every stream and setup request of a pairing.
    fn invalidate_all_for_pairing_id(&mut self, pairing_id: i32);

    /// Tear down every stream and setup request of a session, or all of them.
    fn invalidate_all_for_session(&mut self, session: Option<&Arc<HapSession>>);

    /// Controller-to-accessory transmission of a live stream.
    fn receive_transmission(&mut self, id: DataStreamId) -> Option<&mut Transmission>;

    /// Accessory-to-controller transmission of a live stream.
    fn send_transmission(&mut self, id: DataStreamId) -> Option<&mut Transmission>;

    /// A receive chunk was submitted.
    fn do_receive(&mut self, id: DataStreamId);

    /// A frame was prepared or a send chunk submitted.
    fn do_send(&mut self, id: DataStreamId);

    /// A BLE session was resumed with the secret of an earlier one.
    fn prepare_session_resume(&mut self, _resumed_secret: &[u8; 32], _session: &Arc<HapSession>) {}

    fn set_minimum_priority(&mut self, _id: DataStreamId, _priority: StreamPriority) {}

    /// A timer registered by this leg fired.
    fn handle_timer(&mut self, timer: TimerId);

    /// Zero all slots.
    fn reset(&mut self);

    fn as_tcp_mut(&mut self) -> Option<&mut TcpTransport> {
        None
    }

    fn as_hap_mut(&mut self) -> Option<&mut HapTransport> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
        assert_eq!(TransportKind::Hap.to_string(), "hap");
        assert_eq!(TransportKind::default(), TransportKind::None);
    }
}
