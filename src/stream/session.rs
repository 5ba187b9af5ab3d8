//! HAP session references and stream identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::crypto::KEY_SIZE;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Transport the HAP session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Ip,
    Ble,
    Thread,
}

/// A secured HAP session as seen by Data Stream.
///
/// Streams hold an `Arc` to the session that set them up and compare
/// sessions by identity.
pub struct HapSession {
    id: u64,
    transport_type: TransportType,
    pairing_id: i32,
    shared_secret: RwLock<Zeroizing<[u8; KEY_SIZE]>>,
}

impl HapSession {
    pub fn new(transport_type: TransportType, pairing_id: i32, shared_secret: [u8; KEY_SIZE]) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport_type,
            pairing_id,
            shared_secret: RwLock::new(Zeroizing::new(shared_secret)),
        }
    }

    /// Process-unique session number, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Pairing the controller authenticated with.
    pub fn pairing_id(&self) -> i32 {
        self.pairing_id
    }

    /// Copy of the current shared secret.
    pub fn shared_secret(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(**self.shared_secret.read())
    }

    /// Replace the shared secret, e.g. after a BLE session resume.
    pub fn set_shared_secret(&self, secret: [u8; KEY_SIZE]) {
        **self.shared_secret.write() = secret;
    }

    pub fn same(a: &Arc<HapSession>, b: &Arc<HapSession>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl fmt::Debug for HapSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HapSession")
            .field("id", &self.id)
            .field("transport_type", &self.transport_type)
            .field("pairing_id", &self.pairing_id)
            .finish_non_exhaustive()
    }
}

/// Stable handle of an accepted stream.
///
/// The generation changes every time the slot is released, so handles of
/// destroyed streams never address a newer stream in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataStreamId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl DataStreamId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for DataStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hds#{}.{}", self.index, self.generation)
    }
}

/// Context of the request that created a stream.
#[derive(Debug, Clone)]
pub struct DataStreamRequest {
    pub transport_type: TransportType,
    pub session: Arc<HapSession>,
    /// Index of the Data Stream Transport Management service
    pub service_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_identity() {
        let a = Arc::new(HapSession::new(TransportType::Ip, 1, [1u8; 32]));
        let b = Arc::new(HapSession::new(TransportType::Ip, 1, [1u8; 32]));
        assert!(HapSession::same(&a, &a.clone()));
        assert!(!HapSession::same(&a, &b));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_secret_replacement() {
        let session = HapSession::new(TransportType::Ble, 3, [1u8; 32]);
        assert_eq!(*session.shared_secret(), [1u8; 32]);
        session.set_shared_secret([2u8; 32]);
        assert_eq!(*session.shared_secret(), [2u8; 32]);
        assert!(!format!("{:?}", session).contains("shared_secret"));
    }

    #[test]
    fn test_stream_id_display() {
        assert_eq!(DataStreamId::new(2, 5).to_string(), "hds#2.5");
    }
}
