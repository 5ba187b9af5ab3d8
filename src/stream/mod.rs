//! Data Stream dispatch.
//!
//! [`DataStreamServer`] owns the transport leg chosen at construction and
//! routes setup, invalidation and data operations to it. Stream ids that no
//! longer address a live stream are rejected with `InvalidState`; calling a
//! data operation in the wrong transmission state is a programming error and
//! panics.

mod delegate;
mod session;

pub use delegate::{DataStreamDelegate, StreamControl};
pub use session::{DataStreamId, DataStreamRequest, HapSession, TransportType};

pub(crate) use delegate::{with_control, ControlRequests};

use std::sync::Arc;

use bytes::Bytes;

use crate::characteristics::SetupStatus;
use crate::error::{Error, Result};
use crate::platform::{StreamPriority, TcpStreamEvent, TcpStreamHandle, TcpStreamManager, TimerId, TimerService};
use crate::transport::{
    AccessorySetupParams, CompletionHandler, ControllerSetupParams, DataStreamTransport, HapReadResponse,
    HapTransport, InterruptState, TcpTransport, TransportKind,
};
use crate::DataStreamConfig;

/// Setup Data Stream Transport write awaiting its read.
#[derive(Debug, Clone)]
pub(crate) struct SetupTransaction {
    pub session: Arc<HapSession>,
    pub status: SetupStatus,
}

/// HomeKit Data Stream server context.
pub struct DataStreamServer {
    transport: Option<Box<dyn DataStreamTransport>>,
    setup: Option<SetupTransaction>,
    max_controller_transport_mtu: u32,
}

impl DataStreamServer {
    /// Serve Data Streams over dedicated TCP connections.
    pub fn with_tcp(
        config: &DataStreamConfig,
        manager: Box<dyn TcpStreamManager>,
        timer: Box<dyn TimerService>,
        delegate: Box<dyn DataStreamDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = TcpTransport::new(config, manager, timer, delegate);
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Serve Data Streams tunneled through the HAP Transport characteristic.
    pub fn with_hap(
        config: &DataStreamConfig,
        timer: Box<dyn TimerService>,
        delegate: Box<dyn DataStreamDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = HapTransport::new(config, timer, delegate);
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Server without Data Stream support.
    pub fn disabled() -> Self {
        Self {
            transport: None,
            setup: None,
            max_controller_transport_mtu: DataStreamConfig::default().max_controller_transport_mtu,
        }
    }

    fn with_transport(config: &DataStreamConfig, transport: Box<dyn DataStreamTransport>) -> Self {
        tracing::info!("HomeKit Data Stream enabled ({} transport, {} streams).", transport.kind(), config.max_streams);
        Self {
            transport: Some(transport),
            setup: None,
            max_controller_transport_mtu: config.max_controller_transport_mtu,
        }
    }

    /// Zero all streams and the setup transaction before the server starts.
    pub fn prepare_start(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.reset();
        }
        self.setup = None;
    }

    /// Tear down all streams before the server stops.
    pub fn prepare_stop(&mut self) {
        if self.transport.is_some() {
            self.invalidate_all_for_session(None);
        }
    }

    pub fn stop(&mut self) {
        if self.transport.is_some() {
            self.invalidate_all_for_session(None);
        }
    }

    /// Leg serving sessions of `transport_type`.
    ///
    /// TCP is only offered to IP sessions; the HAP leg serves every session type.
    pub fn active_transport(&self, transport_type: TransportType) -> TransportKind {
        match (self.kind(), transport_type) {
            (TransportKind::Tcp, TransportType::Ip) => TransportKind::Tcp,
            (TransportKind::Hap, _) => TransportKind::Hap,
            _ => TransportKind::None,
        }
    }

    pub fn active_transport_for_session(&self, session: &HapSession) -> TransportKind {
        self.active_transport(session.transport_type())
    }

    /// Largest controller write advertised for the HAP leg.
    pub fn max_controller_transport_mtu(&self) -> u32 {
        self.max_controller_transport_mtu
    }

    fn kind(&self) -> TransportKind {
        self.transport.as_ref().map_or(TransportKind::None, |t| t.kind())
    }

    fn transport_mut(&mut self) -> Result<&mut (dyn DataStreamTransport + 'static)> {
        self.transport.as_deref_mut().ok_or(Error::InvalidState)
    }

    pub(crate) fn setup_transaction(&self) -> Option<&SetupTransaction> {
        self.setup.as_ref()
    }

    pub(crate) fn set_setup_transaction(&mut self, transaction: Option<SetupTransaction>) {
        self.setup = transaction;
    }

    pub(crate) fn set_setup_status(&mut self, status: SetupStatus) {
        if let Some(setup) = self.setup.as_mut() {
            setup.status = status;
        }
    }

    /// Register a setup request.
    ///
    /// # Errors
    ///
    /// * `InvalidState` - Data Stream is not enabled
    /// * `InvalidData` - setup parameters don't fit the transport
    /// * `OutOfResources` - all slots are in use
    pub fn setup_begin(
        &mut self,
        service_index: usize,
        session: &Arc<HapSession>,
        params: &ControllerSetupParams,
    ) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            tracing::error!("Illegal call to begin Data Stream (not active).");
            return Err(Error::InvalidState);
        };
        transport.setup_begin(service_index, session, params)
    }

    pub fn setup_cancel(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.setup_cancel();
        }
    }

    /// Complete the pending setup request.
    pub fn setup_complete(&mut self) -> Result<AccessorySetupParams> {
        let Some(transport) = self.transport.as_mut() else {
            tracing::error!("Illegal call to setup complete (not active).");
            return Err(Error::InvalidState);
        };
        transport.setup_complete()
    }

    pub fn request_context(&self, id: DataStreamId) -> Option<DataStreamRequest> {
        self.transport.as_ref()?.request_context(id)
    }

    pub fn invalidate(&mut self, id: DataStreamId) {
        if let Some(transport) = self.transport.as_mut() {
            transport.invalidate(id);
        }
    }

    /// Tear down everything belonging to a pairing, e.g. after it was removed.
    pub fn invalidate_all_for_pairing_id(&mut self, pairing_id: i32) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        if self
            .setup
            .as_ref()
            .map_or(false, |setup| setup.session.pairing_id() == pairing_id)
        {
            tracing::info!("Aborting incomplete HomeKit Data Stream setup (Invalidate HAP Pairing ID).");
            self.setup = None;
        }

        transport.invalidate_all_for_pairing_id(pairing_id);
    }

    /// Tear down everything belonging to `session`, or everything for `None`.
    pub fn invalidate_all_for_session(&mut self, session: Option<&Arc<HapSession>>) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        if let Some(setup) = &self.setup {
            if session.map_or(true, |session| HapSession::same(&setup.session, session)) {
                tracing::info!(
                    "Aborting incomplete HomeKit Data Stream setup ({}).",
                    if session.is_some() { "Invalidate HAP session" } else { "Invalidate All" }
                );
                self.setup = None;
            }
        }

        transport.invalidate_all_for_session(session);
    }

    /// Announce an outgoing frame of `total` bytes.
    ///
    /// `handler` runs once the header is out; it then supplies the payload
    /// with [`StreamControl::send_data`].
    ///
    /// # Panics
    ///
    /// If a frame is already being sent on the stream.
    pub fn prepare_data(&mut self, id: DataStreamId, total: usize, handler: CompletionHandler) -> Result<()> {
        let transport = self.transport_mut()?;
        let tx = transport.send_transmission(id).ok_or(Error::InvalidState)?;
        tx.prepare(total, handler);
        transport.do_send(id);
        Ok(())
    }

    pub fn send_data(&mut self, id: DataStreamId, bytes: Bytes, handler: CompletionHandler) -> Result<()> {
        let transport = self.transport_mut()?;
        let tx = transport.send_transmission(id).ok_or(Error::InvalidState)?;
        tx.submit_send(bytes, handler);
        transport.do_send(id);
        Ok(())
    }

    /// Send a chunk encrypted in place; the completion hands the buffer back.
    pub fn send_mutable_data(&mut self, id: DataStreamId, buf: Vec<u8>, handler: CompletionHandler) -> Result<()> {
        let transport = self.transport_mut()?;
        let tx = transport.send_transmission(id).ok_or(Error::InvalidState)?;
        tx.submit_send_mutable(buf, handler);
        transport.do_send(id);
        Ok(())
    }

    pub fn receive_data(&mut self, id: DataStreamId, buf: Vec<u8>, handler: CompletionHandler) -> Result<()> {
        let transport = self.transport_mut()?;
        let tx = transport.receive_transmission(id).ok_or(Error::InvalidState)?;
        tracing::debug!("[{}] Receiving data ({} bytes).", id, buf.len());
        tx.submit_receive(buf, handler);
        transport.do_receive(id);
        Ok(())
    }

    pub fn skip_data(&mut self, id: DataStreamId, n: usize, handler: CompletionHandler) -> Result<()> {
        let transport = self.transport_mut()?;
        let tx = transport.receive_transmission(id).ok_or(Error::InvalidState)?;
        tracing::debug!("[{}] Skipping data ({} bytes).", id, n);
        tx.submit_skip(n, handler);
        transport.do_receive(id);
        Ok(())
    }

    /// A BLE session resumed with the secret of an earlier session.
    pub fn prepare_session_resume(&mut self, resumed_secret: &[u8; 32], session: &Arc<HapSession>) {
        if let Some(transport) = self.transport.as_mut() {
            transport.prepare_session_resume(resumed_secret, session);
        }
    }

    pub fn set_minimum_priority(&mut self, id: DataStreamId, priority: StreamPriority) {
        if let Some(transport) = self.transport.as_mut() {
            transport.set_minimum_priority(id, priority);
        }
    }

    /// Deliver an expired timer.
    pub fn handle_timer(&mut self, timer: TimerId) {
        if let Some(transport) = self.transport.as_mut() {
            transport.handle_timer(timer);
        }
    }

    pub fn tcp_mut(&mut self) -> Option<&mut TcpTransport> {
        self.transport.as_mut()?.as_tcp_mut()
    }

    pub fn hap_mut(&mut self) -> Option<&mut HapTransport> {
        self.transport.as_mut()?.as_hap_mut()
    }

    /// Port of the TCP listener while a setup is outstanding.
    pub fn listener_port(&mut self) -> Option<u16> {
        self.tcp_mut()?.listener_port()
    }

    /// A connection is waiting on the TCP listener.
    pub fn handle_pending_connection(&mut self) {
        if let Some(tcp) = self.tcp_mut() {
            tcp.handle_pending_connection();
        }
    }

    /// Readiness of an accepted TCP connection.
    pub fn handle_stream_event(&mut self, handle: TcpStreamHandle, event: TcpStreamEvent) {
        if let Some(tcp) = self.tcp_mut() {
            tcp.handle_stream_event(handle, event);
        }
    }

    /// Write to the HAP Transport characteristic.
    pub fn hap_transport_write(
        &mut self,
        session: &Arc<HapSession>,
        session_identifier: u8,
        payload: &[u8],
        force_close: bool,
    ) -> Result<()> {
        let Some(hap) = self.hap_mut() else {
            tracing::warn!("HAP Transport Write while Data Stream over HAP is not active.");
            return Err(Error::InvalidState);
        };
        hap.handle_write(session, session_identifier, payload, force_close)
    }

    /// Read of the HAP Transport characteristic.
    pub fn hap_transport_read(&mut self, session: &Arc<HapSession>, capacity: usize) -> Result<HapReadResponse> {
        let Some(hap) = self.hap_mut() else {
            tracing::warn!("HAP Transport Read while Data Stream over HAP is not active.");
            return Err(Error::InvalidState);
        };
        hap.handle_read(session, capacity)
    }

    /// Read of the HAP Transport Interrupt characteristic.
    pub fn hap_interrupt_state(&mut self, capacity: usize) -> Result<InterruptState> {
        let Some(hap) = self.hap_mut() else {
            return Err(Error::InvalidState);
        };
        hap.interrupt_state(capacity)
    }

    /// Service indices whose HAP Transport Interrupt value changed since the last call.
    pub fn take_raised_interrupts(&mut self) -> Vec<usize> {
        self.hap_mut().map(HapTransport::take_raised_interrupts).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{MockTcpStreamManager, MockTimer, Recorded, RecordingDelegate};
    use crate::transport::encode_unencrypted;
    use parking_lot::Mutex;

    fn hap_server() -> (DataStreamServer, Arc<Mutex<Recorded>>) {
        let (delegate, log) = RecordingDelegate::new(256, false);
        let server =
            DataStreamServer::with_hap(&DataStreamConfig::default(), Box::new(MockTimer::new()), Box::new(delegate))
                .unwrap();
        (server, log)
    }

    fn session(transport_type: TransportType, pairing_id: i32) -> Arc<HapSession> {
        Arc::new(HapSession::new(transport_type, pairing_id, [3u8; 32]))
    }

    /// Accept a HAP stream and return its session identifier and id.
    fn accept(server: &mut DataStreamServer, log: &Arc<Mutex<Recorded>>, session: &Arc<HapSession>) -> (u8, DataStreamId) {
        server.setup_begin(0, session, &ControllerSetupParams::default()).unwrap();
        let sid = server.setup_complete().unwrap().session_identifier.unwrap();
        server
            .hap_transport_write(session, sid, &encode_unencrypted(b"open").unwrap(), false)
            .unwrap();
        server.hap_transport_read(session, 512).unwrap();
        let id = *log.lock().accepted.last().unwrap();
        (sid, id)
    }

    #[test]
    fn test_active_transport() {
        let (hap, _) = hap_server();
        assert_eq!(hap.active_transport(TransportType::Ip), TransportKind::Hap);
        assert_eq!(hap.active_transport(TransportType::Ble), TransportKind::Hap);
        assert_eq!(hap.active_transport(TransportType::Thread), TransportKind::Hap);

        let (delegate, _) = RecordingDelegate::new(1, false);
        let tcp = DataStreamServer::with_tcp(
            &DataStreamConfig::default(),
            Box::new(MockTcpStreamManager::new(40000)),
            Box::new(MockTimer::new()),
            Box::new(delegate),
        )
        .unwrap();
        assert_eq!(tcp.active_transport(TransportType::Ip), TransportKind::Tcp);
        assert_eq!(tcp.active_transport(TransportType::Ble), TransportKind::None);

        let disabled = DataStreamServer::disabled();
        assert_eq!(disabled.active_transport(TransportType::Ip), TransportKind::None);
    }

    #[test]
    fn test_disabled_server_rejects_setup() {
        let mut server = DataStreamServer::disabled();
        let session = session(TransportType::Ip, 1);
        assert!(matches!(
            server.setup_begin(0, &session, &ControllerSetupParams::default()),
            Err(Error::InvalidState)
        ));
        assert!(matches!(server.setup_complete(), Err(Error::InvalidState)));
        server.setup_cancel();
        server.invalidate_all_for_session(None);
        assert!(server.take_raised_interrupts().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (delegate, _) = RecordingDelegate::new(1, false);
        let config = DataStreamConfig {
            max_streams: 0,
            ..Default::default()
        };
        assert!(DataStreamServer::with_hap(&config, Box::new(MockTimer::new()), Box::new(delegate)).is_err());
    }

    #[test]
    fn test_prepare_data_raises_interrupt() {
        let (mut server, log) = hap_server();
        let session = session(TransportType::Ble, 1);
        let (sid, id) = accept(&mut server, &log, &session);

        let payload = Bytes::from_static(b"event");
        server
            .prepare_data(
                id,
                payload.len(),
                Box::new(move |stream, _| stream.send_data(payload, Box::new(|_, _| {}))),
            )
            .unwrap();
        assert_eq!(server.take_raised_interrupts(), vec![0]);
        assert_eq!(server.hap_interrupt_state(16).unwrap().request_to_send_identifiers, vec![sid]);

        server.hap_transport_write(&session, sid, &[], false).unwrap();
        let response = server.hap_transport_read(&session, 512).unwrap();
        assert_eq!(response.payload, encode_unencrypted(b"event").unwrap());
    }

    #[test]
    fn test_receive_data_from_outside_callback() {
        let (mut server, log) = hap_server();
        let session = session(TransportType::Ip, 1);
        let (sid, id) = accept(&mut server, &log, &session);

        // The delegate consumes the frame itself; data ops on a stale id fail.
        server
            .hap_transport_write(&session, sid, &encode_unencrypted(b"abc").unwrap(), false)
            .unwrap();
        assert_eq!(log.lock().frames.last().unwrap(), b"abc");

        server.invalidate(id);
        assert_eq!(log.lock().invalidated, vec![id]);
        assert!(matches!(
            server.receive_data(id, vec![0u8; 1], Box::new(|_, _| {})),
            Err(Error::InvalidState)
        ));
        assert!(matches!(
            server.prepare_data(id, 1, Box::new(|_, _| {})),
            Err(Error::InvalidState)
        ));
        assert!(matches!(server.skip_data(id, 1, Box::new(|_, _| {})), Err(Error::InvalidState)));
        assert!(server.request_context(id).is_none());
    }

    #[test]
    #[should_panic(expected = "in flight")]
    fn test_double_prepare_panics() {
        let (mut server, log) = hap_server();
        let session = session(TransportType::Ip, 1);
        let (_, id) = accept(&mut server, &log, &session);

        server.prepare_data(id, 1, Box::new(|_, _| {})).unwrap();
        let _ = server.prepare_data(id, 1, Box::new(|_, _| {}));
    }

    #[test]
    fn test_invalidate_aborts_setup_transaction() {
        let (mut server, log) = hap_server();
        let a = session(TransportType::Ip, 1);
        let b = session(TransportType::Ip, 2);
        let (_, id) = accept(&mut server, &log, &a);

        server.set_setup_transaction(Some(SetupTransaction {
            session: b.clone(),
            status: SetupStatus::Success,
        }));
        server.invalidate_all_for_pairing_id(1);
        assert!(server.setup_transaction().is_some());
        assert_eq!(log.lock().invalidated, vec![id]);

        server.invalidate_all_for_session(Some(&b));
        assert!(server.setup_transaction().is_none());

        server.set_setup_transaction(Some(SetupTransaction {
            session: b,
            status: SetupStatus::Busy,
        }));
        server.stop();
        assert!(server.setup_transaction().is_none());
    }

    #[test]
    fn test_request_context() {
        let (mut server, log) = hap_server();
        let session = session(TransportType::Thread, 9);
        let (_, id) = accept(&mut server, &log, &session);

        let request = server.request_context(id).unwrap();
        assert_eq!(request.transport_type, TransportType::Thread);
        assert_eq!(request.service_index, 0);
        assert!(HapSession::same(&request.session, &session));

        server.prepare_start();
        assert!(server.request_context(id).is_none());
    }
}
