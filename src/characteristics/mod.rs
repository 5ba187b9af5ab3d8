//! Characteristic handlers of the Data Stream Transport Management service.
//!
//! | Characteristic | Access | Handler |
//! |---|---|---|
//! | Supported Data Stream Transport Configuration | read | [`handle_supported_configuration_read`] |
//! | Setup Data Stream Transport | write, read | [`handle_setup_write`], [`handle_setup_read`] |
//! | Version | read | [`handle_version_read`] |
//! | Data Stream HAP Transport | write, read | [`handle_hap_transport_write`], [`handle_hap_transport_read`] |
//! | Data Stream HAP Transport Interrupt | read | [`handle_interrupt_read`] |
//!
//! Setup is a write followed by a read from the same session; the server
//! keeps the transaction in between.

pub mod tlv;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use self::tlv::{get_all, read_uint, TlvWriter};
use crate::crypto::SALT_SIZE;
use crate::error::{Error, Result};
use crate::stream::{DataStreamServer, HapSession, SetupTransaction, TransportType};
use crate::transport::{ControllerSetupParams, TransportKind};
use crate::{HAP_READ_OVERHEAD_BYTES, THREAD_MAX_BUFFER_BYTES, VERSION};

/// TLV types of the Setup Data Stream Transport write request.
pub mod setup_request {
    pub const SESSION_COMMAND_TYPE: u8 = 0x01;
    pub const TRANSPORT_TYPE: u8 = 0x02;
    pub const CONTROLLER_KEY_SALT: u8 = 0x03;
}

/// TLV types of the Setup Data Stream Transport read response.
pub mod setup_response {
    pub const STATUS: u8 = 0x01;
    pub const SESSION_PARAMETERS: u8 = 0x02;
    pub const ACCESSORY_KEY_SALT: u8 = 0x03;

    /// Inside `SESSION_PARAMETERS`
    pub const LISTENING_PORT: u8 = 0x01;
    pub const SESSION_IDENTIFIER: u8 = 0x02;
}

/// TLV types of the Supported Data Stream Transport Configuration value.
pub mod supported_configuration {
    pub const CONFIGURATION: u8 = 0x01;

    /// Inside `CONFIGURATION`
    pub const TRANSPORT_TYPE: u8 = 0x01;
    pub const MAX_CONTROLLER_TRANSPORT_MTU: u8 = 0x02;
}

/// TLV types of the Data Stream HAP Transport characteristic.
pub mod hap_transport {
    pub const PAYLOAD: u8 = 0x01;
    pub const SESSION_IDENTIFIER: u8 = 0x02;
    pub const FORCE_CLOSE: u8 = 0x03;
    pub const ACCESSORY_REQUEST_TO_SEND: u8 = 0x04;
}

/// TLV types of the Data Stream HAP Transport Interrupt value.
pub mod interrupt {
    pub const REQUEST_TO_SEND_IDENTIFIERS: u8 = 0x01;
    pub const SEQUENCE_NUMBER: u8 = 0x02;
}

const SESSION_COMMAND_START: u64 = 0;

/// Transport type values on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTransportType {
    Tcp = 0,
    Hap = 1,
}

impl TryFrom<u64> for WireTransportType {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(WireTransportType::Tcp),
            1 => Ok(WireTransportType::Hap),
            _ => Err(Error::invalid_data(format!("Transport Type invalid: {}", value))),
        }
    }
}

impl fmt::Display for WireTransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireTransportType::Tcp => write!(f, "HomeKit Data Stream over TCP"),
            WireTransportType::Hap => write!(f, "HomeKit Data Stream over HAP"),
        }
    }
}

/// Status reported by the Setup Data Stream Transport read.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    Success = 0,
    GenericError = 1,
    Busy = 2,
}

impl fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStatus::Success => write!(f, "Success"),
            SetupStatus::GenericError => write!(f, "Generic error"),
            SetupStatus::Busy => write!(f, "Busy"),
        }
    }
}

/// Read of Supported Data Stream Transport Configuration.
///
/// Empty when no transport serves sessions of `transport_type`.
pub fn handle_supported_configuration_read(server: &DataStreamServer, transport_type: TransportType) -> Result<Bytes> {
    let mut writer = TlvWriter::new();

    let (wire_type, mtu) = match server.active_transport(transport_type) {
        TransportKind::None => return Ok(writer.into_bytes()),
        TransportKind::Tcp => (WireTransportType::Tcp, None),
        TransportKind::Hap => (WireTransportType::Hap, Some(server.max_controller_transport_mtu())),
    };
    tracing::debug!("Transfer Transport Configuration: {}", wire_type);

    writer.append_nested(supported_configuration::CONFIGURATION, |config| {
        config.append(supported_configuration::TRANSPORT_TYPE, &[wire_type as u8])?;
        if let Some(mtu) = mtu {
            config.append(supported_configuration::MAX_CONTROLLER_TRANSPORT_MTU, &mtu.to_le_bytes())?;
        }
        Ok(())
    })?;
    Ok(writer.into_bytes())
}

fn parse_setup_write(request: &[u8]) -> Result<(WireTransportType, ControllerSetupParams)> {
    let [command, transport_type, salt] = get_all(
        request,
        [
            setup_request::SESSION_COMMAND_TYPE,
            setup_request::TRANSPORT_TYPE,
            setup_request::CONTROLLER_KEY_SALT,
        ],
    )?;

    let command = command.ok_or_else(|| Error::invalid_data("Session Command Type missing"))?;
    let command = read_uint(&command, 1)
        .ok_or_else(|| Error::invalid_data(format!("Session Command Type has invalid length ({})", command.len())))?;
    if command != SESSION_COMMAND_START {
        return Err(Error::invalid_data(format!("Session Command Type invalid: {}", command)));
    }

    let transport_type = transport_type.ok_or_else(|| Error::invalid_data("Transport Type missing"))?;
    let transport_type = read_uint(&transport_type, 1).ok_or_else(|| {
        Error::invalid_data(format!("Transport Type has invalid length ({})", transport_type.len()))
    })?;
    let transport_type = WireTransportType::try_from(transport_type)?;

    let controller_key_salt = match salt {
        None => None,
        Some(salt) => {
            let salt: [u8; SALT_SIZE] = salt.as_slice().try_into().map_err(|_| {
                Error::invalid_data(format!("Controller Key Salt has invalid length ({})", salt.len()))
            })?;
            Some(salt)
        }
    };

    Ok((transport_type, ControllerSetupParams { controller_key_salt }))
}

/// Abort a pending setup transaction and the leg's setup request.
fn invalidate_setup(server: &mut DataStreamServer) {
    server.setup_cancel();
    server.set_setup_transaction(None);
}

/// Write of Setup Data Stream Transport.
///
/// Transport mismatches and exhausted slots are reported through the status
/// of the following read, not as an error of the write.
///
/// # Errors
///
/// `InvalidData` for malformed requests or setup parameters the leg rejects.
pub fn handle_setup_write(
    server: &mut DataStreamServer,
    service_index: usize,
    session: &Arc<HapSession>,
    request: &[u8],
) -> Result<()> {
    let (transport_type, params) = parse_setup_write(request).map_err(|e| {
        tracing::warn!("Setup Data Stream Transport write: {}", e);
        e
    })?;

    if server.setup_transaction().is_some() {
        tracing::warn!("Aborting incomplete HomeKit Data Stream setup (Setup Data Stream write done, but read not done).");
        invalidate_setup(server);
    }
    server.set_setup_transaction(Some(SetupTransaction {
        session: session.clone(),
        status: SetupStatus::GenericError,
    }));

    let allowed = match server.active_transport_for_session(session) {
        TransportKind::None => {
            tracing::warn!(
                "Aborting HomeKit Data Stream setup: transport {} not allowed (none supported).",
                transport_type as u8
            );
            false
        }
        TransportKind::Tcp if transport_type != WireTransportType::Tcp => {
            tracing::warn!(
                "Aborting HomeKit Data Stream setup: transport {} not allowed (is not TCP).",
                transport_type as u8
            );
            false
        }
        TransportKind::Hap if transport_type != WireTransportType::Hap => {
            tracing::warn!(
                "Aborting HomeKit Data Stream setup: transport {} not allowed (is not HAP).",
                transport_type as u8
            );
            false
        }
        _ => true,
    };
    if !allowed {
        return Ok(());
    }

    match server.setup_begin(service_index, session, &params) {
        Ok(()) => {
            server.set_setup_status(SetupStatus::Success);
            Ok(())
        }
        Err(Error::OutOfResources) => {
            server.set_setup_status(SetupStatus::Busy);
            Ok(())
        }
        Err(e @ Error::InvalidData(_)) => {
            tracing::warn!("Aborting HomeKit Data Stream setup due to invalid setup parameters from controller.");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Read of Setup Data Stream Transport, completing the setup.
///
/// # Errors
///
/// `InvalidState` without a prior write from the same session.
pub fn handle_setup_read(server: &mut DataStreamServer, session: &Arc<HapSession>) -> Result<Bytes> {
    let Some(transaction) = server.setup_transaction() else {
        tracing::warn!("No prior write to Setup Data Stream Transport detected.");
        return Err(Error::InvalidState);
    };
    if !HapSession::same(&transaction.session, session) {
        tracing::warn!("Write to Setup Data Stream Transport came from different HAP session.");
        return Err(Error::InvalidState);
    }
    let mut status = transaction.status;

    let params = match server.setup_complete() {
        Ok(params) => Some(params),
        Err(e) => {
            // Setup may time out between the write and the read.
            tracing::warn!("HomeKit Data Stream setup failed (bad state): {}", e);
            if status == SetupStatus::Success {
                status = SetupStatus::GenericError;
            }
            None
        }
    };

    let result = write_setup_response(status, params.as_ref());
    invalidate_setup(server);
    result
}

fn write_setup_response(
    status: SetupStatus,
    params: Option<&crate::transport::AccessorySetupParams>,
) -> Result<Bytes> {
    let mut writer = TlvWriter::new();
    writer.append(setup_response::STATUS, &[status as u8])?;

    if let (SetupStatus::Success, Some(params)) = (status, params) {
        tracing::debug!("Status: {} - TCP Listening Port: {:?}", status, params.listener_port);
        writer.append_nested(setup_response::SESSION_PARAMETERS, |nested| {
            if let Some(port) = params.listener_port {
                nested.append(setup_response::LISTENING_PORT, &port.to_le_bytes())?;
            }
            if let Some(identifier) = params.session_identifier {
                nested.append(setup_response::SESSION_IDENTIFIER, &[identifier])?;
            }
            Ok(())
        })?;
        if let Some(salt) = &params.accessory_key_salt {
            writer.append(setup_response::ACCESSORY_KEY_SALT, salt)?;
        }
    }

    Ok(writer.into_bytes())
}

/// Read of the Version characteristic.
pub fn handle_version_read(max_value_bytes: usize) -> Result<&'static str> {
    // Room for the terminating NUL on the wire.
    if VERSION.len() + 1 > max_value_bytes {
        tracing::warn!(
            "Not enough space to store Version (needed: {}, available: {}).",
            VERSION.len() + 1,
            max_value_bytes
        );
        return Err(Error::OutOfResources);
    }
    Ok(VERSION)
}

/// Parsed Data Stream HAP Transport write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HapTransportWrite {
    pub session_identifier: u8,
    pub payload: Vec<u8>,
    pub force_close: bool,
}

impl HapTransportWrite {
    pub fn parse(request: &[u8]) -> Result<Self> {
        let [session_identifier, payload, force_close] = get_all(
            request,
            [
                hap_transport::SESSION_IDENTIFIER,
                hap_transport::PAYLOAD,
                hap_transport::FORCE_CLOSE,
            ],
        )?;

        let session_identifier = session_identifier.ok_or_else(|| Error::invalid_data("Session Identifier missing"))?;
        let session_identifier = read_uint(&session_identifier, 1).ok_or_else(|| {
            Error::invalid_data(format!("Session Identifier has invalid length ({})", session_identifier.len()))
        })? as u8;

        let force_close = match force_close.as_deref() {
            None => false,
            Some([0]) => false,
            Some([1]) => true,
            Some([value]) => {
                return Err(Error::invalid_data(format!("Force Close has unexpected bool value ({})", value)))
            }
            Some(value) => {
                return Err(Error::invalid_data(format!("Force Close has invalid length ({})", value.len())))
            }
        };

        Ok(Self {
            session_identifier,
            payload: payload.unwrap_or_default(),
            force_close,
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut writer = TlvWriter::new();
        writer.append(hap_transport::SESSION_IDENTIFIER, &[self.session_identifier])?;
        if !self.payload.is_empty() {
            writer.append(hap_transport::PAYLOAD, &self.payload)?;
        }
        if self.force_close {
            writer.append(hap_transport::FORCE_CLOSE, &[1])?;
        }
        Ok(writer.into_bytes())
    }
}

/// Write of Data Stream HAP Transport.
pub fn handle_hap_transport_write(server: &mut DataStreamServer, session: &Arc<HapSession>, request: &[u8]) -> Result<()> {
    let write = HapTransportWrite::parse(request).map_err(|e| {
        tracing::warn!("Data Stream HAP Transport write: {}", e);
        e
    })?;
    tracing::debug!("DataStream HAP Payload: {} bytes", write.payload.len());
    server.hap_transport_write(session, write.session_identifier, &write.payload, write.force_close)
}

/// Payload bytes that fit a read response of `max_response_bytes`.
fn hap_read_capacity(session: &HapSession, max_response_bytes: usize) -> Result<usize> {
    let mut budget = max_response_bytes;
    if session.transport_type() == TransportType::Thread {
        budget = budget.min(THREAD_MAX_BUFFER_BYTES);
    }
    if budget <= HAP_READ_OVERHEAD_BYTES {
        tracing::error!("HAP Transport read response too small ({} bytes).", max_response_bytes);
        return Err(Error::OutOfResources);
    }
    let budget = budget - HAP_READ_OVERHEAD_BYTES;
    // Leave room for the fragment headers of the payload item.
    Ok(budget * tlv::MAX_FRAGMENT_LEN / (tlv::MAX_FRAGMENT_LEN + 2))
}

/// Read of Data Stream HAP Transport.
pub fn handle_hap_transport_read(
    server: &mut DataStreamServer,
    session: &Arc<HapSession>,
    max_response_bytes: usize,
) -> Result<Bytes> {
    let capacity = hap_read_capacity(session, max_response_bytes)?;
    let response = server.hap_transport_read(session, capacity)?;

    let mut writer = TlvWriter::with_limit(max_response_bytes);
    if !response.empty_response {
        if !response.payload.is_empty() {
            writer.append(hap_transport::PAYLOAD, &response.payload)?;
        }
        writer.append(hap_transport::ACCESSORY_REQUEST_TO_SEND, &[u8::from(response.request_to_send)])?;
    }
    Ok(writer.into_bytes())
}

/// Read of Data Stream HAP Transport Interrupt.
pub fn handle_interrupt_read(server: &mut DataStreamServer, max_response_bytes: usize) -> Result<Bytes> {
    // Two item headers plus the sequence number.
    let capacity = max_response_bytes.saturating_sub(5);
    let state = server.hap_interrupt_state(capacity)?;

    let mut writer = TlvWriter::new();
    writer.append(interrupt::REQUEST_TO_SEND_IDENTIFIERS, &state.request_to_send_identifiers)?;
    writer.append(interrupt::SEQUENCE_NUMBER, &[state.sequence_number])?;
    Ok(writer.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecureRandom;
    use crate::platform::mock::{MockTcpStreamManager, MockTimer, RecordingDelegate};
    use crate::transport::encode_unencrypted;
    use crate::DataStreamConfig;

    fn hap_server(max_streams: usize) -> DataStreamServer {
        let (delegate, _) = RecordingDelegate::new(256, true);
        let config = DataStreamConfig {
            max_streams,
            ..Default::default()
        };
        DataStreamServer::with_hap(&config, Box::new(MockTimer::new()), Box::new(delegate)).unwrap()
    }

    fn tcp_server() -> DataStreamServer {
        let (delegate, _) = RecordingDelegate::new(256, true);
        DataStreamServer::with_tcp(
            &DataStreamConfig::default(),
            Box::new(MockTcpStreamManager::new(40000)),
            Box::new(MockTimer::new()),
            Box::new(delegate),
        )
        .unwrap()
    }

    fn session(transport_type: TransportType) -> Arc<HapSession> {
        Arc::new(HapSession::new(transport_type, 1, [5u8; 32]))
    }

    fn setup_request(transport_type: u8, salt: Option<[u8; 32]>) -> Bytes {
        let mut writer = TlvWriter::new();
        writer.append(setup_request::SESSION_COMMAND_TYPE, &[0]).unwrap();
        writer.append(setup_request::TRANSPORT_TYPE, &[transport_type]).unwrap();
        if let Some(salt) = salt {
            writer.append(setup_request::CONTROLLER_KEY_SALT, &salt).unwrap();
        }
        writer.into_bytes()
    }

    fn value(data: &[u8], tlv_type: u8) -> Option<Vec<u8>> {
        let [value] = get_all(data, [tlv_type]).unwrap();
        value
    }

    /// Run setup over the HAP leg and return the session identifier.
    fn setup_hap(server: &mut DataStreamServer, session: &Arc<HapSession>) -> u8 {
        handle_setup_write(server, 0, session, &setup_request(1, None)).unwrap();
        let response = handle_setup_read(server, session).unwrap();
        assert_eq!(value(&response, setup_response::STATUS), Some(vec![0]));
        let parameters = value(&response, setup_response::SESSION_PARAMETERS).unwrap();
        value(&parameters, setup_response::SESSION_IDENTIFIER).unwrap()[0]
    }

    #[test]
    fn test_tcp_setup() {
        let mut server = tcp_server();
        let session = session(TransportType::Ip);
        let salt: [u8; 32] = SecureRandom::bytes();

        handle_setup_write(&mut server, 0, &session, &setup_request(0, Some(salt))).unwrap();
        let response = handle_setup_read(&mut server, &session).unwrap();

        assert_eq!(value(&response, setup_response::STATUS), Some(vec![0]));
        let parameters = value(&response, setup_response::SESSION_PARAMETERS).unwrap();
        assert_eq!(
            value(&parameters, setup_response::LISTENING_PORT),
            Some(40000u16.to_le_bytes().to_vec())
        );
        assert_eq!(value(&parameters, setup_response::SESSION_IDENTIFIER), None);
        assert_eq!(value(&response, setup_response::ACCESSORY_KEY_SALT).unwrap().len(), 32);
        assert!(server.setup_transaction().is_none());
    }

    #[test]
    fn test_tcp_setup_without_salt_is_invalid() {
        let mut server = tcp_server();
        let session = session(TransportType::Ip);
        assert!(matches!(
            handle_setup_write(&mut server, 0, &session, &setup_request(0, None)),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_transport_mismatch_reports_generic_error() {
        let mut server = hap_server(4);
        let session = session(TransportType::Ble);

        handle_setup_write(&mut server, 0, &session, &setup_request(0, Some([1u8; 32]))).unwrap();
        let response = handle_setup_read(&mut server, &session).unwrap();
        assert_eq!(value(&response, setup_response::STATUS), Some(vec![1]));
        assert_eq!(value(&response, setup_response::SESSION_PARAMETERS), None);
    }

    #[test]
    fn test_disabled_reports_generic_error() {
        let mut server = DataStreamServer::disabled();
        let session = session(TransportType::Ip);
        handle_setup_write(&mut server, 0, &session, &setup_request(0, Some([1u8; 32]))).unwrap();
        let response = handle_setup_read(&mut server, &session).unwrap();
        assert_eq!(value(&response, setup_response::STATUS), Some(vec![1]));
    }

    #[test]
    fn test_out_of_slots_reports_busy() {
        let mut server = hap_server(1);
        let session = session(TransportType::Ip);
        setup_hap(&mut server, &session);

        handle_setup_write(&mut server, 0, &session, &setup_request(1, None)).unwrap();
        let response = handle_setup_read(&mut server, &session).unwrap();
        assert_eq!(value(&response, setup_response::STATUS), Some(vec![2]));
    }

    #[test]
    fn test_setup_read_requires_same_session() {
        let mut server = hap_server(4);
        let a = session(TransportType::Ip);
        let b = session(TransportType::Ip);

        assert!(matches!(handle_setup_read(&mut server, &a), Err(Error::InvalidState)));
        handle_setup_write(&mut server, 0, &a, &setup_request(1, None)).unwrap();
        assert!(matches!(handle_setup_read(&mut server, &b), Err(Error::InvalidState)));
        assert!(handle_setup_read(&mut server, &a).is_ok());
    }

    #[test]
    fn test_second_write_aborts_first() {
        let mut server = hap_server(4);
        let a = session(TransportType::Ip);
        let b = session(TransportType::Ip);

        handle_setup_write(&mut server, 0, &a, &setup_request(1, None)).unwrap();
        handle_setup_write(&mut server, 0, &b, &setup_request(1, None)).unwrap();
        assert!(matches!(handle_setup_read(&mut server, &a), Err(Error::InvalidState)));
        let response = handle_setup_read(&mut server, &b).unwrap();
        assert_eq!(value(&response, setup_response::STATUS), Some(vec![0]));
    }

    #[test]
    fn test_malformed_setup_write() {
        let mut server = hap_server(4);
        let session = session(TransportType::Ip);

        let mut writer = TlvWriter::new();
        writer.append(setup_request::TRANSPORT_TYPE, &[1]).unwrap();
        assert!(handle_setup_write(&mut server, 0, &session, &writer.into_bytes()).is_err());

        let mut writer = TlvWriter::new();
        writer.append(setup_request::SESSION_COMMAND_TYPE, &[1]).unwrap();
        writer.append(setup_request::TRANSPORT_TYPE, &[1]).unwrap();
        assert!(handle_setup_write(&mut server, 0, &session, &writer.into_bytes()).is_err());

        let mut writer = TlvWriter::new();
        writer.append(setup_request::SESSION_COMMAND_TYPE, &[0]).unwrap();
        writer.append(setup_request::TRANSPORT_TYPE, &[2]).unwrap();
        assert!(handle_setup_write(&mut server, 0, &session, &writer.into_bytes()).is_err());

        let mut writer = TlvWriter::new();
        writer.append(setup_request::SESSION_COMMAND_TYPE, &[0]).unwrap();
        writer.append(setup_request::TRANSPORT_TYPE, &[0]).unwrap();
        writer.append(setup_request::CONTROLLER_KEY_SALT, &[0u8; 16]).unwrap();
        assert!(handle_setup_write(&mut server, 0, &session, &writer.into_bytes()).is_err());

        assert!(server.setup_transaction().is_none());
    }

    #[test]
    fn test_supported_configuration() {
        let hap = hap_server(4);
        let data = handle_supported_configuration_read(&hap, TransportType::Ble).unwrap();
        let config = value(&data, supported_configuration::CONFIGURATION).unwrap();
        assert_eq!(value(&config, supported_configuration::TRANSPORT_TYPE), Some(vec![1]));
        assert_eq!(
            value(&config, supported_configuration::MAX_CONTROLLER_TRANSPORT_MTU),
            Some(1024u32.to_le_bytes().to_vec())
        );

        let tcp = tcp_server();
        let data = handle_supported_configuration_read(&tcp, TransportType::Ip).unwrap();
        let config = value(&data, supported_configuration::CONFIGURATION).unwrap();
        assert_eq!(value(&config, supported_configuration::TRANSPORT_TYPE), Some(vec![0]));
        assert_eq!(value(&config, supported_configuration::MAX_CONTROLLER_TRANSPORT_MTU), None);
        assert!(handle_supported_configuration_read(&tcp, TransportType::Ble).unwrap().is_empty());
    }

    #[test]
    fn test_version() {
        assert_eq!(handle_version_read(64).unwrap(), "1.0");
        assert!(matches!(handle_version_read(3), Err(Error::OutOfResources)));
    }

    #[test]
    fn test_hap_transport_echo_and_close() {
        let mut server = hap_server(4);
        let session = session(TransportType::Ip);
        let sid = setup_hap(&mut server, &session);

        let first = HapTransportWrite {
            session_identifier: sid,
            payload: encode_unencrypted(b"ping").unwrap().to_vec(),
            force_close: false,
        };
        handle_hap_transport_write(&mut server, &session, &first.encode().unwrap()).unwrap();

        // The recording delegate echoes every frame back.
        let response = handle_hap_transport_read(&mut server, &session, 1024).unwrap();
        assert_eq!(
            value(&response, hap_transport::PAYLOAD),
            Some(encode_unencrypted(b"ping").unwrap().to_vec())
        );
        assert_eq!(value(&response, hap_transport::ACCESSORY_REQUEST_TO_SEND), Some(vec![0]));

        let close = HapTransportWrite {
            session_identifier: sid,
            payload: Vec::new(),
            force_close: true,
        };
        handle_hap_transport_write(&mut server, &session, &close.encode().unwrap()).unwrap();
        let response = handle_hap_transport_read(&mut server, &session, 1024).unwrap();
        assert!(response.is_empty());

        assert!(matches!(
            handle_hap_transport_write(&mut server, &session, &first.encode().unwrap()),
            Err(Error::InvalidState)
        ));
    }

    #[test]
    fn test_hap_transport_read_capacity() {
        let ip = session(TransportType::Ip);
        let thread = session(TransportType::Thread);
        assert!(matches!(hap_read_capacity(&ip, 32), Err(Error::OutOfResources)));
        assert_eq!(hap_read_capacity(&ip, 32 + 257).unwrap(), 255);
        assert_eq!(
            hap_read_capacity(&thread, 4096).unwrap(),
            hap_read_capacity(&ip, THREAD_MAX_BUFFER_BYTES).unwrap()
        );
    }

    #[test]
    fn test_hap_transport_write_parse_errors() {
        assert!(HapTransportWrite::parse(&[hap_transport::PAYLOAD, 0x00]).is_err());
        assert!(HapTransportWrite::parse(&[hap_transport::SESSION_IDENTIFIER, 0x02, 0x01, 0x01]).is_err());
        assert!(HapTransportWrite::parse(&[
            hap_transport::SESSION_IDENTIFIER,
            0x01,
            0x01,
            hap_transport::FORCE_CLOSE,
            0x01,
            0x02
        ])
        .is_err());

        let write = HapTransportWrite::parse(&[hap_transport::SESSION_IDENTIFIER, 0x01, 0x07]).unwrap();
        assert_eq!(write.session_identifier, 7);
        assert!(write.payload.is_empty());
        assert!(!write.force_close);
    }

    #[test]
    fn test_interrupt_read() {
        let mut server = hap_server(4);
        let session = session(TransportType::Ip);
        let sid = setup_hap(&mut server, &session);

        let write = HapTransportWrite {
            session_identifier: sid,
            payload: encode_unencrypted(b"hello").unwrap().to_vec(),
            force_close: false,
        };
        handle_hap_transport_write(&mut server, &session, &write.encode().unwrap()).unwrap();
        // The echo waits for the read that follows the write.
        let data = handle_interrupt_read(&mut server, 64).unwrap();
        assert_eq!(value(&data, interrupt::REQUEST_TO_SEND_IDENTIFIERS), Some(vec![]));
        assert_eq!(value(&data, interrupt::SEQUENCE_NUMBER).map(|v| v.len()), Some(1));

        assert!(matches!(handle_interrupt_read(&mut tcp_server(), 64), Err(Error::InvalidState)));
    }
}
