//! Data Stream over a dedicated TCP connection.
//!
//! Setup requests and incoming connections arrive on unrelated channels. A
//! connection is matched to a request by trial-decrypting its first frame
//! with the controller-to-accessory key of every registered request; the
//! request whose key authenticates the frame is swapped into the
//! connection's slot.
//!
//! Unmatched requests and connections live for a bounded time. A single
//! timer is re-armed to the smallest remaining TTL, and the listener is
//! only open while a request is outstanding.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::crypto::{Aead, AeadKey, Nonce, SecureRandom, StreamKeys, StreamingAead, SALT_SIZE};
use crate::error::{Error, Result};
use crate::platform::{
    StreamInterests, StreamPriority, TcpStreamEvent, TcpStreamHandle, TcpStreamManager, TimerId, TimerService,
};
use crate::stream::{
    with_control, ControlRequests, DataStreamDelegate, DataStreamId, DataStreamRequest, HapSession, StreamControl,
    TransportType,
};
use crate::transport::frame::{read_u24, FrameHeader, FrameType};
use crate::transport::transmission::{Crypt, IoStep, Sink, Source, SCRATCH_LEN};
use crate::transport::{
    AccessorySetupParams, ChunkBuffer, ControllerSetupParams, DataStreamTransport, Transmission, TransmissionState,
    TransportKind,
};
use crate::{DataStreamConfig, AUTH_TAG_LEN, FRAME_HEADER_LEN, MAX_INITIAL_DATA_BYTES, MAX_PAYLOAD_BYTES, TCP_MINIMUM_PORT};

/// Salt until setup completes, key afterwards.
#[derive(Default)]
enum DirectionSecret {
    #[default]
    None,
    Salt([u8; SALT_SIZE]),
    Key(AeadKey),
}

impl DirectionSecret {
    fn salt(&self) -> Option<&[u8; SALT_SIZE]> {
        match self {
            DirectionSecret::Salt(salt) => Some(salt),
            _ => None,
        }
    }

    fn key(&self) -> Option<&AeadKey> {
        match self {
            DirectionSecret::Key(key) => Some(key),
            _ => None,
        }
    }
}

/// One direction of a stream.
struct Direction {
    tx: Transmission,
    nonce: Nonce,
    secret: DirectionSecret,
}

impl Default for Direction {
    fn default() -> Self {
        Self {
            tx: Transmission::default(),
            nonce: Nonce::new(0),
            secret: DirectionSecret::None,
        }
    }
}

impl Direction {
    fn reset_transmission(&mut self) {
        self.tx.reset();
        self.nonce = Nonce::new(0);
    }

    /// Wants readiness unless idle or waiting for the delegate's next chunk.
    fn wants_io(&self) -> bool {
        let tx = &self.tx;
        tx.state != TransmissionState::Idle
            && !(tx.state == TransmissionState::Data && tx.num_progress_bytes == tx.num_data_bytes && !tx.has_handler())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Incoming,
    Outgoing,
}

/// A setup request, a connection, or both once matched.
#[derive(Default)]
struct TcpSlot {
    generation: u32,

    session: Option<Arc<HapSession>>,
    service_index: usize,
    setup_ttl: Duration,
    setup_requested: bool,

    outgoing: Direction,
    incoming: Direction,
    /// Decrypted payload of the first frame, handed out before any socket read
    initial_frame: Vec<u8>,

    tcp_stream: Option<TcpStreamHandle>,
    tcp_stream_ttl: Duration,
    priority: StreamPriority,

    is_matchmaking_complete: bool,
    pending_destroy: bool,
    is_handling_event: bool,
}

impl TcpSlot {
    /// Setup begun but not yet completed.
    fn is_setup_pending(&self) -> bool {
        !self.is_matchmaking_complete && self.session.is_some() && !self.setup_requested
    }

    fn reset_setup(&mut self) {
        self.outgoing.secret = DirectionSecret::None;
        self.incoming.secret = DirectionSecret::None;
        self.session = None;
        self.service_index = 0;
        self.setup_ttl = Duration::ZERO;
        self.setup_requested = false;
    }

    fn disconnect(&mut self) {
        self.outgoing.reset_transmission();
        self.incoming.reset_transmission();
        self.initial_frame.clear();
        self.tcp_stream = None;
        self.tcp_stream_ttl = Duration::ZERO;
        self.priority = StreamPriority::default();
        self.pending_destroy = false;
    }

    fn release(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self::default();
        self.generation = generation;
    }

    fn request(&self) -> Option<DataStreamRequest> {
        self.session.as_ref().map(|session| DataStreamRequest {
            transport_type: TransportType::Ip,
            session: session.clone(),
            service_index: self.service_index,
        })
    }

    fn interests(&self) -> StreamInterests {
        if self.pending_destroy {
            return StreamInterests::NONE;
        }
        StreamInterests {
            readable: self.incoming.wants_io(),
            writable: self.outgoing.wants_io(),
        }
    }
}

fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b);
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// TCP transport leg.
pub struct TcpTransport {
    slots: Vec<TcpSlot>,
    manager: Box<dyn TcpStreamManager>,
    timer: Box<dyn TimerService>,
    delegate: Box<dyn DataStreamDelegate>,
    matchmaking_timer: Option<TimerId>,
    reference_time: Instant,
    setup_timeout: Duration,
    tcp_stream_timeout: Duration,
}

impl TcpTransport {
    /// Create a TCP leg with `config.max_streams` slots.
    pub fn new(
        config: &DataStreamConfig,
        manager: Box<dyn TcpStreamManager>,
        timer: Box<dyn TimerService>,
        delegate: Box<dyn DataStreamDelegate>,
    ) -> Self {
        let reference_time = timer.now();
        Self {
            slots: (0..config.max_streams).map(|_| TcpSlot::default()).collect(),
            manager,
            timer,
            delegate,
            matchmaking_timer: None,
            reference_time,
            setup_timeout: config.setup_timeout,
            tcp_stream_timeout: config.tcp_stream_timeout,
        }
    }

    pub fn is_listener_open(&self) -> bool {
        self.manager.is_listener_open()
    }

    pub fn listener_port(&self) -> Option<u16> {
        self.manager.listener_port()
    }

    /// Accept a connection waiting on the listener.
    pub fn handle_pending_connection(&mut self) {
        let handle = match self.manager.accept() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    "Failed to accept TCP connection for HomeKit Data Stream (listener port {:?}): {}",
                    self.manager.listener_port(),
                    e
                );
                return;
            }
        };
        tracing::info!("TCP stream {} connected.", handle);

        self.update_matchmaking_state();

        let Some(index) = self.slots.iter().position(|slot| slot.tcp_stream.is_none()) else {
            tracing::error!(
                "No space to allocate TCP stream ({} max). Increase max_streams.",
                self.slots.len()
            );
            self.manager.close(handle);
            return;
        };

        let slot = &mut self.slots[index];
        debug_assert!(!slot.is_matchmaking_complete);
        debug_assert!(slot.incoming.tx.is_reset() && slot.outgoing.tx.is_reset());
        slot.tcp_stream_ttl = self.tcp_stream_timeout;
        slot.tcp_stream = Some(handle);
        tracing::info!("[{}] TCP stream allocated.", index);

        self.update_matchmaking_state();
        if self.slots[index].tcp_stream.is_some() {
            self.begin_receiving(index);
        }
    }

    /// Readiness reported for an accepted connection.
    pub fn handle_stream_event(&mut self, handle: TcpStreamHandle, event: TcpStreamEvent) {
        let Some(index) = self.slots.iter().position(|slot| slot.tcp_stream == Some(handle)) else {
            tracing::debug!("Ignoring event for unknown TCP stream {}.", handle);
            return;
        };

        let slot = &mut self.slots[index];
        assert!(!slot.is_handling_event, "nested event for TCP stream {}", handle);
        slot.is_handling_event = true;

        if event.writable && !slot.pending_destroy && slot.is_matchmaking_complete {
            self.continue_sending(index);
        }
        if event.readable && !self.slots[index].pending_destroy {
            self.continue_receiving(index);
        }

        self.slots[index].is_handling_event = false;
        if self.slots[index].pending_destroy {
            self.invalidate_slot(index);
        } else {
            self.update_interests(index);
        }
    }

    fn resolve(&self, id: DataStreamId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        (slot.generation == id.generation && slot.is_matchmaking_complete && slot.tcp_stream.is_some())
            .then_some(id.index)
    }

    fn resolve_live(&self, id: DataStreamId) -> Option<usize> {
        self.resolve(id).filter(|&index| !self.slots[index].pending_destroy)
    }

    /// Expire TTLs, open or close the listener and re-arm the timer.
    fn update_matchmaking_state(&mut self) {
        if let Some(timer) = self.matchmaking_timer.take() {
            self.timer.deregister(timer);
        }

        let now = self.timer.now();
        let delta = now.saturating_duration_since(self.reference_time);
        self.reference_time = now;
        if delta >= Duration::from_millis(1) {
            tracing::debug!("Advancing HomeKit Data Stream reference time by {:?}.", delta);
        }

        let mut min_ttl: Option<Duration> = None;
        let mut needs_listener = false;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_matchmaking_complete || slot.session.is_none() {
                continue;
            }
            if slot.setup_ttl <= delta {
                tracing::warn!(
                    "[{}] Aborting pending HomeKit Data Stream setup request ({}).",
                    index,
                    if slot.setup_requested {
                        "no matching connection"
                    } else {
                        "setup not completed"
                    }
                );
                slot.reset_setup();
                continue;
            }
            slot.setup_ttl -= delta;
            min_ttl = Some(min_ttl.map_or(slot.setup_ttl, |ttl| ttl.min(slot.setup_ttl)));
            needs_listener = true;
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_matchmaking_complete {
                continue;
            }
            let Some(handle) = slot.tcp_stream else {
                continue;
            };
            if !needs_listener || slot.tcp_stream_ttl <= delta {
                tracing::warn!(
                    "[{}] Aborting pending TCP stream ({}).",
                    index,
                    if needs_listener {
                        "did not receive frame"
                    } else {
                        "no active setup requests"
                    }
                );
                self.manager.close(handle);
                slot.disconnect();
                continue;
            }
            slot.tcp_stream_ttl -= delta;
            min_ttl = Some(min_ttl.map_or(slot.tcp_stream_ttl, |ttl| ttl.min(slot.tcp_stream_ttl)));
        }

        let has_listener = self.manager.is_listener_open();
        if needs_listener && !has_listener {
            match self.manager.open_listener() {
                Ok(()) => tracing::info!(
                    "Started to listen for HomeKit Data Stream connections (port {:?}).",
                    self.manager.listener_port()
                ),
                Err(e) => tracing::error!("Failed to open HomeKit Data Stream listener: {}", e),
            }
        } else if !needs_listener && has_listener {
            tracing::info!(
                "Stopping to listen for HomeKit Data Stream connections (port {:?}).",
                self.manager.listener_port()
            );
            self.manager.close_listener();
        }

        if let Some(ttl) = min_ttl {
            match self.timer.register(now + ttl) {
                Ok(timer) => self.matchmaking_timer = Some(timer),
                Err(e) => tracing::error!("Not enough timers available (matchmaking timer): {}", e),
            }
        }
    }

    fn update_interests(&mut self, index: usize) {
        let slot = &self.slots[index];
        if let Some(handle) = slot.tcp_stream {
            let interests = slot.interests();
            self.manager.update_interests(handle, interests);
        }
    }

    fn set_pending_destroy(&mut self, index: usize) {
        self.slots[index].pending_destroy = true;
        self.update_interests(index);
    }

    fn begin_receiving(&mut self, index: usize) {
        let tx = &mut self.slots[index].incoming.tx;
        assert_eq!(tx.state, TransmissionState::Idle);
        tx.state = TransmissionState::PrepareFrame;
        self.update_interests(index);
    }

    /// Run `f` with the delegate and a control handle of slot `index`.
    fn with_stream<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn DataStreamDelegate, &mut StreamControl<'_>) -> R,
    ) -> Option<R> {
        let slot = &mut self.slots[index];
        let request = slot.request()?;
        let id = DataStreamId::new(index, slot.generation);
        let destroying = slot.pending_destroy;
        let delegate = self.delegate.as_mut();

        let (result, requests) = with_control(
            id,
            &request,
            &mut slot.incoming.tx,
            &mut slot.outgoing.tx,
            destroying,
            |stream| f(delegate, stream),
        );
        self.apply_requests(index, requests);
        Some(result)
    }

    fn apply_requests(&mut self, index: usize, requests: ControlRequests) {
        if requests.invalidate {
            self.slots[index].pending_destroy = true;
        }
        if requests.invalidate || requests.send || requests.receive {
            self.update_interests(index);
        }
        if requests.invalidate && !self.slots[index].is_handling_event {
            self.invalidate_slot(index);
        }
    }

    fn notify_completion(&mut self, index: usize, side: Side, result: Result<()>, is_complete: bool) {
        let slot = &mut self.slots[index];
        let tx = match side {
            Side::Incoming => &mut slot.incoming.tx,
            Side::Outgoing => &mut slot.outgoing.tx,
        };
        let Some((handler, completion)) = tx.take_completion(result, is_complete) else {
            return;
        };
        self.with_stream(index, move |_, stream| handler(stream, completion));
    }

    fn advance_nonce(&mut self, index: usize, side: Side) {
        let slot = &mut self.slots[index];
        let direction = match side {
            Side::Incoming => &mut slot.incoming,
            Side::Outgoing => &mut slot.outgoing,
        };
        if let Err(e) = direction.nonce.increment() {
            tracing::warn!("[{}] {}. Invalidating HomeKit Data Stream.", index, e);
            slot.pending_destroy = true;
        }
    }

    fn complete_outgoing(&mut self, index: usize, result: Result<()>) {
        self.advance_nonce(index, Side::Outgoing);
        self.notify_completion(index, Side::Outgoing, result, true);
    }

    fn complete_incoming(&mut self, index: usize, result: Result<()>) {
        tracing::debug!("[{}] Accessory <- Controller transmission complete.", index);
        self.advance_nonce(index, Side::Incoming);
        self.notify_completion(index, Side::Incoming, result, true);
        if !self.slots[index].pending_destroy {
            self.begin_receiving(index);
        }
    }

    /// Tear a slot's connection down, deferred while its events are handled.
    fn invalidate_slot(&mut self, index: usize) {
        let Some(handle) = self.slots[index].tcp_stream else {
            return;
        };

        self.set_pending_destroy(index);
        if self.slots[index].is_handling_event {
            tracing::debug!("[{}] TCP stream events are being handled. Delaying invalidation.", index);
            return;
        }

        if self.slots[index].is_matchmaking_complete {
            tracing::info!("[{}] Invalidating HomeKit Data Stream.", index);

            self.slots[index].is_handling_event = true;
            if self.slots[index].outgoing.tx.has_handler() {
                self.complete_outgoing(index, Err(Error::InvalidState));
            }
            if self.slots[index].incoming.tx.has_handler() {
                self.complete_incoming(index, Err(Error::InvalidState));
            }
            self.slots[index].is_handling_event = false;

            self.manager.close(handle);

            let slot = &mut self.slots[index];
            let request = slot.request();
            let id = DataStreamId::new(index, slot.generation);
            slot.release();

            if let Some(request) = request {
                self.delegate.handle_invalidate(&request, id);
            }
        } else {
            tracing::info!("[{}] Invalidating TCP stream.", index);
            self.manager.close(handle);
            self.slots[index].disconnect();
            self.update_matchmaking_state();
        }
    }

    /// Matched streams are invalidated; setup requests are dropped.
    fn invalidate_session_slot(&mut self, index: usize) {
        assert!(!self.slots[index].is_handling_event, "bulk invalidation from inside a callback");
        if self.slots[index].is_matchmaking_complete {
            self.invalidate_slot(index);
        } else {
            tracing::info!("[{}] Invalidating HomeKit Data Stream setup request.", index);
            self.slots[index].reset_setup();
            self.update_matchmaking_state();
        }
    }

    fn finish_io(&mut self, index: usize, step: IoStep, operation: &str) -> bool {
        match step {
            IoStep::Done => true,
            IoStep::WouldBlock => {
                self.update_interests(index);
                false
            }
            IoStep::Closed => {
                tracing::warn!("[{}] Peer has closed TCP stream. Invalidating HomeKit Data Stream.", index);
                self.set_pending_destroy(index);
                false
            }
            IoStep::Failed => {
                tracing::warn!("[{}] Failed to {} TCP stream. Invalidating HomeKit Data Stream.", index, operation);
                self.set_pending_destroy(index);
                false
            }
        }
    }

    fn receive_or_yield(&mut self, index: usize, sink: Sink, max: usize, crypt: Crypt) -> bool {
        let slot = &mut self.slots[index];
        let Some(handle) = slot.tcp_stream else {
            return false;
        };
        let manager = &mut self.manager;
        let step = slot.incoming.tx.fill(sink, max, crypt, |buf| manager.read(handle, buf));
        self.finish_io(index, step, "read from")
    }

    fn send_or_yield(&mut self, index: usize, source: Source, max: usize, offset: usize) -> bool {
        let slot = &mut self.slots[index];
        let Some(handle) = slot.tcp_stream else {
            return false;
        };
        let manager = &mut self.manager;
        let step = slot.outgoing.tx.drain(source, max, offset, |data| manager.write(handle, data));
        self.finish_io(index, step, "write to")
    }

    /// Trial-decrypt the first frame against every completed setup request.
    fn complete_matchmaking(&mut self, index: usize) -> bool {
        let slot = &self.slots[index];
        let ciphertext = slot.incoming.tx.buffer.as_slice().to_vec();
        let header = FrameHeader {
            frame_type: FrameType::Encrypted,
            length: ciphertext.len() as u32,
        }
        .to_bytes();
        let mut tag = [0u8; AUTH_TAG_LEN];
        tag.copy_from_slice(&slot.incoming.tx.scratch[..AUTH_TAG_LEN]);
        let nonce = slot.incoming.nonce;

        for other in 0..self.slots.len() {
            let candidate = &self.slots[other];
            if candidate.is_matchmaking_complete || !candidate.setup_requested || candidate.session.is_none() {
                continue;
            }
            let Some(key) = candidate.incoming.secret.key() else {
                continue;
            };

            let mut plaintext = ciphertext.clone();
            if Aead::new(key).decrypt_detached(&nonce, &header, &mut plaintext, &tag).is_err() {
                continue;
            }

            tracing::info!("[{}] TCP stream matched with HomeKit Data Stream setup request [{}].", index, other);
            if other != index {
                let (stream, setup) = pair_mut(&mut self.slots, index, other);
                mem::swap(&mut stream.outgoing.secret, &mut setup.outgoing.secret);
                mem::swap(&mut stream.incoming.secret, &mut setup.incoming.secret);
                mem::swap(&mut stream.session, &mut setup.session);
                mem::swap(&mut stream.service_index, &mut setup.service_index);
                mem::swap(&mut stream.setup_ttl, &mut setup.setup_ttl);
                mem::swap(&mut stream.setup_requested, &mut setup.setup_requested);
            }

            let slot = &mut self.slots[index];
            slot.initial_frame = plaintext;
            slot.incoming.tx.buffer = ChunkBuffer::None;
            slot.setup_ttl = Duration::ZERO;
            slot.tcp_stream_ttl = Duration::ZERO;
            slot.is_matchmaking_complete = true;
            return true;
        }

        false
    }

    fn continue_receiving(&mut self, index: usize) {
        loop {
            let slot = &mut self.slots[index];
            if slot.pending_destroy || slot.tcp_stream.is_none() {
                return;
            }
            let matched = slot.is_matchmaking_complete;
            let is_initial_frame = slot.incoming.nonce.counter() == 0;

            match slot.incoming.tx.state {
                TransmissionState::Idle => return,
                TransmissionState::DataEncrypted => panic!("receive transmission cannot be in DataEncrypted state"),
                TransmissionState::PrepareFrame => {
                    if matched {
                        if let Some(key) = slot.incoming.secret.key() {
                            slot.incoming.tx.aead = Some(StreamingAead::new(key, &slot.incoming.nonce));
                        }
                    }
                    slot.incoming.tx.state = TransmissionState::FrameHeader;
                }
                TransmissionState::FrameHeader => {
                    if !self.receive_or_yield(index, Sink::Scratch, FRAME_HEADER_LEN, Crypt::Authenticated) {
                        return;
                    }

                    let tx = &self.slots[index].incoming.tx;
                    let frame_type = tx.scratch[0];
                    let total = read_u24(&tx.scratch[1..FRAME_HEADER_LEN]) as usize;
                    if frame_type != FrameType::Encrypted as u8 {
                        tracing::warn!("[{}] Received frame with unexpected frame type: 0x{:02x}.", index, frame_type);
                        self.set_pending_destroy(index);
                        return;
                    }
                    if total > MAX_PAYLOAD_BYTES {
                        tracing::warn!("[{}] Received frame with unsupported length: {}.", index, total);
                        self.set_pending_destroy(index);
                        return;
                    }
                    if !matched && total > MAX_INITIAL_DATA_BYTES {
                        tracing::warn!("[{}] Received initial frame with unexpected length: {}.", index, total);
                        self.set_pending_destroy(index);
                        return;
                    }

                    let tx = &mut self.slots[index].incoming.tx;
                    tx.total_data_bytes = total;
                    tx.state = TransmissionState::DataReadyToAccept;
                }
                TransmissionState::DataReadyToAccept => {
                    slot.incoming.tx.state = TransmissionState::Data;
                    let total = slot.incoming.tx.total_data_bytes;
                    if matched {
                        tracing::debug!("[{}] Ready to accept data ({} bytes).", index, total);
                        self.with_stream(index, |delegate, stream| delegate.handle_data(stream, total));
                        if self.slots[index].pending_destroy {
                            return;
                        }
                    } else {
                        slot.incoming.tx.buffer = ChunkBuffer::Mutable(vec![0u8; total]);
                        slot.incoming.tx.num_data_bytes = total;
                    }
                }
                TransmissionState::Data => {
                    if matched && !slot.incoming.tx.has_handler() {
                        self.update_interests(index);
                        return;
                    }

                    let n = slot.incoming.tx.num_data_bytes;
                    if matched && is_initial_frame {
                        if let ChunkBuffer::Mutable(buf) = &mut slot.incoming.tx.buffer {
                            buf.copy_from_slice(&slot.initial_frame[..n]);
                        }
                        slot.initial_frame.drain(..n);
                    } else if !self.receive_or_yield(index, Sink::Chunk, n, Crypt::Encrypted) {
                        return;
                    }

                    let tx = &mut self.slots[index].incoming.tx;
                    tx.total_data_bytes -= n;
                    if tx.total_data_bytes > 0 {
                        debug_assert!(matched);
                        self.notify_completion(index, Side::Incoming, Ok(()), false);
                        if self.slots[index].pending_destroy {
                            return;
                        }
                    } else {
                        tx.state = TransmissionState::AuthTag;
                    }
                }
                TransmissionState::AuthTag => {
                    if matched {
                        // The first frame was authenticated during matchmaking.
                        if !is_initial_frame {
                            if !self.receive_or_yield(index, Sink::Scratch, AUTH_TAG_LEN, Crypt::None) {
                                return;
                            }
                            let tx = &mut self.slots[index].incoming.tx;
                            let mut tag = [0u8; AUTH_TAG_LEN];
                            tag.copy_from_slice(&tx.scratch[..AUTH_TAG_LEN]);
                            let verified = tx.aead.take().map_or(false, |aead| aead.verify(&tag).is_ok());
                            if !verified {
                                tracing::warn!("[{}] Failed to decrypt frame.", index);
                                self.set_pending_destroy(index);
                                return;
                            }
                        }

                        self.slots[index].incoming.tx.state = TransmissionState::Idle;
                        self.update_interests(index);
                        self.complete_incoming(index, Ok(()));
                        if self.slots[index].pending_destroy {
                            return;
                        }
                    } else {
                        if !self.receive_or_yield(index, Sink::Scratch, AUTH_TAG_LEN, Crypt::None) {
                            return;
                        }

                        tracing::info!("[{}] Received initial frame. Starting matchmaking.", index);
                        if !self.complete_matchmaking(index) {
                            tracing::warn!(
                                "[{}] No matching HomeKit Data Stream setup request found for TCP stream.",
                                index
                            );
                            self.set_pending_destroy(index);
                            return;
                        }

                        // Stops the listener once nothing is left to match.
                        self.update_matchmaking_state();

                        let slot = &mut self.slots[index];
                        slot.incoming.tx.total_data_bytes = slot.initial_frame.len();
                        slot.incoming.tx.num_data_bytes = 0;

                        self.with_stream(index, |delegate, stream| delegate.handle_accept(stream));
                        if self.slots[index].pending_destroy {
                            return;
                        }
                        self.slots[index].incoming.tx.state = TransmissionState::DataReadyToAccept;
                    }
                }
            }
        }
    }

    fn continue_sending(&mut self, index: usize) {
        loop {
            let slot = &mut self.slots[index];
            if slot.pending_destroy || slot.tcp_stream.is_none() {
                return;
            }
            let direction = &mut slot.outgoing;

            match direction.tx.state {
                TransmissionState::Idle => return,
                TransmissionState::DataReadyToAccept => {
                    panic!("send transmission cannot be in DataReadyToAccept state")
                }
                TransmissionState::PrepareFrame => {
                    let Some(key) = direction.secret.key() else {
                        tracing::warn!("[{}] No accessory-to-controller key.", index);
                        self.set_pending_destroy(index);
                        return;
                    };
                    let mut aead = StreamingAead::new(key, &direction.nonce);
                    let header = FrameHeader {
                        frame_type: FrameType::Encrypted,
                        length: direction.tx.total_data_bytes as u32,
                    }
                    .to_bytes();
                    aead.update_aad(&header);
                    direction.tx.scratch[..FRAME_HEADER_LEN].copy_from_slice(&header);
                    direction.tx.aead = Some(aead);
                    direction.tx.state = TransmissionState::FrameHeader;
                }
                TransmissionState::FrameHeader => {
                    if !self.send_or_yield(index, Source::Scratch, FRAME_HEADER_LEN, 0) {
                        return;
                    }
                    self.slots[index].outgoing.tx.state = TransmissionState::Data;

                    // Prepare is done; the delegate may start pushing chunks.
                    self.notify_completion(index, Side::Outgoing, Ok(()), false);
                    if self.slots[index].pending_destroy {
                        return;
                    }
                }
                TransmissionState::Data | TransmissionState::DataEncrypted => {
                    if !direction.tx.has_handler() {
                        self.update_interests(index);
                        return;
                    }

                    let n = direction.tx.num_data_bytes;
                    let tx = &mut direction.tx;
                    if matches!(tx.buffer, ChunkBuffer::Mutable(_)) {
                        if tx.state == TransmissionState::Data {
                            if let (ChunkBuffer::Mutable(buf), Some(aead)) = (&mut tx.buffer, tx.aead.as_mut()) {
                                aead.encrypt(buf);
                            }
                            tx.state = TransmissionState::DataEncrypted;
                        }
                        if !self.send_or_yield(index, Source::Chunk, n, 0) {
                            return;
                        }
                    } else {
                        // Immutable bytes are encrypted through the scratch area.
                        while self.slots[index].outgoing.tx.num_progress_bytes < n {
                            let tx = &mut self.slots[index].outgoing.tx;
                            let progress = tx.num_progress_bytes;
                            let offset = progress - progress % SCRATCH_LEN;
                            let chunk = (n - offset).min(SCRATCH_LEN);

                            if tx.state == TransmissionState::Data {
                                debug_assert_eq!(offset, progress);
                                let Transmission {
                                    buffer, scratch, aead, ..
                                } = &mut *tx;
                                scratch[..chunk].copy_from_slice(&buffer.as_slice()[offset..offset + chunk]);
                                if let Some(aead) = aead.as_mut() {
                                    aead.encrypt(&mut scratch[..chunk]);
                                }
                                tx.state = TransmissionState::DataEncrypted;
                            }

                            if !self.send_or_yield(index, Source::Scratch, chunk, offset) {
                                return;
                            }
                            let tx = &mut self.slots[index].outgoing.tx;
                            tx.state = TransmissionState::Data;
                            tx.num_progress_bytes += chunk;
                        }
                        self.slots[index].outgoing.tx.num_progress_bytes = 0;
                    }

                    let tx = &mut self.slots[index].outgoing.tx;
                    tx.total_data_bytes -= n;
                    tx.state = TransmissionState::Data;
                    if tx.total_data_bytes > 0 {
                        self.notify_completion(index, Side::Outgoing, Ok(()), false);
                        if self.slots[index].pending_destroy {
                            return;
                        }
                    } else {
                        let Some(aead) = tx.aead.take() else {
                            self.set_pending_destroy(index);
                            return;
                        };
                        let tag = aead.finalize();
                        tx.scratch[..AUTH_TAG_LEN].copy_from_slice(&tag);
                        tx.state = TransmissionState::AuthTag;
                    }
                }
                TransmissionState::AuthTag => {
                    if !self.send_or_yield(index, Source::Scratch, AUTH_TAG_LEN, 0) {
                        return;
                    }
                    self.slots[index].outgoing.tx.state = TransmissionState::Idle;
                    self.update_interests(index);
                    self.complete_outgoing(index, Ok(()));
                    if self.slots[index].pending_destroy {
                        return;
                    }
                }
            }
        }
    }
}

impl DataStreamTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn setup_begin(
        &mut self,
        service_index: usize,
        session: &Arc<HapSession>,
        params: &ControllerSetupParams,
    ) -> Result<()> {
        let Some(controller_key_salt) = params.controller_key_salt else {
            tracing::warn!("Setup failed: Controller Key Salt missing.");
            return Err(Error::invalid_data("controller key salt missing"));
        };

        self.update_matchmaking_state();
        assert!(
            !self.slots.iter().any(TcpSlot::is_setup_pending),
            "HomeKit Data Stream setup already in progress"
        );

        let Some(index) = self.slots.iter().position(|slot| slot.session.is_none()) else {
            tracing::error!(
                "No space to allocate HomeKit Data Stream setup request ({} max). Increase max_streams.",
                self.slots.len()
            );
            return Err(Error::OutOfResources);
        };

        let slot = &mut self.slots[index];
        debug_assert!(!slot.is_matchmaking_complete);
        slot.setup_ttl = self.setup_timeout;
        slot.session = Some(session.clone());
        slot.service_index = service_index;
        slot.incoming.secret = DirectionSecret::Salt(controller_key_salt);
        slot.outgoing.secret = DirectionSecret::Salt(SecureRandom::key_salt());
        tracing::info!("[{}] HomeKit Data Stream setup request allocated.", index);

        self.update_matchmaking_state();
        Ok(())
    }

    fn setup_cancel(&mut self) {
        let Some(index) = self.slots.iter().position(TcpSlot::is_setup_pending) else {
            return;
        };
        tracing::info!(
            "[{}] Canceling pending HomeKit Data Stream setup request (setup not completed).",
            index
        );
        self.slots[index].reset_setup();
        self.update_matchmaking_state();
    }

    fn setup_complete(&mut self) -> Result<AccessorySetupParams> {
        let Some(index) = self.slots.iter().position(TcpSlot::is_setup_pending) else {
            tracing::warn!("HomeKit Data Stream setup has not been prepared or has timed out.");
            return Err(Error::InvalidState);
        };
        let Some(listener_port) = self.manager.listener_port() else {
            tracing::error!("HomeKit Data Stream listener is not open.");
            return Err(Error::InvalidState);
        };
        assert!(
            listener_port >= TCP_MINIMUM_PORT,
            "HomeKit Data Stream TCP port must be >= {}, but is {}",
            TCP_MINIMUM_PORT,
            listener_port
        );

        let slot = &mut self.slots[index];
        let (Some(&controller_key_salt), Some(&accessory_key_salt), Some(session)) =
            (slot.incoming.secret.salt(), slot.outgoing.secret.salt(), slot.session.clone())
        else {
            return Err(Error::InvalidState);
        };

        let keys = StreamKeys::derive(&*session.shared_secret(), &controller_key_salt, &accessory_key_salt)?;
        slot.outgoing.secret = DirectionSecret::Key(keys.accessory_to_controller());
        slot.incoming.secret = DirectionSecret::Key(keys.controller_to_accessory());
        slot.setup_requested = true;
        tracing::info!("[{}] HomeKit Data Stream setup request registered.", index);

        Ok(AccessorySetupParams {
            listener_port: Some(listener_port),
            session_identifier: None,
            accessory_key_salt: Some(accessory_key_salt),
        })
    }

    fn request_context(&self, id: DataStreamId) -> Option<DataStreamRequest> {
        self.resolve(id).and_then(|index| self.slots[index].request())
    }

    fn invalidate(&mut self, id: DataStreamId) {
        if let Some(index) = self.resolve(id) {
            self.invalidate_slot(index);
        }
    }

    fn invalidate_all_for_pairing_id(&mut self, pairing_id: i32) {
        for index in 0..self.slots.len() {
            let matches = self.slots[index]
                .session
                .as_ref()
                .map_or(false, |session| session.pairing_id() == pairing_id);
            if matches {
                self.invalidate_session_slot(index);
            }
        }
    }

    fn invalidate_all_for_session(&mut self, session: Option<&Arc<HapSession>>) {
        for index in 0..self.slots.len() {
            let matches = match (&self.slots[index].session, session) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(own), Some(session)) => HapSession::same(own, session),
            };
            if matches {
                self.invalidate_session_slot(index);
            }
        }
    }

    fn receive_transmission(&mut self, id: DataStreamId) -> Option<&mut Transmission> {
        let index = self.resolve_live(id)?;
        Some(&mut self.slots[index].incoming.tx)
    }

    fn send_transmission(&mut self, id: DataStreamId) -> Option<&mut Transmission> {
        let index = self.resolve_live(id)?;
        Some(&mut self.slots[index].outgoing.tx)
    }

    fn do_receive(&mut self, id: DataStreamId) {
        let Some(index) = self.resolve(id) else {
            return;
        };
        self.update_interests(index);

        // The first frame is already in memory; nothing will wake the socket.
        let slot = &self.slots[index];
        if !slot.is_handling_event && slot.incoming.nonce.counter() == 0 {
            if let Some(handle) = slot.tcp_stream {
                self.handle_stream_event(
                    handle,
                    TcpStreamEvent {
                        readable: true,
                        writable: false,
                    },
                );
            }
        }
    }

    fn do_send(&mut self, id: DataStreamId) {
        if let Some(index) = self.resolve(id) {
            self.update_interests(index);
        }
    }

    fn set_minimum_priority(&mut self, id: DataStreamId, priority: StreamPriority) {
        let Some(index) = self.resolve(id) else {
            return;
        };
        let slot = &mut self.slots[index];
        if slot.priority >= priority {
            tracing::debug!(
                "[{}] Current priority {:?} is higher than or equal to requested {:?}.",
                index,
                slot.priority,
                priority
            );
            return;
        }
        slot.priority = priority;
        tracing::debug!("[{}] Set priority to {:?}.", index, priority);
        if let Some(handle) = slot.tcp_stream {
            self.manager.set_priority(handle, priority);
        }
    }

    fn handle_timer(&mut self, timer: TimerId) {
        if self.matchmaking_timer != Some(timer) {
            return;
        }
        tracing::debug!("HomeKit Data Stream matchmaking timer expired.");
        self.matchmaking_timer = None;
        self.update_matchmaking_state();
    }

    fn reset(&mut self) {
        if let Some(timer) = self.matchmaking_timer.take() {
            self.timer.deregister(timer);
        }
        for slot in &mut self.slots {
            if let Some(handle) = slot.tcp_stream {
                self.manager.close(handle);
            }
            slot.release();
        }
        if self.manager.is_listener_open() {
            self.manager.close_listener();
        }
        self.reference_time = self.timer.now();
    }

    fn as_tcp_mut(&mut self) -> Option<&mut TcpTransport> {
        Some(self)
    }
}
