//! Data Stream tunneled through HAP characteristic writes and reads.
//!
//! There is no socket. Every controller write to the HAP Transport
//! characteristic carries controller-to-accessory bytes and must be followed
//! by a read that drains whatever the accessory has queued. Frames are never
//! encrypted here since the HAP session already is.
//!
//! ```text
//! SetupBegun ─▶ WaitingForFirstFrame ─▶ ActiveIdle ◀──────────────┐
//!                                          │ write                │ read (drained)
//!                                          ▼                      │
//!                                ActiveHandlingWrite ─▶ ActiveWrittenPendingRead
//!                                                                 │ read (more queued)
//!                                                                 ▼
//!                                                     ActiveRequestedToSend
//! ```
//!
//! An accessory with data to send while idle raises an interrupt; the
//! controller then polls the interrupt characteristic and issues a write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::platform::{TimerId, TimerService};
use crate::stream::{
    with_control, ControlRequests, DataStreamDelegate, DataStreamId, DataStreamRequest, HapSession, StreamControl,
    TransportType,
};
use crate::transport::frame::{read_u24, FrameHeader, FrameType};
use crate::transport::transmission::{slice_reader, vec_writer, Crypt, IoStep, Sink, Source};
use crate::transport::{
    AccessorySetupParams, ControllerSetupParams, DataStreamTransport, Transmission, TransmissionState, TransportKind,
};
use crate::{DataStreamConfig, FRAME_HEADER_LEN, MAX_INITIAL_DATA_BYTES, MAX_PAYLOAD_BYTES};

/// Lifecycle of a HAP leg slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HapStreamState {
    #[default]
    Uninitialized,
    SetupBegun,
    WaitingForFirstFrame,
    ActiveIdle,
    ActiveHandlingWrite,
    ActiveWrittenPendingRead,
    ActiveRequestedToSend,
}

impl HapStreamState {
    /// Whether the delegate knows the stream.
    fn is_active(self) -> bool {
        matches!(
            self,
            HapStreamState::ActiveIdle
                | HapStreamState::ActiveHandlingWrite
                | HapStreamState::ActiveWrittenPendingRead
                | HapStreamState::ActiveRequestedToSend
        )
    }
}

/// Outcome of a HAP Transport read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HapReadResponse {
    /// Accessory-to-controller bytes
    pub payload: Vec<u8>,
    /// More bytes are queued; the controller should read again promptly
    pub request_to_send: bool,
    /// Answer to a force close: the response carries no items at all
    pub empty_response: bool,
}

/// Contents of the HAP Transport Interrupt characteristic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptState {
    /// Session identifiers of idle streams with data to send
    pub request_to_send_identifiers: Vec<u8>,
    pub sequence_number: u8,
}

#[derive(Default)]
struct HapSlot {
    generation: u32,
    state: HapStreamState,

    session: Option<Arc<HapSession>>,
    pairing_id: i32,
    service_index: usize,
    /// Copy of a BLE session's secret, to tell a resumed session apart
    session_secret: Option<Zeroizing<[u8; 32]>>,
    session_identifier: u8,
    setup_ttl: Duration,

    incoming: Transmission,
    outgoing: Transmission,

    pending_close: bool,
    pending_destroy: bool,
    is_handling_event: bool,
}

impl HapSlot {
    fn release(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self::default();
        self.generation = generation;
    }

    fn request(&self) -> Option<DataStreamRequest> {
        self.session.as_ref().map(|session| DataStreamRequest {
            transport_type: session.transport_type(),
            session: session.clone(),
            service_index: self.service_index,
        })
    }

    /// Whether `session` is the one this slot was set up from.
    fn belongs_to(&self, session: &Arc<HapSession>) -> bool {
        let Some(own) = &self.session else {
            return false;
        };
        if !HapSession::same(own, session) {
            return false;
        }
        if session.transport_type() == TransportType::Ble {
            let current = session.shared_secret();
            return self.session_secret.as_deref() == Some(&*current);
        }
        true
    }

    fn needs_to_send(&self) -> bool {
        self.outgoing.state != TransmissionState::Idle
    }

    fn needs_send_interrupt(&self) -> bool {
        self.state == HapStreamState::ActiveIdle && self.needs_to_send()
    }
}

/// HAP transport leg.
pub struct HapTransport {
    slots: Vec<HapSlot>,
    timer: Box<dyn TimerService>,
    delegate: Box<dyn DataStreamDelegate>,
    setup_timer: Option<TimerId>,
    reference_time: Instant,
    setup_timeout: Duration,
    last_session_identifier: u8,
    interrupt_sequence_number: u8,
    /// Service indices whose interrupt characteristic changed
    raised_interrupts: Vec<usize>,
}

impl HapTransport {
    pub fn new(config: &DataStreamConfig, timer: Box<dyn TimerService>, delegate: Box<dyn DataStreamDelegate>) -> Self {
        let reference_time = timer.now();
        Self {
            slots: (0..config.max_streams).map(|_| HapSlot::default()).collect(),
            timer,
            delegate,
            setup_timer: None,
            reference_time,
            setup_timeout: config.setup_timeout,
            last_session_identifier: 0,
            interrupt_sequence_number: 0,
            raised_interrupts: Vec::new(),
        }
    }

    /// Handle a write to the HAP Transport characteristic.
    ///
    /// Protocol violations by the controller destroy the stream; only an
    /// unknown identifier, a foreign session or an ordering violation is
    /// reported as `InvalidState`.
    pub fn handle_write(
        &mut self,
        session: &Arc<HapSession>,
        session_identifier: u8,
        payload: &[u8],
        force_close: bool,
    ) -> Result<()> {
        let Some(index) = self.find_by_identifier(session_identifier) else {
            tracing::warn!("HAP Transport Write: no stream with session identifier {}.", session_identifier);
            return Err(Error::InvalidState);
        };
        if !self.slots[index].belongs_to(session) {
            tracing::warn!(
                "[{}] HAP Transport Write: session identifier {} used from wrong HAP session.",
                index,
                session_identifier
            );
            return Err(Error::InvalidState);
        }

        let slot = &mut self.slots[index];
        if slot.pending_close {
            tracing::warn!("[{}] HAP Transport Write: stream is already closing.", index);
            return Err(Error::InvalidState);
        }
        if force_close {
            // The next read answers with an empty response and then tears down.
            tracing::info!("[{}] HAP Transport Write: controller requested close.", index);
            slot.pending_close = true;
            slot.state = HapStreamState::ActiveWrittenPendingRead;
            return Ok(());
        }

        assert!(!slot.is_handling_event, "nested HAP Transport Write");
        slot.is_handling_event = true;
        let result = self.handle_transport_write(index, payload);
        self.slots[index].is_handling_event = false;

        if self.slots[index].pending_destroy {
            self.invalidate_slot(index);
        }
        result
    }

    /// Handle a read of the HAP Transport characteristic.
    ///
    /// `capacity` is the number of payload bytes the response can carry.
    pub fn handle_read(&mut self, session: &Arc<HapSession>, capacity: usize) -> Result<HapReadResponse> {
        let pending_read = self.slots.iter().position(|slot| {
            slot.belongs_to(session) && slot.state == HapStreamState::ActiveWrittenPendingRead
        });
        let active = || {
            self.slots
                .iter()
                .position(|slot| slot.belongs_to(session) && slot.state.is_active())
        };
        let Some(index) = pending_read.or_else(active) else {
            tracing::warn!("HAP Transport Read: no stream is expecting a read on session {}.", session.id());
            return Err(Error::InvalidState);
        };

        let mut response = HapReadResponse::default();
        let result = if self.slots[index].pending_close {
            response.empty_response = true;
            self.slots[index].pending_destroy = true;
            Ok(())
        } else {
            let slot = &mut self.slots[index];
            assert!(!slot.is_handling_event, "nested HAP Transport Read");
            slot.is_handling_event = true;
            let result = self.handle_transport_read(index, capacity, &mut response);
            self.slots[index].is_handling_event = false;
            result
        };

        if self.slots[index].pending_destroy {
            self.invalidate_slot(index);
        }
        result.map(|()| response)
    }

    /// Snapshot of the interrupt characteristic.
    ///
    /// # Errors
    ///
    /// `OutOfResources` if more than `capacity` streams request to send.
    pub fn interrupt_state(&self, capacity: usize) -> Result<InterruptState> {
        let mut state = InterruptState {
            request_to_send_identifiers: Vec::new(),
            sequence_number: self.interrupt_sequence_number,
        };
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.needs_send_interrupt() {
                continue;
            }
            if state.request_to_send_identifiers.len() >= capacity {
                tracing::error!(
                    "[{}] Unable to write all request to send identifiers (capacity={}).",
                    index,
                    capacity
                );
                return Err(Error::OutOfResources);
            }
            state.request_to_send_identifiers.push(slot.session_identifier);
        }
        Ok(state)
    }

    /// Service indices whose interrupt characteristic should be notified.
    pub fn take_raised_interrupts(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.raised_interrupts)
    }

    fn find_by_identifier(&self, session_identifier: u8) -> Option<usize> {
        if session_identifier == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(|slot| slot.session.is_some() && slot.session_identifier == session_identifier)
    }

    fn setup_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.state == HapStreamState::SetupBegun)
    }

    fn resolve(&self, id: DataStreamId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        (slot.generation == id.generation && slot.state.is_active()).then_some(id.index)
    }

    fn resolve_live(&self, id: DataStreamId) -> Option<usize> {
        self.resolve(id).filter(|&index| !self.slots[index].pending_destroy)
    }

    /// Pick the next free identifier after the last one, skipping 0.
    fn pick_session_identifier(&mut self) -> u8 {
        let start = self.last_session_identifier;
        let mut candidate = start;
        loop {
            candidate = candidate.wrapping_add(1);
            if candidate != 0 && self.find_by_identifier(candidate).is_none() {
                self.last_session_identifier = candidate;
                return candidate;
            }
            assert_ne!(candidate, start, "no free HAP session identifier");
        }
    }

    fn update_setup_timer(&mut self) {
        if let Some(timer) = self.setup_timer.take() {
            self.timer.deregister(timer);
        }

        let now = self.timer.now();
        let delta = now.saturating_duration_since(self.reference_time);
        self.reference_time = now;
        if delta >= Duration::from_millis(1) {
            tracing::debug!("Advancing HomeKit Data Stream reference time by {:?}.", delta);
        }

        let mut min_ttl: Option<Duration> = None;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !matches!(slot.state, HapStreamState::SetupBegun | HapStreamState::WaitingForFirstFrame) {
                continue;
            }
            if slot.setup_ttl <= delta {
                tracing::warn!("[{}] Aborting pending HomeKit Data Stream setup request.", index);
                slot.release();
                continue;
            }
            slot.setup_ttl -= delta;
            min_ttl = Some(min_ttl.map_or(slot.setup_ttl, |ttl| ttl.min(slot.setup_ttl)));
        }

        if let Some(ttl) = min_ttl {
            match self.timer.register(now + ttl) {
                Ok(timer) => self.setup_timer = Some(timer),
                Err(e) => tracing::error!("Not enough timers available (HomeKit Data Stream setup timer): {}", e),
            }
        }
    }

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
            &mut slot.incoming,
            &mut slot.outgoing,
            destroying,
            |stream| f(delegate, stream),
        );
        self.apply_requests(index, requests);
        Some(result)
    }

    fn apply_requests(&mut self, index: usize, requests: ControlRequests) {
        if requests.send && !requests.invalidate {
            self.raise_interrupt_if_needed(index);
        }
        if requests.invalidate {
            self.slots[index].pending_destroy = true;
            if !self.slots[index].is_handling_event {
                self.invalidate_slot(index);
            }
        }
    }

    fn raise_interrupt_if_needed(&mut self, index: usize) {
        let slot = &self.slots[index];
        if !slot.needs_send_interrupt() {
            tracing::debug!(
                "[{}] No need to raise interrupt (state={:?}, send state={:?}).",
                index,
                slot.state,
                slot.outgoing.state
            );
            return;
        }
        self.interrupt_sequence_number = self.interrupt_sequence_number.wrapping_add(1);
        tracing::debug!(
            "[{}] Raising HAP transport interrupt (sequence number {}).",
            index,
            self.interrupt_sequence_number
        );
        self.raised_interrupts.push(slot.service_index);
    }

    fn notify_completion(&mut self, index: usize, incoming: bool, result: Result<()>, is_complete: bool) {
        let slot = &mut self.slots[index];
        let tx = if incoming { &mut slot.incoming } else { &mut slot.outgoing };
        let Some((handler, completion)) = tx.take_completion(result, is_complete) else {
            return;
        };
        self.with_stream(index, move |_, stream| handler(stream, completion));
    }

    fn invalidate_slot(&mut self, index: usize) {
        self.slots[index].pending_destroy = true;
        if self.slots[index].is_handling_event {
            tracing::debug!("[{}] Stream events are being handled. Delaying invalidation.", index);
            return;
        }

        match self.slots[index].state {
            HapStreamState::Uninitialized => {}
            HapStreamState::SetupBegun | HapStreamState::WaitingForFirstFrame => {
                tracing::info!("[{}] Invalidating HAP stream.", index);
                self.slots[index].release();
                self.update_setup_timer();
            }
            _ => {
                tracing::info!("[{}] Invalidating HomeKit Data Stream.", index);

                self.slots[index].is_handling_event = true;
                if self.slots[index].outgoing.has_handler() {
                    self.notify_completion(index, false, Err(Error::InvalidState), true);
                }
                if self.slots[index].incoming.has_handler() {
                    self.notify_completion(index, true, Err(Error::InvalidState), true);
                }
                self.slots[index].is_handling_event = false;

                let slot = &mut self.slots[index];
                let request = slot.request();
                let id = DataStreamId::new(index, slot.generation);
                slot.release();

                if let Some(request) = request {
                    self.delegate.handle_invalidate(&request, id);
                }
            }
        }
    }

    fn set_pending_destroy(&mut self, index: usize) {
        self.slots[index].pending_destroy = true;
    }

    fn handle_transport_write(&mut self, index: usize, payload: &[u8]) -> Result<()> {
        match self.slots[index].state {
            HapStreamState::Uninitialized => {
                tracing::warn!("[{}] Got HAP Transport Write for an uninitialized stream.", index);
                Err(Error::InvalidState)
            }
            HapStreamState::SetupBegun => {
                tracing::warn!("[{}] Got HAP Transport Write while still being set up. Closing stream.", index);
                self.set_pending_destroy(index);
                Err(Error::InvalidState)
            }
            HapStreamState::ActiveHandlingWrite => {
                tracing::warn!("[{}] Got HAP Transport Write while handling a write. Closing stream.", index);
                self.set_pending_destroy(index);
                Err(Error::InvalidState)
            }
            HapStreamState::ActiveWrittenPendingRead => {
                tracing::warn!("[{}] Got HAP Transport Write but was expecting a read. Closing stream.", index);
                self.set_pending_destroy(index);
                Err(Error::InvalidState)
            }
            HapStreamState::WaitingForFirstFrame => {
                if !self.accept_first_frame(index, payload) {
                    self.set_pending_destroy(index);
                    return Ok(());
                }

                let mut pending = payload;
                self.run_write_loop(index, &mut pending);
                self.check_consumed(index, pending);

                self.update_setup_timer();
                self.slots[index].state = HapStreamState::ActiveWrittenPendingRead;
                Ok(())
            }
            HapStreamState::ActiveIdle | HapStreamState::ActiveRequestedToSend => {
                if !payload.is_empty() {
                    self.slots[index].state = HapStreamState::ActiveHandlingWrite;
                    let mut pending = payload;
                    self.run_write_loop(index, &mut pending);
                    self.check_consumed(index, pending);
                }
                self.slots[index].state = HapStreamState::ActiveWrittenPendingRead;
                Ok(())
            }
        }
    }

    /// Written bytes cannot be kept for later; the delegate must take them all.
    fn check_consumed(&self, index: usize, pending: &[u8]) {
        if !self.slots[index].pending_destroy {
            assert!(
                pending.is_empty(),
                "delegate left {} written bytes unconsumed",
                pending.len()
            );
        }
    }

    /// Validate the first frame, which must arrive whole, and accept the stream.
    fn accept_first_frame(&mut self, index: usize, payload: &[u8]) -> bool {
        if payload.len() < FRAME_HEADER_LEN {
            tracing::warn!(
                "[{}] Received initial frame but header too short ({} bytes).",
                index,
                payload.len()
            );
            return false;
        }
        if payload[0] != FrameType::Unencrypted as u8 {
            tracing::warn!("[{}] Received initial frame with unexpected frame type: 0x{:02x}.", index, payload[0]);
            return false;
        }
        let total = read_u24(&payload[1..FRAME_HEADER_LEN]) as usize;
        if total > MAX_INITIAL_DATA_BYTES {
            tracing::warn!("[{}] Received initial frame with unexpected length: {}.", index, total);
            return false;
        }
        if payload.len() != FRAME_HEADER_LEN + total {
            tracing::warn!(
                "[{}] Received initial frame but has invalid total size (payload {} bytes; total frame {} bytes).",
                index,
                total,
                payload.len()
            );
            return false;
        }

        tracing::info!("[{}] Received initial frame.", index);
        let slot = &mut self.slots[index];
        slot.setup_ttl = Duration::ZERO;
        slot.state = HapStreamState::ActiveIdle;
        debug_assert!(!slot.incoming.has_handler());

        self.with_stream(index, |delegate, stream| delegate.handle_accept(stream));
        if self.slots[index].pending_destroy {
            return false;
        }

        self.slots[index].incoming.state = TransmissionState::PrepareFrame;
        true
    }

    fn run_write_loop(&mut self, index: usize, pending: &mut &[u8]) {
        while self.slots[index].incoming.state != TransmissionState::Idle {
            if !self.do_transport_write(index, pending) || self.slots[index].pending_destroy {
                break;
            }
        }
    }

    /// One step of the receive side. `false` means nothing more can happen
    /// until the next write.
    fn do_transport_write(&mut self, index: usize, pending: &mut &[u8]) -> bool {
        let tx = &mut self.slots[index].incoming;
        match tx.state {
            TransmissionState::Idle | TransmissionState::DataEncrypted | TransmissionState::AuthTag => {
                panic!("HAP Transport Write in receive state {:?}", tx.state)
            }
            TransmissionState::PrepareFrame => {
                tracing::debug!("[{}] HAP Transport Write: beginning next frame.", index);
                tx.state = TransmissionState::FrameHeader;
                true
            }
            TransmissionState::FrameHeader => {
                let step = tx.fill(Sink::Scratch, FRAME_HEADER_LEN, Crypt::None, slice_reader(pending));
                if !matches!(step, IoStep::Done) {
                    tracing::debug!("[{}] HAP Transport Write: frame header not yet ready.", index);
                    return false;
                }

                let frame_type = tx.scratch[0];
                if frame_type != FrameType::Unencrypted as u8 {
                    tracing::warn!(
                        "[{}] HAP Transport Write: received frame with unexpected frame type: 0x{:02x}.",
                        index,
                        frame_type
                    );
                    self.set_pending_destroy(index);
                    return false;
                }
                let total = read_u24(&tx.scratch[1..FRAME_HEADER_LEN]) as usize;
                if total > MAX_PAYLOAD_BYTES {
                    tracing::warn!("[{}] HAP Transport Write: received frame with unsupported length: {}.", index, total);
                    self.set_pending_destroy(index);
                    return false;
                }
                tx.total_data_bytes = total;
                tx.state = TransmissionState::DataReadyToAccept;
                true
            }
            TransmissionState::DataReadyToAccept => {
                tx.state = TransmissionState::Data;
                let total = tx.total_data_bytes;
                tracing::debug!("[{}] HAP Transport Write: ready to accept data ({} bytes).", index, total);
                self.with_stream(index, |delegate, stream| delegate.handle_data(stream, total));
                !self.slots[index].pending_destroy
            }
            TransmissionState::Data => {
                if !tx.has_handler() {
                    tracing::debug!("[{}] HAP Transport Write: no data from delegate yet.", index);
                    return false;
                }

                let n = tx.num_data_bytes;
                let step = tx.fill(Sink::Chunk, n, Crypt::None, slice_reader(pending));
                if !matches!(step, IoStep::Done) {
                    tracing::trace!(
                        "[{}] HAP Transport Write: partial write in progress ({} of {} bytes).",
                        index,
                        tx.num_progress_bytes,
                        n
                    );
                    return false;
                }

                tx.total_data_bytes -= n;
                if tx.total_data_bytes > 0 {
                    self.notify_completion(index, true, Ok(()), false);
                    return true;
                }

                tx.state = TransmissionState::Idle;
                tracing::debug!("[{}] HAP Transport Write: frame completed.", index);
                self.notify_completion(index, true, Ok(()), true);

                let tx = &mut self.slots[index].incoming;
                assert_eq!(tx.state, TransmissionState::Idle);
                tx.state = TransmissionState::PrepareFrame;
                true
            }
        }
    }

    fn handle_transport_read(&mut self, index: usize, capacity: usize, response: &mut HapReadResponse) -> Result<()> {
        let state = self.slots[index].state;
        match state {
            HapStreamState::ActiveWrittenPendingRead => {
                self.run_read_loop(index, &mut response.payload, capacity);

                let slot = &mut self.slots[index];
                if slot.needs_to_send() {
                    response.request_to_send = true;
                    slot.state = HapStreamState::ActiveRequestedToSend;
                } else {
                    slot.state = HapStreamState::ActiveIdle;
                }
                Ok(())
            }
            HapStreamState::Uninitialized => Err(Error::InvalidState),
            _ => {
                tracing::warn!(
                    "[{}] Got HAP Transport Read without a preceding write (state {:?}). Closing stream.",
                    index,
                    state
                );
                self.set_pending_destroy(index);
                Err(Error::InvalidState)
            }
        }
    }

    fn run_read_loop(&mut self, index: usize, out: &mut Vec<u8>, capacity: usize) {
        while self.slots[index].outgoing.state != TransmissionState::Idle {
            if !self.do_transport_read(index, out, capacity) || self.slots[index].pending_destroy {
                break;
            }
        }
    }

    /// One step of the send side. `false` means the response is full or
    /// the delegate has not supplied data.
    fn do_transport_read(&mut self, index: usize, out: &mut Vec<u8>, capacity: usize) -> bool {
        let tx = &mut self.slots[index].outgoing;
        match tx.state {
            TransmissionState::Idle
            | TransmissionState::DataReadyToAccept
            | TransmissionState::DataEncrypted
            | TransmissionState::AuthTag => {
                panic!("HAP Transport Read in send state {:?}", tx.state)
            }
            TransmissionState::PrepareFrame => {
                tracing::debug!(
                    "[{}] HAP Transport Read: beginning next frame ({} bytes).",
                    index,
                    tx.total_data_bytes
                );
                let header = FrameHeader {
                    frame_type: FrameType::Unencrypted,
                    length: tx.total_data_bytes as u32,
                }
                .to_bytes();
                tx.scratch[..FRAME_HEADER_LEN].copy_from_slice(&header);
                tx.state = TransmissionState::FrameHeader;
                true
            }
            TransmissionState::FrameHeader => {
                let step = tx.drain(Source::Scratch, FRAME_HEADER_LEN, 0, vec_writer(out, capacity));
                if !matches!(step, IoStep::Done) {
                    tracing::debug!("[{}] HAP Transport Read: frame header not yet written.", index);
                    return false;
                }
                tx.state = TransmissionState::Data;

                self.notify_completion(index, false, Ok(()), false);
                !self.slots[index].pending_destroy
            }
            TransmissionState::Data => {
                if !tx.has_handler() {
                    tracing::debug!("[{}] HAP Transport Read: no data submitted by delegate yet.", index);
                    return false;
                }
                if out.len() >= capacity {
                    tracing::debug!("[{}] HAP Transport Read: response full; waiting for next read.", index);
                    return false;
                }

                let n = tx.num_data_bytes;
                let step = tx.drain(Source::Chunk, n, 0, vec_writer(out, capacity));
                if !matches!(step, IoStep::Done) {
                    tracing::trace!(
                        "[{}] HAP Transport Read: partial read in progress ({} of {} bytes).",
                        index,
                        tx.num_progress_bytes,
                        n
                    );
                    return false;
                }

                tx.total_data_bytes -= n;
                if tx.total_data_bytes > 0 {
                    self.notify_completion(index, false, Ok(()), false);
                    return true;
                }

                tx.state = TransmissionState::Idle;
                tracing::debug!("[{}] HAP Transport Read: frame completed.", index);
                self.notify_completion(index, false, Ok(()), true);
                true
            }
        }
    }
}

impl DataStreamTransport for HapTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Hap
    }

    fn setup_begin(
        &mut self,
        service_index: usize,
        session: &Arc<HapSession>,
        params: &ControllerSetupParams,
    ) -> Result<()> {
        if params.controller_key_salt.is_some() {
            tracing::error!("Setup failed: Controller Key Salt present but not used for HAP Data Stream.");
            return Err(Error::invalid_data("controller key salt not allowed"));
        }

        self.update_setup_timer();
        assert!(self.setup_slot().is_none(), "HomeKit Data Stream setup already in progress");

        let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.state == HapStreamState::Uninitialized)
        else {
            tracing::error!(
                "No space to allocate HomeKit Data Stream setup request ({} max). Increase max_streams.",
                self.slots.len()
            );
            return Err(Error::OutOfResources);
        };

        let slot = &mut self.slots[index];
        slot.setup_ttl = self.setup_timeout;
        slot.session = Some(session.clone());
        slot.pairing_id = session.pairing_id();
        slot.service_index = service_index;
        slot.state = HapStreamState::SetupBegun;
        if session.transport_type() == TransportType::Ble {
            slot.session_secret = Some(session.shared_secret());
        }
        tracing::info!("[{}] HomeKit Data Stream setup request allocated.", index);

        self.update_setup_timer();
        Ok(())
    }

    fn setup_cancel(&mut self) {
        let Some(index) = self.setup_slot() else {
            return;
        };
        tracing::info!(
            "[{}] Canceling pending HomeKit Data Stream setup request (setup not completed).",
            index
        );
        self.invalidate_slot(index);
    }

    fn setup_complete(&mut self) -> Result<AccessorySetupParams> {
        let Some(index) = self.setup_slot() else {
            tracing::warn!("HomeKit Data Stream setup has not been prepared or has timed out.");
            return Err(Error::InvalidState);
        };

        let session_identifier = self.pick_session_identifier();
        tracing::info!(
            "[{}] HomeKit Data Stream setup request registered (session identifier {}).",
            index,
            session_identifier
        );

        let slot = &mut self.slots[index];
        slot.state = HapStreamState::WaitingForFirstFrame;
        slot.session_identifier = session_identifier;

        Ok(AccessorySetupParams {
            listener_port: None,
            session_identifier: Some(session_identifier),
            accessory_key_salt: None,
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
            let slot = &self.slots[index];
            if slot.state == HapStreamState::Uninitialized || slot.pairing_id != pairing_id {
                continue;
            }
            assert!(!slot.is_handling_event, "bulk invalidation from inside a callback");
            self.invalidate_slot(index);
        }
    }

    fn invalidate_all_for_session(&mut self, session: Option<&Arc<HapSession>>) {
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            let matches = match (&slot.session, session) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(own), Some(session)) => HapSession::same(own, session),
            };
            if !matches {
                continue;
            }
            assert!(!slot.is_handling_event, "bulk invalidation from inside a callback");
            self.invalidate_slot(index);
        }
    }

    fn receive_transmission(&mut self, id: DataStreamId) -> Option<&mut Transmission> {
        let index = self.resolve_live(id)?;
        Some(&mut self.slots[index].incoming)
    }

    fn send_transmission(&mut self, id: DataStreamId) -> Option<&mut Transmission> {
        let index = self.resolve_live(id)?;
        Some(&mut self.slots[index].outgoing)
    }

    fn do_receive(&mut self, _id: DataStreamId) {
        // Picked up by the next controller write.
    }

    fn do_send(&mut self, id: DataStreamId) {
        if let Some(index) = self.resolve(id) {
            self.raise_interrupt_if_needed(index);
        }
    }

    fn prepare_session_resume(&mut self, resumed_secret: &[u8; 32], session: &Arc<HapSession>) {
        assert_eq!(
            session.transport_type(),
            TransportType::Ble,
            "session resume attempted for invalid transport type"
        );
        let current = session.shared_secret();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.session_secret.as_deref() == Some(resumed_secret) {
                tracing::debug!("[{}] Updating session secret for resumed session.", index);
                slot.session_secret = Some(current.clone());
            }
        }
    }

    fn handle_timer(&mut self, timer: TimerId) {
        if self.setup_timer != Some(timer) {
            return;
        }
        tracing::debug!("HomeKit Data Stream setup timer expired.");
        self.setup_timer = None;
        self.update_setup_timer();
    }

    fn reset(&mut self) {
        if let Some(timer) = self.setup_timer.take() {
            self.timer.deregister(timer);
        }
        for slot in &mut self.slots {
            slot.release();
        }
        self.raised_interrupts.clear();
        self.reference_time = self.timer.now();
    }

    fn as_hap_mut(&mut self) -> Option<&mut HapTransport> {
        Some(self)
    }
}
