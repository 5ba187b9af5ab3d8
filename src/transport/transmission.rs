//! Single-direction frame transmission.
//!
//! A [`Transmission`] walks one frame through
//! `Idle → PrepareFrame → FrameHeader → DataReadyToAccept → Data
//! (→ DataEncrypted) → AuthTag → Idle`. Every state is a suspension point:
//! when the wire has no bytes (or no space) left, processing returns and
//! resumes from `num_progress_bytes` on the next readiness notification.

use std::fmt;
use std::io;

use bytes::Bytes;

use crate::crypto::StreamingAead;
use crate::error::Result;
use crate::stream::StreamControl;
use crate::MAX_PAYLOAD_BYTES;

/// Size of the scratch area used for headers, tags and staged chunks.
pub const SCRATCH_LEN: usize = 64;

/// Transmission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmissionState {
    /// No frame in flight
    #[default]
    Idle,
    /// Header and crypto context are about to be set up
    PrepareFrame,
    /// Header bytes are being transferred
    FrameHeader,
    /// The delegate is about to learn the frame size
    DataReadyToAccept,
    /// Payload chunk is being transferred
    Data,
    /// Payload chunk has been encrypted and is being sent
    DataEncrypted,
    /// Authentication tag is being transferred
    AuthTag,
}

/// Buffer of the chunk currently owned by a transmission.
#[derive(Debug, Default)]
pub enum ChunkBuffer {
    /// No buffer; received bytes are skipped
    #[default]
    None,
    /// Caller-owned bytes that must not be modified
    Immutable(Bytes),
    /// Scratch-free buffer, received into or encrypted in place
    Mutable(Vec<u8>),
}

impl ChunkBuffer {
    /// Bytes currently held.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ChunkBuffer::None => &[],
            ChunkBuffer::Immutable(bytes) => bytes,
            ChunkBuffer::Mutable(vec) => vec,
        }
    }

    /// Take a mutable buffer out, if any.
    pub fn into_vec(self) -> Option<Vec<u8>> {
        match self {
            ChunkBuffer::Mutable(vec) => Some(vec),
            _ => None,
        }
    }

    fn is_none(&self) -> bool {
        matches!(self, ChunkBuffer::None)
    }
}

/// Outcome of one chunk, handed to its [`CompletionHandler`].
#[derive(Debug)]
pub struct Completion {
    /// `Err(InvalidState)` when the stream is being invalidated
    pub result: Result<()>,
    /// The buffer submitted with the chunk, handed back
    pub buffer: ChunkBuffer,
    /// Size of the chunk
    pub num_bytes: usize,
    /// Whether this was the last chunk of the frame
    pub is_complete: bool,
}

/// Per-chunk callback.
pub type CompletionHandler = Box<dyn FnOnce(&mut StreamControl<'_>, Completion) + Send>;

/// Result of moving bytes between the wire and a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStep {
    /// Target reached; progress has been reset
    Done,
    /// No more bytes or space for now
    WouldBlock,
    /// Peer closed the stream
    Closed,
    /// Unrecoverable I/O error
    Failed,
}

/// Where received bytes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sink {
    Scratch,
    Chunk,
}

/// How received or sent bytes are run through the AEAD context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Crypt {
    None,
    Authenticated,
    Encrypted,
}

/// Where sent bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Scratch,
    Chunk,
}

/// One in-flight frame in one direction.
pub struct Transmission {
    pub(crate) state: TransmissionState,
    pub(crate) num_progress_bytes: usize,
    pub(crate) total_data_bytes: usize,
    pub(crate) num_data_bytes: usize,
    pub(crate) buffer: ChunkBuffer,
    pub(crate) handler: Option<CompletionHandler>,
    pub(crate) scratch: [u8; SCRATCH_LEN],
    pub(crate) aead: Option<StreamingAead>,
}

impl Default for Transmission {
    fn default() -> Self {
        Self {
            state: TransmissionState::Idle,
            num_progress_bytes: 0,
            total_data_bytes: 0,
            num_data_bytes: 0,
            buffer: ChunkBuffer::None,
            handler: None,
            scratch: [0u8; SCRATCH_LEN],
            aead: None,
        }
    }
}

impl fmt::Debug for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmission")
            .field("state", &self.state)
            .field("num_progress_bytes", &self.num_progress_bytes)
            .field("total_data_bytes", &self.total_data_bytes)
            .field("num_data_bytes", &self.num_data_bytes)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Transmission {
    /// Current state.
    pub fn state(&self) -> TransmissionState {
        self.state
    }

    /// Bytes of the frame not yet transferred.
    pub fn total_data_bytes(&self) -> usize {
        self.total_data_bytes
    }

    /// Size of the current chunk.
    pub fn num_data_bytes(&self) -> usize {
        self.num_data_bytes
    }

    /// Whether a chunk is waiting for its completion.
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Whether the transmission is back to its zero state.
    pub fn is_reset(&self) -> bool {
        self.state == TransmissionState::Idle
            && self.num_progress_bytes == 0
            && self.total_data_bytes == 0
            && self.num_data_bytes == 0
            && self.handler.is_none()
            && self.buffer.is_none()
            && self.aead.is_none()
    }

    /// Zero the transmission.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Announce an outgoing frame of `total` bytes.
    ///
    /// # Panics
    ///
    /// If a frame is already in flight or `total` exceeds the payload limit.
    pub fn prepare(&mut self, total: usize, handler: CompletionHandler) {
        assert!(total <= MAX_PAYLOAD_BYTES, "frame too large: {} bytes", total);
        assert_eq!(self.state, TransmissionState::Idle, "prepare while a frame is in flight");
        assert!(self.handler.is_none(), "prepare with a pending completion");

        self.handler = Some(handler);
        self.total_data_bytes = total;
        self.state = TransmissionState::PrepareFrame;
    }

    /// Submit an immutable chunk for sending.
    pub fn submit_send(&mut self, bytes: Bytes, handler: CompletionHandler) {
        let n = bytes.len();
        self.submit(ChunkBuffer::Immutable(bytes), n, handler);
    }

    /// Submit a chunk that may be encrypted in place.
    pub fn submit_send_mutable(&mut self, buf: Vec<u8>, handler: CompletionHandler) {
        let n = buf.len();
        self.submit(ChunkBuffer::Mutable(buf), n, handler);
    }

    /// Submit a buffer to receive the next `buf.len()` bytes into.
    pub fn submit_receive(&mut self, buf: Vec<u8>, handler: CompletionHandler) {
        let n = buf.len();
        self.submit(ChunkBuffer::Mutable(buf), n, handler);
    }

    /// Skip the next `n` received bytes.
    pub fn submit_skip(&mut self, n: usize, handler: CompletionHandler) {
        self.submit(ChunkBuffer::None, n, handler);
    }

    fn submit(&mut self, buffer: ChunkBuffer, n: usize, handler: CompletionHandler) {
        assert_eq!(self.state, TransmissionState::Data, "chunk submitted outside of Data state");
        assert!(self.handler.is_none(), "chunk submitted while another is pending");
        assert!(
            n <= self.total_data_bytes,
            "chunk of {} bytes exceeds the {} remaining",
            n,
            self.total_data_bytes
        );

        self.handler = Some(handler);
        self.buffer = buffer;
        self.num_data_bytes = n;
    }

    /// Detach the pending handler and build its completion.
    ///
    /// A complete frame zeroes the transmission; otherwise only the chunk is
    /// cleared so that the handler may submit the next one.
    pub(crate) fn take_completion(
        &mut self,
        result: Result<()>,
        is_complete: bool,
    ) -> Option<(CompletionHandler, Completion)> {
        let handler = self.handler.take()?;
        let buffer = std::mem::take(&mut self.buffer);
        let num_bytes = self.num_data_bytes;

        if is_complete {
            self.reset();
        } else {
            self.num_data_bytes = 0;
        }

        Some((
            handler,
            Completion {
                result,
                buffer,
                num_bytes,
                is_complete,
            },
        ))
    }

    /// Receive bytes until `max` have accumulated in the sink.
    ///
    /// Without a mutable chunk buffer, `Sink::Chunk` discards the bytes after
    /// running them through the AEAD context.
    pub(crate) fn fill<R>(&mut self, sink: Sink, max: usize, crypt: Crypt, mut read: R) -> IoStep
    where
        R: FnMut(&mut [u8]) -> io::Result<usize>,
    {
        while self.num_progress_bytes < max {
            let offset = self.num_progress_bytes;
            let want = max - offset;

            let (buf, skipping): (&mut [u8], bool) = match (sink, &mut self.buffer) {
                (Sink::Scratch, _) => (&mut self.scratch[offset..max], false),
                (Sink::Chunk, ChunkBuffer::Mutable(vec)) => (&mut vec[offset..max], false),
                (Sink::Chunk, _) => {
                    let n = want.min(SCRATCH_LEN);
                    (&mut self.scratch[..n], true)
                }
            };

            let n = match read(buf) {
                Ok(0) => return IoStep::Closed,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStep::WouldBlock,
                Err(_) => return IoStep::Failed,
            };
            debug_assert!(n <= buf.len());

            if let Some(aead) = self.aead.as_mut() {
                let data = &mut buf[..n];
                match crypt {
                    Crypt::None => {}
                    Crypt::Authenticated => aead.update_aad(data),
                    Crypt::Encrypted if skipping => aead.skip(data),
                    Crypt::Encrypted => aead.decrypt(data),
                }
            }

            self.num_progress_bytes += n;
        }

        self.num_progress_bytes = 0;
        IoStep::Done
    }

    /// Send `max` bytes of the source, starting at `progress - offset`.
    pub(crate) fn drain<W>(&mut self, source: Source, max: usize, offset: usize, mut write: W) -> IoStep
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        debug_assert!(offset <= self.num_progress_bytes);

        while self.num_progress_bytes - offset < max {
            let start = self.num_progress_bytes - offset;
            let data = match source {
                Source::Scratch => &self.scratch[start..max],
                Source::Chunk => &self.buffer.as_slice()[start..max],
            };

            let n = match write(data) {
                Ok(0) => return IoStep::Failed,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStep::WouldBlock,
                Err(_) => return IoStep::Failed,
            };
            debug_assert!(n <= data.len());

            self.num_progress_bytes += n;
        }

        self.num_progress_bytes = offset;
        IoStep::Done
    }
}

/// Reader over an in-memory slice that reports `WouldBlock` once empty.
pub(crate) fn slice_reader<'a, 'b: 'a>(src: &'a mut &'b [u8]) -> Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + 'a> {
    Box::new(move |buf: &mut [u8]| {
        if src.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(src.len());
        buf[..n].copy_from_slice(&src[..n]);
        *src = &src[n..];
        Ok(n)
    })
}

/// Writer into a bounded vector that reports `WouldBlock` once full.
pub(crate) fn vec_writer<'a>(dst: &'a mut Vec<u8>, capacity: usize) -> impl FnMut(&[u8]) -> io::Result<usize> + 'a {
    move |data: &[u8]| {
        let room = capacity.saturating_sub(dst.len());
        if room == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = data.len().min(room);
        dst.extend_from_slice(&data[..n]);
        Ok(n)
    }
}
