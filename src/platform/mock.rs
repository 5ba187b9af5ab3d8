//! In-memory collaborators for deterministic tests.
//!
//! Both mocks are cheap handles around shared state so a test can keep one
//! clone while the transport owns another.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{StreamInterests, StreamPriority, TcpStreamHandle, TcpStreamManager, TimerId, TimerService};
use crate::error::{Error, Result};
use crate::stream::{DataStreamDelegate, DataStreamId, DataStreamRequest, StreamControl};
use crate::transport::{Completion, CompletionHandler};

#[derive(Debug, Default)]
struct MockStream {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    interests: StreamInterests,
    priority: StreamPriority,
    write_capacity: Option<usize>,
    peer_closed: bool,
    closed: bool,
}

#[derive(Debug)]
struct TcpState {
    port: u16,
    listener_open: bool,
    listener_opens: usize,
    pending: VecDeque<TcpStreamHandle>,
    streams: HashMap<TcpStreamHandle, MockStream>,
    next_handle: u64,
    read_chunk: usize,
}

/// Scripted TCP stream manager.
#[derive(Debug, Clone)]
pub struct MockTcpStreamManager {
    state: Arc<Mutex<TcpState>>,
}

impl MockTcpStreamManager {
    pub fn new(port: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(TcpState {
                port,
                listener_open: false,
                listener_opens: 0,
                pending: VecDeque::new(),
                streams: HashMap::new(),
                next_handle: 1,
                read_chunk: usize::MAX,
            })),
        }
    }

    /// Queue an incoming connection.
    pub fn connect(&self) -> TcpStreamHandle {
        let mut state = self.state.lock();
        let handle = TcpStreamHandle(state.next_handle);
        state.next_handle += 1;
        state.streams.insert(handle, MockStream::default());
        state.pending.push_back(handle);
        handle
    }

    /// Deliver bytes from the controller.
    pub fn push_inbound(&self, handle: TcpStreamHandle, data: &[u8]) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.inbound.extend(data);
        }
    }

    /// Drain everything the accessory wrote.
    pub fn take_outbound(&self, handle: TcpStreamHandle) -> Vec<u8> {
        let mut state = self.state.lock();
        state
            .streams
            .get_mut(&handle)
            .map(|s| std::mem::take(&mut s.outbound))
            .unwrap_or_default()
    }

    /// Limit how many bytes a single write accepts in total until changed.
    pub fn set_write_capacity(&self, handle: TcpStreamHandle, capacity: Option<usize>) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.write_capacity = capacity;
        }
    }

    /// Limit the size of every read.
    pub fn set_read_chunk(&self, n: usize) {
        self.state.lock().read_chunk = n.max(1);
    }

    /// Peer half-closes the stream; pending reads then return `Ok(0)`.
    pub fn close_remote(&self, handle: TcpStreamHandle) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.peer_closed = true;
        }
    }

    pub fn is_closed(&self, handle: TcpStreamHandle) -> bool {
        let state = self.state.lock();
        state.streams.get(&handle).map_or(true, |s| s.closed)
    }

    pub fn interests(&self, handle: TcpStreamHandle) -> StreamInterests {
        let state = self.state.lock();
        state.streams.get(&handle).map(|s| s.interests).unwrap_or_default()
    }

    pub fn priority(&self, handle: TcpStreamHandle) -> StreamPriority {
        let state = self.state.lock();
        state.streams.get(&handle).map(|s| s.priority).unwrap_or_default()
    }

    pub fn listener_opens(&self) -> usize {
        self.state.lock().listener_opens
    }
}

impl TcpStreamManager for MockTcpStreamManager {
    fn open_listener(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.listener_open = true;
        state.listener_opens += 1;
        Ok(())
    }

    fn close_listener(&mut self) {
        self.state.lock().listener_open = false;
    }

    fn is_listener_open(&self) -> bool {
        self.state.lock().listener_open
    }

    fn listener_port(&self) -> Option<u16> {
        let state = self.state.lock();
        state.listener_open.then_some(state.port)
    }

    fn accept(&mut self) -> Result<TcpStreamHandle> {
        self.state.lock().pending.pop_front().ok_or(Error::Busy)
    }

    fn read(&mut self, handle: TcpStreamHandle, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let chunk = state.read_chunk;
        let stream = state
            .streams
            .get_mut(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if stream.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if stream.inbound.is_empty() {
            return if stream.peer_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let n = buf.len().min(stream.inbound.len()).min(chunk);
        for (dst, src) in buf.iter_mut().zip(stream.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, handle: TcpStreamHandle, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let stream = state
            .streams
            .get_mut(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if stream.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }

        let n = match stream.write_capacity.as_mut() {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(capacity) => {
                let n = data.len().min(*capacity);
                *capacity -= n;
                n
            }
            None => data.len(),
        };
        stream.outbound.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self, handle: TcpStreamHandle) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.closed = true;
            stream.interests = StreamInterests::NONE;
        }
    }

    fn update_interests(&mut self, handle: TcpStreamHandle, interests: StreamInterests) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.interests = interests;
        }
    }

    fn set_priority(&mut self, handle: TcpStreamHandle, priority: StreamPriority) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&handle) {
            stream.priority = priority;
        }
    }
}

#[derive(Debug)]
struct TimerState {
    now: Instant,
    next_id: u64,
    timers: BTreeMap<u64, Instant>,
    exhausted: bool,
}

/// Manually advanced clock.
#[derive(Debug, Clone)]
pub struct MockTimer {
    state: Arc<Mutex<TimerState>>,
}

impl MockTimer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState {
                now: Instant::now(),
                next_id: 1,
                timers: BTreeMap::new(),
                exhausted: false,
            })),
        }
    }

    /// Move the clock forward and return the timers that fired, in order.
    pub fn advance(&self, by: Duration) -> Vec<TimerId> {
        let mut state = self.state.lock();
        state.now += by;
        let now = state.now;
        let fired: Vec<u64> = state
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &fired {
            state.timers.remove(id);
        }
        fired.into_iter().map(TimerId).collect()
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// Deadline of the earliest armed timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        let state = self.state.lock();
        state.timers.values().min().map(|d| d.saturating_duration_since(state.now))
    }

    /// Make further registrations fail.
    pub fn exhaust(&self) {
        self.state.lock().exhausted = true;
    }
}

impl TimerService for MockTimer {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn register(&mut self, deadline: Instant) -> Result<TimerId> {
        let mut state = self.state.lock();
        if state.exhausted {
            return Err(Error::OutOfResources);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.timers.insert(id, deadline);
        Ok(TimerId(id))
    }

    fn deregister(&mut self, timer: TimerId) {
        self.state.lock().timers.remove(&timer.0);
    }
}

/// Everything a [`RecordingDelegate`] observed.
#[derive(Debug, Default)]
pub struct Recorded {
    pub accepted: Vec<DataStreamId>,
    pub invalidated: Vec<DataStreamId>,
    /// Fully received frames, without skipped bytes
    pub frames: Vec<Vec<u8>>,
    /// Receive and skip completions, including partial chunks
    pub chunks: usize,
    /// Completed outgoing frames
    pub sent: usize,
    /// Ciphertext handed back by mutable sends
    pub returned: Vec<Vec<u8>>,
    /// Errors reported to incoming completions
    pub receive_errors: Vec<Error>,
    /// Errors reported to outgoing completions
    pub send_errors: Vec<Error>,
    partial: Vec<u8>,
}

/// Delegate that receives every frame in fixed-size chunks and optionally
/// echoes it back.
pub struct RecordingDelegate {
    log: Arc<Mutex<Recorded>>,
    chunk: usize,
    echo: bool,
    skip: usize,
}

impl RecordingDelegate {
    pub fn new(chunk: usize, echo: bool) -> (Self, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let delegate = Self {
            log: log.clone(),
            chunk: chunk.max(1),
            echo,
            skip: 0,
        };
        (delegate, log)
    }

    /// Skip the first `skip` bytes of every frame before receiving the rest.
    pub fn skipping(skip: usize, chunk: usize) -> (Self, Arc<Mutex<Recorded>>) {
        let (mut delegate, log) = Self::new(chunk, false);
        delegate.skip = skip;
        (delegate, log)
    }
}

impl DataStreamDelegate for RecordingDelegate {
    fn handle_accept(&mut self, stream: &mut StreamControl<'_>) {
        self.log.lock().accepted.push(stream.id());
    }

    fn handle_data(&mut self, stream: &mut StreamControl<'_>, total_data_bytes: usize) {
        let skip = self.skip.min(total_data_bytes);
        if skip == 0 {
            receive_chunked(stream, self.log.clone(), total_data_bytes, self.chunk, self.echo);
            return;
        }

        let (log, chunk, echo) = (self.log.clone(), self.chunk, self.echo);
        stream.skip_data(
            skip,
            Box::new(move |stream, completion| {
                let mut recorded = log.lock();
                recorded.chunks += 1;
                if let Err(e) = completion.result {
                    recorded.receive_errors.push(e);
                    return;
                }
                if completion.is_complete {
                    recorded.frames.push(Vec::new());
                    return;
                }
                drop(recorded);
                receive_chunked(stream, log, total_data_bytes - skip, chunk, echo);
            }),
        );
    }

    fn handle_invalidate(&mut self, _request: &DataStreamRequest, id: DataStreamId) {
        self.log.lock().invalidated.push(id);
    }
}

fn receive_chunked(stream: &mut StreamControl<'_>, log: Arc<Mutex<Recorded>>, remaining: usize, chunk: usize, echo: bool) {
    let n = remaining.min(chunk);
    stream.receive_data(
        vec![0u8; n],
        Box::new(move |stream, completion| {
            let mut recorded = log.lock();
            recorded.chunks += 1;
            if let Err(e) = completion.result {
                recorded.receive_errors.push(e);
                return;
            }
            if let Some(buf) = completion.buffer.into_vec() {
                recorded.partial.extend_from_slice(&buf);
            }
            if !completion.is_complete {
                drop(recorded);
                receive_chunked(stream, log, remaining - n, chunk, echo);
                return;
            }

            let frame = std::mem::take(&mut recorded.partial);
            recorded.frames.push(frame.clone());
            drop(recorded);
            if echo {
                send_frame(stream, Bytes::from(frame), log);
            }
        }),
    );
}

fn record_sent(log: &Mutex<Recorded>, completion: Completion) {
    let mut recorded = log.lock();
    match completion.result {
        Err(e) => recorded.send_errors.push(e),
        Ok(()) if completion.is_complete => recorded.sent += 1,
        Ok(()) => {}
    }
}

/// Prepare and send one frame in a single chunk.
pub fn send_frame(stream: &mut StreamControl<'_>, payload: Bytes, log: Arc<Mutex<Recorded>>) {
    stream.prepare_data(
        payload.len(),
        Box::new(move |stream, completion| {
            if let Err(e) = completion.result {
                log.lock().send_errors.push(e);
                return;
            }
            stream.send_data(payload, Box::new(move |_, completion| record_sent(&log, completion)));
        }),
    );
}

/// Prepare completion that sends `payload[..split]` as a mutable chunk and
/// the rest as an immutable one.
pub fn split_frame_handler(payload: Vec<u8>, split: usize, log: Arc<Mutex<Recorded>>) -> CompletionHandler {
    Box::new(move |stream, completion| {
        if let Err(e) = completion.result {
            log.lock().send_errors.push(e);
            return;
        }
        let tail = Bytes::copy_from_slice(&payload[split..]);
        stream.send_mutable_data(
            payload[..split].to_vec(),
            Box::new(move |stream, completion| {
                let mut recorded = log.lock();
                if let Err(e) = completion.result {
                    recorded.send_errors.push(e);
                    return;
                }
                if let Some(ciphertext) = completion.buffer.into_vec() {
                    recorded.returned.push(ciphertext);
                }
                drop(recorded);
                stream.send_data(tail, Box::new(move |_, completion| record_sent(&log, completion)));
            }),
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_stream_io() {
        let mut manager = MockTcpStreamManager::new(40000);
        let remote = manager.clone();
        manager.open_listener().unwrap();
        assert_eq!(manager.listener_port(), Some(40000));

        let handle = remote.connect();
        assert_eq!(manager.accept().unwrap(), handle);
        assert!(matches!(manager.accept(), Err(Error::Busy)));

        let mut buf = [0u8; 8];
        assert_eq!(
            manager.read(handle, &mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        remote.push_inbound(handle, b"abc");
        assert_eq!(manager.read(handle, &mut buf).unwrap(), 3);
        remote.close_remote(handle);
        assert_eq!(manager.read(handle, &mut buf).unwrap(), 0);

        remote.set_write_capacity(handle, Some(2));
        assert_eq!(manager.write(handle, b"xyz").unwrap(), 2);
        assert!(manager.write(handle, b"z").is_err());
        assert_eq!(remote.take_outbound(handle), b"xy");
    }

    #[test]
    fn test_mock_timer() {
        let mut timer = MockTimer::new();
        let clock = timer.clone();
        let start = timer.now();

        let a = timer.register(start + Duration::from_secs(2)).unwrap();
        let b = timer.register(start + Duration::from_secs(5)).unwrap();
        timer.deregister(b);

        assert!(clock.advance(Duration::from_secs(1)).is_empty());
        assert_eq!(clock.advance(Duration::from_secs(1)), vec![a]);
        assert_eq!(clock.armed(), 0);
    }
}
