//! Platform collaborators consumed by the transport legs.
//!
//! The core never blocks: reads and writes return
//! [`std::io::ErrorKind::WouldBlock`] when the socket is busy and the leg
//! waits for the next readiness event. Readiness and timer expiry are
//! delivered back through the [`DataStreamServer`](crate::stream::DataStreamServer)
//! entry points by whatever drives the platform (the tokio driver in
//! `server`, or the mocks in tests).

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::io;
use std::time::Instant;

use crate::error::Result;

/// Opaque handle of an accepted TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpStreamHandle(pub u64);

impl fmt::Display for TcpStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp#{}", self.0)
    }
}

/// Readiness a stream is waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamInterests {
    pub readable: bool,
    pub writable: bool,
}

impl StreamInterests {
    /// No interest in either direction.
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Readiness reported for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStreamEvent {
    pub readable: bool,
    pub writable: bool,
}

/// Scheduling priority of a TCP stream, lowest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamPriority {
    #[default]
    Normal,
    High,
    Realtime,
}

/// TCP listener and stream primitives.
pub trait TcpStreamManager: Send {
    /// Start listening for connections.
    fn open_listener(&mut self) -> Result<()>;

    /// Stop listening. Accepted streams stay open.
    fn close_listener(&mut self);

    fn is_listener_open(&self) -> bool;

    /// Port of the listener, `None` while closed.
    fn listener_port(&self) -> Option<u16>;

    /// Accept one pending connection.
    fn accept(&mut self) -> Result<TcpStreamHandle>;

    /// Read available bytes. `Ok(0)` means the peer closed the stream.
    fn read(&mut self, stream: TcpStreamHandle, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as many bytes as the socket takes.
    fn write(&mut self, stream: TcpStreamHandle, data: &[u8]) -> io::Result<usize>;

    fn close(&mut self, stream: TcpStreamHandle);

    /// Replace the readiness the stream is waiting for.
    fn update_interests(&mut self, stream: TcpStreamHandle, interests: StreamInterests);

    fn set_priority(&mut self, stream: TcpStreamHandle, priority: StreamPriority);
}

/// Identifier of a registered one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Monotonic clock and one-shot timers.
pub trait TimerService: Send {
    fn now(&self) -> Instant;

    /// Arm a timer for `deadline`.
    ///
    /// # Errors
    ///
    /// `OutOfResources` when no timer can be allocated.
    fn register(&mut self, deadline: Instant) -> Result<TimerId>;

    /// Disarm a timer. Unknown or fired ids are ignored.
    fn deregister(&mut self, timer: TimerId);
}
