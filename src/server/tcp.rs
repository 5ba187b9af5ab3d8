//! `TcpStreamManager` on tokio sockets.
//!
//! The listener runs its own accept task and parks accepted sockets until the
//! leg picks them up. Each stream with non-empty interests has a one-shot
//! readiness watcher; the leg re-arms it through `update_interests` after
//! every event it handles.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::DriverEvent;
use crate::error::{Error, Result};
use crate::platform::{StreamInterests, StreamPriority, TcpStreamEvent, TcpStreamHandle, TcpStreamManager};

struct ListenerState {
    port: u16,
    task: JoinHandle<()>,
}

struct StreamEntry {
    stream: Arc<TcpStream>,
    watcher: Option<JoinHandle<()>>,
    priority: StreamPriority,
}

impl StreamEntry {
    fn stop_watching(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// TCP listener and accepted Data Stream connections.
pub struct TokioTcpStreamManager {
    listen_addr: String,
    listen_port: u16,
    events: UnboundedSender<DriverEvent>,
    listener: Option<ListenerState>,
    pending: Arc<Mutex<VecDeque<TcpStream>>>,
    streams: HashMap<TcpStreamHandle, StreamEntry>,
    next_handle: u64,
}

impl TokioTcpStreamManager {
    pub(crate) fn new(listen_addr: impl Into<String>, listen_port: u16, events: UnboundedSender<DriverEvent>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            events,
            listener: None,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            streams: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Number of accepted streams that are still open.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

fn runtime() -> io::Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

async fn accept_loop(
    listener: TcpListener,
    pending: Arc<Mutex<VecDeque<TcpStream>>>,
    events: UnboundedSender<DriverEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::debug!("Incoming HomeKit Data Stream connection from {}.", peer_addr);
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }
                pending.lock().push_back(stream);
                if events.send(DriverEvent::PendingConnection).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn watch(
    handle: TcpStreamHandle,
    stream: Arc<TcpStream>,
    interest: Interest,
    events: UnboundedSender<DriverEvent>,
) {
    let event = match stream.ready(interest).await {
        Ok(ready) => TcpStreamEvent {
            readable: ready.is_readable() || ready.is_read_closed(),
            writable: ready.is_writable() || ready.is_write_closed(),
        },
        Err(e) => {
            // Surface the failure through the next read or write.
            tracing::debug!("Readiness of TCP stream {} failed: {}", handle, e);
            TcpStreamEvent {
                readable: true,
                writable: true,
            }
        }
    };
    let _ = events.send(DriverEvent::Stream(handle, event));
}

impl TcpStreamManager for TokioTcpStreamManager {
    fn open_listener(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let runtime = runtime()?;

        let std_listener = std::net::TcpListener::bind((self.listen_addr.as_str(), self.listen_port))?;
        std_listener.set_nonblocking(true)?;
        let port = std_listener.local_addr()?.port();

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        let task = runtime.spawn(accept_loop(listener, self.pending.clone(), self.events.clone()));
        self.listener = Some(ListenerState { port, task });
        Ok(())
    }

    fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
        }
        self.pending.lock().clear();
    }

    fn is_listener_open(&self) -> bool {
        self.listener.is_some()
    }

    fn listener_port(&self) -> Option<u16> {
        self.listener.as_ref().map(|listener| listener.port)
    }

    fn accept(&mut self) -> Result<TcpStreamHandle> {
        let stream = self.pending.lock().pop_front().ok_or(Error::Busy)?;
        let handle = TcpStreamHandle(self.next_handle);
        self.next_handle += 1;
        self.streams.insert(
            handle,
            StreamEntry {
                stream: Arc::new(stream),
                watcher: None,
                priority: StreamPriority::Normal,
            },
        );
        Ok(handle)
    }

    fn read(&mut self, handle: TcpStreamHandle, buf: &mut [u8]) -> io::Result<usize> {
        let entry = self
            .streams
            .get(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        entry.stream.try_read(buf)
    }

    fn write(&mut self, handle: TcpStreamHandle, data: &[u8]) -> io::Result<usize> {
        let entry = self
            .streams
            .get(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        entry.stream.try_write(data)
    }

    fn close(&mut self, handle: TcpStreamHandle) {
        if let Some(mut entry) = self.streams.remove(&handle) {
            entry.stop_watching();
            tracing::debug!("Closed TCP stream {}.", handle);
        }
    }

    fn update_interests(&mut self, handle: TcpStreamHandle, interests: StreamInterests) {
        let Some(entry) = self.streams.get_mut(&handle) else {
            return;
        };
        entry.stop_watching();

        let interest = match (interests.readable, interests.writable) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => return,
        };
        match runtime() {
            Ok(runtime) => {
                entry.watcher = Some(runtime.spawn(watch(handle, entry.stream.clone(), interest, self.events.clone())));
            }
            Err(e) => tracing::error!("Cannot watch TCP stream {}: {}", handle, e),
        }
    }

    fn set_priority(&mut self, handle: TcpStreamHandle, priority: StreamPriority) {
        if let Some(entry) = self.streams.get_mut(&handle) {
            // Sockets carry no priority here; keep it for diagnostics.
            tracing::trace!("TCP stream {} priority {:?} -> {:?}.", handle, entry.priority, priority);
            entry.priority = priority;
        }
    }
}

impl Drop for TokioTcpStreamManager {
    fn drop(&mut self) {
        self.close_listener();
        for entry in self.streams.values_mut() {
            entry.stop_watching();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_accept_and_read() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = TokioTcpStreamManager::new("127.0.0.1", 0, tx);
        assert!(matches!(manager.accept(), Err(Error::Busy)));

        manager.open_listener().unwrap();
        let port = manager.listener_port().unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        assert!(matches!(rx.recv().await, Some(DriverEvent::PendingConnection)));
        let handle = manager.accept().unwrap();
        assert_eq!(manager.stream_count(), 1);

        let mut buf = [0u8; 8];
        assert_eq!(
            manager.read(handle, &mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        manager.update_interests(
            handle,
            StreamInterests {
                readable: true,
                writable: false,
            },
        );
        client.write_all(b"abc").await.unwrap();
        match rx.recv().await {
            Some(DriverEvent::Stream(h, event)) => {
                assert_eq!(h, handle);
                assert!(event.readable);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.read(handle, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        manager.close(handle);
        assert_eq!(manager.stream_count(), 0);
        assert_eq!(
            manager.write(handle, b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        manager.close_listener();
        assert!(!manager.is_listener_open());
        assert_eq!(manager.listener_port(), None);
    }
}
