//! Tokio driver.
//!
//! Runs a [`DataStreamServer`] on a tokio runtime:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Server                            │
//! │  ┌──────────────────┐   ┌──────────────────┐               │
//! │  │  Accept task     │   │  Timer tasks     │               │
//! │  │  (listener)      │   │  (sleep_until)   │               │
//! │  └────────┬─────────┘   └────────┬─────────┘               │
//! │           │  ┌──────────────────┐│                         │
//! │           │  │ Readiness tasks  ││                         │
//! │           │  │ (one per stream) ││                         │
//! │           │  └────────┬─────────┘│                         │
//! │           ▼           ▼          ▼                         │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │                  Event channel                       │  │
//! │  └──────────────────────────┬───────────────────────────┘  │
//! │                             ▼                              │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Event loop: Arc<Mutex<DataStreamServer>>            │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every event is handled with the façade locked, so the legs keep their
//! single-context model. Characteristic handlers share the same lock through
//! [`Server::data_stream`].

mod config;
mod tcp;
mod timer;

pub use config::{ServerConfig, ServerConfigFile, TransportMode};
pub use tcp::TokioTcpStreamManager;
pub use timer::TokioTimer;

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::platform::{TcpStreamEvent, TcpStreamHandle, TimerId};
use crate::stream::{DataStreamDelegate, DataStreamServer};

/// Work posted to the event loop.
#[derive(Debug)]
pub(crate) enum DriverEvent {
    /// A connection is waiting on the listener
    PendingConnection,
    Stream(TcpStreamHandle, TcpStreamEvent),
    Timer(TimerId),
}

/// Main server instance.
pub struct Server {
    config: Arc<ServerConfig>,
    data_stream: Arc<Mutex<DataStreamServer>>,
    timer: TokioTimer,
    events: mpsc::UnboundedReceiver<DriverEvent>,
}

impl Server {
    /// Create a server with the given configuration.
    pub fn new(config: ServerConfig, delegate: Box<dyn DataStreamDelegate>) -> Result<Self> {
        config.validate().map_err(Error::config)?;
        let (tx, events) = mpsc::unbounded_channel();
        let timer = TokioTimer::new(tx.clone());

        let mut data_stream = match config.transport {
            TransportMode::Tcp => {
                let manager = TokioTcpStreamManager::new(config.listen_addr.clone(), config.listen_port, tx);
                DataStreamServer::with_tcp(&config.data_stream, Box::new(manager), Box::new(timer.clone()), delegate)?
            }
            TransportMode::Hap => DataStreamServer::with_hap(&config.data_stream, Box::new(timer.clone()), delegate)?,
        };
        data_stream.prepare_start();

        Ok(Self {
            config: Arc::new(config),
            data_stream: Arc::new(Mutex::new(data_stream)),
            timer,
            events,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The façade, for characteristic handlers and application data operations.
    pub fn data_stream(&self) -> Arc<Mutex<DataStreamServer>> {
        Arc::clone(&self.data_stream)
    }

    /// Dispatch events until `shutdown` completes, then tear down all streams.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        tracing::info!("HomeKit Data Stream driver running ({} transport).", self.config.transport);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }

        tracing::info!("HomeKit Data Stream driver stopping.");
        let mut data_stream = self.data_stream.lock();
        data_stream.prepare_stop();
        data_stream.stop();
        Ok(())
    }

    fn dispatch(&self, event: DriverEvent) {
        let mut data_stream = self.data_stream.lock();
        match event {
            DriverEvent::PendingConnection => data_stream.handle_pending_connection(),
            DriverEvent::Stream(handle, event) => data_stream.handle_stream_event(handle, event),
            DriverEvent::Timer(timer) => {
                if self.timer.take_fired(timer) {
                    data_stream.handle_timer(timer);
                }
            }
        }
    }
}
