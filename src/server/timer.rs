//! `TimerService` on tokio timers.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::DriverEvent;
use crate::error::Result;
use crate::platform::{TimerId, TimerService};

#[derive(Default)]
struct TimerState {
    next_id: u64,
    armed: HashMap<TimerId, JoinHandle<()>>,
}

/// One task per armed timer; expiry is posted to the driver's event channel.
#[derive(Clone)]
pub struct TokioTimer {
    state: Arc<Mutex<TimerState>>,
    events: UnboundedSender<DriverEvent>,
}

impl TokioTimer {
    pub(crate) fn new(events: UnboundedSender<DriverEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            events,
        }
    }

    /// Claim a fired timer. `false` if it was deregistered in the meantime.
    pub(crate) fn take_fired(&self, timer: TimerId) -> bool {
        self.state.lock().armed.remove(&timer).is_some()
    }

    /// Number of timers not yet delivered.
    pub fn armed(&self) -> usize {
        self.state.lock().armed.len()
    }
}

impl TimerService for TokioTimer {
    fn now(&self) -> Instant {
        // The runtime clock, so paused test clocks advance it too.
        tokio::time::Instant::now().into_std()
    }

    fn register(&mut self, deadline: Instant) -> Result<TimerId> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let mut state = self.state.lock();
        state.next_id += 1;
        let timer = TimerId(state.next_id);

        let events = self.events.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            let _ = events.send(DriverEvent::Timer(timer));
        });
        state.armed.insert(timer, task);
        Ok(timer)
    }

    fn deregister(&mut self, timer: TimerId) {
        if let Some(task) = self.state.lock().armed.remove(&timer) {
            task.abort();
        }
    }
}

impl Drop for TimerState {
    fn drop(&mut self) {
        for task in self.armed.values() {
            task.abort();
        }
    }
}
