use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use agent_relay_protocol::SessionUpdate;
use tokio::sync::Notify;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<SessionUpdate>,
    dropped: u64,
    closed: bool,
}

/// Bounded update queue between the subprocess reader and HTTP consumers.
///
/// `push` never waits. When the queue is full the oldest update is discarded.
/// Every update is handed to exactly one `recv` caller.
#[derive(Debug)]
pub struct UpdateChannel {
    capacity: usize,
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl UpdateChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ChannelState::default()),
            notify: Notify::new(),
        }
    }

    /// Returns `false` when an older update had to be discarded to make room.
    pub fn push(&self, update: SessionUpdate) -> bool {
        let mut kept_all = true;
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            while state.queue.len() >= self.capacity {
                if let Some(discarded) = state.queue.pop_front() {
                    state.dropped += 1;
                    kept_all = false;
                    tracing::debug!(
                        kind = discarded.kind(),
                        dropped_total = state.dropped,
                        "update channel full, discarded oldest update"
                    );
                }
            }
            state.queue.push_back(update);
        }
        self.notify.notify_one();
        kept_all
    }

    pub fn try_recv(&self) -> Option<SessionUpdate> {
        self.lock().queue.pop_front()
    }

    /// Waits for the next update. `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<SessionUpdate> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(update) = state.queue.pop_front() {
                    return Some(update);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for UpdateChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
