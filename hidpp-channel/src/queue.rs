//! Thread-safe message queues filled by polling threads and drained by
//! channel readers.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{filter::Filters, message::TransportMessage};

/// Locks a mutex, recovering the guard if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A point in time a blocking read gives up at.
///
/// A zero timeout means waiting without a deadline.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self(None)
        } else {
            Self(Some(Instant::now() + timeout))
        }
    }

    pub(crate) fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// The time left, `None` if there is no deadline.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// A deadline at most `max` from now, never later than this one.
    pub(crate) fn capped(&self, max: Duration) -> Self {
        let cap = Instant::now() + max;
        Self(Some(self.0.map_or(cap, |at| at.min(cap))))
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<TransportMessage>,

    /// Bumped by [`MessageQueue::wake_all`] so waiters notice they were
    /// interrupted.
    interruptions: u64,
}

/// A FIFO of messages supporting blocking, filtered reads.
///
/// Filtered reads remove the first matching message and leave every other
/// message in its original order.
#[derive(Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, msg: TransportMessage) {
        lock(&self.state).messages.push_back(msg);
        self.available.notify_all();
    }

    /// Removes and returns the head of the queue, waiting up to `timeout` for
    /// a message to arrive. A zero timeout waits indefinitely.
    ///
    /// Returns `None` if no message arrived in time or the wait was
    /// interrupted by [`Self::wake_all`].
    pub fn get(&self, timeout: Duration) -> Option<TransportMessage> {
        self.get_first_until(|_| true, Deadline::after(timeout))
    }

    /// Removes and returns the first message matching the filters, waiting up
    /// to `timeout` for one to arrive. A zero timeout waits indefinitely.
    pub fn get_first_message_filter(
        &self,
        filters: &Filters,
        timeout: Duration,
    ) -> Option<TransportMessage> {
        self.get_first_until(|msg| filters.matches(&msg.data), Deadline::after(timeout))
    }

    pub fn get_nowait(&self) -> Option<TransportMessage> {
        lock(&self.state).messages.pop_front()
    }

    /// Removes and returns the first message satisfying the predicate without
    /// waiting.
    pub fn get_first_nowait(
        &self,
        predicate: impl Fn(&TransportMessage) -> bool,
    ) -> Option<TransportMessage> {
        let mut state = lock(&self.state);
        let pos = state.messages.iter().position(predicate)?;
        state.messages.remove(pos)
    }

    pub(crate) fn get_first_until(
        &self,
        predicate: impl Fn(&TransportMessage) -> bool,
        deadline: Deadline,
    ) -> Option<TransportMessage> {
        let mut state = lock(&self.state);
        let interruptions = state.interruptions;

        loop {
            if let Some(pos) = state.messages.iter().position(&predicate) {
                return state.messages.remove(pos);
            }

            if state.interruptions != interruptions {
                return None;
            }

            state = match deadline.remaining() {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(remaining) if remaining.is_zero() => return None,
                Some(remaining) => {
                    self.available
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                },
            };
        }
    }

    /// Drains the queue, returning the removed messages in order.
    pub fn clear(&self) -> Vec<TransportMessage> {
        lock(&self.state).messages.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).messages.is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).messages.len()
    }

    /// Interrupts every thread currently blocked reading from the queue.
    pub fn wake_all(&self) {
        lock(&self.state).interruptions += 1;
        self.available.notify_all();
    }
}

/// An error occurring when reconfiguring a [`TimestampedMultiQueue`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// A sub-queue is already registered for the device index.
    #[error("a queue is already registered for device index {0:#04x}")]
    DeviceIndexInUse(u8),
}

/// A parent FIFO fanning out messages to per-device-index sub-queues.
///
/// A message is delivered to the sub-queue registered for its device index,
/// or to the parent FIFO if there is none. Messages matching the parent pins
/// always stay in the parent FIFO.
#[derive(Default)]
pub struct TimestampedMultiQueue {
    parent: Arc<MessageQueue>,
    sub_queues: Mutex<HashMap<u8, Arc<MessageQueue>>>,
    parent_pins: Option<Filters>,
}

impl TimestampedMultiQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue that keeps messages matching `pins` in the parent FIFO
    /// regardless of their device index.
    pub fn with_parent_pins(pins: Filters) -> Self {
        Self {
            parent_pins: Some(pins),
            ..Self::default()
        }
    }

    pub fn put(&self, msg: TransportMessage) {
        let pinned = self
            .parent_pins
            .as_ref()
            .is_some_and(|pins| pins.matches(&msg.data));

        let target = if pinned {
            None
        } else {
            msg.device_index()
                .and_then(|index| lock(&self.sub_queues).get(&index).cloned())
        };

        match target {
            Some(queue) => queue.put(msg),
            None => self.parent.put(msg),
        }
    }

    /// The parent FIFO, holding every message no sub-queue took.
    pub fn parent(&self) -> &Arc<MessageQueue> {
        &self.parent
    }

    pub fn get(&self, timeout: Duration) -> Option<TransportMessage> {
        self.parent.get(timeout)
    }

    pub fn get_nowait(&self) -> Option<TransportMessage> {
        self.parent.get_nowait()
    }

    pub fn get_first_message_filter(
        &self,
        filters: &Filters,
        timeout: Duration,
    ) -> Option<TransportMessage> {
        self.parent.get_first_message_filter(filters, timeout)
    }

    pub fn add_device_index_queue(
        &self,
        device_index: u8,
        queue: Arc<MessageQueue>,
    ) -> Result<(), QueueError> {
        let mut sub_queues = lock(&self.sub_queues);
        if sub_queues.contains_key(&device_index) {
            return Err(QueueError::DeviceIndexInUse(device_index));
        }

        sub_queues.insert(device_index, queue);
        Ok(())
    }

    pub fn remove_device_index_queue(&self, device_index: u8) -> Option<Arc<MessageQueue>> {
        lock(&self.sub_queues).remove(&device_index)
    }

    pub fn device_index_queue(&self, device_index: u8) -> Option<Arc<MessageQueue>> {
        lock(&self.sub_queues).get(&device_index).cloned()
    }

    /// Drains the parent FIFO. Sub-queues are drained by their owners.
    pub fn clear(&self) -> Vec<TransportMessage> {
        self.parent.clear()
    }

    /// Whether the parent FIFO is empty.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn wake_all(&self) {
        self.parent.wake_all();
    }
}
