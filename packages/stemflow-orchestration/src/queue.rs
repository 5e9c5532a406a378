//! Task queue (at-least-once)
//!
//! A `Delivery` that is dropped without `ack()` goes back to the queue, so a
//! worker that panics or is torn down mid-task never loses the message.
//! Consumers must therefore tolerate duplicates (see `job::check_delivery`).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stemflow_storage::JobId;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{OrchestratorError, Result};

/// Work item: run attempt `attempt` of stage `stage_index` for `job_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: JobId,
    pub stage_index: usize,
    pub attempt: u32,
}

/// Settles deliveries on behalf of a queue
pub trait DeliveryAcker: Send + Sync {
    fn ack(&self, message: &TaskMessage);
    fn requeue(&self, message: &TaskMessage, delay: Duration);
}

/// A dequeued message; requeued on drop unless acknowledged
pub struct Delivery {
    message: TaskMessage,
    acker: Arc<dyn DeliveryAcker>,
    settled: bool,
}

impl Delivery {
    pub fn new(message: TaskMessage, acker: Arc<dyn DeliveryAcker>) -> Self {
        Self {
            message,
            acker,
            settled: false,
        }
    }

    pub fn message(&self) -> &TaskMessage {
        &self.message
    }

    pub fn ack(mut self) {
        self.acker.ack(&self.message);
        self.settled = true;
    }

    /// Put the message back, visible again after `delay`
    pub fn requeue_after(mut self, delay: Duration) {
        self.acker.requeue(&self.message, delay);
        self.settled = true;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.acker.requeue(&self.message, Duration::ZERO);
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `message`, deliverable after `delay`
    ///
    /// Returns `false` when an identical message is already queued or in flight.
    async fn enqueue(&self, message: TaskMessage, delay: Duration) -> Result<bool>;

    /// Wait for the next deliverable message
    ///
    /// # Errors
    ///
    /// `QueueClosed` once the queue is closed and drained of ready messages
    async fn dequeue(&self) -> Result<Delivery>;

    fn close(&self);

    /// Messages waiting (ready or delayed), excluding in-flight ones
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskMessage>,
    delayed: BinaryHeap<Reverse<(Instant, u64, TaskMessage)>>,
    /// Queued or in flight; used to drop duplicate enqueues
    outstanding: HashSet<TaskMessage>,
    seq: u64,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((due, _, _))) = self.delayed.peek() {
            if *due > now {
                break;
            }
            if let Some(Reverse((_, _, message))) = self.delayed.pop() {
                self.ready.push_back(message);
            }
        }
    }

    fn push(&mut self, message: TaskMessage, delay: Duration) {
        if delay.is_zero() {
            self.ready.push_back(message);
        } else {
            self.seq += 1;
            self.delayed
                .push(Reverse((Instant::now() + delay, self.seq, message)));
        }
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DeliveryAcker for QueueInner {
    fn ack(&self, message: &TaskMessage) {
        self.state.lock().outstanding.remove(message);
    }

    fn requeue(&self, message: &TaskMessage, delay: Duration) {
        let mut state = self.state.lock();
        if state.closed {
            state.outstanding.remove(message);
            return;
        }
        state.push(*message, delay);
        drop(state);
        self.notify.notify_one();
    }
}

/// FIFO in-process queue with delayed (backoff) delivery
#[derive(Clone)]
pub struct InMemoryTaskQueue {
    inner: Arc<QueueInner>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Messages delivered but not yet settled
    pub fn in_flight(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .outstanding
            .len()
            .saturating_sub(state.ready.len() + state.delayed.len())
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, message: TaskMessage, delay: Duration) -> Result<bool> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(OrchestratorError::QueueClosed);
            }
            if !state.outstanding.insert(message) {
                return Ok(false);
            }
            state.push(message, delay);
        }
        self.inner.notify.notify_one();
        Ok(true)
    }

    async fn dequeue(&self) -> Result<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.inner.state.lock();
                state.promote_due(Instant::now());
                if let Some(message) = state.ready.pop_front() {
                    let acker: Arc<dyn DeliveryAcker> = self.inner.clone();
                    return Ok(Delivery::new(message, acker));
                }
                if state.closed {
                    return Err(OrchestratorError::QueueClosed);
                }
                state.delayed.peek().map(|Reverse((due, _, _))| *due)
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.delayed.clear();
        }
        self.inner.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.ready.len() + state.delayed.len()
    }
}
