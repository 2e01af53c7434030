//! Encoded-frame fan-out.
//!
//! One capture loop publishes; any number of stream connections subscribe.
//! Every subscriber owns a small bounded queue. When a queue is full the new
//! frame is dropped for that subscriber only, so order is preserved and a slow
//! reader never stalls the loop or its peers.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::encode::EncodedFrame;

struct Slot {
    id: u64,
    tx: Sender<Arc<EncodedFrame>>,
}

pub struct FrameBroadcaster {
    buffer: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    slots: Mutex<Vec<Slot>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Outcome of one `Subscription::recv_timeout` call.
#[derive(Debug)]
pub enum Received {
    Frame(Arc<EncodedFrame>),
    Timeout,
    Closed,
}

impl FrameBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            slots: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach a new consumer. A closed broadcaster hands out an already-closed
    /// subscription.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(self.buffer);
        {
            let mut slots = self.slots();
            if !self.closed.load(Ordering::Acquire) {
                slots.push(Slot { id, tx });
            }
        }
        log::info!("stream subscriber {} attached", id);
        Subscription {
            id,
            rx,
            owner: Arc::clone(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|s| s.id != id);
        if slots.len() != before {
            log::info!("stream subscriber {} detached", id);
        }
    }

    /// Push a frame to every live subscriber without blocking.
    pub fn publish(&self, frame: EncodedFrame) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let frame = Arc::new(frame);
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots();
        slots.retain(|slot| match slot.tx.try_send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("subscriber {} lagging; frame {} dropped", slot.id, frame.seq);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// End every subscription and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut slots = self.slots();
        if !slots.is_empty() {
            log::info!("closing {} stream subscription(s)", slots.len());
        }
        slots.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots().len()
    }

    pub fn frames_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live consumer. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: Receiver<Arc<EncodedFrame>>,
    owner: Arc<FrameBroadcaster>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Received {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Received::Frame(frame),
            Err(RecvTimeoutError::Timeout) => Received::Timeout,
            Err(RecvTimeoutError::Disconnected) => Received::Closed,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.owner.unsubscribe(self.id);
    }
}
