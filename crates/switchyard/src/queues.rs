//! Bounded consumer queues fed by a session's dispatch loop.
//!
//! The dispatcher never waits on a consumer: a full queue drops the newest
//! item, a closed queue is forgotten.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use switch_transport::{DigestList, IdleTimeoutNotification, PacketIn};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::metrics;

pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("digest {0} already has a consumer")]
    DigestTaken(u32),
    #[error("idle-timeout notifications already have a consumer")]
    IdleTimeoutTaken,
}

/// Result of offering one item to one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Full,
    Closed,
    NoConsumer,
}

pub type PacketFilter = Arc<dyn Fn(&PacketIn) -> bool + Send + Sync>;

/// Receiving end of a consumer queue.
pub struct Consumer<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

impl<T> Consumer<T> {
    /// Next item in arrival order. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }
}

struct PacketConsumer {
    filter: PacketFilter,
    tx: mpsc::Sender<PacketIn>,
}

pub struct ConsumerQueues {
    capacity: usize,
    packets: Mutex<Vec<PacketConsumer>>,
    digests: Mutex<HashMap<u32, mpsc::Sender<DigestList>>>,
    idle_timeouts: Mutex<Option<mpsc::Sender<IdleTimeoutNotification>>>,
}

impl fmt::Debug for ConsumerQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerQueues")
            .field("capacity", &self.capacity)
            .field("packets", &self.packets.lock().len())
            .field("digests", &self.digests.lock().len())
            .finish()
    }
}

impl Default for ConsumerQueues {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ConsumerQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            packets: Mutex::new(Vec::new()),
            digests: Mutex::new(HashMap::new()),
            idle_timeouts: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe_packets(&self, filter: PacketFilter) -> Consumer<PacketIn> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.packets.lock().push(PacketConsumer { filter, tx });
        Consumer { rx }
    }

    /// One consumer per digest id. A consumer whose receiver was dropped
    /// frees the slot.
    pub fn subscribe_digests(&self, digest_id: u32) -> Result<Consumer<DigestList>, QueueError> {
        let mut digests = self.digests.lock();
        if digests.get(&digest_id).is_some_and(|tx| !tx.is_closed()) {
            return Err(QueueError::DigestTaken(digest_id));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        digests.insert(digest_id, tx);
        Ok(Consumer { rx })
    }

    pub fn subscribe_idle_timeouts(&self) -> Result<Consumer<IdleTimeoutNotification>, QueueError> {
        let mut slot = self.idle_timeouts.lock();
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(QueueError::IdleTimeoutTaken);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        *slot = Some(tx);
        Ok(Consumer { rx })
    }

    /// Fan a packet out to every matching consumer. Returns how many took it.
    pub fn dispatch_packet(&self, packet: PacketIn) -> usize {
        let mut packets = self.packets.lock();
        packets.retain(|consumer| !consumer.tx.is_closed());

        let mut matched = 0;
        let mut delivered = 0;
        for consumer in packets.iter().filter(|consumer| (consumer.filter)(&packet)) {
            matched += 1;
            if record("packet", offer(&consumer.tx, packet.clone())) == Delivery::Delivered {
                delivered += 1;
            }
        }
        if matched == 0 {
            record("packet", Delivery::NoConsumer);
        }
        delivered
    }

    pub fn dispatch_digest(&self, digest: DigestList) -> Delivery {
        let mut digests = self.digests.lock();
        let digest_id = digest.digest_id;
        let delivery = match digests.get(&digest_id) {
            Some(tx) => offer(tx, digest),
            None => Delivery::NoConsumer,
        };
        if delivery == Delivery::Closed {
            digests.remove(&digest_id);
        }
        record("digest", delivery)
    }

    pub fn dispatch_idle_timeout(&self, notification: IdleTimeoutNotification) -> Delivery {
        let mut slot = self.idle_timeouts.lock();
        let delivery = match slot.as_ref() {
            Some(tx) => offer(tx, notification),
            None => Delivery::NoConsumer,
        };
        if delivery == Delivery::Closed {
            *slot = None;
        }
        record("idle_timeout", delivery)
    }
}

fn offer<T>(tx: &mpsc::Sender<T>, item: T) -> Delivery {
    match tx.try_send(item) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Full(_)) => Delivery::Full,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

fn record(kind: &'static str, delivery: Delivery) -> Delivery {
    match delivery {
        Delivery::Delivered => {
            metrics::QUEUE_DELIVERED.with_label_values(&[kind]).inc();
        }
        Delivery::Full => {
            warn!(target: "switchyard::session", kind, "consumer queue full; dropping newest");
            metrics::QUEUE_DROPPED.with_label_values(&[kind, "full"]).inc();
        }
        Delivery::Closed => {
            metrics::QUEUE_DROPPED.with_label_values(&[kind, "closed"]).inc();
        }
        Delivery::NoConsumer => {
            warn!(target: "switchyard::session", kind, "no consumer; dropping");
            metrics::QUEUE_DROPPED.with_label_values(&[kind, "no_consumer"]).inc();
        }
    }
    delivery
}
