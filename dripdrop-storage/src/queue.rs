//! At-least-once message queues with a dead-letter list per queue

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

/// A received message. Must be acked, nacked or dead-lettered by its receipt.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub receipt: u64,
    pub body: Bytes,
    /// 1 on first delivery
    pub receive_count: u32,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: Bytes,
    pub receive_count: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, returning its id
    async fn send(&self, queue: &str, body: Bytes) -> Result<String>;

    /// Take up to `max` messages, waiting up to `wait` for the first one
    async fn receive(&self, queue: &str, max: usize, wait: Duration) -> Result<Vec<Delivery>>;

    async fn ack(&self, queue: &str, receipt: u64) -> Result<()>;

    /// Return a message for redelivery. Once it has been received
    /// `max_receives` times it goes to the dead-letter list instead.
    async fn nack(&self, queue: &str, receipt: u64) -> Result<()>;

    async fn dead_letter(&self, queue: &str, receipt: u64, reason: &str) -> Result<()>;

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>>;

    /// Messages waiting plus messages in flight
    async fn depth(&self, queue: &str) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct Message {
    id: String,
    body: Bytes,
    receive_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: HashMap<u64, Message>,
    dead: Vec<DeadLetter>,
}

#[derive(Default)]
struct QueueSlot {
    state: Mutex<QueueState>,
    notify: Notify,
}

pub struct MemoryQueue {
    queues: DashMap<String, Arc<QueueSlot>>,
    next_receipt: AtomicU64,
    next_message: AtomicU64,
    max_receives: u32,
}

impl MemoryQueue {
    pub fn new(max_receives: u32) -> Self {
        Self {
            queues: DashMap::new(),
            next_receipt: AtomicU64::new(1),
            next_message: AtomicU64::new(1),
            max_receives: max_receives.max(1),
        }
    }

    fn slot(&self, queue: &str) -> Arc<QueueSlot> {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueSlot::default()))
            .clone()
    }

    fn take_in_flight(&self, queue: &str, state: &mut QueueState, receipt: u64) -> Result<Message> {
        state
            .in_flight
            .remove(&receipt)
            .ok_or_else(|| StorageError::NotFound(format!("receipt {} on queue {}", receipt, queue)))
    }
}

fn bury(state: &mut QueueState, message: Message, reason: &str) {
    state.dead.push(DeadLetter {
        message_id: message.id,
        body: message.body,
        receive_count: message.receive_count,
        reason: reason.to_string(),
        dead_lettered_at: Utc::now(),
    });
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, queue: &str, body: Bytes) -> Result<String> {
        let id = format!("msg-{}", self.next_message.fetch_add(1, Ordering::SeqCst));
        let slot = self.slot(queue);
        slot.state.lock().ready.push_back(Message {
            id: id.clone(),
            body,
            receive_count: 0,
        });
        slot.notify.notify_one();
        debug!(queue, message_id = %id, "enqueued message");
        Ok(id)
    }

    async fn receive(&self, queue: &str, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let slot = self.slot(queue);
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut state = slot.state.lock();
                let mut batch = Vec::new();
                while batch.len() < max.max(1) {
                    let Some(mut message) = state.ready.pop_front() else { break };
                    message.receive_count += 1;
                    let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst);
                    batch.push(Delivery {
                        message_id: message.id.clone(),
                        receipt,
                        body: message.body.clone(),
                        receive_count: message.receive_count,
                    });
                    state.in_flight.insert(receipt, message);
                }
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, slot.notify.notified()).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, queue: &str, receipt: u64) -> Result<()> {
        let slot = self.slot(queue);
        let mut state = slot.state.lock();
        self.take_in_flight(queue, &mut state, receipt)?;
        Ok(())
    }

    async fn nack(&self, queue: &str, receipt: u64) -> Result<()> {
        let slot = self.slot(queue);
        {
            let mut state = slot.state.lock();
            let message = self.take_in_flight(queue, &mut state, receipt)?;
            if message.receive_count >= self.max_receives {
                warn!(
                    queue,
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    "max receives exceeded, dead-lettering"
                );
                bury(&mut state, message, "max receives exceeded");
                return Ok(());
            }
            state.ready.push_back(message);
        }
        slot.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, queue: &str, receipt: u64, reason: &str) -> Result<()> {
        let slot = self.slot(queue);
        let mut state = slot.state.lock();
        let message = self.take_in_flight(queue, &mut state, receipt)?;
        warn!(queue, message_id = %message.id, reason, "dead-lettering message");
        bury(&mut state, message, reason);
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        Ok(self.slot(queue).state.lock().dead.clone())
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let slot = self.slot(queue);
        let state = slot.state.lock();
        Ok(state.ready.len() + state.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_send_receive_ack() {
        let queue = MemoryQueue::new(3);
        queue.send("q", Bytes::from_static(b"a")).await.unwrap();
        queue.send("q", Bytes::from_static(b"b")).await.unwrap();

        let batch = queue.receive("q", 10, WAIT).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, Bytes::from_static(b"a"));
        assert_eq!(batch[0].receive_count, 1);
        assert_eq!(queue.depth("q").await.unwrap(), 2);

        for d in &batch {
            queue.ack("q", d.receipt).await.unwrap();
        }
        assert_eq!(queue.depth("q").await.unwrap(), 0);
        assert!(queue.ack("q", batch[0].receipt).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let queue = MemoryQueue::new(3);
        assert!(queue.receive("empty", 1, WAIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let queue = Arc::new(MemoryQueue::new(3));
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive("q", 1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.send("q", Bytes::from_static(b"late")).await.unwrap();
        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let queue = MemoryQueue::new(2);
        let id = queue.send("q", Bytes::from_static(b"x")).await.unwrap();

        let first = queue.receive("q", 1, WAIT).await.unwrap().remove(0);
        queue.nack("q", first.receipt).await.unwrap();

        let second = queue.receive("q", 1, WAIT).await.unwrap().remove(0);
        assert_eq!(second.message_id, id);
        assert_eq!(second.receive_count, 2);
        queue.nack("q", second.receipt).await.unwrap();

        assert!(queue.receive("q", 1, WAIT).await.unwrap().is_empty());
        let dead = queue.dead_letters("q").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_explicit_dead_letter() {
        let queue = MemoryQueue::new(5);
        queue.send("q", Bytes::from_static(b"poison")).await.unwrap();
        let d = queue.receive("q", 1, WAIT).await.unwrap().remove(0);
        queue.dead_letter("q", d.receipt, "Missing 'imagePath'").await.unwrap();

        let dead = queue.dead_letters("q").await.unwrap();
        assert_eq!(dead[0].reason, "Missing 'imagePath'");
        assert_eq!(queue.depth("q").await.unwrap(), 0);
    }
}
