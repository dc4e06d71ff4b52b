//! Typed, in-process message bus with priority classes and deadlines.
//!
//! One mailbox per address, one consumer per mailbox. Scheduling is strict
//! priority across classes with round-robin across senders inside a class,
//! which preserves FIFO per `(from, to)` pair. Messages whose deadline has
//! passed at dispatch are dropped and counted, except results and
//! reassignments which are never dropped. A background sweeper evicts
//! messages older than the configured TTL.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::metrics::HaosMetrics;
use crate::types::{Address, Message, Priority};
use crate::HaosError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub message_ttl: Duration,
    pub mailbox_capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(300),
            mailbox_capacity: 10_000,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// FIFO queue of messages from one sender.
struct Lane {
    from: Address,
    queue: VecDeque<Message>,
}

/// One strict-priority class: lanes keyed by sender, served round-robin.
#[derive(Default)]
struct ClassQueue {
    lanes: Vec<Lane>,
    cursor: usize,
}

impl ClassQueue {
    fn push(&mut self, msg: Message) {
        match self.lanes.iter_mut().find(|l| l.from == msg.from) {
            Some(lane) => lane.queue.push_back(msg),
            None => self.lanes.push(Lane {
                from: msg.from,
                queue: VecDeque::from([msg]),
            }),
        }
    }

    fn pop(&mut self) -> Option<Message> {
        if self.lanes.is_empty() {
            return None;
        }
        let n = self.lanes.len();
        for offset in 0..n {
            let i = (self.cursor + offset) % n;
            if let Some(msg) = self.lanes[i].queue.pop_front() {
                self.cursor = (i + 1) % n;
                return Some(msg);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(|l| l.queue.len()).sum()
    }
}

struct MailboxQueues {
    classes: [ClassQueue; Priority::CLASSES],
    len: usize,
}

struct Mailbox {
    queues: Mutex<MailboxQueues>,
    notify: Notify,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queues: Mutex::new(MailboxQueues {
                classes: std::array::from_fn(|_| ClassQueue::default()),
                len: 0,
            }),
            notify: Notify::new(),
        }
    }
}

/// Consumer side of one mailbox.
pub struct BusReceiver {
    addr: Address,
    mailbox: Arc<Mailbox>,
    metrics: Arc<HaosMetrics>,
}

impl BusReceiver {
    /// Receive the next dispatchable message, waiting if the mailbox is
    /// empty. Deadline-expired droppable messages are skipped and counted.
    pub async fn recv(&self) -> Message {
        loop {
            if let Some(msg) = self.try_recv() {
                return msg;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&self) -> Option<Message> {
        let now = Utc::now();
        let mut queues = self.mailbox.queues.lock();
        for class in (0..Priority::CLASSES).rev() {
            loop {
                let Some(msg) = queues.classes[class].pop() else {
                    break;
                };
                queues.len -= 1;
                if msg.deadline < now && msg.body.droppable() {
                    tracing::debug!(
                        to = ?self.addr,
                        kind = %msg.body.kind(),
                        "dropping expired message at dispatch"
                    );
                    self.metrics.message_dropped("deadline");
                    continue;
                }
                return Some(msg);
            }
        }
        None
    }

    pub fn addr(&self) -> Address {
        self.addr
    }
}

/// The process-wide bus. Cheap to clone through `Arc`.
pub struct MessageBus {
    mailboxes: DashMap<Address, Arc<Mailbox>>,
    config: BusConfig,
    metrics: Arc<HaosMetrics>,
}

impl MessageBus {
    pub fn new(config: BusConfig, metrics: Arc<HaosMetrics>) -> Self {
        Self {
            mailboxes: DashMap::new(),
            config,
            metrics,
        }
    }

    fn mailbox(&self, addr: Address) -> Arc<Mailbox> {
        self.mailboxes
            .entry(addr)
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }

    /// Publish a message to its destination mailbox.
    pub fn publish(&self, msg: Message) -> Result<(), HaosError> {
        let mailbox = self.mailbox(msg.to);
        {
            let mut queues = mailbox.queues.lock();
            if queues.len >= self.config.mailbox_capacity && msg.body.droppable() {
                self.metrics.message_dropped("overload");
                return Err(HaosError::BusOverload(msg.to));
            }
            let class = msg.priority.class();
            queues.classes[class].push(msg);
            queues.len += 1;
        }
        mailbox.notify.notify_one();
        Ok(())
    }

    /// Attach the consumer for an address. One consumer per address.
    pub fn subscribe(&self, addr: Address) -> BusReceiver {
        BusReceiver {
            addr,
            mailbox: self.mailbox(addr),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Evict messages older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.message_ttl).unwrap_or_default();
        let mut evicted = 0;
        for entry in self.mailboxes.iter() {
            let mut queues = entry.queues.lock();
            for class in queues.classes.iter_mut() {
                for lane in class.lanes.iter_mut() {
                    let before = lane.queue.len();
                    lane.queue
                        .retain(|m| !m.body.droppable() || m.published_at + ttl >= now);
                    evicted += before - lane.queue.len();
                }
            }
            queues.len = queues.classes.iter().map(|c| c.len()).sum();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "bus sweeper evicted expired messages");
            for _ in 0..evicted {
                self.metrics.message_dropped("ttl");
            }
        }
        evicted
    }

    /// Spawn the periodic TTL sweeper.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        let interval = bus.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                bus.sweep();
            }
        })
    }
}
