//! Priority queue of outbound modem traffic.
//!
//! Items are drained strictly in `(priority, enqueued_at, seq)` order: SBD
//! messages before file transfers, FIFO within a tier. A message that fails
//! persistently is requeued once at the deprioritised retry tier before
//! being surfaced as critical.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::modem::Outbound;

/// Mobile-originated SBD messages — quickest, carry the key data.
pub const PRIORITY_SBD_MO: u8 = 1;
/// File transfers over a RUDICS data call.
pub const PRIORITY_FILE_MO: u8 = 2;
/// Reserved for mobile-terminated collection.
pub const PRIORITY_SBD_MT: u8 = 3;
/// Tier for messages requeued after a persistent MO failure.
pub const PRIORITY_RETRY: u8 = 5;

/// A queued outbound item with its ordering key.
#[derive(Debug)]
pub struct QueuedItem {
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub seq: u64,
    /// Set once the item has been through the retry tier; the next
    /// persistent failure surfaces as critical instead of requeueing.
    pub retried: bool,
    pub item: Outbound,
}

impl QueuedItem {
    fn key(&self) -> (u8, DateTime<Utc>, u64) {
        (self.priority, self.enqueued_at, self.seq)
    }
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap max-heap pops the smallest key first.
impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.key().cmp(&self.key())
    }
}

/// Thread-safe outbound queue shared by tasks (producers) and the modem
/// worker (single consumer).
pub struct MessageQueue {
    inner: Mutex<BinaryHeap<QueuedItem>>,
    available: Condvar,
    seq: AtomicU64,
    mt_pending: AtomicBool,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            seq: AtomicU64::new(0),
            mt_pending: AtomicBool::new(false),
        }
    }

    /// Enqueue an item at the given priority tier.
    pub fn push(&self, priority: u8, item: Outbound) {
        let entry = QueuedItem {
            priority,
            enqueued_at: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            retried: false,
            item,
        };
        self.push_entry(entry);
    }

    /// Put an item back unchanged after a transient failure. It keeps its
    /// original key and so stays at the head of its tier.
    pub fn push_back(&self, entry: QueuedItem) {
        self.push_entry(entry);
    }

    /// Requeue after a persistent MO failure: dropped to the retry tier and
    /// marked so a second failure is surfaced instead of requeued again.
    pub fn requeue(&self, mut entry: QueuedItem) {
        entry.priority = PRIORITY_RETRY;
        entry.retried = true;
        self.push_entry(entry);
    }

    fn push_entry(&self, entry: QueuedItem) {
        self.inner.lock().push(entry);
        self.available.notify_one();
    }

    /// Pop the item with the smallest `(priority, enqueued_at, seq)` key,
    /// waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<QueuedItem> {
        let mut inner = self.inner.lock();
        if inner.is_empty() {
            self.available.wait_for(&mut inner, timeout);
        }
        inner.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Whether the gateway reported queued MT messages still to collect.
    #[must_use]
    pub fn mt_pending(&self) -> bool {
        self.mt_pending.load(Ordering::Relaxed)
    }

    pub fn set_mt_pending(&self, pending: bool) {
        self.mt_pending.store(pending, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::SbdMessage;
    use std::path::PathBuf;

    fn sbd(text: &str) -> Outbound {
        Outbound::Sbd(SbdMessage::text(text))
    }

    fn payload(item: &Outbound) -> &[u8] {
        match item {
            Outbound::Sbd(msg) => &msg.payload,
            Outbound::File(_) => panic!("expected SBD"),
        }
    }

    #[test]
    fn test_priority_order() {
        let queue = MessageQueue::new();
        queue.push(PRIORITY_FILE_MO, Outbound::File(PathBuf::from("track.dat")));
        queue.push(PRIORITY_SBD_MO, sbd("first"));
        queue.push(PRIORITY_SBD_MO, sbd("second"));

        let a = queue.pop(Duration::ZERO).unwrap();
        assert_eq!(payload(&a.item), b"first");
        let b = queue.pop(Duration::ZERO).unwrap();
        assert_eq!(payload(&b.item), b"second");
        let c = queue.pop(Duration::ZERO).unwrap();
        assert!(matches!(c.item, Outbound::File(_)));
        assert!(queue.pop(Duration::ZERO).is_none());
    }

    #[test]
    fn test_fifo_within_tier() {
        let queue = MessageQueue::new();
        for i in 0..5 {
            queue.push(PRIORITY_SBD_MO, sbd(&format!("m{i}")));
        }
        for i in 0..5 {
            let entry = queue.pop(Duration::ZERO).unwrap();
            assert_eq!(payload(&entry.item), format!("m{i}").as_bytes());
        }
    }

    #[test]
    fn test_requeue_drops_to_retry_tier() {
        let queue = MessageQueue::new();
        queue.push(PRIORITY_SBD_MO, sbd("flaky"));
        let entry = queue.pop(Duration::ZERO).unwrap();
        assert!(!entry.retried);

        queue.requeue(entry);
        queue.push(PRIORITY_FILE_MO, Outbound::File(PathBuf::from("f")));

        // The fresh file transfer now outranks the requeued message.
        assert!(matches!(
            queue.pop(Duration::ZERO).unwrap().item,
            Outbound::File(_)
        ));
        let retry = queue.pop(Duration::ZERO).unwrap();
        assert_eq!(retry.priority, PRIORITY_RETRY);
        assert!(retry.retried);
    }

    #[test]
    fn test_push_back_keeps_position() {
        let queue = MessageQueue::new();
        queue.push(PRIORITY_SBD_MO, sbd("head"));
        queue.push(PRIORITY_SBD_MO, sbd("tail"));

        let head = queue.pop(Duration::ZERO).unwrap();
        queue.push_back(head);

        assert_eq!(payload(&queue.pop(Duration::ZERO).unwrap().item), b"head");
        assert_eq!(payload(&queue.pop(Duration::ZERO).unwrap().item), b"tail");
    }

    #[test]
    fn test_pop_timeout_on_empty() {
        let queue = MessageQueue::new();
        let start = std::time::Instant::now();
        assert!(queue.pop(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_mt_pending_flag() {
        let queue = MessageQueue::new();
        assert!(!queue.mt_pending());
        queue.set_mt_pending(true);
        assert!(queue.mt_pending());
        queue.set_mt_pending(false);
        assert!(!queue.mt_pending());
    }
}
