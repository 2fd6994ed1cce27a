use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::models::QueueEntry;

/// Result of asking for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was reserved; the caller must start the job.
    Admitted,
    /// No slot; the entry waits at this 1-indexed position.
    Queued(usize),
}

#[derive(Debug, Default)]
struct QueueInner {
    active: usize,
    entries: VecDeque<QueueEntry>,
}

/// Bounded FIFO gatekeeper. One mutex guards both the slot counter and the
/// waiting entries; no operation does more than O(n) work under it.
#[derive(Debug)]
pub struct AdmissionQueue {
    max_concurrent: usize,
    inner: Mutex<QueueInner>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // State is a counter plus a deque; both stay consistent across a panic
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Reserves a slot iff fewer than `max_concurrent` are occupied.
    pub fn try_admit(&self) -> bool {
        let mut inner = self.lock();
        if inner.active < self.max_concurrent {
            inner.active += 1;
            true
        } else {
            false
        }
    }

    /// Appends to the tail and returns the 1-indexed position.
    pub fn enqueue(&self, entry: QueueEntry) -> usize {
        let mut inner = self.lock();
        inner.entries.push_back(entry);
        inner.entries.len()
    }

    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.lock().entries.pop_front()
    }

    /// `try_admit` and `enqueue` under one lock acquisition. Entries already
    /// waiting keep precedence over the newcomer.
    pub fn admit_or_enqueue(&self, entry: QueueEntry) -> Admission {
        let mut inner = self.lock();
        if inner.active < self.max_concurrent && inner.entries.is_empty() {
            inner.active += 1;
            Admission::Admitted
        } else {
            inner.entries.push_back(entry);
            Admission::Queued(inner.entries.len())
        }
    }

    /// Frees a slot without handing it on.
    pub fn release(&self) {
        let mut inner = self.lock();
        inner.active = inner.active.saturating_sub(1);
    }

    /// Frees the caller's slot. If an entry is waiting, the slot passes
    /// directly to it and the entry is returned for the caller to start.
    pub fn release_and_next(&self) -> Option<QueueEntry> {
        let mut inner = self.lock();
        match inner.entries.pop_front() {
            Some(entry) => Some(entry),
            None => {
                inner.active = inner.active.saturating_sub(1);
                None
            }
        }
    }

    /// Drops a waiting entry, e.g. when its job is deleted before it runs.
    pub fn remove(&self, scan_id: &Uuid) -> bool {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.scan_id != *scan_id);
        inner.entries.len() != before
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// 1-indexed position, 0 when not queued.
    pub fn position_of(&self, scan_id: &Uuid) -> usize {
        self.lock()
            .entries
            .iter()
            .position(|entry| entry.scan_id == *scan_id)
            .map_or(0, |index| index + 1)
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Every waiting job with its current rank.
    pub fn positions(&self) -> Vec<(Uuid, i32)> {
        self.lock()
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.scan_id, index as i32 + 1))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScannerKind;
    use chrono::Utc;
    use std::sync::Arc;

    fn entry() -> QueueEntry {
        QueueEntry {
            scan_id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            scanner: ScannerKind::LineStream,
            args: None,
            engine_config_id: None,
            queued_at: Utc::now(),
        }
    }

    #[test]
    fn test_admission_bound() {
        let queue = AdmissionQueue::new(2);
        assert!(queue.try_admit());
        assert!(queue.try_admit());
        assert!(!queue.try_admit());

        let waiting = entry();
        assert_eq!(queue.admit_or_enqueue(waiting.clone()), Admission::Queued(1));
        assert_eq!(queue.position_of(&waiting.scan_id), 1);
        assert_eq!(queue.active_count(), 2);
    }

    #[test]
    fn test_fifo_draining_hands_slot_to_head() {
        let queue = AdmissionQueue::new(1);
        assert_eq!(queue.admit_or_enqueue(entry()), Admission::Admitted);

        let (a, b, c) = (entry(), entry(), entry());
        assert_eq!(queue.admit_or_enqueue(a.clone()), Admission::Queued(1));
        assert_eq!(queue.admit_or_enqueue(b.clone()), Admission::Queued(2));
        assert_eq!(queue.admit_or_enqueue(c.clone()), Admission::Queued(3));

        assert_eq!(queue.release_and_next().unwrap().scan_id, a.scan_id);
        assert_eq!(queue.active_count(), 1);
        assert_eq!(queue.release_and_next().unwrap().scan_id, b.scan_id);
        assert_eq!(queue.release_and_next().unwrap().scan_id, c.scan_id);
        assert!(queue.release_and_next().is_none());
        assert_eq!(queue.active_count(), 0);
    }

    #[test]
    fn test_positions_follow_rank_after_dequeue_and_remove() {
        let queue = AdmissionQueue::new(1);
        let entries: Vec<QueueEntry> = (0..4).map(|_| entry()).collect();
        for e in &entries {
            queue.enqueue(e.clone());
        }

        queue.dequeue();
        queue.remove(&entries[2].scan_id);

        let positions = queue.positions();
        assert_eq!(
            positions,
            vec![(entries[1].scan_id, 1), (entries[3].scan_id, 2)]
        );
        assert_eq!(queue.position_of(&entries[3].scan_id), 2);
        assert_eq!(queue.position_of(&entries[0].scan_id), 0);
        assert!(!queue.remove(&entries[0].scan_id));
    }

    #[test]
    fn test_waiting_entries_keep_precedence() {
        let queue = AdmissionQueue::new(1);
        let waiting = entry();
        queue.enqueue(waiting.clone());

        // A free slot does not let a newcomer overtake the waiting entry
        assert_eq!(queue.admit_or_enqueue(entry()), Admission::Queued(2));
        assert_eq!(queue.snapshot()[0].scan_id, waiting.scan_id);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_bound() {
        let queue = Arc::new(AdmissionQueue::new(3));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.admit_or_enqueue(entry()))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a == Admission::Admitted)
            .count();

        assert_eq!(admitted, 3);
        assert_eq!(queue.active_count(), 3);
        assert_eq!(queue.size(), 13);
    }
}
