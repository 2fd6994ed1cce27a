use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::models::ScanProgress;

/// One message on a scan's progress channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Progress(ScanProgress),
    Log {
        scan_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },
    HostDiscovered {
        scan_id: Uuid,
        host: String,
        total_hosts: usize,
        timestamp: DateTime<Utc>,
    },
    PortDiscovered {
        scan_id: Uuid,
        port: u16,
        protocol: String,
        service: Option<String>,
        total_ports: usize,
        timestamp: DateTime<Utc>,
    },
}

impl ScanEvent {
    pub fn scan_id(&self) -> Uuid {
        match self {
            ScanEvent::Progress(progress) => progress.scan_id,
            ScanEvent::Log { scan_id, .. }
            | ScanEvent::HostDiscovered { scan_id, .. }
            | ScanEvent::PortDiscovered { scan_id, .. } => *scan_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanEvent::Progress(p) if p.status.is_terminal())
    }
}

pub type ObserverId = u64;

/// Receiving half handed to an observer.
#[derive(Debug)]
pub struct Subscription {
    pub id: ObserverId,
    pub scan_id: Uuid,
    pub events: mpsc::Receiver<ScanEvent>,
}

struct Observer {
    id: ObserverId,
    sender: mpsc::Sender<ScanEvent>,
}

/// Fan-out keyed by scan id. Publication never waits: an observer whose
/// buffer is full misses that event, and a dropped observer is pruned.
pub struct ProgressBroadcaster {
    capacity: usize,
    next_id: AtomicU64,
    observers: Mutex<HashMap<Uuid, Vec<Observer>>>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            observers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<Observer>>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, scan_id: Uuid) -> Subscription {
        let (sender, events) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.lock()
            .entry(scan_id)
            .or_default()
            .push(Observer { id, sender });

        tracing::debug!(scan_id = %scan_id, observer_id = id, "progress observer subscribed");
        Subscription {
            id,
            scan_id,
            events,
        }
    }

    pub fn unsubscribe(&self, scan_id: &Uuid, observer_id: ObserverId) -> bool {
        let mut observers = self.lock();
        let Some(list) = observers.get_mut(scan_id) else {
            return false;
        };

        let before = list.len();
        list.retain(|observer| observer.id != observer_id);
        let removed = list.len() != before;
        if list.is_empty() {
            observers.remove(scan_id);
        }
        removed
    }

    /// Delivers to every live observer of the scan; returns how many accepted it.
    pub fn publish(&self, scan_id: &Uuid, event: ScanEvent) -> usize {
        let mut observers = self.lock();
        let Some(list) = observers.get_mut(scan_id) else {
            return 0;
        };

        let mut delivered = 0;
        list.retain(|observer| match observer.sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    scan_id = %scan_id,
                    observer_id = observer.id,
                    "progress observer lagging, event dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if list.is_empty() {
            observers.remove(scan_id);
        }
        delivered
    }

    /// Drops every observer of the scan, ending their streams.
    pub fn close(&self, scan_id: &Uuid) {
        self.lock().remove(scan_id);
    }

    pub fn observer_count(&self, scan_id: &Uuid) -> usize {
        self.lock().get(scan_id).map_or(0, Vec::len)
    }
}
