//! Live reader subscriptions. Each egress connection registers a
//! [`ReaderState`] here; writers wake matching readers after every append,
//! and the prune path reports evictions that passed a reader's cursor so
//! the gap can be surfaced to the subscriber as drops.

use crate::error::StoreError;
use crate::record::LogRecord;
use loghub_utils::partition::PartitionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub mask: u32,
    pub uid: Option<u32>,
    pub pid: Option<u32>,
    /// Minimum priority for text partitions; binary partitions ignore it.
    pub min_priority: Option<u8>,
}

#[derive(Default)]
struct DropState {
    count: usize,
    uid: Option<u32>,
    mixed: bool,
}

impl DropState {
    fn note(&mut self, uid: u32) {
        self.count += 1;
        match self.uid {
            None if !self.mixed => self.uid = Some(uid),
            Some(prev) if prev != uid => {
                self.uid = None;
                self.mixed = true;
            }
            _ => {}
        }
    }
}

/// A span of records a subscription missed on one partition, and the uid
/// responsible when a single one was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedSpan {
    pub partition: PartitionId,
    pub count: usize,
    pub uid: Option<u32>,
}

pub struct ReaderState {
    handle: u64,
    opts: ReaderOptions,
    /// Sequence of the newest record this subscription has been handed.
    watermark: AtomicU64,
    drops: Mutex<[DropState; PartitionId::COUNT]>,
    cancelled: AtomicBool,
    notify: Notify,
}

impl ReaderState {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.opts
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        if self.opts.mask & record.partition.mask_bit() == 0 {
            return false;
        }
        if self.opts.uid.is_some_and(|uid| uid != record.uid) {
            return false;
        }
        if self.opts.pid.is_some_and(|pid| pid != record.pid) {
            return false;
        }
        if !record.partition.is_binary() {
            if let Some(min) = self.opts.min_priority {
                if record.priority < min {
                    return false;
                }
            }
        }
        true
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Advances the delivery cursor; never moves it backwards.
    pub fn advance_watermark(&self, sequence: u64) {
        self.watermark.fetch_max(sequence, Ordering::AcqRel);
    }

    fn note_drop(&self, record: &LogRecord) {
        self.drops.lock()[record.partition.tag() as usize].note(record.uid);
    }

    /// Drains the pending dropped spans, one per affected partition.
    pub fn take_dropped_spans(&self) -> Vec<DroppedSpan> {
        let mut drops = self.drops.lock();
        let mut spans = Vec::new();
        for partition in PartitionId::ALL {
            let state = &mut drops[partition.tag() as usize];
            if state.count > 0 {
                spans.push(DroppedSpan {
                    partition,
                    count: state.count,
                    uid: state.uid,
                });
                *state = DropState::default();
            }
        }
        spans
    }

    pub fn dropped_total(&self) -> usize {
        self.drops.lock().iter().map(|s| s.count).sum()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Parks until a writer wakes this subscription or it is cancelled.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

pub struct ReaderRegistry {
    subs: Mutex<HashMap<u64, Arc<ReaderState>>>,
    next_handle: AtomicU64,
    max_subscriptions: usize,
}

impl ReaderRegistry {
    pub fn new(max_subscriptions: usize) -> Self {
        ReaderRegistry {
            subs: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            max_subscriptions,
        }
    }

    pub fn register(&self, opts: ReaderOptions) -> Result<Arc<ReaderState>, StoreError> {
        let mut subs = self.subs.lock();
        if subs.len() >= self.max_subscriptions {
            return Err(StoreError::Resource(self.max_subscriptions));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ReaderState {
            handle,
            opts,
            watermark: AtomicU64::new(0),
            drops: Mutex::new(Default::default()),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        });
        subs.insert(handle, state.clone());
        Ok(state)
    }

    pub fn unregister(&self, handle: u64) {
        self.subs.lock().remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every subscription whose mask covers `partition`.
    pub fn notify_partition(&self, partition: PartitionId) {
        for state in self.subs.lock().values() {
            if state.opts.mask & partition.mask_bit() != 0 {
                state.notify.notify_one();
            }
        }
    }

    /// Called by the prune path for each evicted record: any subscription
    /// that would have served it but has not yet passed it records a drop.
    pub fn observe_eviction(&self, record: &LogRecord) {
        for state in self.subs.lock().values() {
            if state.watermark() < record.sequence && state.matches(record) {
                state.note_drop(record);
            }
        }
    }

    pub fn cancel_all(&self) {
        for state in self.subs.lock().values() {
            state.cancel();
        }
    }
}
