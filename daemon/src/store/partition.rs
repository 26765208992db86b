//! Partition storage. Every partition exposes the same capability set;
//! two implementations exist: [`ListStorage`] keeps records as shared
//! allocations, [`CompactStorage`] packs them into serialized chunks and
//! decodes on read, trading read cost for per-record memory.

use crate::record::LogRecord;
use bytes::{Buf, BufMut};
use loghub_utils::partition::{PartitionId, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

pub trait PartitionStorage: Send + Sync {
    fn append(&mut self, record: Arc<LogRecord>);

    /// Removes and returns the oldest record.
    fn evict_oldest(&mut self) -> Option<Arc<LogRecord>>;

    /// Removes and returns the oldest record matching `pred`.
    fn evict_oldest_matching(
        &mut self,
        pred: &dyn Fn(&LogRecord) -> bool,
    ) -> Option<Arc<LogRecord>>;

    /// Removes every record matching `pred`, returning them oldest first.
    fn evict_matching(&mut self, pred: &dyn Fn(&LogRecord) -> bool) -> Vec<Arc<LogRecord>>;

    /// Records with `after_seq < sequence <= stop_seq`, oldest first, at
    /// most `max` of them.
    fn range(&self, after_seq: u64, stop_seq: u64, max: usize) -> Vec<Arc<LogRecord>>;

    /// Bytes currently charged against the partition quota.
    fn byte_usage(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default storage: a deque of shared records.
#[derive(Default)]
pub struct ListStorage {
    records: VecDeque<Arc<LogRecord>>,
    bytes: usize,
}

impl ListStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first record with sequence greater than `after_seq`.
    fn first_after(&self, after_seq: u64) -> usize {
        self.records
            .binary_search_by(|r| {
                if r.sequence <= after_seq {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .unwrap_err()
    }
}

impl PartitionStorage for ListStorage {
    fn append(&mut self, record: Arc<LogRecord>) {
        self.bytes += record.charged_bytes();
        self.records.push_back(record);
    }

    fn evict_oldest(&mut self) -> Option<Arc<LogRecord>> {
        let record = self.records.pop_front()?;
        self.bytes -= record.charged_bytes();
        Some(record)
    }

    fn evict_oldest_matching(
        &mut self,
        pred: &dyn Fn(&LogRecord) -> bool,
    ) -> Option<Arc<LogRecord>> {
        let idx = self.records.iter().position(|r| pred(r))?;
        let record = self.records.remove(idx)?;
        self.bytes -= record.charged_bytes();
        Some(record)
    }

    fn evict_matching(&mut self, pred: &dyn Fn(&LogRecord) -> bool) -> Vec<Arc<LogRecord>> {
        let mut evicted = Vec::new();
        self.records.retain(|r| {
            if pred(r) {
                evicted.push(r.clone());
                false
            } else {
                true
            }
        });
        for record in &evicted {
            self.bytes -= record.charged_bytes();
        }
        evicted
    }

    fn range(&self, after_seq: u64, stop_seq: u64, max: usize) -> Vec<Arc<LogRecord>> {
        self.records
            .iter()
            .skip(self.first_after(after_seq))
            .take_while(|r| r.sequence <= stop_seq)
            .take(max)
            .cloned()
            .collect()
    }

    fn byte_usage(&self) -> usize {
        self.bytes
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

const ENCODED_RECORD_HEADER: usize = 8 + 4 + 4 + 4 + 4 + 4 + 1 + 2;
const CHUNK_TARGET: usize = 16 * 1024;

struct Chunk {
    data: Vec<u8>,
    records: usize,
}

/// Compacted storage: records serialized back to back in chunks.
pub struct CompactStorage {
    partition: PartitionId,
    chunks: VecDeque<Chunk>,
    bytes: usize,
    records: usize,
}

impl CompactStorage {
    pub fn new(partition: PartitionId) -> Self {
        CompactStorage {
            partition,
            chunks: VecDeque::new(),
            bytes: 0,
            records: 0,
        }
    }

    fn encode(record: &LogRecord, buf: &mut Vec<u8>) {
        buf.put_u64_le(record.sequence);
        buf.put_u32_le(record.realtime.sec);
        buf.put_u32_le(record.realtime.nsec);
        buf.put_u32_le(record.uid);
        buf.put_u32_le(record.pid);
        buf.put_u32_le(record.tid);
        buf.put_u8(record.priority);
        buf.put_u16_le(record.payload.len() as u16);
        buf.put_slice(&record.payload);
    }

    /// Decodes the record starting at `offset`, returning it and the
    /// offset past it.
    fn decode(&self, data: &[u8], offset: usize) -> (LogRecord, usize) {
        let mut buf = &data[offset..];
        let sequence = buf.get_u64_le();
        let realtime = Timestamp::new(buf.get_u32_le(), buf.get_u32_le());
        let uid = buf.get_u32_le();
        let pid = buf.get_u32_le();
        let tid = buf.get_u32_le();
        let priority = buf.get_u8();
        let len = buf.get_u16_le() as usize;
        let start = offset + ENCODED_RECORD_HEADER;
        let record = LogRecord {
            partition: self.partition,
            sequence,
            realtime,
            uid,
            pid,
            tid,
            priority,
            payload: data[start..start + len].to_vec(),
        };
        (record, start + len)
    }

    fn remove_at(&mut self, chunk_idx: usize, offset: usize) -> Arc<LogRecord> {
        let (record, end) = {
            let chunk = &self.chunks[chunk_idx];
            self.decode(&chunk.data, offset)
        };
        let chunk = &mut self.chunks[chunk_idx];
        chunk.data.drain(offset..end);
        chunk.records -= 1;
        if chunk.records == 0 {
            self.chunks.remove(chunk_idx);
        }
        self.bytes -= record.charged_bytes();
        self.records -= 1;
        Arc::new(record)
    }

    fn find_oldest_matching(&self, pred: &dyn Fn(&LogRecord) -> bool) -> Option<(usize, usize)> {
        for (chunk_idx, chunk) in self.chunks.iter().enumerate() {
            let mut offset = 0;
            while offset < chunk.data.len() {
                let (record, end) = self.decode(&chunk.data, offset);
                if pred(&record) {
                    return Some((chunk_idx, offset));
                }
                offset = end;
            }
        }
        None
    }
}

impl PartitionStorage for CompactStorage {
    fn append(&mut self, record: Arc<LogRecord>) {
        let needs_chunk = match self.chunks.back() {
            Some(chunk) => chunk.data.len() >= CHUNK_TARGET,
            None => true,
        };
        if needs_chunk {
            self.chunks.push_back(Chunk {
                data: Vec::with_capacity(CHUNK_TARGET),
                records: 0,
            });
        }
        let chunk = self.chunks.back_mut().unwrap();
        Self::encode(&record, &mut chunk.data);
        chunk.records += 1;
        self.bytes += record.charged_bytes();
        self.records += 1;
    }

    fn evict_oldest(&mut self) -> Option<Arc<LogRecord>> {
        if self.chunks.is_empty() {
            return None;
        }
        Some(self.remove_at(0, 0))
    }

    fn evict_oldest_matching(
        &mut self,
        pred: &dyn Fn(&LogRecord) -> bool,
    ) -> Option<Arc<LogRecord>> {
        let (chunk_idx, offset) = self.find_oldest_matching(pred)?;
        Some(self.remove_at(chunk_idx, offset))
    }

    fn evict_matching(&mut self, pred: &dyn Fn(&LogRecord) -> bool) -> Vec<Arc<LogRecord>> {
        let mut evicted = Vec::new();
        let mut chunk_idx = 0;
        while chunk_idx < self.chunks.len() {
            let mut kept = Vec::with_capacity(self.chunks[chunk_idx].data.len());
            let mut kept_records = 0;
            let mut offset = 0;
            while offset < self.chunks[chunk_idx].data.len() {
                let (record, end) = self.decode(&self.chunks[chunk_idx].data, offset);
                if pred(&record) {
                    self.bytes -= record.charged_bytes();
                    self.records -= 1;
                    evicted.push(Arc::new(record));
                } else {
                    kept.extend_from_slice(&self.chunks[chunk_idx].data[offset..end]);
                    kept_records += 1;
                }
                offset = end;
            }
            if kept_records == 0 {
                self.chunks.remove(chunk_idx);
            } else {
                self.chunks[chunk_idx].data = kept;
                self.chunks[chunk_idx].records = kept_records;
                chunk_idx += 1;
            }
        }
        evicted
    }

    fn range(&self, after_seq: u64, stop_seq: u64, max: usize) -> Vec<Arc<LogRecord>> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            let mut offset = 0;
            while offset < chunk.data.len() {
                let (record, end) = self.decode(&chunk.data, offset);
                offset = end;
                if record.sequence <= after_seq {
                    continue;
                }
                if record.sequence > stop_seq || out.len() == max {
                    return out;
                }
                out.push(Arc::new(record));
            }
        }
        out
    }

    fn byte_usage(&self) -> usize {
        self.bytes
    }

    fn len(&self) -> usize {
        self.records
    }
}
