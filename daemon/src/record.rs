use loghub_utils::partition::{PartitionId, Timestamp};
use loghub_utils::wire;

/// Accounting overhead charged per resident record on top of its payload,
/// approximating the header and bookkeeping cost.
pub const RECORD_OVERHEAD: usize = 32;

/// One immutable record. Shared as `Arc<LogRecord>` between the owning
/// partition and in-flight reader batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: PartitionId,
    /// Store-assigned, strictly increasing across all partitions.
    pub sequence: u64,
    pub realtime: Timestamp,
    pub uid: u32,
    pub pid: u32,
    pub tid: u32,
    /// Priority byte of text records; 0 on binary partitions.
    pub priority: u8,
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Bytes this record counts against its partition quota.
    pub fn charged_bytes(&self) -> usize {
        self.payload.len() + RECORD_OVERHEAD
    }

    /// Event tag of a binary-partition record.
    pub fn event_tag(&self) -> Option<u32> {
        if self.partition.is_binary() {
            wire::event_tag(&self.payload)
        } else {
            None
        }
    }
}
