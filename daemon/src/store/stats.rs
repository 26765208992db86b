//! Per-partition accounting: totals plus per-uid, per-pid and (for binary
//! partitions) per-tag tables. All mutation happens under the store write
//! lock so counters stay consistent with the resident record set; dumps are
//! rendered from a snapshot taken under a read lock.

use crate::record::LogRecord;
use loghub_utils::partition::PartitionId;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Default, Clone, Serialize)]
pub struct EntityStats {
    pub bytes: usize,
    pub records: usize,
    pub drops: usize,
}

impl EntityStats {
    fn add(&mut self, bytes: usize) {
        self.bytes += bytes;
        self.records += 1;
    }

    fn sub(&mut self, bytes: usize) {
        self.bytes -= bytes;
        self.records -= 1;
    }
}

#[derive(Default)]
struct PartitionStats {
    totals: EntityStats,
    by_uid: HashMap<u32, EntityStats>,
    by_pid: HashMap<u32, EntityStats>,
    by_tag: HashMap<u32, EntityStats>,
}

#[derive(Default)]
pub struct Statistics {
    partitions: [PartitionStats; PartitionId::COUNT],
}

impl Statistics {
    fn partition_mut(&mut self, partition: PartitionId) -> &mut PartitionStats {
        &mut self.partitions[partition.tag() as usize]
    }

    fn partition(&self, partition: PartitionId) -> &PartitionStats {
        &self.partitions[partition.tag() as usize]
    }

    pub fn add(&mut self, record: &LogRecord) {
        let bytes = record.charged_bytes();
        let tag = record.event_tag();
        let stats = self.partition_mut(record.partition);
        stats.totals.add(bytes);
        stats.by_uid.entry(record.uid).or_default().add(bytes);
        stats.by_pid.entry(record.pid).or_default().add(bytes);
        if let Some(tag) = tag {
            stats.by_tag.entry(tag).or_default().add(bytes);
        }
    }

    /// Removes a record from the accounting without marking a drop
    /// (administrative clear).
    pub fn sub(&mut self, record: &LogRecord) {
        let bytes = record.charged_bytes();
        let tag = record.event_tag();
        let stats = self.partition_mut(record.partition);
        stats.totals.sub(bytes);
        if let Some(entry) = stats.by_uid.get_mut(&record.uid) {
            entry.sub(bytes);
        }
        if let Some(entry) = stats.by_pid.get_mut(&record.pid) {
            entry.sub(bytes);
        }
        if let Some(tag) = tag {
            if let Some(entry) = stats.by_tag.get_mut(&tag) {
                entry.sub(bytes);
            }
        }
    }

    /// Removes a pruned record and charges the drop to its owner.
    pub fn drop_record(&mut self, record: &LogRecord) {
        self.sub(record);
        let stats = self.partition_mut(record.partition);
        stats.totals.drops += 1;
        stats.by_uid.entry(record.uid).or_default().drops += 1;
        stats.by_pid.entry(record.pid).or_default().drops += 1;
        if let Some(tag) = record.event_tag() {
            stats.by_tag.entry(tag).or_default().drops += 1;
        }
    }

    /// A malformed or rejected submission that never became a record.
    pub fn note_ingest_drop(&mut self, partition: PartitionId) {
        self.partition_mut(partition).totals.drops += 1;
    }

    /// Uids of `partition` ordered by descending resident bytes, skipping
    /// uids for which `protected` holds. Only the top two matter to the
    /// pruning policy.
    pub fn top_offenders(
        &self,
        partition: PartitionId,
        protected: &dyn Fn(u32) -> bool,
    ) -> Vec<(u32, usize)> {
        let mut offenders: Vec<(u32, usize)> = self
            .partition(partition)
            .by_uid
            .iter()
            .filter(|(uid, stats)| stats.bytes > 0 && !protected(**uid))
            .map(|(uid, stats)| (*uid, stats.bytes))
            .collect();
        offenders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        offenders.truncate(2);
        offenders
    }

    pub fn uid_bytes(&self, partition: PartitionId, uid: u32) -> usize {
        self.partition(partition)
            .by_uid
            .get(&uid)
            .map(|s| s.bytes)
            .unwrap_or(0)
    }

    pub fn partition_bytes(&self, partition: PartitionId) -> usize {
        self.partition(partition).totals.bytes
    }

    pub fn drops(&self, partition: PartitionId) -> usize {
        self.partition(partition).totals.drops
    }

    pub fn uid_drops(&self, partition: PartitionId, uid: u32) -> usize {
        self.partition(partition)
            .by_uid
            .get(&uid)
            .map(|s| s.drops)
            .unwrap_or(0)
    }

    pub fn snapshot(
        &self,
        filter: Option<&[PartitionId]>,
        quotas: &dyn Fn(PartitionId) -> (usize, usize),
    ) -> StatsSnapshot {
        let selected: Vec<PartitionId> = match filter {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => PartitionId::ALL.to_vec(),
        };
        let partitions = selected
            .into_iter()
            .map(|partition| {
                let stats = self.partition(partition);
                let (quota, used) = quotas(partition);
                PartitionSnapshot {
                    partition,
                    quota,
                    used,
                    totals: stats.totals.clone(),
                    by_uid: sorted_table(&stats.by_uid),
                    by_pid: sorted_table(&stats.by_pid),
                    by_tag: sorted_table(&stats.by_tag),
                }
            })
            .collect();
        StatsSnapshot {
            generated_at: chrono::Utc::now().to_rfc3339(),
            partitions,
        }
    }
}

fn sorted_table(table: &HashMap<u32, EntityStats>) -> Vec<TableRow> {
    let mut rows: Vec<TableRow> = table
        .iter()
        .filter(|(_, stats)| stats.records > 0 || stats.drops > 0)
        .map(|(key, stats)| TableRow {
            key: *key,
            stats: stats.clone(),
        })
        .collect();
    rows.sort_by(|a, b| b.stats.bytes.cmp(&a.stats.bytes).then(a.key.cmp(&b.key)));
    rows
}

#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub key: u32,
    #[serde(flatten)]
    pub stats: EntityStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionSnapshot {
    pub partition: PartitionId,
    pub quota: usize,
    pub used: usize,
    pub totals: EntityStats,
    pub by_uid: Vec<TableRow>,
    pub by_pid: Vec<TableRow>,
    pub by_tag: Vec<TableRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub generated_at: String,
    pub partitions: Vec<PartitionSnapshot>,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn render_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "statistics as of {}", self.generated_at);
        for p in &self.partitions {
            let _ = writeln!(
                out,
                "{}: used {}/{} bytes, {} records, {} dropped",
                p.partition, p.used, p.quota, p.totals.records, p.totals.drops
            );
            Self::render_table(&mut out, "uid", &p.by_uid);
            Self::render_table(&mut out, "pid", &p.by_pid);
            Self::render_table(&mut out, "tag", &p.by_tag);
        }
        out
    }

    fn render_table(out: &mut String, label: &str, rows: &[TableRow]) {
        use std::fmt::Write;

        for row in rows {
            let _ = writeln!(
                out,
                "  {} {:>10}: {:>10} bytes {:>8} records {:>6} dropped",
                label, row.key, row.stats.bytes, row.stats.records, row.stats.drops
            );
        }
    }
}
