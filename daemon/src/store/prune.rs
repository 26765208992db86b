//! Administrative pruning policy. A specification string such as
//! `main: ~1000 !2000/7; events: !*` configures, per partition, an ordered
//! list of `(uid, pid)` selectors marked allow or deny. Deny entries are
//! sacrificed first when a partition is over quota; allow entries are
//! evicted last.

use loghub_utils::partition::PartitionId;
use parking_lot::RwLock;
use std::fmt::Write;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneEntry {
    pub uid: Option<u32>,
    pub pid: Option<u32>,
    pub action: PruneAction,
    /// Whether the allow entry was written with the `~` marker; preserved
    /// when formatting the list back.
    tilde: bool,
}

impl PruneEntry {
    fn matches(&self, uid: u32, pid: u32) -> bool {
        self.uid.map_or(true, |u| u == uid) && self.pid.map_or(true, |p| p == pid)
    }

    /// Whether this entry shields the whole uid from worst-offender
    /// eviction.
    fn shields_uid(&self, uid: u32) -> bool {
        self.action == PruneAction::Allow && self.uid.map_or(true, |u| u == uid)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PruneParseError {
    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    #[error("malformed entry: {0}")]
    MalformedEntry(String),

    #[error("missing ':' in clause: {0}")]
    MissingColon(String),
}

/// The parsed policy, one ordered entry list per partition. First match
/// wins. Reconfiguration swaps the whole table.
#[derive(Default)]
pub struct PruneList {
    rules: RwLock<[Vec<PruneEntry>; PartitionId::COUNT]>,
}

impl PruneList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_from_spec(&self, spec: &str) -> Result<(), PruneParseError> {
        let parsed = parse_spec(spec)?;
        *self.rules.write() = parsed;
        Ok(())
    }

    pub fn format(&self) -> String {
        let rules = self.rules.read();
        let mut out = String::new();
        for partition in PartitionId::ALL {
            let entries = &rules[partition.tag() as usize];
            if entries.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("; ");
            }
            let _ = write!(out, "{partition}:");
            for entry in entries {
                out.push(' ');
                match entry.action {
                    PruneAction::Deny => out.push('!'),
                    PruneAction::Allow if entry.tilde => out.push('~'),
                    PruneAction::Allow => {}
                }
                match entry.uid {
                    Some(uid) => {
                        let _ = write!(out, "{uid}");
                    }
                    None => out.push('*'),
                }
                if let Some(pid) = entry.pid {
                    let _ = write!(out, "/{pid}");
                }
            }
        }
        out
    }

    /// First matching entry's action for `(uid, pid)` on `partition`.
    pub fn action_for(&self, partition: PartitionId, uid: u32, pid: u32) -> Option<PruneAction> {
        self.rules.read()[partition.tag() as usize]
            .iter()
            .find(|entry| entry.matches(uid, pid))
            .map(|entry| entry.action)
    }

    /// Whether an allow entry protects `uid` on `partition` as a whole.
    pub fn uid_protected(&self, partition: PartitionId, uid: u32) -> bool {
        self.rules.read()[partition.tag() as usize]
            .iter()
            .any(|entry| entry.shields_uid(uid))
    }

    pub fn has_deny(&self, partition: PartitionId) -> bool {
        self.rules.read()[partition.tag() as usize]
            .iter()
            .any(|entry| entry.action == PruneAction::Deny)
    }
}

fn parse_spec(spec: &str) -> Result<[Vec<PruneEntry>; PartitionId::COUNT], PruneParseError> {
    let mut rules: [Vec<PruneEntry>; PartitionId::COUNT] = Default::default();
    for clause in spec.split(';') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let (name, entries) = clause
            .split_once(':')
            .ok_or_else(|| PruneParseError::MissingColon(clause.to_string()))?;
        let name = name.trim();
        let partition = name
            .parse::<u8>()
            .ok()
            .and_then(PartitionId::from_tag)
            .or_else(|| PartitionId::from_str(name).ok())
            .ok_or_else(|| PruneParseError::UnknownPartition(name.to_string()))?;
        for token in entries.split_ascii_whitespace() {
            rules[partition.tag() as usize].push(parse_entry(token)?);
        }
    }
    Ok(rules)
}

fn parse_entry(token: &str) -> Result<PruneEntry, PruneParseError> {
    let (action, tilde, rest) = match token.as_bytes() {
        [b'!', ..] => (PruneAction::Deny, false, &token[1..]),
        [b'~', ..] => (PruneAction::Allow, true, &token[1..]),
        _ => (PruneAction::Allow, false, token),
    };
    let (uid_str, pid_str) = match rest.split_once('/') {
        Some((uid, pid)) => (uid, Some(pid)),
        None => (rest, None),
    };
    let uid = parse_selector(uid_str, token)?;
    let pid = match pid_str {
        Some(s) => parse_selector(s, token)?,
        None => None,
    };
    Ok(PruneEntry {
        uid,
        pid,
        action,
        tilde,
    })
}

fn parse_selector(s: &str, token: &str) -> Result<Option<u32>, PruneParseError> {
    if s == "*" {
        return Ok(None);
    }
    s.parse::<u32>()
        .map(Some)
        .map_err(|_| PruneParseError::MalformedEntry(token.to_string()))
}
