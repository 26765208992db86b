use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use strum_macros::{Display, EnumString};

/// One of the eight log partitions. The numeric tag is the wire identifier
/// carried by ingest datagrams and egress frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PartitionId {
    Main,
    Radio,
    Events,
    System,
    Crash,
    Stats,
    Security,
    Kernel,
}

impl PartitionId {
    pub const COUNT: usize = 8;

    pub const ALL: [PartitionId; Self::COUNT] = [
        PartitionId::Main,
        PartitionId::Radio,
        PartitionId::Events,
        PartitionId::System,
        PartitionId::Crash,
        PartitionId::Stats,
        PartitionId::Security,
        PartitionId::Kernel,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn mask_bit(self) -> u32 {
        1 << self.tag()
    }

    /// Partitions whose payload starts with a 4-byte little-endian event tag
    /// rather than `priority | tag\0 | message\0`.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            PartitionId::Events | PartitionId::Stats | PartitionId::Security
        )
    }
}

/// Text-record priority byte. Binary partitions carry 0 here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Verbose = 2,
    Debug = 3,
    Info = 4,
    Warn = 5,
    Error = 6,
    Fatal = 7,
}

impl Priority {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            2 => Some(Priority::Verbose),
            3 => Some(Priority::Debug),
            4 => Some(Priority::Info),
            5 => Some(Priority::Warn),
            6 => Some(Priority::Error),
            7 => Some(Priority::Fatal),
            _ => None,
        }
    }
}

/// Realtime stamp carried on every record, seconds plus nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: u32, nsec: u32) -> Self {
        Timestamp { sec, nsec }
    }

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            sec: elapsed.as_secs() as u32,
            nsec: elapsed.subsec_nanos(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

impl std::str::FromStr for Timestamp {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((sec, nsec)) => Ok(Timestamp {
                sec: sec.parse()?,
                nsec: nsec.parse()?,
            }),
            None => Ok(Timestamp {
                sec: s.parse()?,
                nsec: 0,
            }),
        }
    }
}
