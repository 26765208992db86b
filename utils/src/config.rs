use crate::dirs::{get_app_dir, LoghubDirs};
use crate::partition::PartitionId;
use log::LevelFilter;
use std::collections::{HashMap, HashSet};
use std::env::VarError;
use std::str::FromStr;
use std::{env, path::PathBuf};
use strum_macros::{Display, EnumString};

#[derive(Clone, Copy, Display, EnumString, PartialEq)]
pub enum Env {
    #[strum(serialize = "dev")]
    Dev,

    #[strum(serialize = "prod")]
    Prod,
}

pub const DEFAULT_QUOTA: usize = 256 * 1024;
pub const QUOTA_FLOOR: usize = 64 * 1024;
pub const QUOTA_CEILING: usize = 256 * 1024 * 1024;
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 1024;

#[derive(Clone)]
pub struct Config {
    pub env: Env,

    pub log_level: LevelFilter,

    pub loghub_dirs: LoghubDirs,

    /// Per-partition byte quota overrides; partitions not listed use
    /// [`DEFAULT_QUOTA`].
    pub quotas: HashMap<PartitionId, usize>,

    pub max_subscriptions: usize,

    /// Uids allowed to write to (and clear) the security partition.
    pub security_uids: HashSet<u32>,

    /// Partitions stored in the compacted serialized form instead of the
    /// default list form.
    pub compact_partitions: HashSet<PartitionId>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env = match env::var("ENV") {
            Ok(v) => Env::from_str(&v).unwrap(),
            Err(VarError::NotPresent) => Env::Dev,
            Err(_) => panic!(),
        };

        let log_level = match env::var("LOG_LEVEL") {
            Ok(v) => LevelFilter::from_str(&v).unwrap(),
            Err(VarError::NotPresent) => LevelFilter::Info,
            Err(_) => panic!(),
        };

        let app_dir = match env::var("LOGHUB_APP_DIR") {
            Ok(v) => PathBuf::from(v),
            Err(VarError::NotPresent) => get_app_dir(".loghub".to_string()),
            Err(_) => panic!(),
        };
        let loghub_dirs = LoghubDirs::new(env, app_dir);

        let quotas = match env::var("LOGHUB_QUOTAS") {
            Ok(v) => parse_quotas(&v).unwrap(),
            Err(VarError::NotPresent) => HashMap::new(),
            Err(_) => panic!(),
        };

        let max_subscriptions = env::var("LOGHUB_MAX_SUBSCRIPTIONS")
            .ok()
            .map(|v| v.parse::<usize>().unwrap())
            .unwrap_or(DEFAULT_MAX_SUBSCRIPTIONS);

        let security_uids = match env::var("LOGHUB_SECURITY_UIDS") {
            Ok(v) => parse_uid_set(&v).unwrap(),
            // Root and the system uid by default.
            Err(VarError::NotPresent) => HashSet::from([0, 1000]),
            Err(_) => panic!(),
        };

        let compact_partitions = match env::var("LOGHUB_COMPACT_PARTITIONS") {
            Ok(v) => parse_partition_set(&v).unwrap(),
            Err(VarError::NotPresent) => HashSet::new(),
            Err(_) => panic!(),
        };

        Config {
            env,
            log_level,
            loghub_dirs,
            quotas,
            max_subscriptions,
            security_uids,
            compact_partitions,
        }
    }

    pub fn quota_for(&self, partition: PartitionId) -> usize {
        self.quotas.get(&partition).copied().unwrap_or(DEFAULT_QUOTA)
    }
}

/// Parses `"main=262144,events=524288"`; values are clamped to the
/// administrative quota range.
fn parse_quotas(spec: &str) -> Result<HashMap<PartitionId, usize>, String> {
    let mut quotas = HashMap::new();
    for entry in spec.split(',').filter(|s| !s.is_empty()) {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("bad quota entry: {entry}"))?;
        let partition = PartitionId::from_str(name.trim())
            .map_err(|_| format!("unknown partition: {name}"))?;
        let bytes: usize = value
            .trim()
            .parse()
            .map_err(|_| format!("bad quota value: {value}"))?;
        quotas.insert(partition, bytes.clamp(QUOTA_FLOOR, QUOTA_CEILING));
    }
    Ok(quotas)
}

fn parse_uid_set(spec: &str) -> Result<HashSet<u32>, String> {
    spec.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse::<u32>().map_err(|_| format!("bad uid: {s}")))
        .collect()
}

fn parse_partition_set(spec: &str) -> Result<HashSet<PartitionId>, String> {
    spec.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            PartitionId::from_str(s.trim()).map_err(|_| format!("unknown partition: {s}"))
        })
        .collect()
}
