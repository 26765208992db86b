//! The control endpoint: a line-oriented administrative protocol over a
//! Unix stream socket. Single-line replies end with `\n`; multi-line
//! replies (statistics, prune list) are terminated by one empty line.
//! Parse failures keep the connection open; unknown commands reply
//! `Invalid` and close.

use crate::store::LogStore;
use crate::tags::TagRegistry;
use log::{debug, info, warn};
use loghub_utils::log::LogTarget;
use loghub_utils::partition::PartitionId;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

const SHUTDOWN_TICK: Duration = Duration::from_millis(250);

enum Reply {
    /// One line, connection stays open.
    Line(String),
    /// Multi-line block, terminated by an empty line; stays open.
    Block(String),
    /// Final line, then close.
    Close(String),
}

pub struct ControlEndpoint {
    listener: UnixListener,
    store: Arc<LogStore>,
    tags: Arc<TagRegistry>,
    shutdown_flag: Arc<AtomicBool>,
}

impl ControlEndpoint {
    pub fn bind(
        path: &Path,
        store: Arc<LogStore>,
        tags: Arc<TagRegistry>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        Ok(ControlEndpoint {
            listener: UnixListener::bind(path)?,
            store,
            tags,
            shutdown_flag,
        })
    }

    pub async fn run(self) {
        info!(target: LogTarget::Control.as_str(), "control endpoint ready");

        while !self.shutdown_flag.load(Ordering::Relaxed) {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let store = self.store.clone();
                        let tags = self.tags.clone();
                        tokio::spawn(async move {
                            handle_connection(store, tags, stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(target: LogTarget::Control.as_str(), "accept failed: {e}");
                    }
                },
                _ = tokio::time::sleep(SHUTDOWN_TICK) => {}
            }
        }

        info!(target: LogTarget::Control.as_str(), "control endpoint stopped");
    }
}

async fn handle_connection(store: Arc<LogStore>, tags: Arc<TagRegistry>, stream: UnixStream) {
    let caller_uid = stream.peer_cred().ok().map(|cred| cred.uid());
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(target: LogTarget::Control.as_str(), "command: {line}");

        match dispatch(&store, &tags, caller_uid, line) {
            Reply::Line(text) => {
                if writer.write_all(format!("{text}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            Reply::Block(text) => {
                let mut framed = text;
                if !framed.ends_with('\n') {
                    framed.push('\n');
                }
                framed.push('\n');
                if writer.write_all(framed.as_bytes()).await.is_err() {
                    break;
                }
            }
            Reply::Close(text) => {
                let _ = writer.write_all(format!("{text}\n").as_bytes()).await;
                break;
            }
        }
    }
}

fn dispatch(
    store: &LogStore,
    tags: &TagRegistry,
    caller_uid: Option<u32>,
    line: &str,
) -> Reply {
    let mut tokens = line.split_ascii_whitespace();
    let command = tokens.next().unwrap_or_default();
    match command {
        "getStatistics" => {
            let mut filter = Vec::new();
            let mut json = false;
            for token in tokens {
                if token == "format=json" {
                    json = true;
                    continue;
                }
                match parse_partition(token) {
                    Some(partition) => filter.push(partition),
                    None => return Reply::Line(format!("error: unknown partition {token}")),
                }
            }
            let snapshot = store.stats_snapshot(Some(&filter));
            if json {
                Reply::Block(snapshot.to_json())
            } else {
                Reply::Block(snapshot.render_text())
            }
        }
        "clear" => {
            let Some(partition) = tokens.next().and_then(parse_partition) else {
                return Reply::Line("Invalid".to_string());
            };
            if partition == PartitionId::Security
                && !caller_uid.is_some_and(|uid| store.security_approved(uid))
            {
                return Reply::Line("Permission Denied".to_string());
            }
            let uid = match tokens.next() {
                Some(token) => match token.strip_prefix("uid=").and_then(|v| v.parse().ok()) {
                    Some(uid) => Some(uid),
                    None => return Reply::Line("Invalid".to_string()),
                },
                None => None,
            };
            store.clear(partition, uid);
            Reply::Line("success".to_string())
        }
        "getPruneList" => Reply::Block(store.prune_spec()),
        "setPruneList" => {
            let spec = line["setPruneList".len()..].trim();
            match store.set_prune_spec(spec) {
                Ok(()) => Reply::Line("success".to_string()),
                Err(e) => Reply::Line(format!("error: {e}")),
            }
        }
        "getEventTag" => {
            let mut name = None;
            let mut format = None;
            for token in tokens {
                if let Some(v) = token.strip_prefix("name=") {
                    name = Some(v);
                } else if let Some(v) = token.strip_prefix("format=") {
                    format = Some(v);
                }
            }
            let Some(name) = name else {
                return Reply::Line("error: missing name".to_string());
            };
            match tags.get_or_create(name, format.unwrap_or_default()) {
                Ok(id) => Reply::Line(id.to_string()),
                Err(e) => Reply::Line(format!("error: {e}")),
            }
        }
        "reinit" => match tags.reinit() {
            Ok(()) => Reply::Line("success".to_string()),
            Err(e) => Reply::Line(format!("error: {e}")),
        },
        "getQuota" => match tokens.next().and_then(parse_partition) {
            Some(partition) => Reply::Line(format!(
                "{} {}",
                store.quota(partition),
                store.used(partition)
            )),
            None => Reply::Line("Invalid".to_string()),
        },
        "setQuota" => {
            let Some(partition) = tokens.next().and_then(parse_partition) else {
                return Reply::Line("Invalid".to_string());
            };
            let Some(bytes) = tokens.next().and_then(|v| v.parse::<usize>().ok()) else {
                return Reply::Line("Invalid".to_string());
            };
            match store.set_quota(partition, bytes) {
                Ok(()) => Reply::Line("success".to_string()),
                Err(e) => Reply::Line(format!("error: {e}")),
            }
        }
        "exit" => Reply::Close("success".to_string()),
        _ => Reply::Close("Invalid".to_string()),
    }
}

/// Partitions are addressed by name or numeric tag.
fn parse_partition(token: &str) -> Option<PartitionId> {
    token
        .parse::<u8>()
        .ok()
        .and_then(PartitionId::from_tag)
        .or_else(|| PartitionId::from_str(token).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use loghub_utils::partition::Timestamp;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> (Arc<LogStore>, Arc<TagRegistry>) {
        let store = Arc::new(LogStore::new(StoreOptions::default()));
        let tags = Arc::new(TagRegistry::open(&dir.path().join("event-log-tags")).unwrap());
        (store, tags)
    }

    fn line(reply: Reply) -> String {
        match reply {
            Reply::Line(s) | Reply::Block(s) | Reply::Close(s) => s,
        }
    }

    #[test]
    fn statistics_text_and_json() {
        let dir = TempDir::new().unwrap();
        let (store, tags) = fixture(&dir);
        store
            .log(
                PartitionId::Main,
                Timestamp::now(),
                1000,
                1,
                1,
                4,
                b"hello".to_vec(),
            )
            .unwrap();

        let text = line(dispatch(&store, &tags, Some(0), "getStatistics main"));
        assert!(text.contains("main:"));

        let json = line(dispatch(&store, &tags, Some(0), "getStatistics main format=json"));
        assert!(json.contains("\"main\""));

        let bad = line(dispatch(&store, &tags, Some(0), "getStatistics bogus"));
        assert!(bad.starts_with("error:"));
    }

    #[test]
    fn clear_by_name_and_tag() {
        let dir = TempDir::new().unwrap();
        let (store, tags) = fixture(&dir);
        store
            .log(
                PartitionId::System,
                Timestamp::now(),
                1000,
                1,
                1,
                4,
                b"x".to_vec(),
            )
            .unwrap();

        assert_eq!(line(dispatch(&store, &tags, Some(0), "clear 3")), "success");
        assert_eq!(store.len(PartitionId::System), 0);

        assert_eq!(
            line(dispatch(&store, &tags, Some(0), "clear bogus")),
            "Invalid"
        );
    }

    #[test]
    fn clear_security_requires_approval() {
        let dir = TempDir::new().unwrap();
        let (store, tags) = fixture(&dir);
        // Default approved set is {0}.
        assert_eq!(
            line(dispatch(&store, &tags, Some(2000), "clear security")),
            "Permission Denied"
        );
        assert_eq!(
            line(dispatch(&store, &tags, Some(0), "clear security")),
            "success"
        );
    }

    #[test]
    fn prune_list_round_trip() {
        let dir = TempDir::new().unwrap();
        let (store, tags) = fixture(&dir);
        assert_eq!(
            line(dispatch(&store, &tags, Some(0), "setPruneList main: !1000 2000")),
            "success"
        );
        assert_eq!(
            line(dispatch(&store, &tags, Some(0), "getPruneList")),
            "main: !1000 2000"
        );
        assert!(line(dispatch(&store, &tags, Some(0), "setPruneList main: zzz"))
            .starts_with("error:"));
    }

    #[test]
    fn event_tag_allocation_and_conflict() {
        let dir = TempDir::new().unwrap();
        let (store, tags) = fixture(&dir);
        let id = line(dispatch(
            &store,
            &tags,
            Some(0),
            "getEventTag name=watchdog format=(uptime|2)",
        ));
        let id: u32 = id.parse().expect("numeric tag id");

        let again = line(dispatch(
            &store,
            &tags,
            Some(0),
            "getEventTag name=watchdog format=(uptime|2)",
        ));
        assert_eq!(again.parse::<u32>().unwrap(), id);

        let conflict = line(dispatch(
            &store,
            &tags,
            Some(0),
            "getEventTag name=watchdog format=(count|1)",
        ));
        assert!(conflict.starts_with("error:"));
    }

    #[test]
    fn quota_commands() {
        let dir = TempDir::new().unwrap();
        let (store, tags) = fixture(&dir);
        assert_eq!(
            line(dispatch(&store, &tags, Some(0), "setQuota main 131072")),
            "success"
        );
        assert_eq!(
            line(dispatch(&store, &tags, Some(0), "getQuota main")),
            "131072 0"
        );
        assert!(line(dispatch(&store, &tags, Some(0), "setQuota main 1"))
            .starts_with("error:"));
        assert_eq!(
            line(dispatch(&store, &tags, Some(0), "setQuota main nonsense")),
            "Invalid"
        );
    }

    #[test]
    fn unknown_command_is_invalid_and_closes() {
        let dir = TempDir::new().unwrap();
        let (store, tags) = fixture(&dir);
        assert!(matches!(
            dispatch(&store, &tags, Some(0), "selfdestruct"),
            Reply::Close(text) if text == "Invalid"
        ));
    }
}
