//! Socket-level scenarios: a daemon assembled on temp-dir sockets, real
//! producers on the ingest datagram socket, and real subscribers on the
//! egress stream socket.

use bytes::{Buf, BytesMut};
use loghub_utils::partition::{PartitionId, Timestamp};
use loghub_utils::wire::{split_text_payload, text_payload, EgressFrame, IngestFrame};
use loghubd::endpoints::control::ControlEndpoint;
use loghubd::endpoints::egress::EgressEndpoint;
use loghubd::endpoints::ingest::IngestEndpoint;
use loghubd::store::{LogStore, StoreOptions};
use loghubd::tags::TagRegistry;
use std::collections::HashMap;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

struct TestDaemon {
    dir: TempDir,
    store: Arc<LogStore>,
    shutdown_flag: Arc<AtomicBool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl TestDaemon {
    async fn spawn(options: StoreOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LogStore::new(options));
        let tags = Arc::new(TagRegistry::open(&dir.path().join("event-log-tags")).unwrap());
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let ingest = IngestEndpoint::bind(
            &dir.path().join("ingest"),
            store.clone(),
            shutdown_flag.clone(),
        )
        .unwrap();
        let egress = EgressEndpoint::bind(
            &dir.path().join("reader"),
            store.clone(),
            shutdown_flag.clone(),
        )
        .unwrap();
        let control = ControlEndpoint::bind(
            &dir.path().join("control"),
            store.clone(),
            tags,
            shutdown_flag.clone(),
        )
        .unwrap();

        let tasks = vec![
            tokio::spawn(ingest.run()),
            tokio::spawn(egress.run()),
            tokio::spawn(control.run()),
        ];

        TestDaemon {
            dir,
            store,
            shutdown_flag,
            tasks,
        }
    }

    fn producer(&self) -> UnixDatagram {
        let socket = UnixDatagram::unbound().unwrap();
        socket.connect(self.dir.path().join("ingest")).unwrap();
        socket
    }

    async fn subscribe(&self, request: &str) -> UnixStream {
        let mut stream = UnixStream::connect(self.dir.path().join("reader"))
            .await
            .unwrap();
        stream
            .write_all(format!("{request}\n").as_bytes())
            .await
            .unwrap();
        stream
    }

    async fn control(&self, command: &str) -> String {
        let mut stream = UnixStream::connect(self.dir.path().join("control"))
            .await
            .unwrap();
        stream
            .write_all(format!("{command}\n").as_bytes())
            .await
            .unwrap();
        let mut lines = BufReader::new(stream).lines();
        lines.next_line().await.unwrap().unwrap_or_default()
    }

    async fn stop(self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

fn send_text(producer: &UnixDatagram, partition: PartitionId, tid: u16, message: &str) {
    let mut datagram = Vec::new();
    IngestFrame {
        partition,
        tid,
        realtime: Timestamp::new(0, 0),
        payload: text_payload(4, "test", message),
    }
    .encode(&mut datagram);
    producer.send(&datagram).unwrap();
}

/// Reads frames until `done` says stop, an EOF arrives, or the deadline
/// passes.
async fn read_frames(
    stream: &mut UnixStream,
    deadline: Duration,
    mut done: impl FnMut(&[EgressFrame]) -> bool,
) -> Vec<EgressFrame> {
    let mut frames = Vec::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let _ = tokio::time::timeout(deadline, async {
        loop {
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    while let Some((frame, consumed)) = EgressFrame::decode(&buf).unwrap() {
                        frames.push(frame);
                        buf.advance(consumed);
                    }
                    if done(&frames) {
                        break;
                    }
                }
            }
        }
    })
    .await;
    frames
}

fn message_of(frame: &EgressFrame) -> String {
    split_text_payload(&frame.payload)
        .map(|(_, _, message)| message.to_string())
        .unwrap_or_default()
}

fn is_chatty(frame: &EgressFrame) -> bool {
    split_text_payload(&frame.payload).is_some_and(|(_, tag, _)| tag == "chatty")
}

fn chatty_count(frame: &EgressFrame) -> usize {
    let message = message_of(frame);
    message
        .split_whitespace()
        .find_map(|token| token.parse::<usize>().ok())
        .unwrap_or(0)
}

fn store_write(store: &LogStore, partition: PartitionId, uid: u32, payload: Vec<u8>) {
    store
        .log(partition, Timestamp::now(), uid, uid + 1, uid + 2, 4, payload)
        .unwrap();
}

#[tokio::test]
async fn basic_tail_round_trips_records_in_order() {
    let daemon = TestDaemon::spawn(StoreOptions::default()).await;
    let mut subscriber = daemon.subscribe("logIds=1 stream").await;
    // Let the subscription register before producing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let producer = daemon.producer();
    for message in ["A", "B", "C"] {
        send_text(&producer, PartitionId::Main, 7, message);
    }

    let frames = read_frames(&mut subscriber, Duration::from_secs(2), |frames| {
        frames.len() >= 3
    })
    .await;

    assert_eq!(frames.len(), 3);
    let messages: Vec<String> = frames.iter().map(message_of).collect();
    assert_eq!(messages, vec!["A", "B", "C"]);

    // Header fields round-trip from the producer side.
    for frame in &frames {
        assert_eq!(frame.partition, PartitionId::Main);
        assert_eq!(frame.tid, 7);
        assert_eq!(frame.pid, std::process::id());
        assert!(!frame.realtime.is_zero());
    }

    // Dropping the connection cancels the subscription promptly.
    drop(subscriber);
    let mut waited = Duration::ZERO;
    while daemon.store.readers().len() > 0 && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
    assert_eq!(daemon.store.readers().len(), 0);

    daemon.stop().await;
}

#[tokio::test]
async fn quota_eviction_over_the_wire() {
    let daemon = TestDaemon::spawn(StoreOptions {
        quotas: HashMap::from([(PartitionId::Main, 4096)]),
        ..Default::default()
    })
    .await;

    let producer = daemon.producer();
    let filler = "x".repeat(80);
    for i in 0..100 {
        send_text(&producer, PartitionId::Main, i, &filler);
    }

    // Wait for the ingest side to drain all 100 datagrams.
    let mut waited = Duration::ZERO;
    let total = |store: &LogStore| {
        store.len(PartitionId::Main) + store.drops(PartitionId::Main)
    };
    while total(&daemon.store) < 100 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }

    assert_eq!(total(&daemon.store), 100);
    assert!(daemon.store.used(PartitionId::Main) <= 4096);
    assert!(daemon.store.drops(PartitionId::Main) >= 1);

    // Statistics over the control socket agree.
    let mut stream = UnixStream::connect(daemon.dir.path().join("control"))
        .await
        .unwrap();
    stream.write_all(b"getStatistics main\n").await.unwrap();
    let mut reply = String::new();
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            break;
        }
        reply.push_str(&line);
        reply.push('\n');
    }
    assert!(reply.contains("main:"));
    assert!(reply.contains("dropped"));

    daemon.stop().await;
}

#[tokio::test]
async fn worst_offender_pruned_first() {
    let daemon = TestDaemon::spawn(StoreOptions {
        quotas: HashMap::from([(PartitionId::Main, 8 * 1024)]),
        ..Default::default()
    })
    .await;

    for _ in 0..50 {
        store_write(&daemon.store, PartitionId::Main, 1000, vec![b'a'; 100]);
    }
    for _ in 0..10 {
        store_write(&daemon.store, PartitionId::Main, 2000, vec![b'b'; 100]);
    }
    store_write(&daemon.store, PartitionId::Main, 3000, vec![b'c'; 1024]);

    assert!(daemon.store.uid_drops(PartitionId::Main, 1000) >= 1);
    assert_eq!(daemon.store.uid_drops(PartitionId::Main, 2000), 0);

    daemon.stop().await;
}

#[tokio::test]
async fn allow_list_survives_over_control_socket() {
    let daemon = TestDaemon::spawn(StoreOptions {
        quotas: HashMap::from([(PartitionId::Main, 4096)]),
        ..Default::default()
    })
    .await;

    assert_eq!(daemon.control("setPruneList main: ~1000").await, "success");

    // Few enough rounds that the allow-listed uid alone stays under quota.
    for _ in 0..25 {
        store_write(&daemon.store, PartitionId::Main, 1000, vec![b'a'; 100]);
        store_write(&daemon.store, PartitionId::Main, 2000, vec![b'b'; 100]);
    }

    assert_eq!(daemon.store.uid_drops(PartitionId::Main, 1000), 0);
    assert!(daemon.store.uid_drops(PartitionId::Main, 2000) > 0);

    daemon.stop().await;
}

#[tokio::test]
async fn range_dump_serves_exactly_the_tail() {
    let daemon = TestDaemon::spawn(StoreOptions {
        // Large enough that nothing is pruned.
        quotas: HashMap::from([(PartitionId::Main, 1024 * 1024)]),
        ..Default::default()
    })
    .await;

    for i in 0..1000u32 {
        store_write(
            &daemon.store,
            PartitionId::Main,
            1000,
            text_payload(4, "seq", &i.to_string()),
        );
    }

    let mut subscriber = daemon.subscribe("logIds=1 tail=100 dump").await;
    // Dump terminates with EOF, so read to the end.
    let frames = read_frames(&mut subscriber, Duration::from_secs(5), |_| false).await;

    assert_eq!(frames.len(), 100);
    let numbers: Vec<u32> = frames
        .iter()
        .map(|f| message_of(f).parse().unwrap())
        .collect();
    let expected: Vec<u32> = (900..1000).collect();
    assert_eq!(numbers, expected);

    daemon.stop().await;
}

#[tokio::test]
async fn interleaved_partitions_arrive_in_write_order() {
    let daemon = TestDaemon::spawn(StoreOptions::default()).await;

    for i in 0..20u32 {
        let partition = if i % 2 == 0 {
            PartitionId::Main
        } else {
            PartitionId::Radio
        };
        store_write(
            &daemon.store,
            partition,
            1000,
            text_payload(4, "seq", &i.to_string()),
        );
    }

    let mask = PartitionId::Main.mask_bit() | PartitionId::Radio.mask_bit();
    let mut subscriber = daemon.subscribe(&format!("logIds={mask} dump")).await;
    let frames = read_frames(&mut subscriber, Duration::from_secs(5), |_| false).await;

    let numbers: Vec<u32> = frames
        .iter()
        .map(|f| message_of(f).parse().unwrap())
        .collect();
    assert_eq!(numbers, (0..20).collect::<Vec<u32>>());

    daemon.stop().await;
}

#[tokio::test]
async fn uid_filter_limits_the_stream() {
    let daemon = TestDaemon::spawn(StoreOptions::default()).await;

    for i in 0..10u32 {
        store_write(
            &daemon.store,
            PartitionId::Main,
            1000 + (i % 2),
            text_payload(4, "seq", &i.to_string()),
        );
    }

    let mut subscriber = daemon.subscribe("logIds=1 uid=1001 dump").await;
    let frames = read_frames(&mut subscriber, Duration::from_secs(5), |_| false).await;

    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.uid == 1001));

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_and_tailers_conserve_records() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 2000;
    const SUBSCRIBERS: usize = 3;

    let daemon = TestDaemon::spawn(StoreOptions {
        quotas: HashMap::from([(PartitionId::Main, 16 * 1024)]),
        ..Default::default()
    })
    .await;

    let mut subscribers = Vec::new();
    for _ in 0..SUBSCRIBERS {
        subscribers.push(daemon.subscribe("logIds=1 stream").await);
    }
    // Let subscriptions register before the flood starts.
    let mut waited = Duration::ZERO;
    while daemon.store.readers().len() < SUBSCRIBERS && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    assert_eq!(daemon.store.readers().len(), SUBSCRIBERS);

    let mut writers = Vec::new();
    for w in 0..WRITERS {
        let store = daemon.store.clone();
        writers.push(tokio::task::spawn_blocking(move || {
            for i in 0..PER_WRITER {
                let payload = text_payload(4, "w", &format!("{w}:{i}"));
                store
                    .log(
                        PartitionId::Main,
                        Timestamp::now(),
                        1000 + w as u32,
                        1,
                        1,
                        4,
                        payload,
                    )
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    // Sentinel marks the end of the stream for the tailers.
    store_write(
        &daemon.store,
        PartitionId::Main,
        9999,
        text_payload(4, "w", "sentinel"),
    );

    let total = WRITERS * PER_WRITER + 1;
    for mut subscriber in subscribers {
        let frames = read_frames(&mut subscriber, Duration::from_secs(10), |frames| {
            frames.iter().any(|f| message_of(f) == "sentinel")
        })
        .await;
        // Trailing chatty reports may land after the sentinel.
        let late = read_frames(&mut subscriber, Duration::from_millis(300), |_| false).await;

        let mut observed = 0usize;
        let mut dropped = 0usize;
        for frame in frames.iter().chain(late.iter()) {
            if is_chatty(frame) {
                dropped += chatty_count(frame);
            } else {
                observed += 1;
            }
        }
        assert_eq!(observed + dropped, total);
    }

    daemon.stop().await;
}

#[tokio::test]
async fn event_tag_commands_round_trip() {
    let daemon = TestDaemon::spawn(StoreOptions::default()).await;

    let id = daemon
        .control("getEventTag name=watchdog format=(uptime|2)")
        .await;
    let id: u32 = id.parse().expect("numeric tag id");

    let again = daemon
        .control("getEventTag name=watchdog format=(uptime|2)")
        .await;
    assert_eq!(again.parse::<u32>().unwrap(), id);

    let conflict = daemon
        .control("getEventTag name=watchdog format=(count|1)")
        .await;
    assert!(conflict.starts_with("error:"));

    assert_eq!(daemon.control("reinit").await, "success");
    let after = daemon
        .control("getEventTag name=watchdog format=(uptime|2)")
        .await;
    assert_eq!(after.parse::<u32>().unwrap(), id);

    daemon.stop().await;
}

#[tokio::test]
async fn invalid_requests_get_error_replies() {
    let daemon = TestDaemon::spawn(StoreOptions::default()).await;

    // Egress: bad request line.
    let mut subscriber = daemon.subscribe("tail=10").await;
    let mut reply = String::new();
    let mut reader = BufReader::new(&mut subscriber);
    tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.starts_with("error:"));

    // Control: unknown command closes with Invalid.
    assert_eq!(daemon.control("selfdestruct").await, "Invalid");

    // Control: parse failure keeps the connection open.
    let mut stream = UnixStream::connect(daemon.dir.path().join("control"))
        .await
        .unwrap();
    stream.write_all(b"clear bogus\nclear main\n").await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "Invalid");
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "success");

    daemon.stop().await;
}
