//! The egress endpoint: readers connect over a Unix stream socket, send
//! one request line, and receive framed records. Each connection owns a
//! subscription; a peer hang-up cancels it promptly via a reader-side
//! watchdog task.

use crate::readers::{DroppedSpan, ReaderOptions, ReaderState};
use crate::store::LogStore;
use log::{debug, info, warn};
use loghub_utils::log::LogTarget;
use loghub_utils::partition::Timestamp;
use loghub_utils::wire::{text_payload, EgressFrame, ReadMode, ReadRequest};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};

/// Records served per store-lock acquisition.
const BATCH_SIZE: usize = 128;

const SHUTDOWN_TICK: Duration = Duration::from_millis(250);

pub struct EgressEndpoint {
    listener: UnixListener,
    store: Arc<LogStore>,
    shutdown_flag: Arc<AtomicBool>,
}

impl EgressEndpoint {
    pub fn bind(
        path: &Path,
        store: Arc<LogStore>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        Ok(EgressEndpoint {
            listener: UnixListener::bind(path)?,
            store,
            shutdown_flag,
        })
    }

    pub async fn run(self) {
        info!(target: LogTarget::Egress.as_str(), "egress endpoint ready");

        while !self.shutdown_flag.load(Ordering::Relaxed) {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let store = self.store.clone();
                        let shutdown_flag = self.shutdown_flag.clone();
                        tokio::spawn(async move {
                            handle_connection(store, shutdown_flag, stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(target: LogTarget::Egress.as_str(), "accept failed: {e}");
                    }
                },
                _ = tokio::time::sleep(SHUTDOWN_TICK) => {}
            }
        }

        // Unblock every parked subscription so connection tasks can exit.
        self.store.readers().cancel_all();
        info!(target: LogTarget::Egress.as_str(), "egress endpoint stopped");
    }
}

async fn handle_connection(
    store: Arc<LogStore>,
    shutdown_flag: Arc<AtomicBool>,
    stream: UnixStream,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader_side = BufReader::new(read_half);

    let mut line = String::new();
    match reader_side.read_line(&mut line).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }

    let request = match ReadRequest::parse(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            let _ = writer.write_all(format!("error: {e}\n").as_bytes()).await;
            return;
        }
    };

    let reader = match store.readers().register(ReaderOptions {
        mask: request.mask,
        uid: request.uid,
        pid: request.pid,
        min_priority: request.level,
    }) {
        Ok(reader) => reader,
        Err(e) => {
            let _ = writer.write_all(format!("error: {e}\n").as_bytes()).await;
            return;
        }
    };
    debug!(
        target: LogTarget::Egress.as_str(),
        "subscription {} registered: {}",
        reader.handle(),
        line.trim()
    );

    // Watchdog: a peer hang-up must cancel a parked tail promptly.
    let watchdog_reader = reader.clone();
    let watchdog = tokio::spawn(async move {
        let mut sink = [0u8; 64];
        loop {
            match reader_side.read(&mut sink).await {
                // Extra client bytes are ignored.
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
        watchdog_reader.cancel();
    });

    if let Err(e) = serve(&store, &shutdown_flag, &request, &reader, &mut writer).await {
        debug!(
            target: LogTarget::Egress.as_str(),
            "subscription {} peer gone: {e}",
            reader.handle()
        );
    }

    store.readers().unregister(reader.handle());
    watchdog.abort();
    debug!(
        target: LogTarget::Egress.as_str(),
        "subscription {} closed",
        reader.handle()
    );
}

/// Streams records to one subscriber until the range is exhausted (dump),
/// the peer goes away, or the subscription is cancelled.
async fn serve(
    store: &LogStore,
    shutdown_flag: &AtomicBool,
    request: &ReadRequest,
    reader: &Arc<ReaderState>,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    if let Some(n) = request.tail {
        store.seed_tail(reader, n);
    }
    let stop_seq = match request.mode {
        ReadMode::Dump => store.sequence_head(),
        ReadMode::Stream => u64::MAX,
    };

    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    loop {
        if reader.is_cancelled() || shutdown_flag.load(Ordering::Relaxed) {
            break;
        }

        for span in reader.take_dropped_spans() {
            let frame = chatty_frame(&span);
            buf.clear();
            frame.encode(&mut buf);
            writer.write_all(&buf).await?;
        }

        // The cursor moves when the batch is taken, not when the socket
        // write completes; records evicted during a slow write were still
        // observed.
        let batch = store.next_batch(reader, stop_seq, BATCH_SIZE);
        if batch.is_empty() {
            match request.mode {
                // Nothing at or below the dump horizon remains.
                ReadMode::Dump => break,
                ReadMode::Stream => {
                    let _ = tokio::time::timeout(SHUTDOWN_TICK, reader.wait()).await;
                    continue;
                }
            }
        }

        buf.clear();
        for record in &batch {
            if !reader.matches(record) {
                continue;
            }
            if request.start.is_some_and(|start| record.realtime < start) {
                continue;
            }
            EgressFrame {
                pid: record.pid,
                tid: record.tid,
                realtime: record.realtime,
                partition: record.partition,
                uid: record.uid,
                payload: record.payload.clone(),
            }
            .encode(&mut buf);
        }
        if !buf.is_empty() {
            writer.write_all(&buf).await?;
        }
    }

    writer.flush().await
}

/// Synthesizes the record that reports a missed span to a subscriber that
/// fell behind pruning.
fn chatty_frame(span: &DroppedSpan) -> EgressFrame {
    let message = match span.uid {
        Some(uid) => format!("uid={uid} expired {} records", span.count),
        None => format!("expired {} records", span.count),
    };
    EgressFrame {
        pid: 0,
        tid: 0,
        realtime: Timestamp::now(),
        partition: span.partition,
        uid: span.uid.unwrap_or(0),
        payload: text_payload(4, "chatty", &message),
    }
}
