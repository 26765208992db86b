//! Client side of the egress protocol: send a request line, decode the
//! frame stream, and pretty-print records.

use crate::cli::ReadArgs;
use bytes::{Buf, BytesMut};
use log::error;
use loghub_utils::config::Config;
use loghub_utils::log::LogTarget;
use loghub_utils::partition::{PartitionId, Timestamp};
use loghub_utils::wire::{event_tag, split_text_payload, EgressFrame, ReadMode, ReadRequest};
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub async fn run(config: &Config, args: &ReadArgs, follow: bool) -> i32 {
    let request = match build_request(args, follow) {
        Ok(request) => request,
        Err(e) => {
            error!(target: LogTarget::Cli.as_str(), "{e}");
            return 1;
        }
    };

    let mut stream = match UnixStream::connect(config.loghub_dirs.egress_socket()).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(target: LogTarget::Cli.as_str(), "connect failed: {e}");
            return 1;
        }
    };
    if let Err(e) = stream
        .write_all(format!("{}\n", request.to_line()).as_bytes())
        .await
    {
        error!(target: LogTarget::Cli.as_str(), "request failed: {e}");
        return 1;
    }

    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if follow => break,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    // A text line instead of frames is the daemon refusing
                    // the subscription.
                    if buf.starts_with(b"error") {
                        let reply = String::from_utf8_lossy(&buf);
                        error!(target: LogTarget::Cli.as_str(), "{}", reply.trim_end());
                        return 1;
                    }
                    if drain_frames(&mut buf).is_err() {
                        error!(target: LogTarget::Cli.as_str(), "malformed frame stream");
                        return 1;
                    }
                }
                Err(e) => {
                    error!(target: LogTarget::Cli.as_str(), "read failed: {e}");
                    return 1;
                }
            }
        }
    }
    0
}

fn build_request(args: &ReadArgs, follow: bool) -> Result<ReadRequest, String> {
    let mut mask = 0u32;
    for name in &args.buffers {
        let partition =
            PartitionId::from_str(name).map_err(|_| format!("unknown partition: {name}"))?;
        mask |= partition.mask_bit();
    }
    if mask == 0 {
        mask = (1 << PartitionId::COUNT) - 1;
    }
    let start = match &args.start {
        Some(s) => Some(Timestamp::from_str(s).map_err(|_| format!("bad start time: {s}"))?),
        None => None,
    };
    Ok(ReadRequest {
        mask,
        tail: args.tail,
        start,
        pid: args.pid,
        uid: args.uid,
        level: args.level,
        mode: if follow {
            ReadMode::Stream
        } else {
            ReadMode::Dump
        },
    })
}

fn drain_frames(buf: &mut BytesMut) -> Result<(), loghub_utils::wire::WireError> {
    while let Some((frame, consumed)) = EgressFrame::decode(buf)? {
        print_frame(&frame);
        buf.advance(consumed);
    }
    Ok(())
}

fn priority_letter(priority: u8) -> char {
    match priority {
        2 => 'V',
        3 => 'D',
        4 => 'I',
        5 => 'W',
        6 => 'E',
        7 => 'F',
        _ => '?',
    }
}

fn print_frame(frame: &EgressFrame) {
    let when = chrono::DateTime::from_timestamp(frame.realtime.sec as i64, frame.realtime.nsec)
        .map(|dt| dt.format("%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| frame.realtime.to_string());

    if frame.partition.is_binary() {
        let tag = event_tag(&frame.payload).unwrap_or(0);
        println!(
            "{when} {:>5} {:>5} {:>5} {} [{tag}] {} bytes",
            frame.uid,
            frame.pid,
            frame.tid,
            frame.partition,
            frame.payload.len(),
        );
    } else if let Some((priority, tag, message)) = split_text_payload(&frame.payload) {
        println!(
            "{when} {:>5} {:>5} {:>5} {} {tag}: {message}",
            frame.uid,
            frame.pid,
            frame.tid,
            priority_letter(priority),
        );
    }
}
