//! Wire formats shared by the daemon endpoints and the administrative client:
//! the ingest datagram layout, the egress record frame, and the egress
//! request line.

use crate::partition::{PartitionId, Timestamp};
use bytes::{Buf, BufMut};
use std::str::FromStr;

/// Fixed ingest datagram header: partition tag, tid, realtime sec/nsec.
pub const INGEST_HEADER_LEN: usize = 1 + 2 + 4 + 4;

/// Payload cap for one ingest datagram.
pub const MAX_DATAGRAM_PAYLOAD: usize = 4080;

/// Hard cap on a stored record payload.
pub const MAX_RECORD_PAYLOAD: usize = 4096;

/// Size of the fixed header inside an egress frame.
pub const EGRESS_HEADER_SIZE: u16 = 24;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),
    #[error("unknown partition tag {0}")]
    UnknownPartition(u8),
    #[error("empty payload")]
    EmptyPayload,
    #[error("payload exceeds {max} bytes: {len}")]
    Oversized { len: usize, max: usize },
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
    #[error("bad request line: {0}")]
    BadRequest(String),
}

/// One ingest datagram: fixed header plus partition-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFrame {
    pub partition: PartitionId,
    pub tid: u16,
    pub realtime: Timestamp,
    pub payload: Vec<u8>,
}

impl IngestFrame {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.partition.tag());
        buf.put_u16_le(self.tid);
        buf.put_u32_le(self.realtime.sec);
        buf.put_u32_le(self.realtime.nsec);
        buf.put_slice(&self.payload);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < INGEST_HEADER_LEN {
            return Err(WireError::Truncated(buf.len()));
        }
        let tag = buf.get_u8();
        let partition = PartitionId::from_tag(tag).ok_or(WireError::UnknownPartition(tag))?;
        let tid = buf.get_u16_le();
        let realtime = Timestamp::new(buf.get_u32_le(), buf.get_u32_le());

        if buf.is_empty() {
            return Err(WireError::EmptyPayload);
        }
        if buf.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(WireError::Oversized {
                len: buf.len(),
                max: MAX_DATAGRAM_PAYLOAD,
            });
        }
        let frame = IngestFrame {
            partition,
            tid,
            realtime,
            payload: buf.to_vec(),
        };
        frame.validate_payload()?;
        Ok(frame)
    }

    /// Binary partitions start with a 4-byte event tag; text partitions with
    /// `priority | tag\0 | message\0`.
    fn validate_payload(&self) -> Result<(), WireError> {
        if self.partition.is_binary() {
            if self.payload.len() < 4 {
                return Err(WireError::MalformedPayload("event"));
            }
        } else if split_text_payload(&self.payload).is_none() {
            return Err(WireError::MalformedPayload("text"));
        }
        Ok(())
    }
}

/// Splits a text-partition payload into `(priority, tag, message)`.
/// The message NUL is optional on the wire; everything after the tag
/// terminator is the message, minus a trailing NUL if present.
pub fn split_text_payload(payload: &[u8]) -> Option<(u8, &str, &str)> {
    let (&priority, rest) = payload.split_first()?;
    let nul = rest.iter().position(|&b| b == 0)?;
    let tag = std::str::from_utf8(&rest[..nul]).ok()?;
    let mut message = &rest[nul + 1..];
    if let [head @ .., 0] = message {
        message = head;
    }
    let message = std::str::from_utf8(message).ok()?;
    Some((priority, tag, message))
}

/// Extracts the leading little-endian event tag of a binary payload.
pub fn event_tag(payload: &[u8]) -> Option<u32> {
    let bytes = payload.get(..4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// One record as framed on the egress socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressFrame {
    pub pid: u32,
    pub tid: u32,
    pub realtime: Timestamp,
    pub partition: PartitionId,
    pub uid: u32,
    pub payload: Vec<u8>,
}

impl EgressFrame {
    pub fn encoded_len(&self) -> usize {
        4 + EGRESS_HEADER_SIZE as usize + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u16_le(EGRESS_HEADER_SIZE);
        buf.put_u32_le(self.pid);
        buf.put_u32_le(self.tid);
        buf.put_u32_le(self.realtime.sec);
        buf.put_u32_le(self.realtime.nsec);
        buf.put_u32_le(self.partition.tag() as u32);
        buf.put_u32_le(self.uid);
        buf.put_slice(&self.payload);
    }

    /// Decodes one frame from `buf`, returning it and the bytes consumed.
    /// `None` means more bytes are needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut header = buf;
        let len = header.get_u16_le() as usize;
        let hdr_size = header.get_u16_le() as usize;
        let total = 4 + hdr_size + len;
        if buf.len() < total {
            return Ok(None);
        }
        if hdr_size != EGRESS_HEADER_SIZE as usize {
            return Err(WireError::MalformedPayload("frame header"));
        }
        let pid = header.get_u32_le();
        let tid = header.get_u32_le();
        let realtime = Timestamp::new(header.get_u32_le(), header.get_u32_le());
        let tag = header.get_u32_le();
        let partition = u8::try_from(tag)
            .ok()
            .and_then(PartitionId::from_tag)
            .ok_or(WireError::UnknownPartition(tag.min(255) as u8))?;
        let uid = header.get_u32_le();
        let payload = header[..len].to_vec();
        Ok(Some((
            EgressFrame {
                pid,
                tid,
                realtime,
                partition,
                uid,
                payload,
            },
            total,
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Serve everything up to the tail at subscription time, then stop.
    #[default]
    Dump,
    /// Keep streaming as records arrive.
    Stream,
}

/// Parsed egress request line:
/// `logIds=<mask> [tail=<n>] [start=<s>.<ns>] [pid=<n>] [uid=<n>] [dump|stream]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub mask: u32,
    pub tail: Option<usize>,
    pub start: Option<Timestamp>,
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    /// Minimum text-record priority; binary partitions ignore it.
    pub level: Option<u8>,
    pub mode: ReadMode,
}

impl ReadRequest {
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let mut mask = None;
        let mut tail = None;
        let mut start = None;
        let mut pid = None;
        let mut uid = None;
        let mut level = None;
        let mut mode = ReadMode::Dump;

        for token in line.split_ascii_whitespace() {
            match token.split_once('=') {
                Some(("logIds", v)) => {
                    let m: u32 = v
                        .parse()
                        .map_err(|_| WireError::BadRequest(format!("logIds={v}")))?;
                    if m == 0 || m >= 1 << PartitionId::COUNT {
                        return Err(WireError::BadRequest(format!("logIds={v}")));
                    }
                    mask = Some(m);
                }
                Some(("tail", v)) => {
                    tail = Some(
                        v.parse()
                            .map_err(|_| WireError::BadRequest(format!("tail={v}")))?,
                    );
                }
                Some(("start", v)) => {
                    start = Some(
                        Timestamp::from_str(v)
                            .map_err(|_| WireError::BadRequest(format!("start={v}")))?,
                    );
                }
                Some(("pid", v)) => {
                    pid = Some(
                        v.parse()
                            .map_err(|_| WireError::BadRequest(format!("pid={v}")))?,
                    );
                }
                Some(("uid", v)) => {
                    uid = Some(
                        v.parse()
                            .map_err(|_| WireError::BadRequest(format!("uid={v}")))?,
                    );
                }
                Some(("level", v)) => {
                    level = Some(
                        v.parse()
                            .map_err(|_| WireError::BadRequest(format!("level={v}")))?,
                    );
                }
                Some((key, _)) => {
                    return Err(WireError::BadRequest(key.to_string()));
                }
                None => match token {
                    "dump" => mode = ReadMode::Dump,
                    "stream" => mode = ReadMode::Stream,
                    other => return Err(WireError::BadRequest(other.to_string())),
                },
            }
        }

        let mask = mask.ok_or_else(|| WireError::BadRequest("missing logIds".to_string()))?;
        Ok(ReadRequest {
            mask,
            tail,
            start,
            pid,
            uid,
            level,
            mode,
        })
    }

    pub fn to_line(&self) -> String {
        let mut line = format!("logIds={}", self.mask);
        if let Some(n) = self.tail {
            line.push_str(&format!(" tail={n}"));
        }
        if let Some(ts) = self.start {
            line.push_str(&format!(" start={ts}"));
        }
        if let Some(pid) = self.pid {
            line.push_str(&format!(" pid={pid}"));
        }
        if let Some(uid) = self.uid {
            line.push_str(&format!(" uid={uid}"));
        }
        if let Some(level) = self.level {
            line.push_str(&format!(" level={level}"));
        }
        line.push_str(match self.mode {
            ReadMode::Dump => " dump",
            ReadMode::Stream => " stream",
        });
        line
    }
}

/// Builds a text-partition payload from its parts.
pub fn text_payload(priority: u8, tag: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + tag.len() + 1 + message.len() + 1);
    payload.push(priority);
    payload.extend_from_slice(tag.as_bytes());
    payload.push(0);
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    payload
}
