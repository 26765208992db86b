//! The ingest endpoint: a non-blocking Unix datagram socket, one record
//! per datagram. Producer credentials come from SCM_CREDENTIALS ancillary
//! data, so the socket is read with `recvmsg` through an `AsyncFd` rather
//! than tokio's datagram wrapper.

use crate::store::LogStore;
use log::{debug, error, info, warn};
use loghub_utils::log::LogTarget;
use loghub_utils::partition::{PartitionId, Timestamp};
use loghub_utils::wire::{IngestFrame, INGEST_HEADER_LEN, MAX_DATAGRAM_PAYLOAD};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;

const SHUTDOWN_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
struct PeerCreds {
    pid: u32,
    uid: u32,
}

pub struct IngestEndpoint {
    socket: AsyncFd<UnixDatagram>,
    store: Arc<LogStore>,
    shutdown_flag: Arc<AtomicBool>,
}

impl IngestEndpoint {
    pub fn bind(
        path: &Path,
        store: Arc<LogStore>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        enable_passcred(&socket)?;
        Ok(IngestEndpoint {
            socket: AsyncFd::new(socket)?,
            store,
            shutdown_flag,
        })
    }

    pub async fn run(self) {
        info!(target: LogTarget::Ingest.as_str(), "ingest endpoint ready");

        let mut buf = vec![0u8; INGEST_HEADER_LEN + MAX_DATAGRAM_PAYLOAD];
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            let mut guard =
                match tokio::time::timeout(SHUTDOWN_TICK, self.socket.readable()).await {
                    Ok(Ok(guard)) => guard,
                    Ok(Err(e)) => {
                        error!(target: LogTarget::Ingest.as_str(), "socket poll failed: {e}");
                        break;
                    }
                    // Idle tick: re-check the shutdown flag.
                    Err(_) => continue,
                };

            match guard.try_io(|socket| recv_with_creds(socket.get_ref(), &mut buf)) {
                Ok(Ok((len, creds))) => self.dispatch(&buf[..len], creds),
                Ok(Err(e)) => {
                    warn!(target: LogTarget::Ingest.as_str(), "recvmsg failed: {e}");
                }
                Err(_would_block) => continue,
            }
        }

        info!(target: LogTarget::Ingest.as_str(), "ingest endpoint stopped");
    }

    fn dispatch(&self, datagram: &[u8], creds: Option<PeerCreds>) {
        // For accounting, attribute malformed datagrams to the partition
        // named in the header when that much is intact.
        let claimed = datagram
            .first()
            .and_then(|&tag| PartitionId::from_tag(tag))
            .unwrap_or(PartitionId::Main);

        let frame = match IngestFrame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: LogTarget::Ingest.as_str(), "dropping datagram: {e}");
                self.store.note_ingest_drop(claimed);
                return;
            }
        };

        let Some(creds) = creds else {
            debug!(
                target: LogTarget::Ingest.as_str(),
                "dropping datagram without credentials"
            );
            self.store.note_ingest_drop(frame.partition);
            return;
        };

        let realtime = if frame.realtime.is_zero() {
            Timestamp::now()
        } else {
            frame.realtime
        };
        let priority = if frame.partition.is_binary() {
            0
        } else {
            frame.payload[0]
        };

        if let Err(e) = self.store.log(
            frame.partition,
            realtime,
            creds.uid,
            creds.pid,
            frame.tid as u32,
            priority,
            frame.payload,
        ) {
            debug!(target: LogTarget::Ingest.as_str(), "write rejected: {e}");
            self.store.note_ingest_drop(frame.partition);
        }
    }
}

fn enable_passcred(socket: &UnixDatagram) -> std::io::Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// `recvmsg` with room for one SCM_CREDENTIALS control message.
fn recv_with_creds(
    socket: &UnixDatagram,
    buf: &mut [u8],
) -> std::io::Result<(usize, Option<PeerCreds>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = [0u8; 64];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;

    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if len < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut creds = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
            {
                let ucred = libc::CMSG_DATA(cmsg).cast::<libc::ucred>().read_unaligned();
                creds = Some(PeerCreds {
                    pid: ucred.pid as u32,
                    uid: ucred.uid,
                });
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((len as usize, creds))
}
