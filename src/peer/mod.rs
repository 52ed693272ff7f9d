pub mod handshake;
pub mod stream;

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::bus::Guid;
use crate::wire::{message, Endian, Message};
use handshake::{Credentials, Handshake};
use stream::Stream;

/// The handshake must finish within this deadline or the connection is
/// dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the outbound queue; a peer that lets this fill up is dropped as
/// a slow consumer.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

const READ_BUF_SIZE: usize = 16 * 1024;

/// A freshly authenticated connection, not yet registered with the router.
#[derive(Debug)]
pub struct Peer {
    stream: Stream,
    credentials: Credentials,
    fd_passing: bool,
    leftover: Vec<u8>,
}

impl Peer {
    /// Drives the authentication handshake under its wall-clock deadline.
    pub async fn authenticate(stream: Stream, guid: &Guid) -> Result<Self> {
        timeout(HANDSHAKE_TIMEOUT, Self::handshake(stream, guid))
            .await
            .map_err(|_| anyhow!("authentication handshake timed out"))?
    }

    async fn handshake(stream: Stream, guid: &Guid) -> Result<Self> {
        let mut handshake = Handshake::new(guid.as_str(), stream.supports_fd_passing());
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let (n, fds) = stream.read_with_fds(&mut buf).await?;
            if n == 0 {
                bail!("connection closed during handshake");
            }
            if !fds.is_empty() {
                // Descriptors have no business arriving before BEGIN.
                warn!(
                    "dropping {} descriptors received during handshake",
                    fds.len()
                );
            }
            let advance = handshake.advance(&buf[..n])?;
            if !advance.reply.is_empty() {
                stream.write_all_with_fds(&advance.reply, &[]).await?;
            }
            if advance.begun {
                trace!("handshake complete");
                return Ok(Self {
                    stream,
                    credentials: handshake.credentials(),
                    fd_passing: handshake.unix_fd_agreed(),
                    leftover: advance.leftover,
                });
            }
        }
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn fd_passing(&self) -> bool {
        self.fd_passing
    }

    pub(crate) fn into_parts(self) -> (Stream, Vec<u8>, Credentials, bool) {
        (self.stream, self.leftover, self.credentials, self.fd_passing)
    }
}

/// Drains a peer's outbound queue onto its socket, one message at a time.
///
/// Descriptors ride as ancillary data when FD passing was negotiated and are
/// silently dropped otherwise; the declared count stays with the wire bytes
/// either way.
pub(crate) async fn write_loop(
    stream: Stream,
    mut rx: mpsc::Receiver<Arc<Message>>,
    fd_passing: bool,
) {
    while let Some(msg) = rx.recv().await {
        let bytes = match message::encode_message(&msg, Endian::Little) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode outbound message: {e}");
                continue;
            }
        };
        let fds: Vec<RawFd> = if fd_passing {
            msg.fds.iter().map(|fd| fd.as_raw_fd()).collect()
        } else {
            Vec::new()
        };
        if let Err(e) = stream.write_all_with_fds(&bytes, &fds).await {
            debug!("write failed, stopping writer: {e}");
            break;
        }
    }
}
