//! Stream endpoint of one peer, with SCM_RIGHTS support on Unix sockets.
//!
//! All operations take `&self` so a reader and a writer task can share one
//! stream; readiness is polled via tokio and the actual syscalls go through
//! `try_io`.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};

/// Most descriptors accepted in one control message.
const SCM_MAX_FDS: usize = 16;

#[derive(Debug, Clone)]
pub enum Stream {
    Unix(Arc<UnixStream>),
    Tcp(Arc<TcpStream>),
}

impl Stream {
    /// FD passing can only be negotiated on Unix transports.
    pub fn supports_fd_passing(&self) -> bool {
        matches!(self, Stream::Unix(_))
    }

    /// Reads bytes and any descriptors that rode along as ancillary data.
    pub async fn read_with_fds(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        match self {
            Stream::Tcp(stream) => loop {
                stream.readable().await?;
                match stream.try_read(buf) {
                    Ok(n) => return Ok((n, Vec::new())),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            Stream::Unix(stream) => loop {
                stream.readable().await?;
                let res = stream.try_io(Interest::READABLE, || {
                    let mut iov = [IoSliceMut::new(buf)];
                    let mut cmsg = cmsg_space!([RawFd; SCM_MAX_FDS]);
                    let msg = recvmsg::<UnixAddr>(
                        stream.as_raw_fd(),
                        &mut iov,
                        Some(&mut cmsg),
                        MsgFlags::MSG_CMSG_CLOEXEC,
                    )
                    .map_err(io::Error::from)?;
                    let mut fds = Vec::new();
                    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            for fd in received {
                                // SAFETY: the kernel just handed us this
                                // descriptor; we are its sole owner.
                                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                            }
                        }
                    }
                    Ok((msg.bytes, fds))
                });
                match res {
                    Ok(r) => return Ok(r),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Writes a whole message, attaching descriptors to the first syscall
    /// that carries its bytes. On TCP, descriptors are silently dropped.
    pub async fn write_all_with_fds(&self, bytes: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let mut written = 0;
        if let (Stream::Unix(stream), false) = (self, fds.is_empty()) {
            written = loop {
                stream.writable().await?;
                let res = stream.try_io(Interest::WRITABLE, || {
                    let iov = [IoSlice::new(bytes)];
                    let cmsgs = [ControlMessage::ScmRights(fds)];
                    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                        .map_err(io::Error::from)
                });
                match res {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            };
        }
        while written < bytes.len() {
            let res = match self {
                Stream::Unix(stream) => {
                    stream.writable().await?;
                    stream.try_write(&bytes[written..])
                }
                Stream::Tcp(stream) => {
                    stream.writable().await?;
                    stream.try_write(&bytes[written..])
                }
            };
            match res {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
