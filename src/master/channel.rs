//! Duplex channel over a unix-domain stream socket
//!
//! Two kinds of traffic share one socket:
//!
//! ```text
//! message:     ┌────────────┬──────────────────────┐
//!              │   Length   │   Payload (UTF-8)    │
//!              │  (4 bytes) │  (variable length)   │
//!              └────────────┴──────────────────────┘
//!
//! descriptor:  one dummy byte carrying an SCM_RIGHTS control message
//! ```
//!
//! Nothing on the wire says which kind comes next. Both peers know from the
//! protocol order whether a step expects a message or a descriptor.

use crate::error::ChannelError;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Maximum payload size of a single message (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// A unix stream socket that carries framed text messages and descriptors
#[derive(Debug)]
pub struct DuplexChannel {
    stream: UnixStream,
}

impl DuplexChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Take ownership of a descriptor that refers to a connected unix socket
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::new(UnixStream::from(fd))
    }

    /// Create a connected pair of channels
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Open a second handle on the same socket (e.g. a dedicated reader)
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self::new(self.stream.try_clone()?))
    }

    /// Send one framed message
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        let payload = text.as_bytes();
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ChannelError::MessageTooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive one framed message
    pub fn receive_message(&mut self) -> Result<String> {
        let mut len_bytes = [0u8; 4];
        read_exact_or_closed(&mut self.stream, &mut len_bytes)?;

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ChannelError::MessageTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        read_exact_or_closed(&mut self.stream, &mut payload)?;

        String::from_utf8(payload).map_err(|_| ChannelError::InvalidUtf8)
    }

    /// Send one descriptor to the peer using SCM_RIGHTS
    ///
    /// The kernel duplicates the descriptor into the receiving process; the
    /// caller's handle stays open until the caller drops it.
    pub fn send_descriptor<F: AsFd>(&self, fd: F) -> Result<()> {
        // A control message must ride along with at least 1 byte of data
        let dummy_data = [0u8; 1];
        let iov = [IoSlice::new(&dummy_data)];

        let fds = [fd.as_fd().as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];

        sendmsg::<()>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )?;

        Ok(())
    }

    /// Receive one descriptor from the peer
    ///
    /// The returned descriptor is close-on-exec. Extra descriptors in the same
    /// control message are closed.
    pub fn receive_descriptor(&self) -> Result<OwnedFd> {
        let mut dummy_data = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut dummy_data)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 4]);

        let msg = recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;

        if msg.bytes == 0 {
            return Err(ChannelError::Closed);
        }

        let mut raw_fds: Vec<RawFd> = Vec::new();
        match msg.cmsgs() {
            Ok(cmsgs_iter) => {
                for cmsg in cmsgs_iter {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        raw_fds.extend(received);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        // SAFETY: every descriptor in SCM_RIGHTS was freshly installed in this
        // process by recvmsg and is owned by nobody else.
        let mut owned: Vec<OwnedFd> = raw_fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();

        if owned.is_empty() {
            return Err(ChannelError::NoDescriptor);
        }
        let fd = owned.swap_remove(0);

        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

        Ok(fd)
    }

    /// Shut down both directions of this end, waking any blocked reader
    /// that holds a clone of it
    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    /// Close the channel
    pub fn close(self) {
        drop(self);
    }
}

impl AsFd for DuplexChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl From<UnixStream> for DuplexChannel {
    fn from(stream: UnixStream) -> Self {
        Self::new(stream)
    }
}

fn read_exact_or_closed(stream: &mut UnixStream, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ChannelError::Closed),
        Err(e) => Err(e.into()),
    }
}
