//! Framed, `SCM_RIGHTS`-aware channel used for every socket in the broker:
//! the master's listening socket, a session's listening socket, and the
//! ephemeral task-conversation connections accepted from either.
//!
//! Adapted from `privsep::imsg::Handler`, replacing its generic
//! `bincode`-serialized payloads with the fixed-size headers and
//! NUL-terminated string blocks the wire protocol specifies.

use crate::{
    credentials::{peer_credentials, PeerCred},
    error::Error,
    net::{AncillaryData, Fd, SocketAncillary, UnixStream, UnixStreamExt},
    wire::{CommandHeader, CommandType, ResponseHeader},
};
use std::{
    io::{self, IoSlice, IoSliceMut},
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
};
use zerocopy::AsBytes as _;

/// One end of a framed Unix-domain socket connection.
#[derive(Debug)]
pub struct Channel {
    socket: UnixStream,
}

impl From<UnixStream> for Channel {
    fn from(socket: UnixStream) -> Self {
        Self { socket }
    }
}

impl Channel {
    /// Wrap an already-accepted or already-connected socket.
    pub fn new(socket: UnixStream) -> Self {
        socket.into()
    }

    /// Take ownership of a raw descriptor (e.g. one inherited across
    /// `TASK_FDS`) as a channel.
    ///
    /// # Safety
    /// `fd` must be an open `AF_UNIX`/`SOCK_STREAM` descriptor not owned
    /// elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        UnixStream::from_raw_fd(fd).map(Self::new)
    }

    /// The kernel-supplied credentials of the connected peer.
    ///
    /// Must be called right after accepting the connection (see spec.md
    /// §4.1): a session server additionally compares the result against
    /// the caller data captured at session creation.
    pub fn peer_credentials(&self) -> Result<PeerCred, Error> {
        peer_credentials(&self.socket)
    }

    /// Send a command header followed by `payload` (no ancillary data).
    pub async fn send_command(&self, command_type: CommandType, payload: &[u8]) -> Result<(), Error> {
        let header = CommandHeader::new(command_type, payload.len() as u64);
        self.send_framed(header.as_bytes(), payload, None).await
    }

    /// Send a command header and payload together with up to one fd slot
    /// carrying three descriptors via `SCM_RIGHTS` (used only by
    /// `TASK_FDS`, whose ancillary data carries exactly three fds).
    pub async fn send_command_with_fds(
        &self,
        command_type: CommandType,
        payload: &[u8],
        fds: &[RawFd],
    ) -> Result<(), Error> {
        let header = CommandHeader::new(command_type, payload.len() as u64);
        self.send_framed(header.as_bytes(), payload, Some(fds)).await
    }

    async fn send_framed(&self, header: &[u8], payload: &[u8], fds: Option<&[RawFd]>) -> Result<(), Error> {
        let iovs = [IoSlice::new(header), IoSlice::new(payload)];
        let bufs = if payload.is_empty() { &iovs[..1] } else { &iovs[..] };

        let mut ancillary_buffer = [0u8; 128];
        let mut ancillary = SocketAncillary::new(&mut ancillary_buffer);
        if let Some(fds) = fds {
            if !ancillary.add_fds(fds) {
                return Err(Error::Protocol("too many descriptors for ancillary buffer"));
            }
        }

        let expected = header.len() + payload.len();
        let sent = self
            .socket
            .send_vectored_with_ancillary(bufs, &mut ancillary)
            .await
            .map_err(Error::Io)?;
        if sent != expected {
            return Err(Error::Io(io::Error::new(io::ErrorKind::WriteZero, "short write")));
        }
        Ok(())
    }

    /// Receive just a [`CommandHeader`]. Returns `None` on a clean EOF
    /// (peer closed the connection between commands).
    ///
    /// Split out from [`Self::recv_command`] so a caller that needs to
    /// branch on `command_type` before deciding how to read the payload
    /// can do so — `TASK_FDS` in particular must *not* go through
    /// [`Self::recv_command`]'s plain `read(2)`-based payload read, since
    /// its payload rides in the same `sendmsg(2)` call as the `SCM_RIGHTS`
    /// ancillary data and the kernel only delivers that ancillary data to
    /// the `recvmsg(2)` call that consumes those exact bytes ([`Self::recv_fds3`]).
    pub async fn recv_header(&self) -> Result<Option<CommandHeader>, Error> {
        let mut header = CommandHeader::default();
        let mut header_buf = [0u8; CommandHeader::LEN];

        let n = self.recv_exact_or_eof(&mut header_buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if n != header_buf.len() {
            return Err(Error::Protocol("truncated command header"));
        }
        header.as_bytes_mut().copy_from_slice(&header_buf);
        Ok(Some(header))
    }

    /// Receive exactly `datalen` bytes of plain (non-ancillary-bearing)
    /// command payload following a header already read via
    /// [`Self::recv_header`]. Must not be used for `TASK_FDS`; see
    /// [`Self::recv_fds3`].
    pub async fn recv_payload(&self, datalen: u64) -> Result<Vec<u8>, Error> {
        let mut payload = vec![0u8; datalen as usize];
        if !payload.is_empty() {
            let n = self.recv_exact_or_eof(&mut payload).await?;
            if n != payload.len() {
                return Err(Error::Protocol("truncated command payload"));
            }
        }
        Ok(payload)
    }

    /// Receive a [`CommandHeader`] and its payload in one call. Returns
    /// `None` on a clean EOF (peer closed the connection between
    /// commands).
    ///
    /// Callers that may see `TASK_FDS` must not use this: its ancillary
    /// data would be silently dropped by the kernel once the plain
    /// `read(2)` here consumes the payload bytes it rides with. Use
    /// [`Self::recv_header`] followed by either this payload read or
    /// [`Self::recv_fds3`], chosen by `command_type`, instead (see
    /// `broker::conversation::serve`).
    pub async fn recv_command(&self) -> Result<Option<(CommandHeader, Vec<u8>)>, Error> {
        let Some(header) = self.recv_header().await? else {
            return Ok(None);
        };
        let payload = self.recv_payload(header.datalen).await?;
        Ok(Some((header, payload)))
    }

    /// Receive exactly three descriptors passed via `SCM_RIGHTS`, along
    /// with the single dummy data byte `TASK_FDS` carries. Must be called
    /// immediately after a [`Self::recv_header`] that announced
    /// `TASK_FDS` — the dummy byte and the three descriptors are read
    /// together in one `recvmsg(2)` call, matching the single
    /// `sendmsg(2)` call [`Self::send_fds3`] makes.
    pub async fn recv_fds3(&self) -> Result<[Fd; 3], Error> {
        let mut data = [0u8; 1];
        let mut ancillary_buffer = [0u8; 128];
        let mut ancillary = SocketAncillary::new(&mut ancillary_buffer);
        let bufs = &mut [IoSliceMut::new(&mut data)][..];

        self.socket
            .recv_vectored_with_ancillary(bufs, &mut ancillary)
            .await
            .map_err(Error::Io)?;

        let mut fds = Vec::with_capacity(3);
        for message in ancillary.messages().flatten() {
            if let AncillaryData::ScmRights(scm_rights) = message {
                fds.extend(scm_rights.map(Fd::from));
            }
        }

        if fds.len() != 3 {
            return Err(Error::Protocol("expected exactly 3 descriptors"));
        }
        let mut it = fds.into_iter();
        Ok([it.next().unwrap(), it.next().unwrap(), it.next().unwrap()])
    }

    /// Send three descriptors (stdin, stdout, stderr) via `SCM_RIGHTS`.
    pub async fn send_fds3(&self, fds: [RawFd; 3]) -> Result<(), Error> {
        self.send_command_with_fds(CommandType::TaskFds, &[0u8], &fds).await
    }

    /// Send a [`ResponseHeader`] plus an optional UTF-8 error message.
    pub async fn send_response(&self, response: ResponseHeader, message: Option<&str>) -> Result<(), Error> {
        let message_bytes = message.map(str::as_bytes).unwrap_or(&[]);
        let result = self.send_framed(response.as_bytes(), message_bytes, None).await;
        // `EPIPE` means the peer already left; the caller has nothing
        // meaningful to report back to, so swallow it (spec.md §7).
        match result {
            Err(Error::Io(ref err)) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    }

    /// Receive a [`ResponseHeader`] plus its optional trailing message.
    pub async fn recv_response(&self) -> Result<(ResponseHeader, Option<String>), Error> {
        let mut header = ResponseHeader::default();
        let mut header_buf = [0u8; ResponseHeader::LEN];
        let n = self.recv_exact_or_eof(&mut header_buf).await?;
        if n != header_buf.len() {
            return Err(Error::Protocol("truncated response header"));
        }
        header.as_bytes_mut().copy_from_slice(&header_buf);

        let message = if header.msglen > 0 {
            let mut buf = vec![0u8; header.msglen as usize];
            let n = self.recv_exact_or_eof(&mut buf).await?;
            if n != buf.len() {
                return Err(Error::Protocol("truncated response message"));
            }
            Some(String::from_utf8_lossy(&buf).into_owned())
        } else {
            None
        };

        Ok((header, message))
    }

    async fn recv_exact_or_eof(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut filled = 0;
        while filled < buf.len() {
            self.socket.readable().await.map_err(Error::Io)?;
            match self.socket.try_read(&mut buf[filled..]) {
                Ok(0) => return Ok(filled),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
        Ok(filled)
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl IntoRawFd for Channel {
    fn into_raw_fd(self) -> RawFd {
        self.socket.into_std().expect("tokio UnixStream to std").into_raw_fd()
    }
}
