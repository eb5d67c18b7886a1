//! Peer credential lookup (`SO_PEERCRED`).

use crate::error::Error;
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::os::unix::io::AsRawFd;

/// `(pid, uid, gid)` of the peer of a connected `AF_UNIX` socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Fetch the kernel-supplied credentials of the peer of `socket`.
///
/// This must be called immediately after `accept`; on Linux the kernel
/// snapshots the peer's identity at connect time, so the result is safe to
/// trust for authentication even though the peer process could have since
/// exited or changed its own credentials.
pub fn peer_credentials<S: AsRawFd>(socket: &S) -> Result<PeerCred, Error> {
    let cred = getsockopt(socket, PeerCredentials)?;
    Ok(PeerCred {
        pid: cred.pid(),
        uid: cred.uid(),
        gid: cred.gid(),
    })
}
