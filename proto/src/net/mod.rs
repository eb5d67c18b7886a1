//! Networking primitives for framed messages and file descriptor passing.

mod ancillary;
mod fd;
mod stream;

pub use ancillary::{AncillaryData, SocketAncillary};
pub use fd::Fd;
pub use stream::{UnixStream, UnixStreamExt};
