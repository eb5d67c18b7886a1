//! Error definitions for the wire protocol layer.

use derive_more::{Display, From};
use std::io;

/// Errors raised while framing, sending or receiving protocol messages.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    Io(io::Error),
    #[display(fmt = "{}", "_0")]
    Unix(nix::Error),
    #[display(fmt = "protocol violation: {}", "_0")]
    #[from(ignore)]
    Protocol(&'static str),
    #[display(fmt = "unknown command type: {}", "_0")]
    #[from(ignore)]
    UnknownCommand(u32),
    #[display(fmt = "unknown task kind: {}", "_0")]
    #[from(ignore)]
    UnknownTask(u32),
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
