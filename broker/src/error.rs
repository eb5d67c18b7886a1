//! Broker-wide error type, carrying the seven error kinds.

use derive_more::{Display, From};
use std::io;

/// The seven error kinds every failure in the broker is classified under.
///
/// Kept as an explicit enum (rather than deriving the kind from a string
/// match on the message) so the wire layer can map an error straight to
/// the right response without re-parsing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    #[display(fmt = "AUTH")]
    Auth,
    #[display(fmt = "PROTOCOL")]
    Protocol,
    #[display(fmt = "VALIDATION")]
    Validation,
    #[display(fmt = "PRIVILEGE")]
    Privilege,
    #[display(fmt = "RESOURCE")]
    Resource,
    #[display(fmt = "TIMEOUT")]
    Timeout,
    #[display(fmt = "TASK")]
    Task,
}

#[derive(Debug, Display)]
#[display(fmt = "{}: {}", kind, message)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn privilege(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Privilege, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn task(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Task, message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::resource(err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::resource(err.to_string())
    }
}

impl From<hasher_priv_proto::Error> for Error {
    fn from(err: hasher_priv_proto::Error) -> Self {
        match err {
            hasher_priv_proto::Error::Protocol(_) => Self::protocol(err.to_string()),
            hasher_priv_proto::Error::UnknownCommand(_) | hasher_priv_proto::Error::UnknownTask(_) => {
                Self::protocol(err.to_string())
            }
            other => Self::resource(other.to_string()),
        }
    }
}

impl From<caps::errors::CapsError> for Error {
    fn from(err: caps::errors::CapsError) -> Self {
        Self::privilege(err.to_string())
    }
}
