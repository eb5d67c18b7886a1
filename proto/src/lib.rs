//! Wire protocol and transport primitives shared by the broker's master,
//! session server and client binaries: the framed command/response
//! headers, the closed command and task-kind enums, `SO_PEERCRED` lookup,
//! and the `SCM_RIGHTS` fd-passing channel built on top of them.

mod channel;
mod credentials;
mod error;
pub mod net;
mod task;
pub mod wire;

pub use channel::Channel;
pub use credentials::{peer_credentials, PeerCred};
pub use error::Error;
pub use task::TaskKind;
pub use wire::{CommandHeader, CommandType, ResponseHeader, SessionPayload, Status, TaskBeginPayload};
