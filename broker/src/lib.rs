//! `hasher-priv-broker`: session table, caller data, privilege-drop state
//! machine, task state machine and chroot container assembly shared by
//! the `hasher-privd` master daemon and the `hasher-priv` client's peer
//! (the session server and its forked workers).
//!
//! Every role in the broker (master, session server, conversation,
//! worker) runs as its own OS process; this crate is the library they all
//! link, not a process of its own. See `daemon/` and `client/` for the
//! binaries.

pub mod caller;
pub mod chroot;
pub mod config;
pub mod conversation;
pub mod error;
pub mod pidfile;
pub mod privdrop;
pub mod process;
pub mod session;
pub mod task;
pub mod worker;

pub use caller::CallerData;
pub use config::{CallerConfig, ConfigSource, ServerConfig, TomlConfigSource};
pub use error::{Error, ErrorKind};
pub use privdrop::{CapState, PrivilegeDrop};
pub use session::{Session, SessionKey, SessionTable};
pub use task::{ConversationState, TaskRecord};
