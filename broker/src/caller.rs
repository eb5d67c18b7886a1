//! Caller data derived from peer credentials.

use crate::error::Error;
use nix::unistd::User;
use std::path::PathBuf;

pub const MIN_CHANGE_UID: libc::uid_t = 34;
pub const MIN_CHANGE_GID: libc::gid_t = 34;

/// Caller identity the session server validates at startup and then
/// treats as immutable for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct CallerData {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub login: String,
    pub home: PathBuf,
}

impl CallerData {
    /// Validate `(uid, gid)` against the system user database and build
    /// the immutable caller record, per spec.md §3's invariants.
    pub fn init(uid: libc::uid_t, gid: libc::gid_t) -> Result<Self, Error> {
        if uid < MIN_CHANGE_UID {
            return Err(Error::validation(format!("uid {} below MIN_CHANGE_UID", uid)));
        }
        if gid < MIN_CHANGE_GID {
            return Err(Error::validation(format!("gid {} below MIN_CHANGE_GID", gid)));
        }

        let user = User::from_uid(nix::unistd::Uid::from_raw(uid))
            .map_err(|err| Error::validation(format!("user lookup for uid {}: {}", uid, err)))?
            .ok_or_else(|| Error::validation(format!("no passwd entry for uid {}", uid)))?;

        if user.uid.as_raw() != uid || user.gid.as_raw() != gid {
            return Err(Error::validation(format!(
                "passwd entry for uid {} does not match supplied (uid, gid)",
                uid
            )));
        }

        let home = user
            .dir
            .canonicalize()
            .map_err(|err| Error::validation(format!("canonicalizing home directory: {}", err)))?;
        if home.as_os_str().is_empty() {
            return Err(Error::validation("caller home directory is empty"));
        }

        Ok(Self {
            uid,
            gid,
            login: user.name,
            home,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_uid_below_minimum() {
        let err = CallerData::init(33, 1000).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn rejects_gid_below_minimum() {
        let err = CallerData::init(1000, 33).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
