//! Capability-drop state machine (spec.md §4.6).
//!
//! Adapted from `Child::new`'s privilege-drop sequence in
//! `privsep::process`, replaced with the fixed capability set a session
//! server must retain instead of dropping all privileges outright.

use crate::error::Error;
use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{setgroups, setreuid, Gid, Uid};

/// The six capabilities a session server retains across the uid switch.
pub const SESSION_CAPABILITIES: &[Capability] = &[
    Capability::CAP_SETGID,
    Capability::CAP_SETUID,
    Capability::CAP_KILL,
    Capability::CAP_MKNOD,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_SYS_ADMIN,
];

/// States of the linear privilege-drop transition. Any failure at any
/// state is fatal; there is no retry and no path back to `Boot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapState {
    Boot,
    KeepCaps,
    CapsetPre,
    Reuid,
    CapsetPost,
    NoNewPrivs,
    Ready,
}

/// Drives the session server from root to an unprivileged-but-capable
/// identity. Grounded on `caller_server.c`'s `drop_privs()`.
pub struct PrivilegeDrop {
    state: CapState,
}

impl PrivilegeDrop {
    pub fn new() -> Self {
        Self { state: CapState::Boot }
    }

    pub fn state(&self) -> CapState {
        self.state
    }

    /// Run the full sequence, switching to `(caller_uid, caller_gid)`
    /// while retaining [`SESSION_CAPABILITIES`].
    pub fn run(&mut self, caller_uid: libc::uid_t, caller_gid: libc::gid_t) -> Result<(), Error> {
        assert_eq!(self.state, CapState::Boot);

        setgroups(&[]).map_err(|err| Error::privilege(format!("setgroups(0): {}", err)))?;
        nix::unistd::setgid(Gid::from_raw(caller_gid))
            .map_err(|err| Error::privilege(format!("setgid: {}", err)))?;

        set_keepcaps(true)?;
        self.state = CapState::KeepCaps;

        install_session_caps()?;
        self.state = CapState::CapsetPre;

        setreuid(Uid::from_raw(caller_uid), Uid::from_raw(caller_uid))
            .map_err(|err| Error::privilege(format!("setreuid: {}", err)))?;
        self.state = CapState::Reuid;

        // `setreuid` to a non-root uid clears the permitted capability
        // set unless it was re-stated afterwards.
        install_session_caps()?;
        self.state = CapState::CapsetPost;

        set_no_new_privs()?;
        self.state = CapState::NoNewPrivs;

        self.state = CapState::Ready;
        Ok(())
    }
}

impl Default for PrivilegeDrop {
    fn default() -> Self {
        Self::new()
    }
}

fn capability_hash_set() -> CapsHashSet {
    SESSION_CAPABILITIES.iter().copied().collect()
}

fn install_session_caps() -> Result<(), Error> {
    let caps = capability_hash_set();
    caps::set(None, CapSet::Effective, &caps)?;
    caps::set(None, CapSet::Permitted, &caps)?;
    Ok(())
}

fn set_keepcaps(keep: bool) -> Result<(), Error> {
    let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, if keep { 1 } else { 0 }, 0, 0, 0) };
    if rc != 0 {
        return Err(Error::privilege(format!(
            "PR_SET_KEEPCAPS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn set_no_new_privs() -> Result<(), Error> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(Error::privilege(format!(
            "PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_boot_state() {
        let drop = PrivilegeDrop::new();
        assert_eq!(drop.state(), CapState::Boot);
    }

    #[test]
    fn session_capability_set_matches_spec() {
        assert_eq!(SESSION_CAPABILITIES.len(), 6);
        assert!(SESSION_CAPABILITIES.contains(&Capability::CAP_SYS_CHROOT));
        assert!(SESSION_CAPABILITIES.contains(&Capability::CAP_SYS_ADMIN));
    }
}
