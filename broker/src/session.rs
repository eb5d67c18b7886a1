//! Session record and session table (spec.md §3), owned exclusively by
//! the master process.

use nix::unistd::Pid;

/// Key identifying a session: the caller's uid and the client-chosen
/// multiplexing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub caller_uid: libc::uid_t,
    pub caller_num: u32,
}

/// A session pinned to one `(caller_uid, caller_num)` key.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub caller_gid: libc::gid_t,
    pub server_pid: Pid,
}

/// Linear-scan session table. A hash map would also satisfy spec.md §3
/// ("no ordering guarantees required"), but a `Vec` keeps broadcast
/// iteration (SIGTERM on shutdown) trivial and the table is expected to
/// stay small (one entry per concurrently active caller).
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Vec<Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: SessionKey) -> Option<&Session> {
        self.sessions.iter().find(|session| session.key == key)
    }

    /// Insert a new session. Panics if the key is already present —
    /// callers must check [`Self::find`] first (spec.md §3: "at most one
    /// session per key").
    pub fn insert(&mut self, session: Session) {
        assert!(
            self.find(session.key).is_none(),
            "duplicate session for {:?}",
            session.key
        );
        self.sessions.push(session);
    }

    /// Remove the session owned by `pid`, e.g. after reaping it via
    /// SIGCHLD. Returns the removed entry, if any.
    pub fn remove_by_pid(&mut self, pid: Pid) -> Option<Session> {
        let index = self.sessions.iter().position(|session| session.server_pid == pid)?;
        Some(self.sessions.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(uid: libc::uid_t, num: u32) -> SessionKey {
        SessionKey {
            caller_uid: uid,
            caller_num: num,
        }
    }

    #[test]
    fn at_most_one_session_per_key() {
        let mut table = SessionTable::new();
        table.insert(Session {
            key: key(1000, 0),
            caller_gid: 1000,
            server_pid: Pid::from_raw(111),
        });
        assert!(table.find(key(1000, 0)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate session")]
    fn inserting_a_duplicate_key_panics() {
        let mut table = SessionTable::new();
        table.insert(Session {
            key: key(1000, 0),
            caller_gid: 1000,
            server_pid: Pid::from_raw(111),
        });
        table.insert(Session {
            key: key(1000, 0),
            caller_gid: 1000,
            server_pid: Pid::from_raw(222),
        });
    }

    #[test]
    fn remove_by_pid_drops_matching_session() {
        let mut table = SessionTable::new();
        table.insert(Session {
            key: key(1000, 0),
            caller_gid: 1000,
            server_pid: Pid::from_raw(111),
        });
        table.insert(Session {
            key: key(1000, 1),
            caller_gid: 1000,
            server_pid: Pid::from_raw(222),
        });

        let removed = table.remove_by_pid(Pid::from_raw(111)).unwrap();
        assert_eq!(removed.key, key(1000, 0));
        assert_eq!(table.len(), 1);
        assert!(table.find(key(1000, 0)).is_none());
        assert!(table.find(key(1000, 1)).is_some());
    }
}
