//! Pidfile handling: refuse to start a second daemon instance.
//!
//! The parsing format of the rest of the config is an external
//! collaborator, but "refuse to start if already running" is core
//! startup behavior the original always performs (`hasher-privd.c`).

use crate::error::Error;
use std::path::Path;

/// Read an existing pidfile and check whether its pid is still alive
/// (via `/proc/<pid>`). Returns `Ok(None)` if the file is absent, stale,
/// or unparsable; returns the live pid otherwise.
pub fn check(path: &Path) -> Result<Option<libc::pid_t>, Error> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::resource(format!("reading pidfile: {}", err))),
    };

    let pid: libc::pid_t = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => return Ok(None),
    };

    if Path::new(&format!("/proc/{}", pid)).exists() {
        Ok(Some(pid))
    } else {
        Ok(None)
    }
}

/// Atomically write the current process id to `path`.
pub fn write(path: &Path) -> Result<(), Error> {
    let pid = std::process::id();
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("{}\n", pid))
        .map_err(|err| Error::resource(format!("writing pidfile: {}", err)))?;
    std::fs::rename(&tmp, path).map_err(|err| Error::resource(format!("installing pidfile: {}", err)))
}

/// Remove the pidfile on clean shutdown.
pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pidfile_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hasher-privd.pid");
        assert!(check(&path).unwrap().is_none());
    }

    #[test]
    fn stale_pid_is_treated_as_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hasher-privd.pid");
        // PID 1 << 30 is guaranteed not to exist as a live process.
        std::fs::write(&path, "1073741824\n").unwrap();
        assert!(check(&path).unwrap().is_none());
    }

    #[test]
    fn write_then_check_round_trips_our_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hasher-privd.pid");
        write(&path).unwrap();
        assert_eq!(check(&path).unwrap(), Some(std::process::id() as libc::pid_t));
        remove(&path);
        assert!(check(&path).unwrap().is_none());
    }
}
