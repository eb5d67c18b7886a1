//! Process-level helpers: daemonizing and rlimit application.
//!
//! `daemon()` is adapted from `privsep::process`'s portable `daemon(3)`
//! wrapper; unlike the original `master`/`parent` setup, every role here
//! is forked dynamically rather than declared as a static process list.

use crate::{config::RlimitEntry, error::Error};
use nix::unistd::{daemon as nix_daemon, fork, ForkResult};

/// Portable daemonize: fork, detach from the controlling terminal,
/// redirect stdio to `/dev/null` unless `no_close` is set.
pub fn daemon(no_close: bool, no_chdir: bool) -> Result<(), Error> {
    nix_daemon(no_chdir, no_close).map_err(|err| Error::resource(format!("daemon(3): {}", err)))
}

/// Fork, forwarding the parent/child split as a plain [`ForkResult`].
///
/// Thin wrapper kept for symmetry with the rest of this module and to
/// centralize the one `unsafe` call site every role's fork-and-drop
/// sequence goes through.
///
/// # Safety
/// Same caveats as `nix::unistd::fork`: async-signal-unsafe code must
/// not run between the fork and an `execve`/`_exit` in the child.
pub unsafe fn fork_process() -> Result<ForkResult, Error> {
    fork().map_err(|err| Error::resource(format!("fork: {}", err)))
}

/// Apply the `change_rlimit` table (spec.md §6) after privilege drop.
pub fn apply_rlimits(entries: &[RlimitEntry]) -> Result<(), Error> {
    for entry in entries {
        let resource = parse_resource(&entry.name)?;
        let current = nix::sys::resource::getrlimit(resource)
            .map_err(|err| Error::privilege(format!("getrlimit({}): {}", entry.name, err)))?;
        let soft = entry.soft.unwrap_or(current.0);
        let hard = entry.hard.unwrap_or(current.1);
        nix::sys::resource::setrlimit(resource, soft, hard)
            .map_err(|err| Error::privilege(format!("setrlimit({}): {}", entry.name, err)))?;
    }
    Ok(())
}

fn parse_resource(name: &str) -> Result<nix::sys::resource::Resource, Error> {
    use nix::sys::resource::Resource;
    Ok(match name {
        "RLIMIT_CPU" => Resource::RLIMIT_CPU,
        "RLIMIT_FSIZE" => Resource::RLIMIT_FSIZE,
        "RLIMIT_DATA" => Resource::RLIMIT_DATA,
        "RLIMIT_STACK" => Resource::RLIMIT_STACK,
        "RLIMIT_NOFILE" => Resource::RLIMIT_NOFILE,
        "RLIMIT_AS" => Resource::RLIMIT_AS,
        "RLIMIT_NPROC" => Resource::RLIMIT_NPROC,
        "RLIMIT_MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        other => return Err(Error::validation(format!("unknown rlimit resource: {}", other))),
    })
}

/// Parse a `-l/--loglevel` flag value into the `RUST_LOG`-compatible
/// string `hasher-priv-log` expects.
pub fn parse_loglevel(raw: &str) -> Result<String, Error> {
    for candidate in ["debug", "info", "warning", "error"] {
        if candidate == raw {
            return Ok(if raw == "warning" { "warn".to_string() } else { raw.to_string() });
        }
    }
    Err(Error::validation(format!("unknown loglevel: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loglevel_warning_maps_to_warn() {
        assert_eq!(parse_loglevel("warning").unwrap(), "warn");
        assert_eq!(parse_loglevel("debug").unwrap(), "debug");
        assert!(parse_loglevel("bogus").is_err());
    }
}
