//! Task worker: the sequence a forked worker process runs after
//! `TASK_RUN` (spec.md §4.4), and the dispatch table onto individual task
//! bodies.
//!
//! Grounded on `connection.c`'s `process_task()`: reopen stdio, clear and
//! rebuild the environment, sanitize descriptors, parse task arguments,
//! validate the chroot path, initialize caller data, dispatch.

use crate::{
    caller::CallerData,
    chroot::{self, BlockingPump, ChrootParams},
    config::CallerConfig,
    error::Error,
};
use hasher_priv_log::info;
use hasher_priv_proto::TaskKind;
use std::os::unix::io::RawFd;

/// Everything a task body needs: the caller it is running on behalf of,
/// the per-caller configuration loaded by the session server, and the
/// command line supplied with `TASK_ARGUMENTS`. Immutable by convention
/// (spec.md §9): a task body must not mutate the session's view of its
/// caller.
pub struct WorkerContext<'a> {
    pub caller: &'a CallerData,
    pub config: &'a CallerConfig,
    pub argv: &'a [String],
}

/// One task's body. `getconf`/`makedev`/`maketty`/`makeconsole`/`mount`/
/// `umount` are external collaborators per spec.md §1 — only the
/// contract (take a [`WorkerContext`], return an exit status) is in
/// scope; [`unimplemented_task`] is their stand-in.
pub trait TaskAction {
    fn run(&self, ctx: &WorkerContext) -> Result<i32, Error>;
}

/// Run the worker sequence for one accepted task, after the conversation
/// process has forked this worker and the three stdio descriptors have
/// already been installed on fds 0/1/2 by the caller (mirrors
/// `reopen_iostreams` + `dup2` in `connection.c`, steps already performed
/// by the conversation before `fork`).
///
/// Steps 2-8 of spec.md §4.4 run here; step 1 (installing the stdio fds)
/// is the conversation's job since it owns the descriptors received over
/// `TASK_FDS`.
pub fn run_worker(
    kind: TaskKind,
    caller_uid: libc::uid_t,
    caller_gid: libc::gid_t,
    argv: Vec<String>,
    envp: Vec<String>,
    config: &CallerConfig,
) -> i32 {
    // 2. clearenv, then putenv each entry from the stored environment.
    apply_environment(&envp);

    // 3. Sanitize descriptors (close everything >= 3).
    sanitize_fds();

    // 4. Parse task arguments for the kind (chroot path extraction for
    // chrootuid{1,2}; other kinds keep argv as-is for their own parsing).
    let chroot_path = chroot_path_argument(kind, &argv);

    // 5. chroot_path == NULL || chroot_path[0] == '/'.
    if let Some(path) = &chroot_path {
        if !path.starts_with('/') {
            hasher_priv_log::error!("{}: invalid chroot path", path);
            return libc::EXIT_FAILURE;
        }
    }

    // 6. Parse environment for task-config options, then clearenv again.
    // (No broker-level env-derived options beyond TERM/DISPLAY, which
    // chroot::child_environment already derives from config.)
    clear_environment();

    // 3. (caller data init happens here, matching `init_caller_data`
    // being called from within the forked worker in `connection.c`.)
    let caller = match CallerData::init(caller_uid, caller_gid) {
        Ok(caller) => caller,
        Err(err) => {
            hasher_priv_log::error!("init_caller_data: {}", err);
            return libc::EXIT_FAILURE;
        }
    };

    let ctx = WorkerContext {
        caller: &caller,
        config,
        argv: &argv,
    };

    let result = dispatch(kind, &ctx, config);
    match result {
        Ok(status) => status,
        Err(err) => {
            hasher_priv_log::error!("{}: {}", kind, err);
            libc::EXIT_FAILURE
        }
    }
}

fn chroot_path_argument(kind: TaskKind, argv: &[String]) -> Option<String> {
    match kind {
        TaskKind::Chrootuid1 | TaskKind::Chrootuid2 => argv.first().cloned(),
        _ => None,
    }
}

/// `clearenv()` + `putenv()` for every entry of `envp` (spec.md §4.4
/// step 2).
fn apply_environment(envp: &[String]) {
    clear_environment();
    for entry in envp {
        if let Some((key, value)) = entry.split_once('=') {
            std::env::set_var(key, value);
        }
    }
}

fn clear_environment() {
    for (key, _) in std::env::vars() {
        std::env::remove_var(key);
    }
}

/// Close every descriptor `>= 3`; stdio (0/1/2) was already installed by
/// the conversation via `TASK_FDS`/`dup2` (spec.md §4.4 step 3).
fn sanitize_fds() {
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()) {
                if fd >= 3 {
                    let _ = nix::unistd::close(fd);
                }
            }
        }
    }
}

fn dispatch(kind: TaskKind, ctx: &WorkerContext, config: &CallerConfig) -> Result<i32, Error> {
    match kind {
        TaskKind::None => Err(Error::protocol("TASK_RUN: none is not a runnable task")),
        TaskKind::KillUid => do_killuid(ctx),
        TaskKind::GetUgid1 => do_getugid(config.change_uid1, config.change_gid1),
        TaskKind::GetUgid2 => do_getugid(config.change_uid2, config.change_gid2),
        TaskKind::Chrootuid1 => do_chrootuid1(ctx, config),
        TaskKind::Chrootuid2 => do_chrootuid2(ctx, config),
        TaskKind::GetConf => unimplemented_task("getconf"),
        TaskKind::MakeDev => unimplemented_task("makedev"),
        TaskKind::MakeTty => unimplemented_task("maketty"),
        TaskKind::MakeConsole => unimplemented_task("makeconsole"),
        TaskKind::Mount => unimplemented_task("mount"),
        TaskKind::Umount => unimplemented_task("umount"),
    }
}

/// Stand-in for the task action bodies spec.md §1 places out of scope:
/// only the contract (take a context, return an exit status) is
/// specified, and those bodies are external collaborators.
fn unimplemented_task(name: &str) -> Result<i32, Error> {
    Err(Error::task(format!("{}: task action body is an external collaborator", name)))
}

/// Kill every process belonging to the caller's build uid. Grounded on
/// the purpose stated in spec.md §1 ("killing all processes of a
/// per-build uid"); implemented by scanning `/proc` rather than shelling
/// out, since `killuid` has no external config surface beyond the uid
/// itself.
fn do_killuid(ctx: &WorkerContext) -> Result<i32, Error> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = ctx.config.change_uid1.unwrap_or(ctx.caller.uid);
    let mut killed = 0u32;

    let entries = std::fs::read_dir("/proc").map_err(|err| Error::resource(format!("/proc: {}", err)))?;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let status_path = entry.path().join("status");
        let Ok(status) = std::fs::read_to_string(&status_path) else {
            continue;
        };
        let owner = status
            .lines()
            .find(|line| line.starts_with("Uid:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|s| s.parse::<libc::uid_t>().ok());
        if owner == Some(target) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            killed += 1;
        }
    }

    info!("killuid: sent SIGKILL to {} process(es) owned by uid {}", killed, target);
    Ok(libc::EXIT_SUCCESS)
}

/// Print the configured `(uid, gid)` pair for a build slot, the way a
/// calling script would query it to `chown` build artifacts.
fn do_getugid(uid: Option<libc::uid_t>, gid: Option<libc::gid_t>) -> Result<i32, Error> {
    let uid = uid.ok_or_else(|| Error::validation("change_uid not configured for this slot"))?;
    let gid = gid.ok_or_else(|| Error::validation("change_gid not configured for this slot"))?;
    println!("{}:{}", uid, gid);
    Ok(libc::EXIT_SUCCESS)
}

fn do_chrootuid1(ctx: &WorkerContext, config: &CallerConfig) -> Result<i32, Error> {
    run_chrootuid(ctx, config, config.change_uid1, config.change_gid1, "/root", "root", "/sbin:/usr/sbin:/bin:/usr/bin")
}

fn do_chrootuid2(ctx: &WorkerContext, config: &CallerConfig) -> Result<i32, Error> {
    run_chrootuid(ctx, config, config.change_uid2, config.change_gid2, "/usr/src", "builder", "/bin:/usr/bin:/usr/X11R6/bin")
}

fn run_chrootuid(
    ctx: &WorkerContext,
    config: &CallerConfig,
    target_uid: Option<libc::uid_t>,
    target_gid: Option<libc::gid_t>,
    home: &'static str,
    user: &'static str,
    path: &'static str,
) -> Result<i32, Error> {
    let target_uid = target_uid.ok_or_else(|| Error::validation("change_uid not configured for this slot"))?;
    let target_gid = target_gid.ok_or_else(|| Error::validation("change_gid not configured for this slot"))?;

    let chroot_path = ctx
        .argv
        .first()
        .ok_or_else(|| Error::validation("missing chroot path argument"))?
        .clone();
    let command = ctx.argv[1..].to_vec();
    if command.is_empty() {
        return Err(Error::validation("chrootuid task requires a command to exec"));
    }

    let params = ChrootParams {
        target_uid,
        target_gid,
        caller_uid: ctx.caller.uid,
        chroot_path: chroot_path.into(),
        allowed_mountpoints: config.allowed_mountpoints.iter().map(Into::into).collect(),
        use_pty: config.use_pty,
        share_caller_network: config.share_caller_network,
        x11_display: config.x11_display.clone(),
        term: std::env::var("TERM").ok(),
        home,
        user,
        path,
        argv: command,
    };

    let outcome = chroot::run_chrootuid(params, BlockingPump)?;
    Ok(outcome.exit_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getugid_formats_as_uid_colon_gid() {
        assert!(do_getugid(Some(5001), Some(5001)).is_ok());
        assert!(do_getugid(None, Some(5001)).is_err());
    }

    #[test]
    fn chroot_path_is_only_extracted_for_chroot_tasks() {
        let argv = vec!["/srv/root".to_string(), "/bin/true".to_string()];
        assert_eq!(chroot_path_argument(TaskKind::Chrootuid1, &argv), Some("/srv/root".to_string()));
        assert_eq!(chroot_path_argument(TaskKind::Mount, &argv), None);
    }
}
