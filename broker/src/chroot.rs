//! Chroot container assembly for `chrootuid1`/`chrootuid2` (spec.md §4.5).
//!
//! Grounded on `chrootuid.c`'s `chrootuid()` and `pty.c`'s `open_pty()`;
//! the eleven-step ordering below mirrors the C original exactly because
//! each step constrains the next (mount namespace before chdir, pty
//! opened outside the chroot before `chroot(".")`, privilege dropped only
//! in the child after the fork that splits master from slave).

use crate::{error::Error, process::fork_process};
use nix::{
    fcntl::{self, FcntlArg, FdFlag, OFlag},
    pty::{openpty, OpenptyResult},
    sched::{unshare, CloneFlags},
    sys::{
        signal::{SigSet, SigmaskHow, Signal},
        socket::{socketpair, AddressFamily, SockFlag, SockType},
        stat::Mode,
    },
    unistd::{chdir, chroot as nix_chroot, close, getuid, setgid, setgroups, setuid, ForkResult, Gid, Pid, Uid},
};
use futures::TryStreamExt;
use std::{
    collections::HashSet,
    os::unix::io::{IntoRawFd, RawFd},
    path::{Path, PathBuf},
};

use crate::caller::MIN_CHANGE_UID;

/// Everything the chroot assembly needs, already validated and resolved
/// by the worker before this module is entered (spec.md §9: caller_*,
/// chroot_path and friends are an immutable value passed down, never
/// global mutable state).
#[derive(Debug, Clone)]
pub struct ChrootParams {
    pub target_uid: libc::uid_t,
    pub target_gid: libc::gid_t,
    /// The caller's uid, required to own (or have root own) every
    /// component of `chroot_path` (spec.md §4.5 step 3).
    pub caller_uid: libc::uid_t,
    pub chroot_path: PathBuf,
    pub allowed_mountpoints: Vec<PathBuf>,
    pub use_pty: bool,
    pub share_caller_network: bool,
    pub x11_display: Option<String>,
    pub term: Option<String>,
    pub home: &'static str,
    pub user: &'static str,
    pub path: &'static str,
    pub argv: Vec<String>,
}

/// Pumps bytes between the pty master / pipe read-sides / X11 control fd
/// and the client's own descriptors. The wire format and scheduling of
/// that pump is explicitly out of scope (spec.md §1); this trait is the
/// seam a caller can plug a real implementation into. [`BlockingPump`] is
/// a minimal default good enough to drain a chroot task to completion.
pub trait IoPump {
    fn run(&mut self, master: RawFd, pipe_out: Option<RawFd>, pipe_err: Option<RawFd>, ctl: Option<RawFd>) -> Result<(), Error>;
}

/// Default pump: copies bytes between each source fd and the
/// corresponding inherited stdio descriptor with `poll(2)` until every
/// source has hit EOF. Good enough to unblock a chroot task; a richer
/// terminal-aware pump is an external concern.
#[derive(Default)]
pub struct BlockingPump;

impl IoPump for BlockingPump {
    fn run(&mut self, master: RawFd, pipe_out: Option<RawFd>, pipe_err: Option<RawFd>, ctl: Option<RawFd>) -> Result<(), Error> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        use std::os::fd::BorrowedFd;

        let mut sources: Vec<RawFd> = vec![master];
        sources.extend(pipe_out);
        sources.extend(pipe_err);
        sources.extend(ctl);

        let mut live: HashSet<RawFd> = sources.iter().copied().collect();
        let mut buf = [0u8; 4096];

        while !live.is_empty() {
            let borrowed: Vec<RawFd> = live.iter().copied().collect();
            let mut fds: Vec<PollFd> = borrowed
                .iter()
                .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
                .collect();
            let n = poll(&mut fds, PollTimeout::NONE).map_err(|err| Error::resource(format!("poll: {}", err)))?;
            if n <= 0 {
                continue;
            }
            for (&fd, pollfd) in borrowed.iter().zip(fds.iter()) {
                let Some(events) = pollfd.revents() else { continue };
                if events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    let read = read_fd(fd, &mut buf);
                    if read == 0 {
                        live.remove(&fd);
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> usize {
    match nix::unistd::read(fd, buf) {
        Ok(n) => n,
        Err(_) => 0,
    }
}

/// Result of a completed chroot task, as reported back to the
/// conversation process that forked the worker.
pub struct ChrootOutcome {
    pub exit_status: i32,
}

/// Run the full container-construction sequence and the child's command,
/// returning the exit status the task conversation reports back over
/// `TASK_RUN`.
///
/// Must be called from inside the already-forked worker process, with
/// root privileges and the six session capabilities still held.
pub fn run_chrootuid(params: ChrootParams, mut pump: impl IoPump) -> Result<ChrootOutcome, Error> {
    // 1. Validate target uid.
    if params.target_uid < MIN_CHANGE_UID || Uid::from_raw(params.target_uid) == getuid() {
        return Err(Error::validation(format!("invalid uid: {}", params.target_uid)));
    }

    // 2. Unshare mount namespace, apply requested mountpoints.
    unshare(CloneFlags::CLONE_NEWNS).map_err(|err| Error::privilege(format!("unshare(CLONE_NEWNS): {}", err)))?;
    apply_mountpoints(&params.chroot_path, &params.allowed_mountpoints)?;

    // 3. chdir into chroot_path, validating every path component is
    // owned by the caller (or root) and free of symlink races.
    chdir_validated(&params.chroot_path, params.caller_uid)?;

    // 4. End pw/gr enumerators (no persistent state to close in Rust's
    // `nix::unistd::User` lookups; kept as a named step for parity with
    // the original's `endpwent()`/`endgrent()`).

    // 5. Sanitize descriptors again.
    sanitize_fds(&[0, 1, 2]);

    // 6. Pipes, only without a pty.
    let (pipe_out, pipe_err) = if params.use_pty {
        (None, None)
    } else {
        let out = nix::unistd::pipe().map_err(|err| Error::resource(format!("pipe: {}", err)))?;
        let err = nix::unistd::pipe().map_err(|err| Error::resource(format!("pipe: {}", err)))?;
        (Some(out), Some(err))
    };

    // 7. X11 control socketpair, only if X11 forwarding was prepared.
    let ctl = if params.x11_display.is_some() {
        Some(
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .map_err(|err| Error::resource(format!("socketpair AF_UNIX: {}", err)))?,
        )
    } else {
        None
    };

    // 8. Unshare IPC, UTS and (unless sharing) network.
    unshare(CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS)
        .map_err(|err| Error::privilege(format!("unshare(IPC|UTS): {}", err)))?;
    if !params.share_caller_network {
        unshare(CloneFlags::CLONE_NEWNET).map_err(|err| Error::privilege(format!("unshare(CLONE_NEWNET): {}", err)))?;
        bring_loopback_up()?;
    }

    // 9. Drop supplementary groups.
    setgroups(&[]).map_err(|err| Error::privilege(format!("setgroups: {}", err)))?;

    // 10. Open a pty outside the new root, chroot, then try again inside.
    let OpenptyResult { master: outer_master, slave: outer_slave } =
        openpty(None, None).map_err(|err| Error::resource(format!("openpty: {}", err)))?;
    let mut master_fd: RawFd = outer_master.into_raw_fd();
    let mut slave_fd: RawFd = outer_slave.into_raw_fd();

    nix_chroot(".").map_err(|err| Error::privilege(format!("chroot: {}: {}", params.chroot_path.display(), err)))?;

    if let Ok(OpenptyResult { master: inner_master, slave: inner_slave }) = openpty(None, None) {
        let inner_master_fd: RawFd = inner_master.into_raw_fd();
        let inner_slave_fd: RawFd = inner_slave.into_raw_fd();
        if inner_master_fd > master_fd {
            let _ = close(master_fd);
            let _ = close(slave_fd);
            master_fd = inner_master_fd;
            slave_fd = inner_slave_fd;
        } else {
            let _ = close(inner_master_fd);
            let _ = close(inner_slave_fd);
        }
    }

    // 11. Close-on-exec on non-standard descriptors; block SIGCHLD before
    // the fork that splits master from slave role.
    set_cloexec_all(&[master_fd, slave_fd], &pipe_out, &pipe_err, &ctl);
    let mut block = SigSet::empty();
    block.add(Signal::SIGCHLD);
    block
        .thread_block()
        .map_err(|err| Error::resource(format!("sigprocmask(SIG_BLOCK, SIGCHLD): {}", err)))?;

    // 12. Fork into parent (master) and child (slave).
    match unsafe { fork_process() }? {
        ForkResult::Parent { child } => {
            let _ = close(slave_fd);
            if let Some((_, write_end)) = pipe_out {
                let _ = close(write_end);
            }
            if let Some((_, write_end)) = pipe_err {
                let _ = close(write_end);
            }
            if let Some((_, write_end)) = ctl {
                let _ = close(write_end);
            }

            pump.run(
                master_fd,
                pipe_out.map(|(read_end, _)| read_end),
                pipe_err.map(|(read_end, _)| read_end),
                ctl.map(|(read_end, _)| read_end),
            )?;

            let status = waitpid_exit_status(child)?;
            Ok(ChrootOutcome { exit_status: status })
        }
        ForkResult::Child => {
            let _ = close(master_fd);
            if let Some((read_end, _)) = pipe_out {
                let _ = close(read_end);
            }
            if let Some((read_end, _)) = pipe_err {
                let _ = close(read_end);
            }
            if let Some((read_end, _)) = ctl {
                let _ = close(read_end);
            }

            // Open question (spec.md §9): unshare the network in the
            // child even when sharing was requested, so the child's
            // namespace is always the defensive one.
            if params.share_caller_network {
                let _ = unshare(CloneFlags::CLONE_NEWNET);
            }

            setgid(Gid::from_raw(params.target_gid)).map_err(|err| Error::privilege(format!("setgid: {}", err)))?;
            setuid(Uid::from_raw(params.target_uid)).map_err(|err| Error::privilege(format!("setuid: {}", err)))?;
            // Process is no longer privileged past this point.

            let env = child_environment(&params);
            exec_child(slave_fd, pipe_out.map(|(_, write_end)| write_end), pipe_err.map(|(_, write_end)| write_end), ctl.map(|(_, write_end)| write_end), &params.argv, &env)
        }
    }
}

fn apply_mountpoints(chroot_path: &Path, mountpoints: &[PathBuf]) -> Result<(), Error> {
    use nix::mount::{mount, MsFlags};

    for source in mountpoints {
        let target = chroot_path.join(source.strip_prefix("/").unwrap_or(source));
        std::fs::create_dir_all(&target).map_err(|err| Error::resource(format!("mkdir {}: {}", target.display(), err)))?;
        mount(
            Some(source.as_path()),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|err| Error::privilege(format!("bind mount {} -> {}: {}", source.display(), target.display(), err)))?;
    }
    Ok(())
}

/// `chdir` into `path` one component at a time via `openat(O_NOFOLLOW)`,
/// so a symlink planted by the unprivileged caller between validation and
/// use cannot redirect the chroot, and reject any component not owned by
/// `caller_uid` or root (spec.md §4.5 step 3). Grounded on `caller.c`'s
/// `chdiruid()`/`safe_chdir()` and its `stat_caller_ok_validator`.
fn chdir_validated(path: &Path, caller_uid: libc::uid_t) -> Result<(), Error> {
    let root = if path.is_absolute() {
        fcntl::open("/", OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(|err| Error::resource(format!("open /: {}", err)))?
    } else {
        return Err(Error::validation("chroot path must be absolute"));
    };

    let mut dirfd = root;
    for component in path.components().skip(1) {
        let name = component.as_os_str();
        let next = fcntl::openat(
            dirfd,
            name,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
            Mode::empty(),
        )
        .map_err(|err| Error::validation(format!("opening path component {:?}: {}", name, err)))?;
        stat_caller_ok(next, name, caller_uid)?;
        let _ = close(dirfd);
        dirfd = next;
    }

    nix::unistd::fchdir(dirfd).map_err(|err| Error::privilege(format!("fchdir: {}", err)))?;
    let _ = close(dirfd);
    Ok(())
}

/// Reject a path component not owned by `caller_uid` or root: otherwise
/// an unprivileged caller could point `chroot_path` at a directory
/// another user controls and have us traverse into it with full
/// privilege still held.
fn stat_caller_ok(fd: RawFd, name: &std::ffi::OsStr, caller_uid: libc::uid_t) -> Result<(), Error> {
    use nix::sys::stat::fstat;

    let st = fstat(fd).map_err(|err| Error::resource(format!("fstat {:?}: {}", name, err)))?;
    if st.st_uid != caller_uid && st.st_uid != 0 {
        return Err(Error::privilege(format!(
            "path component {:?} is owned by uid {}, not caller uid {} or root",
            name, st.st_uid, caller_uid
        )));
    }
    Ok(())
}

/// Close every descriptor `>= 3` except the ones named in `keep`.
fn sanitize_fds(keep: &[RawFd]) {
    let keep: HashSet<RawFd> = keep.iter().copied().collect();
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<RawFd>().ok()) {
                if fd >= 3 && !keep.contains(&fd) {
                    let _ = close(fd);
                }
            }
        }
    }
}

fn set_cloexec_all(
    pty: &[RawFd; 2],
    pipe_out: &Option<(RawFd, RawFd)>,
    pipe_err: &Option<(RawFd, RawFd)>,
    ctl: &Option<(RawFd, RawFd)>,
) {
    let mut fds: Vec<RawFd> = pty.to_vec();
    for pair in [pipe_out, pipe_err, ctl].into_iter().flatten() {
        fds.push(pair.0);
        fds.push(pair.1);
    }
    for fd in fds {
        if fd > libc::STDERR_FILENO {
            let _ = fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
        }
    }
}

/// Bring up the loopback interface inside the freshly unshared network
/// namespace by sending an `RTM_NEWLINK`/`IFF_UP` rtnetlink message.
/// Grounded on `vinit`'s own `rtnetlink`-based loopback bring-up.
fn bring_loopback_up() -> Result<(), Error> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| Error::resource(format!("building rtnetlink runtime: {}", err)))?;

    rt.block_on(async {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|err| Error::resource(format!("rtnetlink connection: {}", err)))?;
        tokio::spawn(connection);

        let mut links = handle.link().get().match_name("lo".to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|err| Error::resource(format!("rtnetlink get lo: {}", err)))?
            .ok_or_else(|| Error::resource("no loopback interface in new namespace"))?;

        handle
            .link()
            .set(link.header.index)
            .up()
            .execute()
            .await
            .map_err(|err| Error::resource(format!("rtnetlink set lo up: {}", err)))
    })
}

fn child_environment(params: &ChrootParams) -> Vec<String> {
    let mut env = vec![
        format!("HOME={}", params.home),
        format!("USER={}", params.user),
        format!("PATH={}", params.path),
        format!("TERM={}", params.term.as_deref().unwrap_or("dumb")),
    ];
    if params.x11_display.is_some() {
        env.push("DISPLAY=:10.0".to_string());
    }
    env.push("SHELL=/bin/sh".to_string());
    env
}

fn exec_child(
    slave: RawFd,
    pipe_out_write: Option<RawFd>,
    pipe_err_write: Option<RawFd>,
    ctl_write: Option<RawFd>,
    argv: &[String],
    env: &[String],
) -> Result<ChrootOutcome, Error> {
    use nix::unistd::{dup2, execve};
    use std::ffi::CString;

    dup2(slave, libc::STDIN_FILENO).map_err(|err| Error::resource(format!("dup2 stdin: {}", err)))?;
    dup2(pipe_out_write.unwrap_or(slave), libc::STDOUT_FILENO)
        .map_err(|err| Error::resource(format!("dup2 stdout: {}", err)))?;
    dup2(pipe_err_write.unwrap_or(slave), libc::STDERR_FILENO)
        .map_err(|err| Error::resource(format!("dup2 stderr: {}", err)))?;
    if let Some(ctl) = ctl_write {
        const X11_CTL_FD: RawFd = 3;
        dup2(ctl, X11_CTL_FD).map_err(|err| Error::resource(format!("dup2 ctl: {}", err)))?;
    }

    let path = CString::new(argv[0].as_bytes()).map_err(|_| Error::validation("embedded NUL in argv[0]"))?;
    let args: Vec<CString> = argv.iter().map(|a| CString::new(a.as_bytes()).unwrap()).collect();
    let envp: Vec<CString> = env.iter().map(|e| CString::new(e.as_bytes()).unwrap()).collect();

    let err = execve(&path, &args, &envp).unwrap_err();
    Err(Error::task(format!("execve {}: {}", argv[0], err)))
}

fn waitpid_exit_status(child: Pid) -> Result<i32, Error> {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    loop {
        match waitpid(child, Some(WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED)) {
            Ok(WaitStatus::Exited(_, status)) => return Ok(status),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(err) => return Err(Error::resource(format!("waitpid: {}", err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_uid_below_minimum() {
        let params = ChrootParams {
            target_uid: 10,
            target_gid: 10,
            caller_uid: 1000,
            chroot_path: PathBuf::from("/srv/root"),
            allowed_mountpoints: vec![],
            use_pty: true,
            share_caller_network: false,
            x11_display: None,
            term: None,
            home: "HOME=/root",
            user: "root",
            path: "/bin",
            argv: vec!["/bin/true".to_string()],
        };
        let err = run_chrootuid(params, BlockingPump).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn stat_caller_ok_accepts_owned_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fd = fcntl::open(dir.path(), OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()).unwrap();
        let result = stat_caller_ok(fd, std::ffi::OsStr::new("tmp"), getuid().as_raw());
        let _ = close(fd);
        assert!(result.is_ok());
    }

    #[test]
    fn stat_caller_ok_rejects_directory_owned_by_someone_else() {
        let dir = tempfile::tempdir().unwrap();
        let fd = fcntl::open(dir.path(), OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()).unwrap();
        // Every uid other than our own and root (0) must be rejected.
        let other_uid = if getuid().as_raw() == 1 { 2 } else { 1 };
        let result = stat_caller_ok(fd, std::ffi::OsStr::new("tmp"), other_uid);
        let _ = close(fd);
        let err = result.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Privilege);
    }
}
