//! Session server: the forked-once-per-caller process that implements
//! spec.md §4.3. Runs the fixed initialization sequence (caller data,
//! per-caller socket, privilege drop, configuration, idle event loop),
//! then forks a **conversation** process per accepted task connection
//! so a crashing conversation cannot take the session down with it
//! (spec.md §4.4, §5).
//!
//! Grounded on `caller_server.c`'s `caller_server()`/`fork_server()`:
//! the init-then-serve shape is identical, with `epoll_wait` replaced
//! by a fresh single-threaded tokio runtime built after `fork` — the
//! same "spin an ad-hoc runtime for a freshly forked process" pattern
//! used for the `chrootuid` worker's `bring_loopback_up`.

use hasher_priv_broker::{
    caller::CallerData,
    config::{CallerConfig, ConfigSource},
    conversation,
    error::Error,
    privdrop::PrivilegeDrop,
    process::{apply_rlimits, fork_process},
    session::SessionKey,
};
use hasher_priv_log::{info, warn};
use hasher_priv_proto::{wire::ResponseHeader, Channel};
use nix::{
    sys::{
        stat::{umask, Mode},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{chown, ForkResult, Gid, Uid},
};
use std::{
    os::unix::{fs::PermissionsExt, io::{IntoRawFd, RawFd}},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{UnixListener, UnixStream},
    signal::unix::{signal, SignalKind},
};

/// Entry point called in the freshly forked child right after
/// `fork()`: builds a dedicated runtime (the master's reactor
/// registrations are not ours to reuse) and runs the session to
/// completion, returning the process exit status.
pub fn run_forked(
    control_fd: RawFd,
    key: SessionKey,
    caller_gid: libc::gid_t,
    socketdir: PathBuf,
    server_gid: libc::gid_t,
    config_source: Arc<dyn ConfigSource>,
) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("hasher-priv-{}-{}: {}", key.caller_uid, key.caller_num, err);
            return libc::EXIT_FAILURE;
        }
    };

    match runtime.block_on(run(control_fd, key, caller_gid, socketdir, server_gid, config_source)) {
        Ok(()) => libc::EXIT_SUCCESS,
        Err(err) => {
            eprintln!("hasher-priv-{}-{}: {}", key.caller_uid, key.caller_num, err);
            libc::EXIT_FAILURE
        }
    }
}

async fn run(
    control_fd: RawFd,
    key: SessionKey,
    caller_gid: libc::gid_t,
    socketdir: PathBuf,
    server_gid: libc::gid_t,
    config_source: Arc<dyn ConfigSource>,
) -> Result<(), Error> {
    let name = format!("hasher-priv-{}-{}", key.caller_uid, key.caller_num);
    let _guard = hasher_priv_log::async_logger(
        &name,
        hasher_priv_log::Config {
            foreground: true,
            level: None,
        },
    )
    .await
    .map_err(|err| Error::resource(err.to_string()))?;

    // 1. Initialize caller data from (uid, gid).
    let caller = CallerData::init(key.caller_uid, caller_gid)?;
    let _ = server_gid; // only the master's listening socket needs this gid.
    info!("{}({}) num={}: start session server", caller.login, caller.uid, key.caller_num);

    // 2. Bind and listen on the per-caller socket, mode 0700, chowned to
    // the caller.
    let socket_path = crate::master::session_socket_path(&socketdir, key.caller_uid, key.caller_num);
    let _ = std::fs::remove_file(&socket_path);
    let previous_umask = umask(Mode::from_bits_truncate(0o077));
    let listener = UnixListener::bind(&socket_path);
    umask(previous_umask);
    let listener = listener.map_err(|err| Error::resource(format!("bind {}: {}", socket_path.display(), err)))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o700))
        .map_err(|err| Error::resource(format!("chmod {}: {}", socket_path.display(), err)))?;
    chown(&socket_path, Some(Uid::from_raw(key.caller_uid)), Some(Gid::from_raw(caller_gid)))
        .map_err(|err| Error::resource(format!("chown {}: {}", socket_path.display(), err)))?;

    // 3. Drop privileges to the caller's identity, retaining the fixed
    // capability set.
    let mut drop = PrivilegeDrop::new();
    drop.run(key.caller_uid, caller_gid)?;

    // 4. Load configuration, apply rlimits.
    let server_config = config_source.load_server()?;
    let caller_config = Arc::new(config_source.load_caller(key.caller_uid)?);
    apply_rlimits(&caller_config.change_rlimit)?;

    // 5. Ack on the inherited control connection, then close it.
    let control = unsafe { Channel::from_raw_fd(control_fd) }.map_err(|err| Error::resource(err.to_string()))?;
    control.send_response(ResponseHeader::done(), None).await?;
    drop_channel(control);

    event_loop(listener, key, caller_gid, socket_path, caller_config, server_config.server_session_timeout).await
}

/// Close the control connection explicitly rather than leaving it to an
/// implicit end-of-scope drop, so the intent ("close it", spec.md §4.3
/// step 5) is visible at the call site.
fn drop_channel(channel: Channel) {
    std::mem::drop(channel);
}

async fn event_loop(
    listener: UnixListener,
    key: SessionKey,
    caller_gid: libc::gid_t,
    socket_path: PathBuf,
    caller_config: Arc<CallerConfig>,
    session_timeout: u64,
) -> Result<(), Error> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|err| Error::resource(err.to_string()))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|err| Error::resource(err.to_string()))?;
    let mut sigchld = signal(SignalKind::child()).map_err(|err| Error::resource(err.to_string()))?;

    let mut idle_ticks: u64 = 0;

    loop {
        if idle_ticks >= session_timeout {
            info!("uid={} num={}: idle timeout, finishing", key.caller_uid, key.caller_num);
            break;
        }

        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,

            _ = sigchld.recv() => {
                reap_conversations();
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        idle_ticks = 0;
                        if let Err(err) = authenticate_and_spawn(stream, key, caller_gid, caller_config.clone()).await {
                            warn!("session: {}", err);
                        }
                    }
                    Err(err) => warn!("session: accept: {}", err),
                }
            }

            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                idle_ticks += 1;
            }
        }
    }

    info!("{}: finish session server", key.caller_uid);
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

fn reap_conversations() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Err(nix::errno::Errno::ECHILD) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// Authenticate the peer of a freshly accepted task connection against
/// this session's caller identity (spec.md §4.1: "A session server
/// additionally verifies `peer.uid == caller_uid && peer.gid ==
/// caller_gid`"), then fork a conversation for it. A mismatched peer is
/// rejected with `FAILED`/`AUTH` and the connection is closed without
/// ever forking — spec.md §8 scenario 5 requires the session itself to
/// remain undamaged by such an attempt.
async fn authenticate_and_spawn(
    stream: UnixStream,
    key: SessionKey,
    caller_gid: libc::gid_t,
    caller_config: Arc<CallerConfig>,
) -> Result<(), Error> {
    let peer = hasher_priv_proto::peer_credentials(&stream)?;
    if peer.uid != key.caller_uid || peer.gid != caller_gid {
        let channel = Channel::new(stream);
        let message = format!(
            "peer credentials {}:{} do not match session {}:{}",
            peer.uid, peer.gid, key.caller_uid, caller_gid
        );
        warn!("session: {}", message);
        let response = ResponseHeader::failed(message.len() as i64);
        let _ = channel.send_response(response, Some(&message)).await;
        return Err(Error::auth(message));
    }

    spawn_conversation(stream, key, caller_gid, caller_config)
}

/// Fork a conversation process for one accepted task connection
/// (spec.md §4.4): the parent returns immediately so the session server
/// can keep accepting, and the conversation is reaped asynchronously via
/// SIGCHLD. This is how "the session server may interleave task
/// conversations only across distinct accepted connections" (spec.md
/// §5) is realized: interleaving comes from separate OS processes, not
/// cooperative scheduling within one.
fn spawn_conversation(
    stream: UnixStream,
    key: SessionKey,
    caller_gid: libc::gid_t,
    caller_config: Arc<CallerConfig>,
) -> Result<(), Error> {
    let std_stream = stream.into_std().map_err(Error::from)?;
    let raw_fd = std_stream.into_raw_fd();

    match unsafe { fork_process() }? {
        ForkResult::Parent { child: _ } => {
            let _ = nix::unistd::close(raw_fd);
            Ok(())
        }
        ForkResult::Child => {
            let status = run_conversation_child(raw_fd, key, caller_gid, caller_config);
            std::process::exit(status);
        }
    }
}

fn run_conversation_child(raw_fd: RawFd, key: SessionKey, caller_gid: libc::gid_t, caller_config: Arc<CallerConfig>) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(_) => return libc::EXIT_FAILURE,
    };

    runtime.block_on(async move {
        match unsafe { Channel::from_raw_fd(raw_fd) } {
            Ok(channel) => conversation::serve(channel, key.caller_uid, caller_gid, &caller_config).await,
            Err(err) => warn!("conversation: {}", err),
        }
    });

    libc::EXIT_SUCCESS
}
