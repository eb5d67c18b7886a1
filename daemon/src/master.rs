//! Master daemon event loop (spec.md §4.2): the one long-lived root
//! process that owns the well-known listening socket, authenticates
//! connecting peers, and forks a session server for each unknown
//! `(caller_uid, caller_num)` key.
//!
//! Grounded on `hasher-privd.c`'s `main()`: the same four watched
//! conditions (new connection, SIGINT, SIGTERM, SIGCHLD, SIGHUP) drive
//! the loop, but `epoll_wait`/`signalfd` are replaced by tokio's
//! reactor and `tokio::signal::unix::signal` — the same substitution
//! `privsep`'s own `imsg::Handler` makes for its event loop. Forking a
//! session server directly (rather than re-exec) keeps the broker to a
//! single binary; `privsep`'s own roles are all compiled into one
//! binary and dispatched by argv[0] for the same reason.

use hasher_priv_broker::{
    config::ConfigSource,
    error::Error,
    process::fork_process,
    session::{Session, SessionKey, SessionTable},
};
use hasher_priv_log::{info, warn};
use hasher_priv_proto::{
    wire::{ResponseHeader, SessionPayload},
    Channel, CommandType,
};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{chown, ForkResult, Gid, Uid},
};
use std::{
    convert::TryFrom,
    os::unix::{fs::PermissionsExt, io::IntoRawFd},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{UnixListener, UnixStream},
    signal::unix::{signal, SignalKind},
    time::timeout,
};
use zerocopy::FromBytes;

/// Well-known project name the master's socket file is named after
/// (`${SOCKETDIR}/${PROJECT}`). The original fixes both at configure
/// time via autoconf substitution; kept as constants here for the same
/// "no runtime surface for this" reason.
pub const PROJECT: &str = "hasher-priv";

/// Default socket directory, overridable by an embedding caller.
pub const DEFAULT_SOCKETDIR: &str = "/var/run/hasher-priv";

const COMMAND_RECV_TIMEOUT: Duration = Duration::from_secs(3);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub fn master_socket_path(socketdir: &Path) -> PathBuf {
    socketdir.join(PROJECT)
}

pub fn session_socket_path(socketdir: &Path, uid: libc::uid_t, num: u32) -> PathBuf {
    socketdir.join(format!("hasher-priv-{}-{}", uid, num))
}

/// Run the master event loop to completion (spec.md §4.2). Returns once
/// a graceful shutdown has fully drained the session table.
pub async fn run(socketdir: &Path, server_gid: libc::gid_t, config: Arc<dyn ConfigSource>) -> Result<(), Error> {
    std::fs::create_dir_all(socketdir)
        .map_err(|err| Error::resource(format!("{}: {}", socketdir.display(), err)))?;
    std::fs::set_permissions(socketdir, std::fs::Permissions::from_mode(0o700))
        .map_err(|err| Error::resource(format!("chmod {}: {}", socketdir.display(), err)))?;

    let path = master_socket_path(socketdir);
    let _ = std::fs::remove_file(&path);
    let listener =
        UnixListener::bind(&path).map_err(|err| Error::resource(format!("bind {}: {}", path.display(), err)))?;
    // Mode 0660, gid = server_gid (spec.md §5): only members of that
    // group may even attempt to open a session.
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660))
        .map_err(|err| Error::resource(format!("chmod {}: {}", path.display(), err)))?;
    chown(&path, Some(Uid::from_raw(0)), Some(Gid::from_raw(server_gid)))
        .map_err(|err| Error::resource(format!("chown {}: {}", path.display(), err)))?;

    let mut sigint = signal(SignalKind::interrupt()).map_err(|err| Error::resource(err.to_string()))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|err| Error::resource(err.to_string()))?;
    let mut sigchld = signal(SignalKind::child()).map_err(|err| Error::resource(err.to_string()))?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|err| Error::resource(err.to_string()))?;

    let mut table = SessionTable::new();
    let mut draining = false;

    loop {
        if draining && table.is_empty() {
            break;
        }

        tokio::select! {
            accepted = listener.accept(), if !draining => {
                match accepted {
                    Ok((stream, _addr)) => {
                        if let Err(err) = handle_connection(stream, &mut table, socketdir, server_gid, &config).await {
                            warn!("master: {}", err);
                        }
                    }
                    Err(err) => warn!("master: accept: {}", err),
                }
            }

            _ = sigint.recv() => {
                info!("master: SIGINT, draining session table");
                begin_drain(&mut draining, &table);
            }

            _ = sigterm.recv() => {
                info!("master: SIGTERM, draining session table");
                begin_drain(&mut draining, &table);
            }

            _ = sigchld.recv() => {
                reap_children(&mut table);
            }

            _ = sighup.recv() => {
                info!("master: SIGHUP (no-op)");
            }

            _ = tokio::time::sleep(DRAIN_POLL_INTERVAL), if draining => {
                // 3-second poll cadence while waiting for sessions to exit.
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    Ok(())
}

fn begin_drain(draining: &mut bool, table: &SessionTable) {
    *draining = true;
    for session in table.iter() {
        let _ = kill(session.server_pid, Signal::SIGTERM);
    }
}

fn reap_children(table: &mut SessionTable) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                table.remove_by_pid(pid);
            }
            Ok(WaitStatus::StillAlive) => break,
            Err(nix::errno::Errno::ECHILD) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    table: &mut SessionTable,
    socketdir: &Path,
    server_gid: libc::gid_t,
    config: &Arc<dyn ConfigSource>,
) -> Result<(), Error> {
    let channel = Channel::new(stream);
    let peer = channel.peer_credentials()?;

    let command = timeout(COMMAND_RECV_TIMEOUT, channel.recv_command())
        .await
        .map_err(|_| Error::timeout("master: command receive timed out"))??;

    let Some((header, payload)) = command else {
        return Ok(());
    };
    let command_type = CommandType::try_from(header.command_type)?;

    match command_type {
        CommandType::OpenSession => {
            let caller_num = decode_session_payload(&payload)?;
            let key = SessionKey {
                caller_uid: peer.uid,
                caller_num,
            };

            if table.find(key).is_some() {
                return channel.send_response(ResponseHeader::done(), None).await.map_err(Error::from);
            }

            spawn_session(channel, table, key, peer.gid, socketdir, server_gid, config.clone())
        }

        CommandType::CloseSession => {
            // Idempotent by design (SPEC_FULL.md Open Questions): a
            // missing session is not an error.
            let caller_num = decode_session_payload(&payload)?;
            let key = SessionKey {
                caller_uid: peer.uid,
                caller_num,
            };
            if let Some(session) = table.find(key) {
                let _ = kill(session.server_pid, Signal::SIGTERM);
            }
            channel.send_response(ResponseHeader::done(), None).await.map_err(Error::from)
        }

        _ => {
            let message = "expected OPEN_SESSION or CLOSE_SESSION";
            channel
                .send_response(ResponseHeader::failed(message.len() as i64), Some(message))
                .await
                .map_err(Error::from)?;
            Err(Error::protocol(message))
        }
    }
}

fn decode_session_payload(payload: &[u8]) -> Result<u32, Error> {
    if payload.len() != std::mem::size_of::<SessionPayload>() {
        return Err(Error::protocol("OPEN_SESSION/CLOSE_SESSION: unexpected payload length"));
    }
    let payload =
        SessionPayload::read_from(payload).ok_or_else(|| Error::protocol("OPEN_SESSION/CLOSE_SESSION: malformed payload"))?;
    Ok(payload.caller_num)
}

/// `OPEN_SESSION` on an unknown key: fork a session server and hand it
/// the accepted connection. The child runs the full init sequence of
/// spec.md §4.3 and sends `DONE` on this same connection once ready; the
/// master only tracks the new pid.
fn spawn_session(
    channel: Channel,
    table: &mut SessionTable,
    key: SessionKey,
    caller_gid: libc::gid_t,
    socketdir: &Path,
    server_gid: libc::gid_t,
    config: Arc<dyn ConfigSource>,
) -> Result<(), Error> {
    let raw_fd = channel.into_raw_fd();

    match unsafe { fork_process() }? {
        ForkResult::Parent { child } => {
            // The child now owns the only live reference to `raw_fd`.
            let _ = nix::unistd::close(raw_fd);
            table.insert(Session {
                key,
                caller_gid,
                server_pid: child,
            });
            Ok(())
        }
        ForkResult::Child => {
            let socketdir = socketdir.to_path_buf();
            let status = crate::session_server::run_forked(raw_fd, key, caller_gid, socketdir, server_gid, config);
            std::process::exit(status);
        }
    }
}
