//! One task conversation (spec.md §4.4): the command loop a session
//! server runs, in its own forked process, over one accepted task-socket
//! connection.
//!
//! Grounded on `caller_task.c`'s `handle_connection()`/`process_task()`:
//! the outer fork isolates a crashing conversation from the session
//! server; `TASK_RUN` forks again for the actual worker so a crashing
//! task cannot take the conversation (and thus the client's connection)
//! down with it.

use crate::{
    config::CallerConfig,
    error::{Error, ErrorKind},
    process::fork_process,
    task::TaskRecord,
    worker,
};
use hasher_priv_log::{error, info};
use hasher_priv_proto::{
    wire::{decode_strings, ResponseHeader, Status, TaskBeginPayload},
    Channel, CommandHeader, CommandType, TaskKind,
};
use nix::{
    sys::wait::{waitpid, WaitStatus},
    unistd::ForkResult,
};
use std::{convert::TryFrom, os::unix::io::AsRawFd, time::Duration};
use tokio::time::timeout;
use zerocopy::FromBytes;

/// Every accepted socket gets a 3-second receive timeout before any read
/// (spec.md §5): a stuck or malicious client cannot wedge a conversation
/// process forever.
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Drive one conversation to completion: read commands until `TASK_RUN`
/// (or a protocol/validation error), replying `DONE`/`FAILED` after each
/// non-terminal command, per the table in spec.md §4.4.
///
/// The header is always read on its own via [`Channel::recv_header`]
/// before any payload: `TASK_FDS`'s payload carries `SCM_RIGHTS`
/// ancillary data that only the `recvmsg(2)` call consuming those exact
/// bytes receives, so it must be routed to [`Channel::recv_fds3`]
/// instead of the generic payload reader used by every other command.
pub async fn serve(channel: Channel, caller_uid: libc::uid_t, caller_gid: libc::gid_t, config: &CallerConfig) {
    let mut record = TaskRecord::new();

    loop {
        let header = match timeout(RECV_TIMEOUT, channel.recv_header()).await {
            Ok(Ok(Some(header))) => header,
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                error!("conversation: {}", err);
                return;
            }
            Err(_) => {
                error!("conversation: timed out waiting for next command");
                return;
            }
        };

        let result = handle_header(&channel, &mut record, header, caller_uid, caller_gid, config).await;

        match result {
            Ok(true) => return, // TASK_RUN: conversation is over.
            Ok(false) => continue,
            Err(err) => {
                report_failure(&channel, &err).await;
                return;
            }
        }
    }
}

async fn handle_header(
    channel: &Channel,
    record: &mut TaskRecord,
    header: CommandHeader,
    caller_uid: libc::uid_t,
    caller_gid: libc::gid_t,
    config: &CallerConfig,
) -> Result<bool, Error> {
    let command_type = CommandType::try_from(header.command_type)?;

    // `TASK_FDS` must not go through the generic payload read: its one
    // dummy data byte rides in the same `sendmsg(2)` call as the three
    // `SCM_RIGHTS` descriptors, and the kernel delivers that ancillary
    // data only to the `recvmsg(2)` call that consumes those bytes.
    if command_type == CommandType::TaskFds {
        if header.datalen != 1 {
            return Err(Error::protocol("TASK_FDS: unexpected payload length"));
        }
        let fds = channel.recv_fds3().await?;
        let raw: [std::os::unix::io::RawFd; 3] = [fds[0].as_raw_fd(), fds[1].as_raw_fd(), fds[2].as_raw_fd()];
        for fd in &fds {
            std::mem::forget(fd);
        }
        record.set_fds(raw);
        channel.send_response(ResponseHeader::done(), None).await?;
        return Ok(false);
    }

    let payload = channel.recv_payload(header.datalen).await?;
    handle_command(channel, record, command_type, payload, caller_uid, caller_gid, config).await
}

async fn handle_command(
    channel: &Channel,
    record: &mut TaskRecord,
    command_type: CommandType,
    payload: Vec<u8>,
    caller_uid: libc::uid_t,
    caller_gid: libc::gid_t,
    config: &CallerConfig,
) -> Result<bool, Error> {
    match command_type {
        CommandType::TaskBegin => {
            if payload.len() != std::mem::size_of::<TaskBeginPayload>() {
                return Err(Error::protocol("TASK_BEGIN: unexpected payload length"));
            }
            let begin = TaskBeginPayload::read_from(&payload[..]).ok_or_else(|| Error::protocol("TASK_BEGIN: malformed payload"))?;
            let kind = TaskKind::try_from(begin.task_kind)?;
            record.begin(kind, begin.caller_num);
            channel.send_response(ResponseHeader::done(), None).await?;
            Ok(false)
        }

        CommandType::TaskFds => unreachable!("handled in handle_header before the generic payload read"),

        CommandType::TaskArguments => {
            let argv = decode_argv_or_envp(&payload)?;
            record.set_arguments(argv)?;
            channel.send_response(ResponseHeader::done(), None).await?;
            Ok(false)
        }

        CommandType::TaskEnviron => {
            let envp = decode_argv_or_envp(&payload)?;
            record.set_environ(envp);
            channel.send_response(ResponseHeader::done(), None).await?;
            Ok(false)
        }

        CommandType::TaskRun => {
            let kind = record.kind.ok_or_else(|| Error::protocol("TASK_RUN before TASK_BEGIN"))?;
            let fds = record.fds.ok_or_else(|| Error::protocol("TASK_RUN before TASK_FDS"))?;
            let status = run_task(kind, fds, record.argv.clone(), record.envp.clone(), caller_uid, caller_gid, config)?;
            // The generic response header only has room for DONE/FAILED
            // plus an optional trailing message; for TASK_RUN specifically
            // that message body carries the worker's decimal exit status
            // rather than an error string, so the client can propagate it
            // as its own exit code (spec.md §6/§7).
            let body = status.to_string();
            let header = ResponseHeader {
                status: Status::Done as i32,
                msglen: body.len() as i64,
            };
            channel.send_response(header, Some(&body)).await?;
            info!("{}: worker exited with status {}", kind, status);
            Ok(true)
        }

        CommandType::OpenSession | CommandType::CloseSession => {
            Err(Error::protocol("OPEN_SESSION/CLOSE_SESSION are master-only commands"))
        }
    }
}

/// `TASK_ARGUMENTS`/`TASK_ENVIRON` carry a NUL-terminated block with no
/// separate count prefix; the receiver scans for NULs bounded by
/// `datalen` (spec.md §4.1). `decode_strings`' `count` parameter exists
/// for the codec's round-trip tests — here every NUL-delimited string up
/// to the end of the block is taken.
fn decode_argv_or_envp(payload: &[u8]) -> Result<Vec<String>, Error> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let count = payload.iter().filter(|&&b| b == 0).count();
    decode_strings(payload, count).map_err(Error::from)
}

/// `TASK_RUN`: fork a worker, wait for it, and return its exit status.
fn run_task(
    kind: TaskKind,
    fds: [std::os::unix::io::RawFd; 3],
    argv: Vec<String>,
    envp: Vec<String>,
    caller_uid: libc::uid_t,
    caller_gid: libc::gid_t,
    config: &CallerConfig,
) -> Result<i32, Error> {
    match unsafe { fork_process() }? {
        ForkResult::Parent { child } => {
            for fd in fds {
                let _ = nix::unistd::close(fd);
            }
            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, status)) => return Ok(status),
                    Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                    Ok(_) => continue,
                    Err(err) => return Err(Error::resource(format!("waitpid: {}", err))),
                }
            }
        }
        ForkResult::Child => {
            install_stdio(fds);
            let status = worker::run_worker(kind, caller_uid, caller_gid, argv, envp, config);
            std::process::exit(status);
        }
    }
}

fn install_stdio(fds: [std::os::unix::io::RawFd; 3]) {
    for (slot, fd) in fds.into_iter().enumerate() {
        let _ = nix::unistd::dup2(fd, slot as i32);
        let _ = nix::unistd::close(fd);
    }
}

async fn report_failure(channel: &Channel, err: &Error) {
    let message = err.to_string();
    let response = ResponseHeader::failed(message.len() as i64);
    // `EPIPE` on the way out just means the client already left
    // (spec.md §7); `send_response` swallows that for us.
    let _ = channel.send_response(response, Some(&message)).await;
    if err.kind == ErrorKind::Protocol {
        error!("conversation: protocol error: {}", message);
    }
}
