//! `hasher-priv`: the client CLI (spec.md §6).
//!
//! Grounded on `hasher-priv.c`'s `main()`: connect to the master socket,
//! `OPEN_SESSION`, reconnect to the now-existing per-caller session
//! socket, then run one task conversation (`TASK_BEGIN`, `TASK_FDS`,
//! `TASK_ARGUMENTS`, `TASK_ENVIRON`, `TASK_RUN`) and exit with the task's
//! status. Unlike the C original (which only distinguishes success from
//! failure), this client also recovers the worker's actual exit status
//! from the `TASK_RUN` response body — see `DESIGN.md` for why the
//! generic response header can carry that without changing shape.

use clap::Parser;
use hasher_priv_proto::{
    wire::{CommandType, ResponseHeader, SessionPayload, Status, TaskBeginPayload},
    Channel, TaskKind,
};
use std::{convert::TryFrom, ffi::OsString, path::PathBuf, process::ExitCode, str::FromStr};
use tokio::net::UnixStream;
use zerocopy::AsBytes;

const PROJECT: &str = "hasher-priv";
const DEFAULT_SOCKETDIR: &str = "/var/run/hasher-priv";

/// Client for the hasher-priv privilege-separation broker.
#[derive(Parser, Debug)]
#[command(name = "hasher-priv", version, about)]
struct Args {
    /// session multiplexing index (distinguishes concurrent sessions for
    /// the same uid)
    #[arg(long, default_value_t = 0)]
    num: u32,

    /// socket directory (must match the daemon's)
    #[arg(long, value_name = "DIR", default_value = DEFAULT_SOCKETDIR)]
    socketdir: PathBuf,

    /// send CLOSE_SESSION instead of OPEN_SESSION for the `none` task
    #[arg(long)]
    close_session: bool,

    /// task to run: none, getconf, killuid, getugid1, getugid2,
    /// chrootuid1, chrootuid2, makedev, maketty, makeconsole, mount, umount
    task: String,

    /// task-specific arguments (e.g. chroot path and command for
    /// chrootuid1/chrootuid2, mountpoint names for mount/umount)
    task_args: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let task = match TaskKind::from_str(&args.task) {
        Ok(task) => task,
        Err(_) => return fail(&format!("unknown task: {}", args.task)),
    };

    if task != TaskKind::None && !task.accepts_arg_count(args.task_args.len()) {
        return fail(&format!(
            "{}: requires {}, got {}",
            task,
            arity_description(task),
            args.task_args.len()
        ));
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => return fail(&err.to_string()),
    };

    runtime.block_on(run(args, task))
}

fn arity_description(kind: TaskKind) -> String {
    match kind.required_args() {
        Some(n) => format!("exactly {}", n),
        None => "at least 2".to_string(),
    }
}

async fn run(args: Args, task: TaskKind) -> ExitCode {
    let master_path = args.socketdir.join(PROJECT);
    let master = match UnixStream::connect(&master_path).await {
        Ok(stream) => Channel::new(stream),
        Err(err) => return fail(&format!("connecting to {}: {}", master_path.display(), err)),
    };

    let command = if args.close_session && task == TaskKind::None {
        CommandType::CloseSession
    } else {
        CommandType::OpenSession
    };

    let payload = SessionPayload { caller_num: args.num };
    if let Err(err) = master.send_command(command, payload.as_bytes()).await {
        return fail(&format!("{:?}: {}", command, err));
    }

    match master.recv_response().await {
        Ok((header, message)) => {
            if let Err(status) = expect_done(&header, &message, "open/close session") {
                return status;
            }
        }
        Err(err) => return fail(&format!("waiting for session response: {}", err)),
    }
    drop(master);

    if task == TaskKind::None {
        return ExitCode::SUCCESS;
    }
    let kind = task;

    let uid = nix::unistd::geteuid().as_raw();
    let session_path = args.socketdir.join(format!("hasher-priv-{}-{}", uid, args.num));
    let session = match UnixStream::connect(&session_path).await {
        Ok(stream) => Channel::new(stream),
        Err(err) => return fail(&format!("connecting to {}: {}", session_path.display(), err)),
    };

    run_task_conversation(&session, kind, args.num, &args.task_args).await
}

async fn run_task_conversation(session: &Channel, kind: TaskKind, num: u32, task_args: &[String]) -> ExitCode {
    let begin = TaskBeginPayload {
        task_kind: kind as u32,
        caller_num: num,
    };
    if let Err(status) = send_and_expect_done(session, CommandType::TaskBegin, begin.as_bytes(), "TASK_BEGIN").await {
        return status;
    }

    if let Err(err) = session.send_fds3([libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]).await {
        return fail(&format!("TASK_FDS: {}", err));
    }
    if let Err(status) = expect_done_response(session, "TASK_FDS").await {
        return status;
    }

    let argv = hasher_priv_proto::wire::encode_strings(task_args);
    if let Err(status) = send_and_expect_done(session, CommandType::TaskArguments, &argv, "TASK_ARGUMENTS").await {
        return status;
    }

    let envp = hasher_priv_proto::wire::encode_strings(&current_environment());
    if let Err(status) = send_and_expect_done(session, CommandType::TaskEnviron, &envp, "TASK_ENVIRON").await {
        return status;
    }

    if let Err(err) = session.send_command(CommandType::TaskRun, &[]).await {
        return fail(&format!("TASK_RUN: {}", err));
    }

    match session.recv_response().await {
        Ok((header, message)) => match Status::try_from(header.status) {
            Ok(Status::Done) => match message.as_deref().map(str::parse::<i32>) {
                Some(Ok(status)) => exit_code_from_status(status),
                _ => ExitCode::SUCCESS,
            },
            _ => {
                if let Some(message) = message {
                    eprintln!("hasher-priv: {}: {}", kind, message);
                } else {
                    eprintln!("hasher-priv: {}: task failed", kind);
                }
                ExitCode::FAILURE
            }
        },
        Err(err) => fail(&format!("waiting for TASK_RUN response: {}", err)),
    }
}

async fn send_and_expect_done(channel: &Channel, command: CommandType, payload: &[u8], what: &str) -> Result<(), ExitCode> {
    channel
        .send_command(command, payload)
        .await
        .map_err(|err| fail(&format!("{}: {}", what, err)))?;
    expect_done_response(channel, what).await
}

async fn expect_done_response(channel: &Channel, what: &str) -> Result<(), ExitCode> {
    let (header, message) = channel
        .recv_response()
        .await
        .map_err(|err| fail(&format!("{}: waiting for response: {}", what, err)))?;
    expect_done(&header, &message, what)
}

fn expect_done(header: &ResponseHeader, message: &Option<String>, what: &str) -> Result<(), ExitCode> {
    match Status::try_from(header.status) {
        Ok(Status::Done) => Ok(()),
        _ => {
            let detail = message.as_deref().unwrap_or("failed");
            Err(fail(&format!("{}: {}", what, detail)))
        }
    }
}

/// A process with exit code `n` (`0 <= n < 256`) is reported verbatim;
/// anything else (e.g. `128 + signal`, as `run_task` reports a
/// signal-terminated worker) is still clamped into the `u8` an `ExitCode`
/// can carry.
fn exit_code_from_status(status: i32) -> ExitCode {
    ExitCode::from((status & 0xff) as u8)
}

fn current_environment() -> Vec<String> {
    std::env::vars_os()
        .map(|(key, value)| {
            let mut entry: OsString = key;
            entry.push("=");
            entry.push(value);
            entry.to_string_lossy().into_owned()
        })
        .collect()
}

fn fail(message: &str) -> ExitCode {
    eprintln!("hasher-priv: {}", message);
    ExitCode::FAILURE
}
