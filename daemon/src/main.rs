//! `hasher-privd`: the master daemon binary (spec.md §6's CLI contract).
//!
//! Flag names and behavior match `hasher-privd.c`'s `getopt_long` table
//! exactly; `--config` is the one addition this crate needs beyond the
//! original, since `configure_server()`'s backing format is an external
//! collaborator here implemented as a TOML file rather than compiled-in
//! defaults (see `DESIGN.md`).

mod master;
mod session_server;

use clap::Parser;
use hasher_priv_broker::{
    config::{ConfigSource, TomlConfigSource},
    pidfile,
    process::{daemon, parse_loglevel},
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};

const DEFAULT_CONFIG: &str = "/etc/hasher-priv/hasher-priv.toml";

/// Master daemon for the hasher-priv privilege-separation broker.
#[derive(Parser, Debug)]
#[command(name = "hasher-privd", version, about)]
struct Args {
    /// pid file location
    #[arg(short, long, value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// set logging level (debug|info|warning|error)
    #[arg(short, long, value_name = "LVL", default_value = "info")]
    loglevel: String,

    /// stay in the foreground instead of daemonizing
    #[arg(short, long)]
    foreground: bool,

    /// configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let loglevel = match parse_loglevel(&args.loglevel) {
        Ok(level) => level,
        Err(err) => return fail(&err.to_string()),
    };

    let config_source: Arc<dyn ConfigSource> = match TomlConfigSource::load(&args.config) {
        Ok(source) => Arc::new(source),
        Err(err) => return fail(&format!("{}: {}", args.config.display(), err)),
    };

    let server_config = match config_source.load_server() {
        Ok(config) => config,
        Err(err) => return fail(&err.to_string()),
    };

    let pidfile_path = args.pidfile.clone().unwrap_or_else(|| server_config.server_pidfile.clone());

    match pidfile::check(&pidfile_path) {
        Ok(Some(pid)) => return fail(&format!("already running (pid {})", pid)),
        Ok(None) => {}
        Err(err) => return fail(&err.to_string()),
    }

    if !args.foreground {
        if let Err(err) = daemon(false, false) {
            return fail(&format!("daemon: {}", err));
        }
    }

    if let Err(err) = pidfile::write(&pidfile_path) {
        return fail(&err.to_string());
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            pidfile::remove(&pidfile_path);
            return fail(&err.to_string());
        }
    };

    let _guard = match runtime.block_on(hasher_priv_log::async_logger(
        "hasher-privd",
        hasher_priv_log::Config {
            foreground: args.foreground,
            level: Some(loglevel),
        },
    )) {
        Ok(guard) => guard,
        Err(err) => {
            pidfile::remove(&pidfile_path);
            return fail(&err.to_string());
        }
    };

    let socketdir = PathBuf::from(master::DEFAULT_SOCKETDIR);
    let result = runtime.block_on(master::run(&socketdir, server_config.server_gid, config_source));

    pidfile::remove(&pidfile_path);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => fail(&err.to_string()),
    }
}

fn fail(message: &str) -> ExitCode {
    eprintln!("hasher-privd: {}", message);
    ExitCode::FAILURE
}
