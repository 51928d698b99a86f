//! The `nesta` command-line front end.
//!
//! `-start` runs the server in the foreground (or daemonized when the
//! configuration asks for it); `-stop`, `-status` and `-trace` talk to a
//! running instance by posting `cmd=…` to its HTTP port on loopback.

use anyhow::Context;
use nesta::{post_command, Config, HandlerRegistry, Server};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const PROGRAM: &str = "nesta";
const DEFAULT_CONF_FILE: &str = "./conf/nesta.conf";

#[derive(Debug, PartialEq)]
enum Action {
    Start,
    Stop,
    Status,
    Trace(bool),
    Version,
}

fn version() {
    println!("{}/{}", PROGRAM, env!("CARGO_PKG_VERSION"));
}

fn usage() {
    version();
    println!("usage: {PROGRAM} [-start | -stop | -status | -trace {{on|off}} | -version] [-f conf.file]");
}

fn parse_args(args: &[String]) -> Result<(Action, Option<String>), ()> {
    let mut action = Action::Start;
    let mut conf_file = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-start" => action = Action::Start,
            "-stop" => action = Action::Stop,
            "-status" => action = Action::Status,
            "-trace" => {
                let value = iter.next().ok_or(())?;
                action = match value.to_ascii_lowercase().as_str() {
                    "on" => Action::Trace(true),
                    "off" => Action::Trace(false),
                    _ => return Err(()),
                };
            }
            "-version" | "--version" => action = Action::Version,
            "-f" => {
                conf_file = Some(iter.next().ok_or(())?.clone());
            }
            _ => return Err(()),
        }
    }
    Ok((action, conf_file))
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (action, conf_file) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(()) => {
            usage();
            return ExitCode::FAILURE;
        }
    };
    if action == Action::Version {
        version();
        return ExitCode::SUCCESS;
    }

    let conf_path = conf_file.unwrap_or_else(|| DEFAULT_CONF_FILE.to_owned());
    let config = match Config::load(&conf_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match run(action, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(action: Action, config: Config) -> anyhow::Result<()> {
    if action == Action::Start {
        #[cfg(unix)]
        {
            switch_user(&config)?;
            if config.daemonize {
                daemonize(&config)?;
            }
        }
        init_tracing(&config)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?;

    match action {
        Action::Start => runtime.block_on(serve(config)),
        Action::Stop => runtime.block_on(client_command(config.port_no, "stop")),
        Action::Status => runtime.block_on(client_command(config.port_no, "status")),
        Action::Trace(on) => runtime.block_on(client_command(
            config.port_no,
            if on { "trace_on" } else { "trace_off" },
        )),
        Action::Version => Ok(()),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    // The stock binary registers no application handlers; embedding
    // applications build their own registry before Server::new.
    let registry = HandlerRegistry::new();
    let server = Server::new(config, registry)?;

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });
    #[cfg(unix)]
    {
        let handle = server.shutdown_handle();
        tokio::spawn(async move {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(_) => return,
                };
            term.recv().await;
            handle.shutdown();
        });
    }

    server.run().await.context("server failed")?;
    println!("{PROGRAM} was terminated.");
    Ok(())
}

async fn client_command(port: u16, cmd: &str) -> anyhow::Result<()> {
    match post_command(port, cmd).await {
        Ok(body) => println!("{body}"),
        Err(_) => println!("not running."),
    }
    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.error_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open error file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Refuses to serve as root unless `http.username` names the account to
/// drop to.
#[cfg(unix)]
fn switch_user(config: &Config) -> anyhow::Result<()> {
    use nix::unistd::{geteuid, getuid, setgid, setuid, User};

    if !getuid().is_root() && !geteuid().is_root() {
        return Ok(());
    }
    let name = config
        .username
        .as_deref()
        .context("cannot run as root, set http.username")?;
    let user = User::from_name(name)
        .context("user lookup failed")?
        .with_context(|| format!("cannot find the user {name}"))?;
    setgid(user.gid).context("setgid failed")?;
    setuid(user.uid).context("setuid failed")?;
    Ok(())
}

/// Classic double-dissociation: fork, exit the parent, start a new session,
/// and point stdio at the configured output/error files (or /dev/null).
#[cfg(unix)]
fn daemonize(config: &Config) -> anyhow::Result<()> {
    use nix::unistd::{dup2, fork, setsid, ForkResult};
    use std::os::fd::AsRawFd;

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid failed")?;

    let stdin = std::fs::File::open("/dev/null").context("open /dev/null")?;
    dup2(stdin.as_raw_fd(), 0).context("stdin redirection")?;

    let stdout = open_sink(config.output_file.as_deref())?;
    dup2(stdout.as_raw_fd(), 1).context("stdout redirection")?;

    let stderr = open_sink(config.error_file.as_deref())?;
    dup2(stderr.as_raw_fd(), 2).context("stderr redirection")?;

    Ok(())
}

#[cfg(unix)]
fn open_sink(path: Option<&std::path::Path>) -> anyhow::Result<std::fs::File> {
    let file = match path {
        Some(path) => std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?,
        None => std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .context("open /dev/null")?,
    };
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn default_action_is_start() {
        assert_eq!(parse_args(&args(&[])).unwrap(), (Action::Start, None));
    }

    #[test]
    fn actions_and_config_file() {
        assert_eq!(
            parse_args(&args(&["-stop", "-f", "x.conf"])).unwrap(),
            (Action::Stop, Some("x.conf".into()))
        );
        assert_eq!(
            parse_args(&args(&["-trace", "on"])).unwrap(),
            (Action::Trace(true), None)
        );
        assert_eq!(
            parse_args(&args(&["-trace", "OFF"])).unwrap(),
            (Action::Trace(false), None)
        );
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert!(parse_args(&args(&["-bogus"])).is_err());
        assert!(parse_args(&args(&["-trace"])).is_err());
        assert!(parse_args(&args(&["-trace", "maybe"])).is_err());
        assert!(parse_args(&args(&["-f"])).is_err());
    }
}
