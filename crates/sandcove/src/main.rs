use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sandcove::bootstrap::reserve_descriptors;
use sandcove::bridge::host::HostChannel;
use sandcove::signal::{SignalBridge, install_defaults};
use sandcove::{Config, Error, EventLoop, SysCalls, config};

const USAGE: &str = "usage: sandcove -c <path> | -d <depth> [-m <maxchild>] [-v...]";

/// Supervises sandboxed children for a host speaking the frame protocol
/// on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "sandcove", version, disable_help_flag = true)]
struct Args {
    /// Create the control fifo at this path and run as the top supervisor.
    #[arg(short = 'c', value_name = "PATH", conflicts_with = "depth")]
    control: Option<PathBuf>,

    /// Run at this nesting depth without reserving descriptors.
    #[arg(short = 'd', value_name = "DEPTH")]
    depth: Option<u16>,

    /// Maximum number of children (default: derived from RLIMIT_NOFILE).
    #[arg(short = 'm', value_name = "N")]
    max_children: Option<usize>,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short = 'h', action = clap::ArgAction::SetTrue)]
    help: bool,
}

/// Initialize tracing on stderr. Stdout belongs to the protocol.
fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SANDCOVE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            Ok("warn") | Ok("warning") => "warn",
            _ => match verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            },
        };
        EnvFilter::new(format!("sandcove={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Where this supervisor sits in the tree.
enum Launch {
    /// Started by the host: reserve descriptors and create the fifo.
    Top(PathBuf),
    /// Started at a given depth with descriptors already in place.
    Nested(u16),
}

impl Args {
    fn launch(&self) -> Option<Launch> {
        if self.help {
            return None;
        }
        match (&self.control, self.depth) {
            (Some(fifo), _) => Some(Launch::Top(fifo.clone())),
            (None, Some(depth)) => Some(Launch::Nested(depth)),
            (None, None) => None,
        }
    }
}

fn run(args: Args, launch: Launch) -> anyhow::Result<()> {
    install_defaults();
    if let Err(errno) = config::normalize_stack_limit() {
        tracing::warn!(%errno, "Could not normalize stack limit");
    }

    let (signals, control, depth) = match launch {
        Launch::Top(fifo) => {
            let reserved = reserve_descriptors(&fifo)
                .map_err(Error::Bootstrap)
                .with_context(|| format!("reserving descriptors for {}", fifo.display()))?;
            (reserved.signals, Some(reserved.control), 0)
        }
        Launch::Nested(depth) => {
            let signals = SignalBridge::new()
                .map_err(Error::Bootstrap)
                .context("creating signal pipe")?;
            (signals, None, depth)
        }
    };
    signals
        .install_child_handler()
        .map_err(|errno| Error::Bootstrap(errno.into()))
        .context("installing SIGCHLD handler")?;

    let max_children = match args.max_children {
        Some(n) => n,
        None => {
            let ceiling = config::fd_ceiling()
                .map_err(|errno| Error::Bootstrap(errno.into()))
                .context("reading RLIMIT_NOFILE")?;
            config::max_children_for(ceiling)
        }
    };

    let mut config = Config::new(max_children).with_depth(depth);
    config.verbose = args.verbose;
    tracing::debug!(?config, "Starting supervisor");

    let mut event_loop = EventLoop::new(config, SysCalls, HostChannel::stdio(), signals);
    if let Some(control) = control {
        event_loop = event_loop.with_control(control);
    }
    event_loop.run()?;
    Ok(())
}

fn main() -> ExitCode {
    let (args, launch) = match Args::try_parse() {
        Ok(args) => match args.launch() {
            Some(launch) => (args, launch),
            None => {
                eprintln!("{USAGE}");
                return ExitCode::from(1);
            }
        },
        Err(err) => {
            let _ = err.print();
            eprintln!("{USAGE}");
            return ExitCode::from(1);
        }
    };

    init_tracing(args.verbose);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "sandcove starting"
    );

    match run(args, launch) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(error = %message, "Supervisor failed");
            let code = err
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(libc::EIO);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
