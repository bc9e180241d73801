use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use guestbox_cli::{RunOptions, Settings};

/// Environment variable holding a tracing filter, e.g. `guestbox_runtime=debug`.
const LOG_ENV: &str = "GUESTBOX_LOG";

/// guestbox - run a WebAssembly Python against local files
#[derive(Parser, Debug)]
#[command(name = "guestbox")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Workspace folder to mount (repeatable, defaults to the current directory)
    #[arg(short, long = "workspace", value_name = "DIR", global = true)]
    workspaces: Vec<PathBuf>,

    /// GitHub repository holding the guest runtime
    #[arg(long, value_name = "REPO", global = true)]
    runtime: Option<String>,

    /// Seconds to wait for the execution context to become ready
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Settings file (defaults to <config dir>/guestbox/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Run the guest on the shared blocking pool instead of a dedicated thread
    #[arg(long, global = true)]
    pooled: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a file
    Run {
        file: PathBuf,
    },
    /// Start the interactive interpreter
    Repl,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "guestbox={level},guestbox_cli={level},guestbox_runtime={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 1)
        .try_init()
        .ok();
}

fn load_settings(args: &Args) -> Result<Settings, guestbox_cli::CliError> {
    let file = match args.config.clone().or_else(Settings::default_path) {
        Some(path) => Settings::load(&path)?,
        None => Settings::default(),
    };
    Ok(file
        .with_env(|key| std::env::var(key).ok())
        .with_flags(args.runtime.clone(), args.timeout))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let target = match args.command {
        Command::Run { file } => Some(file),
        Command::Repl => None,
    };
    let options = RunOptions {
        target,
        workspaces: args.workspaces,
        settings,
        pooled: args.pooled,
    };

    match guestbox_cli::run(options).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
