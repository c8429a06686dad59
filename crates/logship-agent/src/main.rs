//! logship: container-sidecar log shipper
//!
//! Wraps an application entry point, tails the log sources described in a
//! JSON configuration document, and forwards every record to stdout where
//! the container runtime picks it up.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logship_agent::{child, signal, LogWriter, StopToken, Supervisor};

/// Well-known config location inside the container image.
const DEFAULT_CONFIG_PATH: &str = "/etc/logship/config.json";

const OPTION_CONFIG: &str = "/config";
const OPTION_HELP_SHORT: &str = "/?";
const OPTION_HELP_LONG: &str = "--help";

struct Invocation {
    config_path: PathBuf,
    child_command: Vec<String>,
}

enum ParsedArgs {
    Run(Invocation),
    Help,
}

fn parse_args(args: &[String]) -> ParsedArgs {
    if args.len() == 1
        && (args[0] == OPTION_HELP_SHORT || args[0].eq_ignore_ascii_case(OPTION_HELP_LONG))
    {
        return ParsedArgs::Help;
    }

    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut rest = args;

    if args.len() >= 2 && args[0].eq_ignore_ascii_case(OPTION_CONFIG) {
        config_path = PathBuf::from(&args[1]);
        rest = &args[2..];
    }

    // Anything left, recognized or not, is the child command line.
    ParsedArgs::Run(Invocation {
        config_path,
        child_command: rest.to_vec(),
    })
}

fn print_usage() {
    println!("logship {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: logship [/? | --help] | [[/Config <PATH>] [COMMAND [ARGS...]]]");
    println!();
    println!("  /? | --help   Show this help");
    println!("  <PATH>        Path of the JSON configuration file; defaults to");
    println!("                {DEFAULT_CONFIG_PATH}");
    println!("  COMMAND       Child command to run and wrap");
    println!("  ARGS          Arguments passed to COMMAND");
    println!();
    println!("Monitors event logs, kernel-trace providers, and log files per the");
    println!("configuration and writes every record to standard output.");
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        ParsedArgs::Help => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        ParsedArgs::Run(invocation) => invocation,
    };

    // Diagnostics go to stderr; stdout belongs to the records.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logship=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %invocation.config_path.display(),
        "starting logship"
    );

    let writer = Arc::new(LogWriter::stdout());
    let stop = StopToken::new();
    signal::install_termination_handler(&stop);

    let mut supervisor = Supervisor::initialize(&invocation.config_path, Arc::clone(&writer));

    let child_handle = if invocation.child_command.is_empty() {
        None
    } else {
        match child::spawn_child(&invocation.child_command, stop.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                writer.trace_error(&format!(
                    "failed to start '{}': {e}",
                    invocation.child_command.join(" ")
                ));
                supervisor.shutdown();
                return ExitCode::FAILURE;
            }
        }
    };

    supervisor.wait_until_stopped(&stop);
    supervisor.shutdown();

    match child_handle {
        Some(handle) => match handle.join() {
            Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
            Err(_) => ExitCode::FAILURE,
        },
        None => ExitCode::SUCCESS,
    }
}
