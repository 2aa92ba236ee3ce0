//! lidguard-ctl: command-line client for lidguard-daemon.
//!
//! Sends one request per invocation and prints the daemon's `data` payload as
//! JSON on stdout. Daemon errors go to stderr with a non-zero exit.
//!
//! ## Subcommands
//!
//! - `arm` / `stop`: change the armed state
//! - `status`: report whether the guard is armed
//! - `test-trigger`: sound the alarm once without arming
//! - `health`: daemon and supervisor snapshot

mod client;

use clap::{Parser, Subcommand};
use lidguard_daemon_protocol::{Method, Request, Response};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lidguard-ctl")]
#[command(about = "Control the Lidguard lid-close alarm")]
#[command(version)]
struct Cli {
    /// Daemon socket (defaults to $LIDGUARD_SOCKET or ~/.lidguard/daemon.sock)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Arm the guard; closing the lid will sound the alarm
    Arm,

    /// Disarm and silence any alarm
    Stop,

    /// Show whether the guard is armed
    Status,

    /// Sound the alarm once without arming
    TestTrigger,

    /// Show daemon health and supervisor state
    Health,
}

impl Commands {
    fn method(self) -> Method {
        match self {
            Commands::Arm => Method::Arm,
            Commands::Stop => Method::Stop,
            Commands::Status => Method::Status,
            Commands::TestTrigger => Method::TestTrigger,
            Commands::Health => Method::GetHealth,
        }
    }
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %err, "lidguard-ctl failed");
            eprintln!("lidguard-ctl: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32, String> {
    let socket = client::socket_path(cli.socket.clone())?;
    let method = cli.command.method();
    let request = Request::new(method).with_id(format!("ctl-{}", std::process::id()));
    let response = client::send_request(&socket, &request)?;
    tracing::debug!(method = method.as_str(), ok = response.ok, "Daemon responded");

    let data = into_data(response)?;
    println!("{}", render(&data, cli.pretty)?);
    Ok(exit_code(method, &data))
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(response
        .error
        .map(|err| format!("{}: {}", err.code, err.message))
        .unwrap_or_else(|| "Unknown daemon error".to_string()))
}

fn render(data: &Value, pretty: bool) -> Result<String, String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(data)
    } else {
        serde_json::to_string(data)
    };
    rendered.map_err(|err| format!("Failed to render response: {}", err))
}

/// A test trigger that could not sound the alarm exits non-zero.
fn exit_code(method: Method, data: &Value) -> i32 {
    match method {
        Method::TestTrigger => match data.get("success").and_then(Value::as_bool) {
            Some(true) => 0,
            _ => 1,
        },
        _ => 0,
    }
}

fn init_logging() {
    let debug_enabled = std::env::var("LIDGUARD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
