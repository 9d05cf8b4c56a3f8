mod agent;
mod analysis;
mod capabilities;
mod config;
mod context;
mod sandbox;

use std::sync::Arc;

use anyhow::Result;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::agent::runtime::SandboxRuntime;
use crate::analysis::DescriptiveAnalyzer;
use crate::capabilities::CapabilityRegistry;
use crate::config::Config;
use crate::sandbox::Engine;

const DEFAULT_CONFIG_PATH: &str = "config/sandbox.toml";

fn print_help() {
    println!(
        "\
context-sandbox v{}

Runs capability-limited navigation code against append-only
conversation histories. Speaks line-delimited JSON on stdin/stdout.

USAGE:
    context-sandbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                   Built-in defaults are used when the default file is absent.

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG         Log level filter for tracing, written to stderr
                     (e.g. debug, context_sandbox=debug,warn)

REQUESTS (one JSON object per line, optional \"request_id\" echoed back):
    {{\"op\":\"append\",\"session_id\":\"s\",\"role\":\"user\",\"content\":\"...\"}}
    {{\"op\":\"execute\",\"session_id\":\"s\",\"code\":\"result = count_messages()\"}}
    {{\"op\":\"context\",\"session_id\":\"s\"}}
    {{\"op\":\"stats\",\"session_id\":\"s\"}}
    {{\"op\":\"cancel\",\"session_id\":\"s\"}}
    {{\"op\":\"close\",\"session_id\":\"s\"}}
    {{\"op\":\"suggest\",\"query\":\"find messages about rust\"}}
    {{\"op\":\"validate\",\"code\":\"result = 1\"}}
    {{\"op\":\"capabilities\"}}

EXAMPLES:
    context-sandbox                            # uses {DEFAULT_CONFIG_PATH}
    context-sandbox /etc/sandbox.toml          # custom config path
    RUST_LOG=debug context-sandbox < requests.jsonl",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("context-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr: stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("context_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // An explicit path must exist; the default one may be absent
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(&path)?
        }
        None => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH} (if present)");
            Config::load_or_default(DEFAULT_CONFIG_PATH)?
        }
    };
    info!("Limits: {}", config.engine.limits_description());

    let registry = CapabilityRegistry::standard();
    info!(
        "Capabilities: {} registered (registry v{})",
        registry.len(),
        registry.version()
    );
    let engine = Arc::new(Engine::new(
        registry,
        Arc::new(DescriptiveAnalyzer::new()),
        config.engine.clone(),
    ));
    let mut runtime = SandboxRuntime::new(config, engine);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    tokio::select! {
        result = runtime.run(stdin, &mut stdout) => {
            if let Err(e) = result {
                error!("Runtime error: {e}");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
        }
    }

    Ok(())
}
