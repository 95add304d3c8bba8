//! pipetun client binary
//!
//! Usage: pipetun-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   --print-config       Print the effective configuration as TOML
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use pipetun::client::Client;
use pipetun::config::{Config, ConfigFile};

fn main() -> anyhow::Result<()> {
    // Initialize tracing, respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    // Loaded while the process is still single-threaded: `from_env` removes
    // the variables it reads.
    let config = match args.get(1).map(String::as_str) {
        None => load_config(None)?,
        Some("-h" | "--help") => {
            print_usage();
            return Ok(());
        }
        Some("--print-config") => {
            return print_config(&load_config(args.get(2).map(String::as_str))?);
        }
        Some("-c" | "--config") => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            load_config(Some(&args[2]))?
        }
        Some(other) => {
            eprintln!("Unknown option: {}", other);
            print_usage();
            return Ok(());
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_client(config))
}

fn print_usage() {
    println!(
        r#"pipetun client - local SOCKS5 endpoint of the tunnel

USAGE:
    pipetun-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file (TOML)
    --print-config [FILE]   Print the effective configuration and exit
    -h, --help              Print help information

Without --config, settings come from PIPETUN_* environment variables.

EXAMPLES:
    Run the client against a local server:
        PIPETUN_SERVER_HOST=10.0.0.2 pipetun-client

    Use it:
        curl --socks5 127.0.0.1:2022 http://example.com/
"#
    );
}

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    println!("# pipetun configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", toml::to_string_pretty(&ConfigFile::from_config(config))?);
    Ok(())
}

async fn run_client(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        connections = config.client_connection,
        server = %config.server_addr(),
        "starting pipetun client"
    );

    let client = Client::bind(Arc::new(config)).await?;

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown");
        }
    }

    Ok(())
}
