// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Satchel - bridge a personal self-chat channel to a bot-API-compatible
//! HTTP surface.
//!
//! Binary entry point: parses the CLI, loads configuration, and hands off to
//! the serve loop.

mod serve;
mod shutdown;

use clap::{Parser, Subcommand};

/// Satchel - a self-chat to bot-API bridge.
#[derive(Parser, Debug)]
#[command(name = "satchel", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the bridge: session engine, scheduler, and HTTP gateway.
    Serve,
    /// Print the effective configuration and exit.
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match satchel_config::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("satchel: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Serve) | None => {
            if let Err(e) = serve::run_serve(config).await {
                eprintln!("satchel serve: {e}");
                std::process::exit(1);
            }
        }
        Some(Commands::Config) => match toml::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("satchel config: {e}");
                std::process::exit(1);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn default_config_loads() {
        let config = satchel_config::load_config_from_str("").expect("defaults are valid");
        assert_eq!(config.server.port, 8600);
    }
}
