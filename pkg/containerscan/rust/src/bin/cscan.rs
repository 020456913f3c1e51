// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dd_containerscan::image_layers::build_inventory;
use dd_containerscan::{AgentConfig, Scanner};

#[derive(Parser, Debug)]
#[command(name = "cscan")]
#[command(about = "Container scan tool - runs a single scan of this node and prints the result", long_about = None)]
struct Args {
    /// Path to the agent config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one scan cycle and print the snapshot
    Scan,
    /// Print the files shipped by every locally stored image
    Images {
        /// Blob store to read instead of the configured one
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[allow(clippy::print_stdout, clippy::print_stderr)]
fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AgentConfig::load(args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let output = match args.command {
        Command::Scan => Scanner::new(config.paths)
            .scan()
            .map_err(|e| e.to_string())
            .and_then(|snapshot| snapshot.to_json().map_err(|e| e.to_string())),
        Command::Images { store } => {
            let store = store.unwrap_or(config.paths.image_store_root);
            build_inventory(&store)
                .map_err(|e| e.to_string())
                .and_then(|inventory| {
                    serde_json::to_string_pretty(&inventory).map_err(|e| e.to_string())
                })
        }
    };

    match output {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
