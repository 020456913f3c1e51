// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default, PartialEq)]
#[command(name = "container-scan-agent")]
#[command(about = "Reports per-process usage and container filesystem changes on this node", long_about = None)]
pub struct Args {
    /// Path to the agent config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP listen port, takes precedence over the config file and CSA_HTTP_PORT
    #[arg(short = 'P', long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,
}
