// Copyright 2024 Delta Vision Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! delta-remote is the remote session subsystem for Delta Vision.
//!
//! `--server` listens for tcp connections and spawns one pty-backed
//! viewer process per client, `--client` attaches the local terminal
//! to one of those sessions. There is no authentication or encryption
//! on the wire, so the server binds to loopback unless told otherwise.

use std::{fs, io, sync::Mutex};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod client;
pub mod config;
pub mod consts;
pub mod protocol;
pub mod server;
pub mod tty;

/// The command line arguments that delta-remote expects.
#[derive(Parser, Debug)]
#[clap(version, author, about)]
#[clap(group(clap::ArgGroup::new("mode").required(true).args(["server", "client"])))]
pub struct Args {
    #[clap(long, action, help = "Run the session server")]
    pub server: bool,

    #[clap(long, action, help = "Connect the local terminal to a session server")]
    pub client: bool,

    #[clap(long, help = "The address to bind (server) or dial (client), 127.0.0.1 by default")]
    pub host: Option<String>,

    #[clap(short, long, help = "The tcp port to listen on or connect to")]
    pub port: u16,

    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In client mode logs are discarded by default. In server
mode they go to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,
}

/// Run the delta-remote tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let log_level = if args.verbose == 0 {
        tracing_subscriber::filter::LevelFilter::INFO
    } else if args.verbose == 1 {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::TRACE
    };

    let builder = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_max_level(log_level);
    if let Some(log_file) = &args.log_file {
        let file = fs::File::create(log_file).context("unable to create log file")?;
        builder.with_writer(Mutex::new(file)).init();
    } else if args.server {
        builder.with_writer(io::stderr).init();
    } else {
        builder.with_writer(io::sink).init();
    }

    let host = args.host.as_deref().unwrap_or(consts::DEFAULT_HOST);
    let config = config::read_config(&args.config_file)?;

    if args.server {
        server::run(host, args.port, config)
    } else {
        client::run(host, args.port)
    }
}
