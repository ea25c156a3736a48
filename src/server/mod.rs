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

use std::net::TcpListener;

use anyhow::Context;
use tracing::{info, instrument, warn};

use crate::config;

mod exit_notify;
mod registry;
mod relay;
mod session;
mod signals;

#[instrument(skip_all)]
pub fn run(host: &str, port: u16, config: config::Config) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING SERVER ============================\n\n");

    if host == "0.0.0.0" {
        warn!(
            "binding to all interfaces exposes unauthenticated \
             sessions to anyone who can reach this machine"
        );
    }

    let listener =
        TcpListener::bind((host, port)).with_context(|| format!("binding to {host}:{port}"))?;
    let addr = listener.local_addr().context("resolving bound address")?;

    // Stdout rather than the log so wrapping tools can discover the
    // port when asked to bind port 0.
    println!("delta-remote server listening on {addr}");

    let server = relay::Server::new(config)?;
    signals::Handler::new(server.registry()).spawn()?;

    relay::Server::serve(server, listener)
}
