//! # gatehouse

mod agent;
mod api;
mod cli;
mod health;
mod keys;
mod proxyproto;
mod recorder;
mod revdial;
mod ssh;
mod target;

use cata::execute;
use clap::Parser;
use eyre::Result;
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::Root;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .display_location_section(false)
        .install()?;

    let root = Root::parse();
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => Ok(()),
        result = execute(&root) => result,
    }
}
