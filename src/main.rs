#[macro_use]
extern crate tracing;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tokio::net::TcpListener;

#[macro_use]
mod display;

mod api;
mod config;
mod engine;
mod signal;

use self::api::AppState;
use self::config::Store;
use self::engine::MappingEngine;
use self::signal::Signals;

/// A runtime-reconfigurable TCP/UDP port forwarder.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Path of the mapping config file.
    #[arg(long, default_value = "portway.yml")]
    config: PathBuf,

    /// Port the control API listens on.
    #[arg(short = 'p', long = "port", default_value_t = 7655)]
    api_port: u16,

    /// Access code required by the control API.
    #[arg(long)]
    code: String,

    /// Maximum lifetime of a TCP relay session and idle timeout of a UDP
    /// session, in seconds.
    #[arg(long, default_value_t = 30)]
    relay_timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().compact().with_target(false).init();

    match try_main().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> Result<()> {
    let args = Args::parse();

    let engine = Arc::new(MappingEngine::new(Duration::from_secs(args.relay_timeout)));

    let store = Store::open(&args.config)
        .await
        .with_context(|| args.config.display().to_string())?;

    for record in store.records().await {
        let (listen, forward) = (record.listen_addr(), record.forward_addr());

        if let Err(e) = engine.add_mapping(&listen, &forward, record.mapping_type).await {
            warn!("skipping saved mapping {listen}: {e}");
        }
    }

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), args.api_port);
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind control API on {bind}"))?;
    info!("control API listening on {}", display!(bind));

    let state = AppState {
        engine,
        store: Arc::new(store),
        code: args.code.into(),
    };

    let signals = Signals::new().context("failed to register signal handlers")?;

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(signals.wait_terminate())
        .await?;

    info!("exiting...");
    Ok(())
}
