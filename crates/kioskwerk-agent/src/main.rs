// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Kioskwerk — print kiosk session agent
//
// Entry point. Initialises logging, loads configuration, destroys anything a
// previous run left behind, then serves until Ctrl-C.

mod services;

use std::process::ExitCode;

use kioskwerk_core::Result;
use kioskwerk_core::human_errors::humanize_error;
use kioskwerk_session::Kiosk;
use tracing::{error, info, warn};

use services::{config, data_dir};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Kioskwerk agent starting");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let human = humanize_error(&e);
            error!(error = %e, screen = %human.message, "agent stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let dir = data_dir::data_dir()?;
    info!(path = %dir.display(), "data directory");

    let config = config::load_or_init(&dir)?;
    let kiosk = Kiosk::open(config, &dir)?;

    // Nothing from a previous run survives startup.
    let report = kiosk.recover_from_crash().await;
    if report.errors.is_empty() {
        info!(recovered = report.total_recovered, "startup sweep finished");
    } else {
        warn!(
            found = report.total_found,
            recovered = report.total_recovered,
            "startup sweep left workspaces behind"
        );
    }

    kiosk.spawn_background();
    info!("agent ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C, shutting down");
    }
    kiosk.shutdown().await;
    Ok(())
}
