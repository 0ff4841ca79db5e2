// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runs the pipeline daemon: crash recovery, the scheduler's periodic tick
//! loop, and the HTTP control plane, until SIGINT/SIGTERM (spec §4.7, §6).

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the SQLite3 database file.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from(crate::DEFAULT_DB_PATH)))]
    db_path: PathBuf,

    /// Path to the TOML config file (spec §6's `AppConfig`).
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from(crate::DEFAULT_CONFIG_PATH)))]
    config: PathBuf,

    /// Bind address for the HTTP control plane.
    #[bpaf(long, argument("ADDR"), fallback(crate::DEFAULT_HTTP_ADDR.parse().unwrap()))]
    http_addr: std::net::SocketAddr,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| base::format_err_t!(Internal, format!("building tokio runtime: {}", e)))?;
    rt.block_on(async_run(args))
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let config = crate::config::AppConfig::load(&args.config)?;
    let store = Arc::new(db::Store::open(&args.db_path, RealClocks {})?);
    let scheduler = Arc::new(crate::scheduler::Scheduler::new(store.clone(), config));
    scheduler.recover()?;

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| base::format_err_t!(Internal, format!("installing SIGINT handler: {}", e)))?;
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| base::format_err_t!(Internal, format!("installing SIGTERM handler: {}", e)))?;

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { scheduler.run(shutdown_rx).await }
    });
    let control_plane_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let store = store.clone();
        let addr = args.http_addr;
        async move { crate::control_plane::serve(addr, scheduler, store, shutdown_rx).await }
    });

    info!(addr = %args.http_addr, "vodwatch running");
    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully (send again to force)");
            shutdown_tx.take();
        }
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully (send again to force)");
            shutdown_tx.take();
        }
    }

    tokio::select! {
        _ = int.recv() => {
            info!("second signal received; cancelling outstanding encodes and exiting");
            scheduler.cancel_encoders();
            return Ok(1);
        }
        _ = term.recv() => {
            info!("second signal received; cancelling outstanding encodes and exiting");
            scheduler.cancel_encoders();
            return Ok(1);
        }
        _ = async {
            let _ = scheduler_task.await;
            if let Err(e) = control_plane_task.await {
                tracing::warn!(error = %e, "control plane task panicked");
            }
        } => {}
    }

    info!("exiting");
    Ok(0)
}
