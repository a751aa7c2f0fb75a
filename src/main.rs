// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use trackerd::{
    cfg::{cli::Cli, config::Config, logger::init_logger},
    serial::loopback::LoopbackSerial,
    server::supervisor::{CoreDeps, CoreSupervisor},
    store::memory::{CsvExporter, MemoryStore, RecordingNotifier},
    translate::AsciiTableRenderer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::load_from_file(&cli.config)
        .with_context(|| format!("loading configuration {:?}", cli.config))?;
    cli.apply_to(&mut cfg);

    let _logger_guard = init_logger(&cfg.logger)?;

    if let Some(pid_file) = &cli.pid_file {
        fs::write(pid_file, std::process::id().to_string())
            .with_context(|| format!("writing pid file {pid_file:?}"))?;
    }

    // The sqlite store, SMTP notifier and report renderers are external
    // collaborators; the standalone binary runs with the in-process set.
    let store = Arc::new(MemoryStore::new());
    let deps = CoreDeps {
        store: store.clone(),
        notifier: Some(Arc::new(RecordingNotifier::new())),
        exporter: Some(Arc::new(CsvExporter::new(store))),
        serial: Arc::new(LoopbackSerial::new()),
        renderer: Arc::new(AsciiTableRenderer),
    };

    let supervisor = CoreSupervisor::new(cfg, deps).context("supervisor start failed")?;
    let (cmd_addr, trk_addr) = supervisor.start().await?;
    info!(%cmd_addr, %trk_addr, "trackerd running");

    let fatal = supervisor.fatal_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = fatal.cancelled() => warn!("fatal condition reported"),
    }

    supervisor.shutdown().await?;

    if let Some(pid_file) = &cli.pid_file {
        let _ = fs::remove_file(pid_file);
    }
    Ok(())
}
