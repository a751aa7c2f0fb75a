// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::cfg::config::{Config, LogOutput};

/// Command-line surface of the wrapper binary. Flags override the
/// corresponding configuration keys after the file is loaded.
#[derive(Parser, Debug)]
#[command(name = "trackerd", version, about = "GPS tracker mediation server")]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(long, default_value = "trackerd.yaml")]
    pub config: PathBuf,

    /// Port operators connect to
    #[arg(long = "cmdport")]
    pub cmd_port: Option<u16>,

    /// Port trackers connect to
    #[arg(long = "trkport")]
    pub tracker_port: Option<u16>,

    /// Runtime data root
    #[arg(long = "datadir")]
    pub data_dir: Option<PathBuf>,

    /// History database and cache root
    #[arg(long = "dbdir")]
    pub db_dir: Option<PathBuf>,

    /// Log file path (switches logger output to file)
    #[arg(long = "logfile")]
    pub log_file: Option<PathBuf>,

    /// Write a pid file at this path
    #[arg(long = "pidfile")]
    pub pid_file: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(long, short)]
    pub verbose: bool,
}

impl Cli {
    /// Fold the flag overrides into a loaded configuration.
    pub fn apply_to(&self, cfg: &mut Config) {
        if let Some(p) = self.cmd_port {
            cfg.server.cmd_port = p;
        }
        if let Some(p) = self.tracker_port {
            cfg.server.tracker_port = p;
        }
        if let Some(d) = &self.data_dir {
            cfg.paths.data_dir = d.clone();
        }
        if let Some(d) = &self.db_dir {
            cfg.paths.db_dir = d.clone();
        }
        if let Some(f) = &self.log_file {
            cfg.logger.output = LogOutput::File;
            cfg.logger.file = Some(crate::cfg::config::LogFileConfig {
                path: f.clone(),
                rotation_frequency: None,
            });
        }
        if self.verbose {
            cfg.logger.level = "debug".to_string();
        }
    }
}

pub fn resolve_config_path(rel: &Path) -> Result<PathBuf> {
    let abs = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(rel)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
