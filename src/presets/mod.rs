// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Named command sequences loaded from `<data_dir>/presets/<name>.preset`.
//!
//! File layout: the first line is the short description, the following
//! lines up to the first command line are the free-form long description,
//! and every remaining non-empty line is one device command. A command
//! line starts with `get`, `set` or `do`. `[KEY]` placeholders anywhere in
//! a command are substituted at expansion time (`[PIN]` carries the
//! per-tracker PIN).

use std::{collections::HashMap, fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use tracing::{debug, warn};

/// Directory under `data_dir` holding the preset files.
pub const PRESET_SUBDIR: &str = "presets";
/// File suffix of a preset definition.
pub const PRESET_SUFFIX: &str = "preset";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub name: String,
    pub short_desc: String,
    pub long_desc: String,
    pub commands: Vec<String>,
}

impl Preset {
    /// Parse one preset file body.
    pub fn parse(name: &str, body: &str) -> Result<Self> {
        let mut lines = body.lines();
        let short_desc = lines
            .next()
            .context("preset file is empty")?
            .trim()
            .to_string();

        let mut long_desc = String::new();
        let mut commands = Vec::new();
        let mut in_commands = false;
        for line in lines {
            let trimmed = line.trim();
            if !in_commands && is_command_line(trimmed) {
                in_commands = true;
            }
            if in_commands {
                if !trimmed.is_empty() {
                    if !is_command_line(trimmed) {
                        bail!("preset {name:?}: unexpected line after commands: {trimmed:?}");
                    }
                    commands.push(trimmed.to_string());
                }
            } else if !trimmed.is_empty() {
                if !long_desc.is_empty() {
                    long_desc.push(' ');
                }
                long_desc.push_str(trimmed);
            }
        }

        if commands.is_empty() {
            bail!("preset {name:?} contains no commands");
        }

        Ok(Self {
            name: name.to_string(),
            short_desc,
            long_desc,
            commands,
        })
    }

    /// The command list with every `[KEY]` placeholder substituted.
    pub fn expand_commands(&self, substitutions: &HashMap<String, String>) -> Vec<String> {
        self.commands
            .iter()
            .map(|cmd| expand_placeholders(cmd, substitutions))
            .collect()
    }
}

fn is_command_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("get ")
        || lower.starts_with("set ")
        || lower.starts_with("do ")
        || lower == "get"
        || lower == "set"
        || lower == "do"
}

fn expand_placeholders(text: &str, substitutions: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("[{key}]"), value);
    }
    out
}

/// The loaded preset set, rebuilt from the preset directory on `refresh`.
#[derive(Debug)]
pub struct PresetRegistry {
    dir: PathBuf,
    presets: DashMap<String, Arc<Preset>>,
}

impl PresetRegistry {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            dir: data_dir.join(PRESET_SUBDIR),
            presets: DashMap::new(),
        }
    }

    /// Reread the preset directory, replacing the loaded set. Files that
    /// fail to parse are skipped with a warning; a missing directory just
    /// yields an empty set.
    pub fn refresh(&self) -> Result<usize> {
        self.presets.clear();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "no preset directory");
                return Ok(0);
            },
            Err(e) => return Err(e).context("reading preset directory"),
        };

        for entry in entries {
            let path = entry.context("reading preset directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PRESET_SUFFIX) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = match fs::read_to_string(&path) {
                Ok(body) => body,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable preset file");
                    continue;
                },
            };
            match Preset::parse(name, &body) {
                Ok(preset) => {
                    self.presets.insert(name.to_string(), Arc::new(preset));
                },
                Err(e) => warn!(file = %path.display(), error = %e, "bad preset file"),
            }
        }

        debug!(count = self.presets.len(), "presets loaded");
        Ok(self.presets.len())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Preset>> {
        self.presets.get(name).map(|p| p.clone())
    }

    /// `(name, short description)` pairs, sorted by name.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .presets
            .iter()
            .map(|p| (p.key().clone(), p.value().short_desc.clone()))
            .collect();
        out.sort();
        out
    }
}
