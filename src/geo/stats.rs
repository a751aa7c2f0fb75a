// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt::Write as _,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};

/// Cache and external-service counters, shared by both geo caches and
/// aggregated across daemon runs through `persist`/`restore`.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub service_calls: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn service_call(&self) {
        self.service_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// `key=value` lines, one counter per line.
    pub fn persist(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "hits={}", self.hits.load(Ordering::Relaxed));
        let _ = writeln!(out, "misses={}", self.misses.load(Ordering::Relaxed));
        let _ = writeln!(out, "evictions={}", self.evictions.load(Ordering::Relaxed));
        let _ = writeln!(
            out,
            "service_calls={}",
            self.service_calls.load(Ordering::Relaxed)
        );
        out
    }

    /// Add previously persisted totals onto the live counters.
    pub fn restore(&self, text: &str) -> Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("bad stat line {line:?}"))?;
            let value: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("bad stat value in {line:?}"))?;
            let counter = match key.trim() {
                "hits" => &self.hits,
                "misses" => &self.misses,
                "evictions" => &self.evictions,
                "service_calls" => &self.service_calls,
                other => anyhow::bail!("unknown stat key {other:?}"),
            };
            counter.fetch_add(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Human summary for the `.cachestat` meta-command.
    pub fn summary(&self) -> String {
        format!(
            "hits={} misses={} evictions={} service_calls={}",
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            self.service_calls.load(Ordering::Relaxed),
        )
    }
}
