// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    io::BufReader,
    net::SocketAddr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cfg::config::Config,
    geo::{
        cache::{
            ADDR_CACHE_FILE, AddressCache, CACHE_STAT_FILE, MINIMAP_CACHE_FILE, MinimapCache,
            save_with_backup,
        },
        lookup::GeoLookup,
        ratelimit::RateLimiter,
        stats::CacheStats,
    },
    pipeline::EventPipeline,
    presets::PresetRegistry,
    serial::SerialPort,
    server::{acceptor, registry::SlotTable, tags::TagRegistry},
    store::{Exporter, LocationStore, Notifier},
    translate::TableRenderer,
};

/// Grace period granted to workers after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Collaborator handles injected into the core.
pub struct CoreDeps {
    pub store: Arc<dyn LocationStore>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub exporter: Option<Arc<dyn Exporter>>,
    pub serial: Arc<dyn SerialPort>,
    pub renderer: Arc<dyn TableRenderer>,
}

/// Everything the per-connection workers share. Owned by the supervisor,
/// handed to workers behind an `Arc`.
pub struct Core {
    cfg: RwLock<Arc<Config>>,
    pub slots: SlotTable,
    pub tags: TagRegistry,
    pub store: Arc<dyn LocationStore>,
    pub exporter: Option<Arc<dyn Exporter>>,
    pub serial: Arc<dyn SerialPort>,
    pub renderer: Arc<dyn TableRenderer>,
    pub pipeline: EventPipeline,
    pub presets: PresetRegistry,
    /// Session nickname map, device id -> name.
    pub nicknames: DashMap<u32, String>,
    /// Root cancellation: every worker runs under a child of this token.
    pub cancel: CancellationToken,
    /// Set on unrecoverable failure; observed by the supervisor wrapper.
    pub fatal: CancellationToken,
}

impl Core {
    /// The current configuration snapshot. Workers hold the `Arc` they
    /// took at spawn; a reload swaps the pointer for later snapshots.
    pub fn cfg(&self) -> Arc<Config> {
        self.cfg.read().expect("config lock poisoned").clone()
    }

    pub fn trigger_fatal(&self, reason: &str) {
        error!(reason, "fatal condition, initiating shutdown");
        self.fatal.cancel();
    }
}

/// Owns the acceptor and the shared core; exposes the start / reload /
/// shutdown lifecycle.
pub struct CoreSupervisor {
    core: Arc<Core>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    persisted: AtomicBool,
}

impl CoreSupervisor {
    /// Build the core from a configuration and collaborator handles.
    /// Fails on configuration inconsistencies and restores persisted
    /// geo-cache state from `db_dir`.
    pub fn new(mut cfg: Config, deps: CoreDeps) -> Result<Self> {
        cfg.validate_and_normalize().context("invalid configuration")?;

        let stats = Arc::new(CacheStats::new());
        let addr_cache = Arc::new(AddressCache::new(
            cfg.lookup.address_cache_max,
            cfg.lookup.address_lookup_proximity,
            stats.clone(),
        ));
        let minimap_cache = Arc::new(MinimapCache::new(
            cfg.lookup.minimap_cache_max,
            stats.clone(),
        ));
        restore_geo_state(&cfg, &addr_cache, &minimap_cache, &stats);

        let lookup = if cfg.lookup.use_address_lookup.as_bool()
            || cfg.lookup.include_minimap.as_bool()
        {
            Some(GeoLookup::new(&cfg.lookup)?)
        } else {
            None
        };

        let spacing = cfg.lookup.min_spacing();
        let geocode_limiter = Arc::new(RateLimiter::new(spacing));
        let map_limiter = Arc::new(RateLimiter::new(spacing));

        let pipeline = EventPipeline::new(
            deps.store.clone(),
            deps.notifier,
            addr_cache,
            minimap_cache,
            stats,
            geocode_limiter,
            map_limiter,
            lookup,
            cfg.paths.db_dir.clone(),
        );

        let presets = PresetRegistry::new(&cfg.paths.data_dir);
        if let Err(e) = presets.refresh() {
            warn!(error = %e, "preset load failed");
        }

        let max_clients = cfg.server.max_clients;
        let core = Arc::new(Core {
            cfg: RwLock::new(Arc::new(cfg)),
            slots: SlotTable::new(max_clients),
            tags: TagRegistry::new(),
            store: deps.store,
            exporter: deps.exporter,
            serial: deps.serial,
            renderer: deps.renderer,
            pipeline,
            presets,
            nicknames: DashMap::new(),
            cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
        });

        Ok(Self {
            core,
            accept_task: tokio::sync::Mutex::new(None),
            persisted: AtomicBool::new(false),
        })
    }

    pub fn core(&self) -> Arc<Core> {
        self.core.clone()
    }

    /// Fires when the core hit an unrecoverable condition; the wrapper
    /// should respond by calling [`shutdown`](Self::shutdown).
    pub fn fatal_token(&self) -> CancellationToken {
        self.core.fatal.clone()
    }

    /// Bind both listening sockets and start accepting. Returns the bound
    /// command and tracker addresses.
    pub async fn start(&self) -> Result<(SocketAddr, SocketAddr)> {
        let cfg = self.core.cfg();
        let cmd = acceptor::bind_listener(cfg.server.cmd_port).await?;
        let trk = acceptor::bind_listener(cfg.server.tracker_port).await?;
        let cmd_addr = cmd.local_addr()?;
        let trk_addr = trk.local_addr()?;
        info!(port = cmd_addr.port(), "listening for commands");
        info!(port = trk_addr.port(), "listening for tracker connections");

        let core = self.core.clone();
        let handle = tokio::spawn(acceptor::run_acceptor(core, cmd, trk));
        *self.accept_task.lock().await = Some(handle);
        Ok((cmd_addr, trk_addr))
    }

    /// Swap in a new configuration. In-flight workers keep the snapshot
    /// they started with; presets are reread.
    pub fn reload(&self, mut new_cfg: Config) -> Result<()> {
        new_cfg
            .validate_and_normalize()
            .context("invalid configuration on reload")?;
        *self.core.cfg.write().expect("config lock poisoned") = Arc::new(new_cfg);
        let n = self.core.presets.refresh()?;
        info!(presets = n, "configuration reloaded");
        Ok(())
    }

    /// Stop accepting, cancel every worker, wait out the grace period and
    /// persist geo-cache state. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.cancel.cancel();

        if let Some(handle) = self.accept_task.lock().await.take() {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(error = %e, "acceptor exited with error"),
                Err(e) => warn!(error = %e, "acceptor task panicked"),
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.core.slots.count() > 0 && tokio::time::Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.core.slots.count();
        if remaining > 0 {
            warn!(remaining, "workers still alive after grace period");
        }

        if !self.persisted.swap(true, Ordering::SeqCst) {
            self.persist_geo_state()?;
        }
        info!("shutdown complete");
        Ok(())
    }

    fn persist_geo_state(&self) -> Result<()> {
        let cfg = self.core.cfg();
        let db_dir = &cfg.paths.db_dir;
        fs::create_dir_all(db_dir).context("creating db_dir")?;

        let mut buf = Vec::new();
        self.core.pipeline.addr_cache.persist(&mut buf)?;
        save_with_backup(
            &db_dir.join(ADDR_CACHE_FILE),
            &String::from_utf8_lossy(&buf),
        )?;

        let mut buf = Vec::new();
        self.core.pipeline.minimap_cache.persist(&mut buf)?;
        save_with_backup(
            &db_dir.join(MINIMAP_CACHE_FILE),
            &String::from_utf8_lossy(&buf),
        )?;

        save_with_backup(
            &db_dir.join(CACHE_STAT_FILE),
            &self.core.pipeline.stats.persist(),
        )?;

        info!(
            addresses = self.core.pipeline.addr_cache.len(),
            minimaps = self.core.pipeline.minimap_cache.len(),
            "geo caches persisted"
        );
        Ok(())
    }
}

fn restore_geo_state(
    cfg: &Config,
    addr_cache: &AddressCache,
    minimap_cache: &MinimapCache,
    stats: &CacheStats,
) {
    let db_dir = &cfg.paths.db_dir;

    match fs::File::open(db_dir.join(ADDR_CACHE_FILE)) {
        Ok(f) => {
            if let Err(e) = addr_cache.restore(BufReader::new(f)) {
                warn!(error = %e, "address cache restore failed, starting empty");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(error = %e, "address cache unreadable"),
    }

    match fs::File::open(db_dir.join(MINIMAP_CACHE_FILE)) {
        Ok(f) => {
            if let Err(e) = minimap_cache.restore(BufReader::new(f)) {
                warn!(error = %e, "minimap cache restore failed, starting empty");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(error = %e, "minimap cache unreadable"),
    }

    match fs::read_to_string(db_dir.join(CACHE_STAT_FILE)) {
        Ok(text) => {
            if let Err(e) = stats.restore(&text) {
                warn!(error = %e, "cache stats restore failed");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(error = %e, "cache stats unreadable"),
    }
}
