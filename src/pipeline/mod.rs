// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The location event pipeline: persist every validated record, then
//! optionally enrich (address, minimaps) and notify. Enrichment is
//! best-effort; each step runs under its own timeout and a failed step
//! degrades to omission, never blocking persistence or the notification
//! itself.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    cfg::config::Config,
    codec::location::LocationRecord,
    geo::{
        cache::{AddressCache, MinimapCache, MinimapKey, MINIMAP_TILE_DIR},
        lookup::GeoLookup,
        ratelimit::RateLimiter,
        stats::CacheStats,
    },
    store::{LocationStore, Notification, Notifier},
    utils::render_device_id,
};

/// Fan-out target of one parsed location record.
pub struct EventPipeline {
    store: Arc<dyn LocationStore>,
    notifier: Option<Arc<dyn Notifier>>,
    pub addr_cache: Arc<AddressCache>,
    pub minimap_cache: Arc<MinimapCache>,
    pub stats: Arc<CacheStats>,
    pub geocode_limiter: Arc<RateLimiter>,
    pub map_limiter: Arc<RateLimiter>,
    lookup: Option<GeoLookup>,
    db_dir: PathBuf,
    /// While set and in the future, enrichment is suppressed and no further
    /// rate-limit notices are sent.
    suppress_until: Mutex<Option<Instant>>,
}

impl EventPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LocationStore>,
        notifier: Option<Arc<dyn Notifier>>,
        addr_cache: Arc<AddressCache>,
        minimap_cache: Arc<MinimapCache>,
        stats: Arc<CacheStats>,
        geocode_limiter: Arc<RateLimiter>,
        map_limiter: Arc<RateLimiter>,
        lookup: Option<GeoLookup>,
        db_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            notifier,
            addr_cache,
            minimap_cache,
            stats,
            geocode_limiter,
            map_limiter,
            lookup,
            db_dir,
            suppress_until: Mutex::new(None),
        }
    }

    /// Run one record through the pipeline. A store failure is returned to
    /// the caller (it is fatal for the daemon); everything downstream is
    /// best-effort.
    pub async fn process(
        &self,
        cfg: &Config,
        record: &LocationRecord,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.store
            .append(record)
            .with_context(|| format!("appending record for device {}", record.device_id))?;

        if !self.should_notify(cfg, record) {
            return Ok(());
        }
        let Some(notifier) = &self.notifier else {
            return Ok(());
        };

        let mut address = None;
        let mut overview = None;
        let mut detailed = None;

        if !self.in_cooldown().await {
            if cfg.lookup.use_address_lookup.as_bool() {
                address = self.enrich_address(cfg, record, cancel).await;
            }
            if cfg.lookup.include_minimap.as_bool() {
                overview = self
                    .enrich_minimap(cfg, record, cfg.lookup.minimap_overview_zoom, cancel)
                    .await;
                detailed = self
                    .enrich_minimap(cfg, record, cfg.lookup.minimap_detailed_zoom, cancel)
                    .await;
            }
        }

        let notification = Notification::Event {
            kind: record.event,
            device_label: render_device_id(record.device_id, cfg.mail.use_short_devid.as_bool()),
            timestamp: record.utc,
            latitude: record.latitude,
            longitude: record.longitude,
            address,
            minimap_overview: overview,
            minimap_detailed: detailed,
        };
        if let Err(e) = notifier.send(&notification) {
            error!(device = record.device_id, error = %e, "notifier failed");
        }
        Ok(())
    }

    /// Notify the operator about a tracker that connected and identified
    /// itself, when configured.
    pub fn tracker_connected(&self, cfg: &Config, device_id: u32, peer: &str) {
        if !cfg.mail.mail_on_tracker_conn.as_bool() && !cfg.mail.script_on_tracker_conn.as_bool() {
            return;
        }
        let Some(notifier) = &self.notifier else {
            return;
        };
        let n = Notification::TrackerConnected {
            device_label: render_device_id(device_id, cfg.mail.use_short_devid.as_bool()),
            peer: peer.to_string(),
        };
        if let Err(e) = notifier.send(&n) {
            error!(device = device_id, error = %e, "connect notification failed");
        }
    }

    fn should_notify(&self, cfg: &Config, record: &LocationRecord) -> bool {
        if !cfg.mail.send_mail_on_event.as_bool() {
            return false;
        }
        if cfg.mail.force_mail_on_all_events.as_bool() {
            return true;
        }
        !cfg.mail
            .event_mail_exclusions
            .contains(&record.event.code())
    }

    async fn in_cooldown(&self) -> bool {
        let guard = self.suppress_until.lock().await;
        matches!(*guard, Some(until) if Instant::now() < until)
    }

    /// Record a limiter hard-fail: notify at most once per cooldown window
    /// and suppress enrichment until the window ends.
    async fn enter_cooldown(&self, cfg: &Config, service: &str) {
        let mut guard = self.suppress_until.lock().await;
        let now = Instant::now();
        let already = matches!(*guard, Some(until) if now < until);
        *guard = Some(now + cfg.lookup.ratelimit_cooldown);
        drop(guard);

        if already {
            return;
        }
        warn!(service, "external service rate limit exceeded, enrichment suspended");
        if let Some(notifier) = &self.notifier {
            let n = Notification::RateLimitExceeded {
                service: service.to_string(),
            };
            if let Err(e) = notifier.send(&n) {
                error!(error = %e, "rate limit notification failed");
            }
        }
    }

    async fn enrich_address(
        &self,
        cfg: &Config,
        record: &LocationRecord,
        cancel: &CancellationToken,
    ) -> Option<String> {
        self.address_for(cfg, record.latitude, record.longitude, cancel)
            .await
    }

    /// Cache-first address resolution, also backing the `.address`
    /// meta-command. A miss consults the geocoder under the rate limiter.
    pub async fn address_for(
        &self,
        cfg: &Config,
        lat: f64,
        lon: f64,
        cancel: &CancellationToken,
    ) -> Option<String> {
        if let Some(addr) = self.addr_cache.lookup(lat, lon) {
            return Some(addr);
        }
        let lookup = self.lookup.as_ref()?;

        // The whole step, limiter wait plus HTTP, is bounded so the
        // tracker worker stays responsive to keep-alive.
        let step = async {
            self.geocode_limiter.acquire(cancel).await?;
            self.stats.service_call();
            lookup.reverse_geocode(lat, lon).await
        };
        match tokio::time::timeout(cfg.lookup.geocode_http_timeout, step).await {
            Ok(Ok(addr)) => {
                self.addr_cache.insert(lat, lon, &addr);
                Some(addr)
            },
            Ok(Err(e)) => {
                debug!(lat, lon, error = %e, "address lookup failed");
                None
            },
            Err(_) => {
                self.enter_cooldown(cfg, "geocode").await;
                None
            },
        }
    }

    async fn enrich_minimap(
        &self,
        cfg: &Config,
        record: &LocationRecord,
        zoom: u8,
        cancel: &CancellationToken,
    ) -> Option<PathBuf> {
        let key = MinimapKey::new(
            record.latitude,
            record.longitude,
            zoom,
            cfg.lookup.minimap_width,
            cfg.lookup.minimap_height,
        );
        if let Some(path) = self.minimap_cache.lookup(&key) {
            return Some(self.db_dir.join(path));
        }
        let lookup = self.lookup.as_ref()?;

        let step = async {
            self.map_limiter.acquire(cancel).await?;
            self.stats.service_call();
            lookup
                .fetch_static_map(
                    record.latitude,
                    record.longitude,
                    zoom,
                    cfg.lookup.minimap_width,
                    cfg.lookup.minimap_height,
                )
                .await
        };
        match tokio::time::timeout(cfg.lookup.map_http_timeout, step).await {
            Ok(Ok(png)) => {
                let rel = PathBuf::from(MINIMAP_TILE_DIR).join(key.tile_name());
                let abs = self.db_dir.join(&rel);
                if let Some(parent) = abs.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        warn!(error = %e, "cannot create tile directory");
                        return None;
                    }
                }
                if let Err(e) = tokio::fs::write(&abs, &png).await {
                    warn!(error = %e, "cannot store map tile");
                    return None;
                }
                self.minimap_cache.insert(key, rel);
                Some(abs)
            },
            Ok(Err(e)) => {
                debug!(device = record.device_id, error = %e, "minimap fetch failed");
                None
            },
            Err(_) => {
                self.enter_cooldown(cfg, "staticmap").await;
                None
            },
        }
    }
}
