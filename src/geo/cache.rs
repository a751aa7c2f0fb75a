// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    fs,
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use anyhow::{Context, Result, bail, ensure};
use chrono::Utc;

use crate::{geo::stats::CacheStats, utils::haversine_m};

/// Version header written as the first line of every persisted cache file.
pub const CACHE_FILE_HEADER: &str = "# trackerd-geocache v1";

/// File names under `db_dir`.
pub const ADDR_CACHE_FILE: &str = "geoloc_addrcache.txt";
pub const MINIMAP_CACHE_FILE: &str = "geoloc_minimapcache.txt";
pub const CACHE_STAT_FILE: &str = "geoloc_cachestat.txt";
/// Subdirectory for fetched map tiles.
pub const MINIMAP_TILE_DIR: &str = "map_cache";

// ~1.1 m of latitude per quantization step.
#[inline]
fn quantize(v: f64) -> i64 {
    (v * 1e5).round() as i64
}

#[derive(Debug, Clone)]
struct AddrEntry {
    lat: f64,
    lon: f64,
    address: String,
    last_used: i64,
    order: u64,
}

#[derive(Debug, Default)]
struct AddrInner {
    map: HashMap<(i64, i64), AddrEntry>,
    tick: u64,
}

/// Coordinate -> formatted street address, bounded LRU, with the
/// proximity-match policy: any cached entry within `proximity_m` of the
/// queried point counts as a hit and refreshes its LRU position.
#[derive(Debug)]
pub struct AddressCache {
    inner: RwLock<AddrInner>,
    capacity: usize,
    proximity_m: f64,
    stats: Arc<CacheStats>,
}

impl AddressCache {
    pub fn new(capacity: usize, proximity_m: f64, stats: Arc<CacheStats>) -> Self {
        Self {
            inner: RwLock::new(AddrInner::default()),
            capacity,
            proximity_m,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact-key or proximity lookup. A hit refreshes the entry's LRU
    /// position and use timestamp.
    pub fn lookup(&self, lat: f64, lon: f64) -> Option<String> {
        let mut inner = self.inner.write().expect("cache poisoned");
        inner.tick += 1;
        let tick = inner.tick;

        let key = (quantize(lat), quantize(lon));
        if let Some(entry) = inner.map.get_mut(&key) {
            entry.order = tick;
            entry.last_used = Utc::now().timestamp();
            self.stats.hit();
            return Some(entry.address.clone());
        }

        let near = inner
            .map
            .iter()
            .find(|(_, e)| haversine_m(lat, lon, e.lat, e.lon) <= self.proximity_m)
            .map(|(k, _)| *k);
        if let Some(k) = near {
            let entry = inner.map.get_mut(&k).expect("key just found");
            entry.order = tick;
            entry.last_used = Utc::now().timestamp();
            self.stats.hit();
            return Some(entry.address.clone());
        }

        self.stats.miss();
        None
    }

    /// Insert, evicting the least recently used entry when over capacity.
    pub fn insert(&self, lat: f64, lon: f64, address: &str) {
        let mut inner = self.inner.write().expect("cache poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(
            (quantize(lat), quantize(lon)),
            AddrEntry {
                lat,
                lon,
                // Quotes would break the persisted line format.
                address: address.replace('"', "'"),
                last_used: Utc::now().timestamp(),
                order: tick,
            },
        );

        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.order)
                .map(|(k, _)| *k)
            {
                inner.map.remove(&oldest);
                self.stats.eviction();
            }
        }
    }

    /// One record per line: `lat lon unix_last_used "formatted address"`.
    pub fn persist<W: Write>(&self, mut writer: W) -> Result<()> {
        let inner = self.inner.read().expect("cache poisoned");
        writeln!(writer, "{CACHE_FILE_HEADER}")?;
        let mut entries: Vec<&AddrEntry> = inner.map.values().collect();
        entries.sort_by_key(|e| e.order);
        for e in entries {
            writeln!(
                writer,
                "{:.6} {:.6} {} \"{}\"",
                e.lat, e.lon, e.last_used, e.address
            )?;
        }
        Ok(())
    }

    /// Replace the cache contents from a previously persisted stream.
    /// LRU order restarts in file order.
    pub fn restore<R: BufRead>(&self, reader: R) -> Result<()> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .context("empty cache file")?
            .context("read header")?;
        ensure!(
            header.trim() == CACHE_FILE_HEADER,
            "unexpected cache file header {header:?}"
        );

        let mut inner = self.inner.write().expect("cache poisoned");
        inner.map.clear();
        for line in lines {
            let line = line.context("read cache line")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            inner.tick += 1;
            let tick = inner.tick;

            let mut parts = line.splitn(4, ' ');
            let lat: f64 = parts.next().context("missing lat")?.parse()?;
            let lon: f64 = parts.next().context("missing lon")?.parse()?;
            let last_used: i64 = parts.next().context("missing timestamp")?.parse()?;
            let quoted = parts.next().context("missing address")?;
            let address = quoted
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .with_context(|| format!("address not quoted: {quoted:?}"))?
                .to_string();

            inner.map.insert(
                (quantize(lat), quantize(lon)),
                AddrEntry {
                    lat,
                    lon,
                    address,
                    last_used,
                    order: tick,
                },
            );
        }

        // A shrunk capacity between runs drops the oldest entries.
        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.order)
                .map(|(k, _)| *k)
            {
                inner.map.remove(&oldest);
            }
        }
        Ok(())
    }
}

/// Key of one stored map tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MinimapKey {
    pub lat_q: i64,
    pub lon_q: i64,
    pub zoom: u8,
    pub width: u32,
    pub height: u32,
}

impl MinimapKey {
    pub fn new(lat: f64, lon: f64, zoom: u8, width: u32, height: u32) -> Self {
        Self {
            lat_q: quantize(lat),
            lon_q: quantize(lon),
            zoom,
            width,
            height,
        }
    }

    /// Stable tile file name under [`MINIMAP_TILE_DIR`].
    pub fn tile_name(&self) -> String {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut h);
        format!("{:016x}.png", h.finish())
    }
}

#[derive(Debug, Clone)]
struct MinimapEntry {
    path: PathBuf,
    last_used: i64,
    order: u64,
}

#[derive(Debug, Default)]
struct MinimapInner {
    map: HashMap<MinimapKey, MinimapEntry>,
    tick: u64,
}

/// (coordinate, zoom, size) -> stored PNG tile path, bounded LRU.
#[derive(Debug)]
pub struct MinimapCache {
    inner: RwLock<MinimapInner>,
    capacity: usize,
    stats: Arc<CacheStats>,
}

impl MinimapCache {
    pub fn new(capacity: usize, stats: Arc<CacheStats>) -> Self {
        Self {
            inner: RwLock::new(MinimapInner::default()),
            capacity,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, key: &MinimapKey) -> Option<PathBuf> {
        let mut inner = self.inner.write().expect("cache poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.order = tick;
                entry.last_used = Utc::now().timestamp();
                self.stats.hit();
                Some(entry.path.clone())
            },
            None => {
                self.stats.miss();
                None
            },
        }
    }

    pub fn insert(&self, key: MinimapKey, path: PathBuf) {
        let mut inner = self.inner.write().expect("cache poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(
            key,
            MinimapEntry {
                path,
                last_used: Utc::now().timestamp(),
                order: tick,
            },
        );

        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.order)
                .map(|(k, _)| *k)
            {
                inner.map.remove(&oldest);
                self.stats.eviction();
            }
        }
    }

    /// One record per line:
    /// `lat lon zoom w h unix_last_used relative_path`.
    pub fn persist<W: Write>(&self, mut writer: W) -> Result<()> {
        let inner = self.inner.read().expect("cache poisoned");
        writeln!(writer, "{CACHE_FILE_HEADER}")?;
        let mut entries: Vec<(&MinimapKey, &MinimapEntry)> = inner.map.iter().collect();
        entries.sort_by_key(|(_, e)| e.order);
        for (k, e) in entries {
            writeln!(
                writer,
                "{:.6} {:.6} {} {} {} {} {}",
                k.lat_q as f64 / 1e5,
                k.lon_q as f64 / 1e5,
                k.zoom,
                k.width,
                k.height,
                e.last_used,
                e.path.display()
            )?;
        }
        Ok(())
    }

    pub fn restore<R: BufRead>(&self, reader: R) -> Result<()> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .context("empty cache file")?
            .context("read header")?;
        ensure!(
            header.trim() == CACHE_FILE_HEADER,
            "unexpected cache file header {header:?}"
        );

        let mut inner = self.inner.write().expect("cache poisoned");
        inner.map.clear();
        for line in lines {
            let line = line.context("read cache line")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            inner.tick += 1;
            let tick = inner.tick;

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 7 {
                bail!("bad minimap cache line {line:?}");
            }
            let lat: f64 = fields[0].parse()?;
            let lon: f64 = fields[1].parse()?;
            let zoom: u8 = fields[2].parse()?;
            let width: u32 = fields[3].parse()?;
            let height: u32 = fields[4].parse()?;
            let last_used: i64 = fields[5].parse()?;
            let path = PathBuf::from(fields[6]);

            inner.map.insert(
                MinimapKey::new(lat, lon, zoom, width, height),
                MinimapEntry {
                    path,
                    last_used,
                    order: tick,
                },
            );
        }

        while inner.map.len() > self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.order)
                .map(|(k, _)| *k)
            {
                inner.map.remove(&oldest);
            }
        }
        Ok(())
    }
}

/// Write `contents` to `path`, first rotating any existing file to
/// `<stem>_backup.<ext>`.
pub fn save_with_backup(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        let backup = backup_path(path);
        fs::rename(path, &backup)
            .with_context(|| format!("rotating {} to backup", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

fn backup_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = path.extension().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!("{stem}_backup.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_cache(capacity: usize) -> AddressCache {
        AddressCache::new(capacity, 20.0, Arc::new(CacheStats::new()))
    }

    #[test]
    fn exact_hit_and_miss() {
        let cache = addr_cache(10);
        cache.insert(59.36647, 17.96103, "Sveavägen 1");
        assert_eq!(
            cache.lookup(59.36647, 17.96103).as_deref(),
            Some("Sveavägen 1")
        );
        assert!(cache.lookup(60.0, 18.0).is_none());
    }

    #[test]
    fn proximity_hit_within_radius() {
        let stats = Arc::new(CacheStats::new());
        let cache = AddressCache::new(10, 20.0, stats.clone());
        cache.insert(59.36647, 17.96103, "Sveavägen 1");

        // ~1.2 m away: inside the 20 m radius.
        assert_eq!(
            cache.lookup(59.36648, 17.96104).as_deref(),
            Some("Sveavägen 1")
        );
        assert_eq!(stats.hits.load(std::sync::atomic::Ordering::Relaxed), 1);

        // ~500 m away: a miss.
        assert!(cache.lookup(59.37100, 17.96103).is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let stats = Arc::new(CacheStats::new());
        let cache = AddressCache::new(2, 1.0, stats.clone());
        cache.insert(1.0, 1.0, "a");
        cache.insert(2.0, 2.0, "b");
        // Refresh "a" so "b" is the LRU victim.
        assert!(cache.lookup(1.0, 1.0).is_some());
        cache.insert(3.0, 3.0, "c");

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(2.0, 2.0).is_none());
        assert!(cache.lookup(1.0, 1.0).is_some());
        assert_eq!(stats.evictions.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn addr_persist_restore_round_trip() {
        let cache = addr_cache(10);
        cache.insert(59.36647, 17.96103, "Sveavägen 1");
        cache.insert(57.70887, 11.97456, "Avenyn 10");

        let mut buf = Vec::new();
        cache.persist(&mut buf).expect("persist");

        let restored = addr_cache(10);
        restored.restore(buf.as_slice()).expect("restore");
        assert_eq!(restored.len(), 2);
        assert_eq!(
            restored.lookup(59.36647, 17.96103).as_deref(),
            Some("Sveavägen 1")
        );
    }

    #[test]
    fn restore_rejects_wrong_header() {
        let cache = addr_cache(10);
        assert!(cache.restore("# other v9\n".as_bytes()).is_err());
    }

    #[test]
    fn minimap_round_trip() {
        let stats = Arc::new(CacheStats::new());
        let cache = MinimapCache::new(10, stats.clone());
        let key = MinimapKey::new(59.36647, 17.96103, 15, 200, 200);
        cache.insert(key, PathBuf::from("map_cache/abc.png"));

        let mut buf = Vec::new();
        cache.persist(&mut buf).expect("persist");

        let restored = MinimapCache::new(10, stats);
        restored.restore(buf.as_slice()).expect("restore");
        assert_eq!(
            restored.lookup(&key),
            Some(PathBuf::from("map_cache/abc.png"))
        );
    }

    #[test]
    fn tile_name_is_stable() {
        let a = MinimapKey::new(59.36647, 17.96103, 15, 200, 200);
        let b = MinimapKey::new(59.36647, 17.96103, 15, 200, 200);
        assert_eq!(a.tile_name(), b.tile_name());
        let c = MinimapKey::new(59.36647, 17.96103, 9, 200, 200);
        assert_ne!(a.tile_name(), c.tile_name());
    }
}
