// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::PathBuf, sync::Arc, sync::atomic::Ordering};

use anyhow::Result;
use trackerd::geo::{
    cache::{AddressCache, MinimapCache, MinimapKey, save_with_backup},
    stats::CacheStats,
};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trackerd-{tag}-{}", std::process::id()));
    fs::create_dir_all(&dir).expect("mkdir");
    dir
}

#[test]
fn proximity_hit_skips_service_and_counts() {
    let stats = Arc::new(CacheStats::new());
    let cache = AddressCache::new(100, 20.0, stats.clone());
    cache.insert(59.36647, 17.96103, "Sveavägen 1");

    let hit = cache.lookup(59.36648, 17.96104);
    assert_eq!(hit.as_deref(), Some("Sveavägen 1"));
    assert_eq!(stats.hits.load(Ordering::Relaxed), 1);
    assert_eq!(stats.misses.load(Ordering::Relaxed), 0);
}

#[test]
fn capacity_is_never_exceeded() {
    let stats = Arc::new(CacheStats::new());
    let cache = AddressCache::new(8, 1.0, stats);
    for i in 0..50 {
        cache.insert(10.0 + i as f64, 10.0 + i as f64, &format!("addr {i}"));
        assert!(cache.len() <= 8, "size {} after insert {i}", cache.len());
    }
}

#[test]
fn persist_restore_file_round_trip_with_backup() -> Result<()> {
    let dir = temp_dir("addrcache");
    let file = dir.join("geoloc_addrcache.txt");

    let stats = Arc::new(CacheStats::new());
    let cache = AddressCache::new(100, 20.0, stats.clone());
    cache.insert(59.36647, 17.96103, "Sveavägen 1, Stockholm");
    cache.insert(57.70887, 11.97456, "Avenyn 10, Göteborg");

    let mut buf = Vec::new();
    cache.persist(&mut buf)?;
    save_with_backup(&file, &String::from_utf8_lossy(&buf))?;

    // A second save rotates the first into the backup file.
    save_with_backup(&file, &String::from_utf8_lossy(&buf))?;
    assert!(dir.join("geoloc_addrcache_backup.txt").exists());

    let restored = AddressCache::new(100, 20.0, stats);
    restored.restore(std::io::BufReader::new(fs::File::open(&file)?))?;
    assert_eq!(restored.len(), 2);
    assert_eq!(
        restored.lookup(59.36647, 17.96103).as_deref(),
        Some("Sveavägen 1, Stockholm")
    );

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn minimap_persist_restore_keeps_keys_and_paths() -> Result<()> {
    let stats = Arc::new(CacheStats::new());
    let cache = MinimapCache::new(100, stats.clone());

    let overview = MinimapKey::new(59.36647, 17.96103, 9, 200, 200);
    let detail = MinimapKey::new(59.36647, 17.96103, 15, 200, 200);
    cache.insert(overview, PathBuf::from("map_cache/ov.png"));
    cache.insert(detail, PathBuf::from("map_cache/det.png"));

    let mut buf = Vec::new();
    cache.persist(&mut buf)?;

    let restored = MinimapCache::new(100, stats);
    restored.restore(buf.as_slice())?;
    assert_eq!(restored.len(), 2);
    assert_eq!(
        restored.lookup(&overview),
        Some(PathBuf::from("map_cache/ov.png"))
    );
    assert_eq!(
        restored.lookup(&detail),
        Some(PathBuf::from("map_cache/det.png"))
    );
    Ok(())
}

#[test]
fn stats_aggregate_across_runs() -> Result<()> {
    let first_run = CacheStats::new();
    first_run.hit();
    first_run.miss();
    first_run.service_call();
    let persisted = first_run.persist();

    let second_run = CacheStats::new();
    second_run.restore(&persisted)?;
    second_run.hit();
    assert_eq!(second_run.hits.load(Ordering::Relaxed), 2);
    assert_eq!(second_run.service_calls.load(Ordering::Relaxed), 1);
    Ok(())
}
