// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::YesNo;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Listener ports, capacity and the command-client policy.
    pub server: ServerConfig,
    /// Automatic position polling after a geofence event.
    #[serde(default)]
    pub gfen: GfenConfig,
    /// Reverse geocoding and static-map enrichment.
    #[serde(default)]
    pub lookup: LookupConfig,
    /// Event notification policy.
    #[serde(default)]
    pub mail: MailConfig,
    /// Track export segmentation consumed by the exporter collaborator.
    #[serde(default)]
    pub export: ExportConfig,
    /// Filesystem roots.
    pub paths: PathsConfig,
    /// Logging destination and level.
    #[serde(default)]
    pub logger: LoggerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// TCP port operators connect to.
    #[serde(default = "default_cmd_port")]
    pub cmd_port: u16,
    /// TCP port trackers connect to over GPRS.
    #[serde(default = "default_tracker_port")]
    pub tracker_port: u16,
    /// Cap on concurrently accepted connections of either role.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Seconds a silent tracker is kept before its session is closed.
    #[serde(default = "default_device_idle", with = "serde_secs")]
    pub device_idle_timeout: Duration,
    /// Seconds a silent command client is kept before its session is closed.
    #[serde(default = "default_client_idle", with = "serde_secs")]
    pub client_idle_timeout: Duration,
    /// Whether a shared secret is required on the command socket.
    #[serde(default)]
    pub require_password: YesNo,
    /// The shared secret. Only meaningful with `require_password`.
    #[serde(default)]
    pub password: String,
    /// Allow device commands outside the known command list.
    #[serde(default)]
    pub enable_raw_device_commands: YesNo,
    /// Reply wait for ordinary device commands.
    #[serde(default = "default_command_timeout", with = "serde_secs")]
    pub command_timeout: Duration,
    /// Reply wait for `dlrec`, which can legitimately take minutes.
    #[serde(default = "default_dlrec_timeout", with = "serde_secs")]
    pub dlrec_timeout: Duration,
    /// Minutes the device clock is ahead of UTC.
    #[serde(default)]
    pub device_tz_offset_minutes: i32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GfenConfig {
    /// Poll position automatically while a device is outside its fence.
    #[serde(default = "yes")]
    pub enable_gfen_tracking: YesNo,
    /// Seconds between synthetic position queries.
    #[serde(default = "default_gfen_interval", with = "serde_secs")]
    pub gfen_tracking_interval: Duration,
    /// Upper bound on one automatic tracking episode.
    #[serde(default = "default_gfen_max", with = "serde_secs")]
    pub max_gfen_auto_track_duration: Duration,
}

impl Default for GfenConfig {
    fn default() -> Self {
        Self {
            enable_gfen_tracking: YesNo::Yes,
            gfen_tracking_interval: default_gfen_interval(),
            max_gfen_auto_track_duration: default_gfen_max(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LookupConfig {
    /// Reverse-geocode event coordinates into a street address.
    #[serde(default)]
    pub use_address_lookup: YesNo,
    /// Meters within which a cached address counts as a hit.
    #[serde(default = "default_proximity")]
    pub address_lookup_proximity: f64,
    /// Attach overview/detail minimaps to event notifications.
    #[serde(default)]
    pub include_minimap: YesNo,
    #[serde(default = "default_overview_zoom")]
    pub minimap_overview_zoom: u8,
    #[serde(default = "default_detailed_zoom")]
    pub minimap_detailed_zoom: u8,
    #[serde(default = "default_minimap_dim")]
    pub minimap_width: u32,
    #[serde(default = "default_minimap_dim")]
    pub minimap_height: u32,
    /// When set, per-service throttling drops to the keyed floor.
    #[serde(default)]
    pub google_api_key: String,
    #[serde(default = "default_addr_cache_max")]
    pub address_cache_max: usize,
    #[serde(default = "default_minimap_cache_max")]
    pub minimap_cache_max: usize,
    #[serde(default = "default_http_timeout", with = "serde_secs")]
    pub geocode_http_timeout: Duration,
    #[serde(default = "default_http_timeout", with = "serde_secs")]
    pub map_http_timeout: Duration,
    /// Minimum spacing between external calls without an API key.
    #[serde(default = "default_spacing_anonymous", with = "serde_millis")]
    pub min_spacing_anonymous: Duration,
    /// Minimum spacing between external calls with an API key.
    #[serde(default = "default_spacing_keyed", with = "serde_millis")]
    pub min_spacing_keyed: Duration,
    /// Window during which at most one rate-limit-exceeded notice is sent.
    #[serde(default = "default_ratelimit_cooldown", with = "serde_secs")]
    pub ratelimit_cooldown: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            use_address_lookup: YesNo::No,
            address_lookup_proximity: default_proximity(),
            include_minimap: YesNo::No,
            minimap_overview_zoom: default_overview_zoom(),
            minimap_detailed_zoom: default_detailed_zoom(),
            minimap_width: default_minimap_dim(),
            minimap_height: default_minimap_dim(),
            google_api_key: String::new(),
            address_cache_max: default_addr_cache_max(),
            minimap_cache_max: default_minimap_cache_max(),
            geocode_http_timeout: default_http_timeout(),
            map_http_timeout: default_http_timeout(),
            min_spacing_anonymous: default_spacing_anonymous(),
            min_spacing_keyed: default_spacing_keyed(),
            ratelimit_cooldown: default_ratelimit_cooldown(),
        }
    }
}

impl LookupConfig {
    /// The effective per-service minimum spacing for this configuration.
    pub fn min_spacing(&self) -> Duration {
        if self.google_api_key.is_empty() {
            self.min_spacing_anonymous
        } else {
            self.min_spacing_keyed
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MailConfig {
    /// Master switch for event notifications.
    #[serde(default)]
    pub send_mail_on_event: YesNo,
    /// Notify on every event kind, overriding the exclusion list.
    #[serde(default)]
    pub force_mail_on_all_events: YesNo,
    /// Notify when a tracker connects and identifies itself.
    #[serde(default)]
    pub mail_on_tracker_conn: YesNo,
    /// Run the connect hook script when a tracker identifies itself.
    #[serde(default)]
    pub script_on_tracker_conn: YesNo,
    /// Render only the last four digits of the device id in payloads.
    #[serde(default)]
    pub use_short_devid: YesNo,
    /// Translate numeric device reply fields into labelled text.
    #[serde(default = "yes")]
    pub translate_device_reply: YesNo,
    /// Event codes excluded from notification (REC is typically listed
    /// to avoid mail floods from log downloads).
    #[serde(default = "default_mail_exclusions")]
    pub event_mail_exclusions: Vec<u8>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ExportConfig {
    /// Seconds of silence that split two tracks in an export.
    #[serde(default = "default_track_split")]
    pub track_split_time: i64,
    /// Seconds of silence that split two segments within a track.
    #[serde(default = "default_trackseg_split")]
    pub track_seg_split_time: i64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            track_split_time: default_track_split(),
            track_seg_split_time: default_trackseg_split(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PathsConfig {
    /// Root for presets and other runtime data.
    pub data_dir: PathBuf,
    /// Root for the history database and geo-cache files.
    pub db_dir: PathBuf,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub output: LogOutput,
    #[serde(default)]
    pub file: Option<LogFileConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: LogOutput::Stderr,
            file: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    #[default]
    Stderr,
    File,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFileConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub rotation_frequency: Option<RotationFreq>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.server.max_clients >= 1, "max_clients must be >= 1");
        // Port 0 means OS-assigned (used by the test harness).
        if self.server.cmd_port != 0 || self.server.tracker_port != 0 {
            ensure!(
                self.server.cmd_port != self.server.tracker_port,
                "cmd_port and tracker_port must differ"
            );
        }
        if self.server.require_password.as_bool() {
            ensure!(
                !self.server.password.is_empty(),
                "password must not be empty when require_password is set"
            );
        }

        let ivl = self.gfen.gfen_tracking_interval.as_secs();
        ensure!(
            (10..=3600).contains(&ivl),
            "gfen_tracking_interval must be within 10..=3600 seconds"
        );

        ensure!(
            self.lookup.address_lookup_proximity >= 0.0,
            "address_lookup_proximity must not be negative"
        );
        ensure!(
            self.lookup.address_cache_max >= 1 && self.lookup.minimap_cache_max >= 1,
            "cache sizes must be >= 1"
        );

        // Two positive split times must be strictly ordered or the exporter
        // would produce empty segments.
        let split = self.export.track_split_time;
        let seg = self.export.track_seg_split_time;
        if split > 0 && seg > 0 {
            ensure!(
                split > seg,
                "track_split_time ({split}) must be greater than track_seg_split_time ({seg})"
            );
        }

        for code in &self.mail.event_mail_exclusions {
            ensure!(
                crate::codec::location::EventKind::from_code(*code).is_some(),
                "event_mail_exclusions contains unknown event code {code}"
            );
        }

        Ok(())
    }
}

fn yes() -> YesNo {
    YesNo::Yes
}

fn default_cmd_port() -> u16 {
    3100
}
fn default_tracker_port() -> u16 {
    3400
}
fn default_max_clients() -> usize {
    5
}
fn default_device_idle() -> Duration {
    Duration::from_secs(180)
}
fn default_client_idle() -> Duration {
    Duration::from_secs(1200)
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_dlrec_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_gfen_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_gfen_max() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_proximity() -> f64 {
    20.0
}
fn default_overview_zoom() -> u8 {
    9
}
fn default_detailed_zoom() -> u8 {
    15
}
fn default_minimap_dim() -> u32 {
    200
}
fn default_addr_cache_max() -> usize {
    10_000
}
fn default_minimap_cache_max() -> usize {
    20_000
}
fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_spacing_anonymous() -> Duration {
    Duration::from_millis(1000)
}
fn default_spacing_keyed() -> Duration {
    Duration::from_millis(200)
}
fn default_ratelimit_cooldown() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_mail_exclusions() -> Vec<u8> {
    vec![crate::codec::location::EventKind::Rec.code()]
}
fn default_track_split() -> i64 {
    240
}
fn default_trackseg_split() -> i64 {
    -1
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            server: ServerConfig {
                cmd_port: 3100,
                tracker_port: 3400,
                max_clients: 5,
                device_idle_timeout: default_device_idle(),
                client_idle_timeout: default_client_idle(),
                require_password: YesNo::No,
                password: String::new(),
                enable_raw_device_commands: YesNo::No,
                command_timeout: default_command_timeout(),
                dlrec_timeout: default_dlrec_timeout(),
                device_tz_offset_minutes: 0,
            },
            gfen: GfenConfig::default(),
            lookup: LookupConfig::default(),
            mail: MailConfig::default(),
            export: ExportConfig::default(),
            paths: PathsConfig {
                data_dir: PathBuf::from("/tmp/trackerd"),
                db_dir: PathBuf::from("/tmp/trackerd/db"),
            },
            logger: LoggerConfig::default(),
        }
    }

    #[test]
    fn minimal_config_validates() {
        minimal().validate_and_normalize().expect("valid config");
    }

    #[test]
    fn split_time_ordering_enforced() {
        let mut cfg = minimal();
        cfg.export.track_split_time = 100;
        cfg.export.track_seg_split_time = 100;
        assert!(cfg.validate_and_normalize().is_err());

        cfg.export.track_seg_split_time = -1;
        cfg.validate_and_normalize().expect("disabled seg split is fine");
    }

    #[test]
    fn password_required_when_enabled() {
        let mut cfg = minimal();
        cfg.server.require_password = YesNo::Yes;
        assert!(cfg.validate_and_normalize().is_err());
        cfg.server.password = "s3cret".into();
        cfg.validate_and_normalize().expect("valid with secret");
    }

    #[test]
    fn keyed_spacing_applies_with_api_key() {
        let mut cfg = minimal();
        assert_eq!(cfg.lookup.min_spacing(), Duration::from_millis(1000));
        cfg.lookup.google_api_key = "k".into();
        assert_eq!(cfg.lookup.min_spacing(), Duration::from_millis(200));
    }
}
