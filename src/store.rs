// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Narrow seams toward the collaborators the core consumes but does not
//! implement: the history database, the mail notifier and the export
//! renderers. In-memory implementations live in [`memory`] for tests and
//! embedders.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::codec::location::{EventKind, LocationRecord};

/// Selection over the persisted history.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub device_id: Option<u32>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Keep only the first n matching records.
    pub head: Option<usize>,
    /// Keep only the last n matching records.
    pub tail: Option<usize>,
}

/// The history database as the core sees it.
pub trait LocationStore: Send + Sync {
    fn append(&self, record: &LocationRecord) -> Result<()>;
    fn query(&self, query: &HistoryQuery) -> Result<Vec<LocationRecord>>;
    fn delete_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize>;
    fn size(&self) -> Result<u64>;
}

/// Export formats rendered by the exporter collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Gpx,
    Csv,
    Pdf,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gpx" => Some(Self::Gpx),
            "csv" => Some(Self::Csv),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

pub trait Exporter: Send + Sync {
    fn render(&self, format: ExportFormat, query: &HistoryQuery) -> Result<Vec<u8>>;
}

/// Something the pipeline wants a human to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A location event, optionally enriched.
    Event {
        kind: EventKind,
        device_label: String,
        timestamp: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
        address: Option<String>,
        minimap_overview: Option<PathBuf>,
        minimap_detailed: Option<PathBuf>,
    },
    /// A tracker connected and identified itself via its first keep-alive.
    TrackerConnected { device_label: String, peer: String },
    /// An external service refused further calls; enrichment is degraded.
    RateLimitExceeded { service: String },
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// In-memory collaborators used by the test suite and the emulator.
pub mod memory {
    use std::sync::Mutex;

    use anyhow::{Context, Result, bail};
    use chrono::{DateTime, Utc};

    use super::{ExportFormat, Exporter, HistoryQuery, LocationStore, Notification, Notifier};
    use crate::codec::location::LocationRecord;

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        records: Mutex<Vec<LocationRecord>>,
        /// When set, `append` fails; exercises the §7 fatal path.
        pub fail_appends: std::sync::atomic::AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn snapshot(&self) -> Vec<LocationRecord> {
            self.records.lock().expect("store poisoned").clone()
        }
    }

    impl LocationStore for MemoryStore {
        fn append(&self, record: &LocationRecord) -> Result<()> {
            if self.fail_appends.load(std::sync::atomic::Ordering::Relaxed) {
                bail!("store append failure injected");
            }
            self.records
                .lock()
                .expect("store poisoned")
                .push(record.clone());
            Ok(())
        }

        fn query(&self, query: &HistoryQuery) -> Result<Vec<LocationRecord>> {
            let records = self.records.lock().expect("store poisoned");
            let mut out: Vec<LocationRecord> = records
                .iter()
                .filter(|r| query.device_id.is_none_or(|id| r.device_id == id))
                .filter(|r| query.from.is_none_or(|from| r.utc >= from))
                .filter(|r| query.to.is_none_or(|to| r.utc <= to))
                .cloned()
                .collect();
            if let Some(n) = query.head {
                out.truncate(n);
            }
            if let Some(n) = query.tail {
                let skip = out.len().saturating_sub(n);
                out.drain(..skip);
            }
            Ok(out)
        }

        fn delete_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
            let mut records = self.records.lock().expect("store poisoned");
            let before = records.len();
            records.retain(|r| r.utc < from || r.utc > to);
            Ok(before - records.len())
        }

        fn size(&self) -> Result<u64> {
            Ok(self.records.lock().expect("store poisoned").len() as u64)
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().expect("notifier poisoned").clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, notification: &Notification) -> Result<()> {
            self.sent
                .lock()
                .expect("notifier poisoned")
                .push(notification.clone());
            Ok(())
        }
    }

    /// Renders CSV directly from the store; GPX/PDF stay with the real
    /// exporter collaborator.
    pub struct CsvExporter<S> {
        store: std::sync::Arc<S>,
    }

    impl<S: LocationStore> CsvExporter<S> {
        pub fn new(store: std::sync::Arc<S>) -> Self {
            Self { store }
        }
    }

    impl<S: LocationStore> Exporter for CsvExporter<S> {
        fn render(&self, format: ExportFormat, query: &HistoryQuery) -> Result<Vec<u8>> {
            if format != ExportFormat::Csv {
                bail!("only csv is rendered in-process");
            }
            let records = self.store.query(query).context("export query")?;
            let mut out = String::from("deviceid,datetime,lon,lat,speed,heading,alt,sat,event,volt,detach\n");
            for r in records {
                out.push_str(&r.serialize());
                out.push('\n');
            }
            Ok(out.into_bytes())
        }
    }
}
