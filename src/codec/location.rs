// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Number of comma-separated fields in one location record.
pub const RECORD_FIELDS: usize = 11;

/// Event kinds a tracker reports in field 9 of a location record.
///
/// The discriminants are the numeric codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    GetLoc = 0,
    Timer = 1,
    Rec = 2,
    Track = 3,
    Wakeup = 4,
    Sleep = 5,
    LowBatt = 6,
    Gfen = 7,
    Setra = 8,
}

impl EventKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::GetLoc),
            1 => Some(Self::Timer),
            2 => Some(Self::Rec),
            3 => Some(Self::Track),
            4 => Some(Self::Wakeup),
            5 => Some(Self::Sleep),
            6 => Some(Self::LowBatt),
            7 => Some(Self::Gfen),
            8 => Some(Self::Setra),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Human description shown in notifications and client output.
    pub fn describe(self) -> &'static str {
        match self {
            Self::GetLoc => "Position data",
            Self::Timer => "Timer report",
            Self::Rec => "Logging data",
            Self::Track => "Position update",
            Self::Wakeup => "Wake Up Report",
            Self::Sleep => "Enter Sleeping Report",
            Self::LowBatt => "Internal Battery Low Alert",
            Self::Gfen => "Virtual fence crossing",
            Self::Setra => "Unit Detaching Report",
        }
    }
}

/// One parsed position report from a tracker.
///
/// `timestamp` is the raw device-local `YYYYMMDDhhmmss` value; `utc` is
/// the same instant shifted by the configured device timezone offset.
/// Both are stored, the device-local form is what goes back on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRecord {
    pub device_id: u32,
    pub timestamp: NaiveDateTime,
    pub utc: DateTime<Utc>,
    pub longitude: f64,
    pub latitude: f64,
    pub speed_kmh: u32,
    pub heading_deg: u16,
    pub altitude_m: i32,
    pub satellites: u8,
    pub event: EventKind,
    /// Raw voltage field, e.g. `"4.20V"`.
    pub voltage: String,
    pub detached: bool,
}

impl LocationRecord {
    /// Parse one bare record line (no surrounding brackets, no CRLF).
    ///
    /// Field order on the wire:
    /// `devid,ts,lon,lat,speed,heading,alt,sat,evt,volt,detach`.
    /// Anything that is not exactly eleven fields, or any field outside its
    /// valid range, is a protocol error for this record.
    pub fn parse(line: &str, tz_offset_minutes: i32) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != RECORD_FIELDS {
            bail!(
                "location record must have {RECORD_FIELDS} fields, got {}",
                fields.len()
            );
        }

        let device_id: u32 = fields[0]
            .parse()
            .with_context(|| format!("bad device id {:?}", fields[0]))?;

        let timestamp = NaiveDateTime::parse_from_str(fields[1], "%Y%m%d%H%M%S")
            .with_context(|| format!("bad datetime {:?}", fields[1]))?;
        let utc = DateTime::<Utc>::from_naive_utc_and_offset(
            timestamp - Duration::minutes(tz_offset_minutes as i64),
            Utc,
        );

        let longitude: f64 = fields[2]
            .parse()
            .with_context(|| format!("bad longitude {:?}", fields[2]))?;
        if !(-180.0..=180.0).contains(&longitude) {
            bail!("longitude {longitude} out of range");
        }
        let latitude: f64 = fields[3]
            .parse()
            .with_context(|| format!("bad latitude {:?}", fields[3]))?;
        if !(-90.0..=90.0).contains(&latitude) {
            bail!("latitude {latitude} out of range");
        }

        let speed_kmh: u32 = fields[4]
            .parse()
            .with_context(|| format!("bad speed {:?}", fields[4]))?;
        let heading_deg: u16 = fields[5]
            .parse()
            .with_context(|| format!("bad heading {:?}", fields[5]))?;
        if heading_deg >= 360 {
            bail!("heading {heading_deg} out of range");
        }
        let altitude_m: i32 = fields[6]
            .parse()
            .with_context(|| format!("bad altitude {:?}", fields[6]))?;

        let satellites: u8 = fields[7]
            .parse()
            .with_context(|| format!("bad satellite count {:?}", fields[7]))?;
        if satellites > 32 {
            bail!("satellite count {satellites} out of range");
        }

        let evt_code: u8 = fields[8]
            .parse()
            .with_context(|| format!("bad event code {:?}", fields[8]))?;
        let event = EventKind::from_code(evt_code)
            .with_context(|| format!("unknown event code {evt_code}"))?;

        let voltage = fields[9].to_string();
        if !is_valid_voltage(&voltage) {
            bail!("bad voltage field {voltage:?}");
        }

        let detached = match fields[10] {
            "0" => false,
            "1" => true,
            other => bail!("bad detach flag {other:?}"),
        };

        Ok(Self {
            device_id,
            timestamp,
            utc,
            longitude,
            latitude,
            speed_kmh,
            heading_deg,
            altitude_m,
            satellites,
            event,
            voltage,
            detached,
        })
    }

    /// Emit the exact 11-field wire form this record was parsed from.
    pub fn serialize(&self) -> String {
        format!(
            "{},{},{:.6},{:.6},{},{},{},{},{},{},{}",
            self.device_id,
            self.timestamp.format("%Y%m%d%H%M%S"),
            self.longitude,
            self.latitude,
            self.speed_kmh,
            self.heading_deg,
            self.altitude_m,
            self.satellites,
            self.event.code(),
            self.voltage,
            u8::from(self.detached),
        )
    }
}

// The device always reports "d.ddV".
fn is_valid_voltage(v: &str) -> bool {
    let b = v.as_bytes();
    b.len() == 5
        && b[0].is_ascii_digit()
        && b[1] == b'.'
        && b[2].is_ascii_digit()
        && b[3].is_ascii_digit()
        && b[4] == b'V'
}

/// Outcome of parsing one buffer of location traffic. Bad records inside a
/// batch do not poison their neighbours; they are reported alongside.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<LocationRecord>,
    pub errors: Vec<anyhow::Error>,
}

/// Parse a buffer that holds either a single bare record or a batch
/// `[rec\r\nrec\r\n...rec]` where the closing `]` replaces the final CRLF.
pub fn parse_location_buffer(buf: &str, tz_offset_minutes: i32) -> ParsedBatch {
    let trimmed = buf.trim_end_matches(['\r', '\n']);
    let inner = if let Some(stripped) = trimmed.strip_prefix('[') {
        stripped.strip_suffix(']').unwrap_or(stripped)
    } else {
        trimmed
    };

    let mut out = ParsedBatch::default();
    for line in inner.split("\r\n") {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        match LocationRecord::parse(line, tz_offset_minutes) {
            Ok(rec) => out.records.push(rec),
            Err(e) => out.errors.push(e),
        }
    }
    out
}

/// True when the buffer starts like location traffic (batch bracket or a
/// bare record, which always begins with the numeric device id).
#[inline]
pub fn looks_like_location(buf: &[u8]) -> bool {
    matches!(buf.first(), Some(b'[') | Some(b'0'..=b'9'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REC: &str = "3000000001,20140107232526,17.961028,59.366470,0,0,0,0,2,4.20V,0";

    #[test]
    fn parse_single_record() {
        let rec = LocationRecord::parse(REC, 0).expect("valid record");
        assert_eq!(rec.device_id, 3_000_000_001);
        assert_eq!(rec.longitude, 17.961028);
        assert_eq!(rec.latitude, 59.366470);
        assert_eq!(rec.event, EventKind::Rec);
        assert!(!rec.detached);
    }

    #[test]
    fn serialize_round_trip() {
        let rec = LocationRecord::parse(REC, 0).expect("valid record");
        let again = LocationRecord::parse(&rec.serialize(), 0).expect("round trip");
        assert_eq!(rec, again);
    }

    #[test]
    fn tz_offset_shifts_utc() {
        let rec = LocationRecord::parse(REC, 60).expect("valid record");
        assert_eq!(
            rec.utc.naive_utc(),
            rec.timestamp - Duration::minutes(60)
        );
    }

    #[test]
    fn wrong_field_count_is_error() {
        assert!(LocationRecord::parse("1,2,3", 0).is_err());
    }

    #[test]
    fn out_of_range_latitude_is_error() {
        let bad = REC.replace("59.366470", "95.000000");
        assert!(LocationRecord::parse(&bad, 0).is_err());
    }

    #[test]
    fn bad_voltage_is_error() {
        let bad = REC.replace("4.20V", "4.2V");
        assert!(LocationRecord::parse(&bad, 0).is_err());
    }

    #[test]
    fn batch_with_bad_record_keeps_good_ones() {
        let buf = format!("[{REC}\r\nnot,a,record\r\n{REC}]");
        let parsed = parse_location_buffer(&buf, 0);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.errors.len(), 1);
    }
}
