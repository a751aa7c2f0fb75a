// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Translation of numeric device reply fields into labelled human text,
//! and the table renderer hook used for client output.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::codec::command::DeviceReply;

/// How one reply field is typed and labelled.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub label: &'static str,
    pub ftype: FieldType,
}

#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    Bool,
    Int,
    Enum(&'static [(&'static str, &'static str)]),
    Text,
}

const ON_OFF: &[(&str, &str)] = &[("0", "Off"), ("1", "On")];

const COMM_SELECT: &[(&str, &str)] = &[
    ("0", "USB"),
    ("1", "SMS"),
    ("2", "CSD"),
    ("3", "GPRS"),
];

const FENCE_TRIGGER: &[(&str, &str)] = &[
    ("1", "Entering fence"),
    ("2", "Leaving fence"),
    ("3", "Both directions"),
];

const REPORT_ACTION: &[(&str, &str)] = &[
    ("0", "None"),
    ("1", "Log"),
    ("2", "Log and report"),
    ("3", "Log, report and VIP SMS"),
];

const TRACK_BASIS: &[(&str, &str)] = &[
    ("0", "Time"),
    ("1", "Distance"),
    ("2", "Time and distance"),
    ("3", "Time or distance"),
    ("4", "Heading"),
];

const PS_MODE: &[(&str, &str)] = &[
    ("0", "Disabled"),
    ("1", "Sleep"),
    ("2", "Deep sleep"),
    ("3", "Scheduled wakeup"),
];

const SMS_MODE: &[(&str, &str)] = &[("0", "PDU"), ("1", "Text")];

/// Per-command field tables. Replies for commands not listed here pass
/// through verbatim.
static REPLY_TABLES: Lazy<HashMap<&'static str, &'static [FieldSpec]>> = Lazy::new(|| {
    use FieldType::*;

    let mut m: HashMap<&'static str, &'static [FieldSpec]> = HashMap::new();
    m.insert("IMEI", &[FieldSpec { label: "IMEI", ftype: Text }]);
    m.insert("VER", &[FieldSpec { label: "Firmware version", ftype: Text }]);
    m.insert("LED", &[FieldSpec { label: "LED indicator", ftype: Bool }]);
    m.insert("ROAM", &[FieldSpec { label: "GPRS roaming", ftype: Bool }]);
    m.insert("SLEEP", &[FieldSpec {
        label: "Power save mode",
        ftype: Enum(PS_MODE),
    }]);
    m.insert("PS", &[
        FieldSpec { label: "Mode", ftype: Enum(PS_MODE) },
        FieldSpec { label: "Wakeup interval (s)", ftype: Int },
    ]);
    m.insert("TZ", &[
        FieldSpec { label: "Sign", ftype: Enum(&[("0", "+"), ("1", "-")]) },
        FieldSpec { label: "Hours", ftype: Int },
        FieldSpec { label: "Minutes", ftype: Int },
    ]);
    m.insert("SMS", &[FieldSpec { label: "SMS mode", ftype: Enum(SMS_MODE) }]);
    m.insert("COMM", &[
        FieldSpec { label: "Channel", ftype: Enum(COMM_SELECT) },
        FieldSpec { label: "SMS base number", ftype: Text },
        FieldSpec { label: "CSD base number", ftype: Text },
        FieldSpec { label: "GPRS APN", ftype: Text },
        FieldSpec { label: "GPRS user", ftype: Text },
        FieldSpec { label: "GPRS password", ftype: Text },
        FieldSpec { label: "Server address", ftype: Text },
        FieldSpec { label: "Server port", ftype: Int },
        FieldSpec { label: "Keep-alive interval (s)", ftype: Int },
        FieldSpec { label: "DNS", ftype: Text },
    ]);
    m.insert("TRACK", &[
        FieldSpec { label: "Tracking", ftype: Bool },
        FieldSpec { label: "Interval (s)", ftype: Int },
        FieldSpec { label: "Distance (m)", ftype: Int },
        FieldSpec { label: "Report count", ftype: Int },
        FieldSpec { label: "Basis", ftype: Enum(TRACK_BASIS) },
        FieldSpec { label: "Channel", ftype: Enum(COMM_SELECT) },
        FieldSpec { label: "Heading (deg)", ftype: Int },
    ]);
    m.insert("GFEN", &[
        FieldSpec { label: "Fence", ftype: Enum(ON_OFF) },
        FieldSpec { label: "Radius (m)", ftype: Int },
        FieldSpec { label: "Trigger", ftype: Enum(FENCE_TRIGGER) },
        FieldSpec { label: "Action", ftype: Enum(REPORT_ACTION) },
        FieldSpec { label: "VIP mask", ftype: Int },
    ]);
    m.insert("REC", &[
        FieldSpec { label: "Logging", ftype: Bool },
        FieldSpec { label: "Interval (s)", ftype: Int },
        FieldSpec { label: "Distance (m)", ftype: Int },
        FieldSpec { label: "Record count", ftype: Int },
        FieldSpec { label: "Basis", ftype: Enum(TRACK_BASIS) },
    ]);
    m.insert("LOWBATT", &[
        FieldSpec { label: "Threshold (%)", ftype: Int },
        FieldSpec { label: "Action", ftype: Enum(REPORT_ACTION) },
    ]);
    m.insert("MSWITCH", &[
        FieldSpec { label: "Detach detection", ftype: Bool },
        FieldSpec { label: "Action", ftype: Enum(REPORT_ACTION) },
    ]);
    m.insert("PHONE", &[FieldSpec { label: "Phone number", ftype: Text }]);
    m.insert("SIM", &[
        FieldSpec { label: "SIM id", ftype: Text },
        FieldSpec { label: "PIN set", ftype: Bool },
    ]);
    m
});

/// The set of command names the dispatcher accepts without
/// `enable_raw_device_commands`.
pub fn is_known_command(name: &str) -> bool {
    const EXTRA: &[&str] = &["DLREC", "TEST", "SENS", "GSENS", "VIP", "LOC"];
    let upper = name.to_ascii_uppercase();
    REPLY_TABLES.contains_key(upper.as_str()) || EXTRA.contains(&upper.as_str())
}

/// Translate a device reply into `(label, value)` rows.
///
/// `$ERR` replies translate to a single error row. Unknown commands pass
/// their fields through with positional labels.
pub fn translate_reply(reply: &DeviceReply) -> Vec<(String, String)> {
    if !reply.ok {
        let code = reply.args.first().map(String::as_str).unwrap_or("?");
        return vec![("Device error".to_string(), code.to_string())];
    }

    match REPLY_TABLES.get(reply.name.as_str()) {
        Some(specs) => specs
            .iter()
            .zip(reply.args.iter())
            .map(|(spec, raw)| (spec.label.to_string(), translate_field(spec, raw)))
            .chain(
                // Fields beyond the table pass through untouched.
                reply.args.iter().skip(specs.len()).enumerate().map(|(i, raw)| {
                    (format!("Field {}", specs.len() + i + 1), raw.clone())
                }),
            )
            .collect(),
        None => reply
            .args
            .iter()
            .enumerate()
            .map(|(i, raw)| (format!("Field {}", i + 1), raw.clone()))
            .collect(),
    }
}

fn translate_field(spec: &FieldSpec, raw: &str) -> String {
    match spec.ftype {
        FieldType::Bool => match raw {
            "0" => "No".to_string(),
            "1" => "Yes".to_string(),
            other => other.to_string(),
        },
        FieldType::Enum(map) => map
            .iter()
            .find(|(k, _)| *k == raw)
            .map(|(_, label)| (*label).to_string())
            .unwrap_or_else(|| raw.to_string()),
        FieldType::Int | FieldType::Text => raw.to_string(),
    }
}

/// Output table hook. The plain ASCII renderer ships with the core; the
/// Unicode box-drawing variant is a collaborator concern.
pub trait TableRenderer: Send + Sync {
    fn render_table(&self, columns: &[&str], rows: &[Vec<String>], unicode: bool) -> String;
}

#[derive(Debug, Default)]
pub struct AsciiTableRenderer;

impl TableRenderer for AsciiTableRenderer {
    fn render_table(&self, columns: &[&str], rows: &[Vec<String>], _unicode: bool) -> String {
        let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
        for row in rows {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell.len());
                }
            }
        }

        let sep: String = {
            let mut s = String::from("+");
            for w in &widths {
                s.push_str(&"-".repeat(w + 2));
                s.push('+');
            }
            s.push_str("\r\n");
            s
        };

        let mut out = String::new();
        out.push_str(&sep);
        out.push('|');
        for (c, w) in columns.iter().zip(widths.iter().copied()) {
            out.push_str(&format!(" {c:<w$} |"));
        }
        out.push_str("\r\n");
        out.push_str(&sep);
        for row in rows {
            out.push('|');
            for (cell, w) in row.iter().zip(widths.iter().copied()) {
                out.push_str(&format!(" {cell:<w$} |"));
            }
            out.push_str("\r\n");
        }
        out.push_str(&sep);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::command::DeviceReply;

    #[test]
    fn translates_known_enum_fields() {
        let reply = DeviceReply::parse("$OK:GFEN+0042=1,100,2,3,1").expect("valid reply");
        let rows = translate_reply(&reply);
        assert_eq!(rows[0], ("Fence".to_string(), "On".to_string()));
        assert_eq!(rows[1], ("Radius (m)".to_string(), "100".to_string()));
        assert_eq!(rows[2], ("Trigger".to_string(), "Leaving fence".to_string()));
        assert_eq!(
            rows[3],
            ("Action".to_string(), "Log, report and VIP SMS".to_string())
        );
    }

    #[test]
    fn unknown_command_passes_verbatim() {
        let reply = DeviceReply::parse("$OK:XYZ+0001=1,2,3").expect("valid reply");
        let rows = translate_reply(&reply);
        assert_eq!(rows[0], ("Field 1".to_string(), "1".to_string()));
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn err_reply_translates_to_error_row() {
        let reply = DeviceReply::parse("$ERR:GFEN+0042=4").expect("valid reply");
        let rows = translate_reply(&reply);
        assert_eq!(rows, vec![("Device error".to_string(), "4".to_string())]);
    }

    #[test]
    fn idempotent_for_same_reply() {
        let reply = DeviceReply::parse("$OK:LED+0001=1").expect("valid reply");
        assert_eq!(translate_reply(&reply), translate_reply(&reply));
    }

    #[test]
    fn ascii_table_shape() {
        let r = AsciiTableRenderer;
        let table = r.render_table(
            &["Field", "Value"],
            &[vec!["LED indicator".into(), "Yes".into()]],
            false,
        );
        assert!(table.starts_with("+"));
        assert!(table.contains("| LED indicator | Yes |"));
    }
}
