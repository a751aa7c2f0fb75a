// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use trackerd::{
    codec::command::DeviceReply,
    translate::{AsciiTableRenderer, TableRenderer, is_known_command, translate_reply},
};

#[test]
fn imei_reply_gets_its_label() {
    let reply = DeviceReply::parse("$OK:IMEI+0001=123456789012345").expect("reply");
    let rows = translate_reply(&reply);
    assert_eq!(
        rows,
        vec![("IMEI".to_string(), "123456789012345".to_string())]
    );
}

#[test]
fn track_reply_translates_enums_and_ints() {
    let reply = DeviceReply::parse("$OK:TRACK+0002=1,60,0,0,3,3,0").expect("reply");
    let rows = translate_reply(&reply);
    assert_eq!(rows[0], ("Tracking".to_string(), "Yes".to_string()));
    assert_eq!(rows[1], ("Interval (s)".to_string(), "60".to_string()));
    assert_eq!(rows[4], ("Basis".to_string(), "Time or distance".to_string()));
    assert_eq!(rows[5], ("Channel".to_string(), "GPRS".to_string()));
}

#[test]
fn surplus_fields_pass_through_positionally() {
    let reply = DeviceReply::parse("$OK:LED+0003=1,extra").expect("reply");
    let rows = translate_reply(&reply);
    assert_eq!(rows[0], ("LED indicator".to_string(), "Yes".to_string()));
    assert_eq!(rows[1], ("Field 2".to_string(), "extra".to_string()));
}

#[test]
fn unknown_command_is_verbatim() {
    let reply = DeviceReply::parse("$OK:FOO+0004=a,b").expect("reply");
    let rows = translate_reply(&reply);
    assert_eq!(rows[0].1, "a");
    assert_eq!(rows[1].1, "b");
    assert!(!is_known_command("FOO"));
    assert!(is_known_command("imei"));
    assert!(is_known_command("dlrec"));
}

#[test]
fn table_renderer_aligns_columns() {
    let renderer = AsciiTableRenderer;
    let out = renderer.render_table(
        &["Field", "Value"],
        &[
            vec!["Tracking".to_string(), "Yes".to_string()],
            vec!["Interval (s)".to_string(), "60".to_string()],
        ],
        false,
    );
    let lines: Vec<&str> = out.lines().collect();
    assert!(lines[0].starts_with("+-"));
    assert!(lines[1].contains("| Field"));
    // All rows share the same width.
    assert_eq!(lines[0].len(), lines[3].len());
}
