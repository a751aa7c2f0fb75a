// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use trackerd::codec::{
    command::{DeviceCommand, DeviceReply, Tag},
    keepalive::{KEEP_ALIVE_LEN, KeepAliveFrame},
    location::{EventKind, LocationRecord, parse_location_buffer},
};

use super::load_fixture;

#[test]
fn keepalive_fixture_round_trip() -> Result<()> {
    let bytes = load_fixture("tests/unit_tests/fixtures/keepalive/keepalive_seq5.hex")?;
    assert_eq!(bytes.len(), KEEP_ALIVE_LEN);

    let frame = KeepAliveFrame::from_wire_bytes(&bytes)?;
    assert_eq!(frame.seq(), 5);
    assert_eq!(frame.device_id(), 2_986_344_449);

    let emitted = KeepAliveFrame::new(frame.seq(), frame.device_id()).to_wire_bytes();
    assert_eq!(&emitted[..], &bytes[..], "echo must be byte-identical");
    Ok(())
}

#[test]
fn location_batch_fixture_parses_two_records() -> Result<()> {
    let bytes = load_fixture("tests/unit_tests/fixtures/location/batch_two_records.hex")?;
    let text = String::from_utf8(bytes)?;

    let parsed = parse_location_buffer(&text, 0);
    assert!(parsed.errors.is_empty());
    assert_eq!(parsed.records.len(), 2);

    let first = &parsed.records[0];
    assert_eq!(first.device_id, 3_000_000_001);
    assert_eq!(first.event, EventKind::Rec);
    assert!(!first.detached);
    assert!(parsed.records[1].detached, "second record carries detach=1");
    Ok(())
}

#[test]
fn location_serialize_parse_law() -> Result<()> {
    let line = "3000000001,20140107232526,17.961028,59.366470,83,275,312,9,3,4.07V,0";
    let record = LocationRecord::parse(line, 0)?;
    assert_eq!(record.serialize(), line);
    assert_eq!(LocationRecord::parse(&record.serialize(), 0)?, record);
    Ok(())
}

#[test]
fn command_frame_and_reply_correlate_by_tag() -> Result<()> {
    let tag = Tag::new(4711)?;
    let cmd = DeviceCommand::new("gfen", tag, vec![
        "1".into(),
        "100".into(),
        "2".into(),
        "1".into(),
        "0".into(),
    ])?;
    assert_eq!(cmd.frame(), "$GFEN+4711=1,100,2,1,0\r\n");

    let reply = DeviceReply::parse("$OK:GFEN+4711=1,100,2,1,0\r\n")?;
    assert!(reply.ok);
    assert_eq!(reply.tag, tag);
    assert_eq!(reply.name, "GFEN");
    Ok(())
}

#[test]
fn malformed_records_do_not_poison_batch() {
    let good = "3000000001,20140107232526,17.961028,59.366470,0,0,0,0,2,4.20V,0";
    let batch = format!("[{good}\r\n3000000001,not,enough,fields\r\n{good}]");
    let parsed = parse_location_buffer(&batch, 0);
    assert_eq!(parsed.records.len(), 2);
    assert_eq!(parsed.errors.len(), 1);
}

#[test]
fn unknown_event_code_is_rejected() {
    let line = "3000000001,20140107232526,17.961028,59.366470,0,0,0,0,99,4.20V,0";
    assert!(LocationRecord::parse(line, 0).is_err());
}
