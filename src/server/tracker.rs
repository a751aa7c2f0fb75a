// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    codec::{
        command::{DeviceReply, looks_like_reply},
        keepalive::{KEEP_ALIVE_HEADER, KEEP_ALIVE_LEN, KeepAliveFrame, looks_like_keepalive},
        location::{EventKind, looks_like_location, parse_location_buffer},
    },
    server::{dispatcher, registry::ClientSlot, supervisor::Core, tags::TargetKey},
};

/// A buffer growing past this without a frame boundary is a protocol error.
const MAX_FRAME: usize = 64 * 1024;
/// Consecutive protocol errors tolerated before the session is closed.
const MAX_PROTOCOL_ERRORS: u32 = 5;

enum Frame {
    KeepAlive { seq: u16, device_id: u32 },
    Location(String),
    Reply(String),
}

enum Step {
    Frame(Frame),
    /// Not enough buffered bytes for a complete frame.
    NeedMore,
    /// Unrecognised bytes were discarded.
    Junk(String),
}

/// Per-tracker worker: classify inbound traffic, echo keep-alives, feed
/// location records to the pipeline, publish command replies, and close
/// the session on idle, peer loss or repeated protocol garbage.
///
/// Returns the device id the session identified as (0 if it never did).
pub async fn run_tracker_session(
    core: Arc<Core>,
    slot: Arc<ClientSlot>,
    mut read: OwnedReadHalf,
    cancel: CancellationToken,
) -> u32 {
    let cfg = core.cfg();
    let mut buf = BytesMut::with_capacity(4096);
    let mut protocol_errors = 0u32;
    let mut gfen = GfenTracker::default();

    'session: loop {
        let read_res = tokio::select! {
            _ = cancel.cancelled() => break 'session,
            res = timeout(cfg.server.device_idle_timeout, read.read_buf(&mut buf)) => res,
        };

        match read_res {
            Err(_) => {
                info!(
                    device = slot.device_id(),
                    idle_secs = cfg.server.device_idle_timeout.as_secs(),
                    "closing idle tracker"
                );
                break 'session;
            },
            Ok(Ok(0)) => {
                debug!(device = slot.device_id(), "tracker peer closed connection");
                break 'session;
            },
            Ok(Err(e)) => {
                warn!(device = slot.device_id(), error = %e, "tracker read failed");
                break 'session;
            },
            Ok(Ok(_)) => {},
        }

        loop {
            match next_step(&mut buf) {
                Step::NeedMore => break,
                Step::Junk(sample) => {
                    protocol_errors += 1;
                    warn!(
                        device = slot.device_id(),
                        errors = protocol_errors,
                        bytes = %sample,
                        "protocol garbage from tracker"
                    );
                    if protocol_errors >= MAX_PROTOCOL_ERRORS {
                        warn!(device = slot.device_id(), "too many protocol errors, closing");
                        break 'session;
                    }
                },
                Step::Frame(frame) => {
                    match handle_frame(&core, &cfg, &slot, frame, &mut gfen, &cancel).await {
                        Ok(good) => {
                            if good {
                                protocol_errors = 0;
                            } else {
                                protocol_errors += 1;
                                if protocol_errors >= MAX_PROTOCOL_ERRORS {
                                    warn!(
                                        device = slot.device_id(),
                                        "too many protocol errors, closing"
                                    );
                                    break 'session;
                                }
                            }
                        },
                        Err(()) => break 'session,
                    }
                },
            }
        }
    }

    gfen.stop();
    slot.device_id()
}

/// Handle one classified frame. `Ok(true)` on a well-formed frame,
/// `Ok(false)` on a per-frame protocol error, `Err(())` when the session
/// must end.
async fn handle_frame(
    core: &Arc<Core>,
    cfg: &Arc<Config>,
    slot: &Arc<ClientSlot>,
    frame: Frame,
    gfen: &mut GfenTracker,
    cancel: &CancellationToken,
) -> Result<bool, ()> {
    match frame {
        Frame::KeepAlive { seq, device_id } => {
            // Identify before echoing: once the echo is on the wire the
            // slot must be resolvable by device id.
            if slot.set_device_id(device_id) {
                info!(device = device_id, peer = %slot.peer, "tracker identified");
                core.pipeline
                    .tracker_connected(cfg, device_id, &slot.peer.to_string());
            } else if slot.device_id() != device_id {
                warn!(
                    device = slot.device_id(),
                    claimed = device_id,
                    "keep-alive with different device id ignored"
                );
            }
            let echo = KeepAliveFrame::new(seq, device_id).to_wire_bytes();
            if let Err(e) = slot.write_all(&echo).await {
                warn!(device = device_id, error = %e, "keep-alive echo failed");
                return Err(());
            }
            Ok(true)
        },
        Frame::Location(text) => {
            let parsed = parse_location_buffer(&text, cfg.server.device_tz_offset_minutes);
            let ok = parsed.errors.is_empty() && !parsed.records.is_empty();
            for e in &parsed.errors {
                warn!(device = slot.device_id(), error = %e, "bad location record");
            }
            for record in &parsed.records {
                if let Err(e) = core.pipeline.process(cfg, record, cancel).await {
                    // Persistence is the critical path.
                    core.trigger_fatal(&format!("store append failed: {e}"));
                    return Err(());
                }
                if record.event == EventKind::Gfen && cfg.gfen.enable_gfen_tracking.as_bool() {
                    gfen.toggle(core.clone(), cfg.clone(), record.device_id, cancel);
                }
            }
            Ok(ok)
        },
        Frame::Reply(line) => match DeviceReply::parse(&line) {
            Ok(reply) => {
                let device_id = slot.device_id();
                if device_id == 0 {
                    warn!("command reply before keep-alive identification, dropped");
                    return Ok(false);
                }
                core.tags.deliver(TargetKey::Gprs(device_id), reply);
                Ok(true)
            },
            Err(e) => {
                warn!(device = slot.device_id(), error = %e, "unparseable reply");
                Ok(false)
            },
        },
    }
}

/// Pull the next complete frame off the accumulation buffer.
fn next_step(buf: &mut BytesMut) -> Step {
    if buf.is_empty() {
        return Step::NeedMore;
    }

    // A lone 0xD0 could be the start of a keep-alive split across reads.
    if buf.len() < 2 && buf[0] == KEEP_ALIVE_HEADER[0] {
        return Step::NeedMore;
    }

    if looks_like_keepalive(buf) {
        if buf.len() < KEEP_ALIVE_LEN {
            return Step::NeedMore;
        }
        let bytes = buf.split_to(KEEP_ALIVE_LEN);
        return match KeepAliveFrame::from_wire_bytes(&bytes) {
            Ok(frame) => Step::Frame(Frame::KeepAlive {
                seq: frame.seq(),
                device_id: frame.device_id(),
            }),
            Err(_) => Step::Junk(hex_sample(&bytes)),
        };
    }

    if buf[0] == b'[' {
        return match buf.iter().position(|&b| b == b']') {
            Some(end) => {
                let batch = buf.split_to(end + 1);
                consume_crlf(buf);
                Step::Frame(Frame::Location(String::from_utf8_lossy(&batch).into_owned()))
            },
            None if buf.len() > MAX_FRAME => {
                let junk = hex_sample(buf);
                buf.clear();
                Step::Junk(junk)
            },
            None => Step::NeedMore,
        };
    }

    if looks_like_location(buf) || looks_like_reply(buf) || buf[0] == b'$' {
        return match find_crlf(buf) {
            Some(end) => {
                let line = buf.split_to(end);
                consume_crlf(buf);
                let text = String::from_utf8_lossy(&line).into_owned();
                if looks_like_reply(text.as_bytes()) {
                    Step::Frame(Frame::Reply(text))
                } else if text.starts_with('$') {
                    Step::Junk(text.chars().take(64).collect())
                } else {
                    Step::Frame(Frame::Location(text))
                }
            },
            None if buf.len() > MAX_FRAME => {
                let junk = hex_sample(buf);
                buf.clear();
                Step::Junk(junk)
            },
            None => Step::NeedMore,
        };
    }

    // Unclassifiable: discard up to the next line break, or everything.
    match find_crlf(buf) {
        Some(end) => {
            let junk = buf.split_to(end);
            consume_crlf(buf);
            Step::Junk(hex_sample(&junk))
        },
        None => {
            let junk = hex_sample(buf);
            buf.clear();
            Step::Junk(junk)
        },
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn consume_crlf(buf: &mut BytesMut) {
    if buf.len() >= 2 && &buf[..2] == b"\r\n" {
        buf.advance(2);
    }
}

/// First bytes of the offending buffer, hex-encoded for the log.
fn hex_sample(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(32)])
}

/// Synthetic position polling after a geofence event. The first GFEN
/// event starts an episode, the mate event stops it; an episode also ends
/// after `max_gfen_auto_track_duration` or with the session.
#[derive(Default)]
struct GfenTracker {
    active: Option<(CancellationToken, tokio::task::JoinHandle<()>)>,
}

impl GfenTracker {
    fn toggle(
        &mut self,
        core: Arc<Core>,
        cfg: Arc<Config>,
        device_id: u32,
        parent: &CancellationToken,
    ) {
        if let Some((token, _handle)) = self.active.take() {
            debug!(device = device_id, "geofence mate event, stopping auto-track");
            token.cancel();
            return;
        }

        info!(device = device_id, "geofence event, starting auto-track");
        let token = parent.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            auto_track(core, cfg, device_id, task_token).await;
        });
        self.active = Some((token, handle));
    }

    fn stop(&mut self) {
        if let Some((token, _handle)) = self.active.take() {
            token.cancel();
        }
    }
}

async fn auto_track(core: Arc<Core>, cfg: Arc<Config>, device_id: u32, cancel: CancellationToken) {
    let deadline = tokio::time::Instant::now() + cfg.gfen.max_gfen_auto_track_duration;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(cfg.gfen.gfen_tracking_interval) => {},
        }
        if tokio::time::Instant::now() >= deadline {
            info!(device = device_id, "auto-track episode hit its upper bound");
            break;
        }

        match dispatcher::dispatch_gprs(
            &core,
            device_id,
            "LOC",
            vec!["?".to_string()],
            cfg.server.command_timeout,
        )
        .await
        {
            Ok(_) => debug!(device = device_id, "synthetic position query answered"),
            Err(e) => {
                debug!(device = device_id, error = %e, "auto-track query failed, stopping");
                break;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keepalive_waits_for_more() {
        let mut buf = BytesMut::from(&[0xD0u8][..]);
        assert!(matches!(next_step(&mut buf), Step::NeedMore));
        buf.extend_from_slice(&[0xD7, 0x05, 0x00]);
        assert!(matches!(next_step(&mut buf), Step::NeedMore));
        buf.extend_from_slice(&[0x01, 0x00, 0x00, 0xB2]);
        match next_step(&mut buf) {
            Step::Frame(Frame::KeepAlive { seq, device_id }) => {
                assert_eq!(seq, 5);
                assert_eq!(device_id, 0xB200_0001);
            },
            _ => panic!("expected keep-alive frame"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn batch_extracted_after_terminator() {
        let rec = "3000000001,20140107232526,17.961028,59.366470,0,0,0,0,2,4.20V,0";
        let mut buf = BytesMut::from(format!("[{rec}\r\n").as_bytes());
        assert!(matches!(next_step(&mut buf), Step::NeedMore));
        buf.extend_from_slice(format!("{rec}]").as_bytes());
        match next_step(&mut buf) {
            Step::Frame(Frame::Location(text)) => assert!(text.starts_with('[')),
            _ => panic!("expected location batch"),
        }
    }

    #[test]
    fn reply_line_classified() {
        let mut buf = BytesMut::from(&b"$OK:IMEI+0001=123456789012345\r\n"[..]);
        match next_step(&mut buf) {
            Step::Frame(Frame::Reply(line)) => assert!(line.starts_with("$OK:")),
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn garbage_becomes_junk() {
        let mut buf = BytesMut::from(&b"hello world\r\nnext"[..]);
        assert!(matches!(next_step(&mut buf), Step::Junk(_)));
        // The remainder stays for the next classification round.
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn interleaved_keepalive_and_record() {
        let rec = "3000000001,20140107232526,17.961028,59.366470,0,0,0,0,0,4.20V,0\r\n";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xD0, 0xD7, 0x01, 0x00, 0x01, 0x00, 0x00, 0xB2]);
        buf.extend_from_slice(rec.as_bytes());

        assert!(matches!(
            next_step(&mut buf),
            Step::Frame(Frame::KeepAlive { .. })
        ));
        assert!(matches!(
            next_step(&mut buf),
            Step::Frame(Frame::Location(_))
        ));
        assert!(matches!(next_step(&mut buf), Step::NeedMore));
    }
}
