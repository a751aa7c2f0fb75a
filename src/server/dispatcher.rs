// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::tcp::OwnedReadHalf,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    codec::command::{DeviceCommand, DeviceReply},
    serial::DEVICE_BAUD,
    server::{
        SessionError,
        registry::{ClientRole, ClientSlot},
        supervisor::Core,
        tags::TargetKey,
        target::{Target, TargetSelection},
    },
    store::{ExportFormat, HistoryQuery},
    translate::{is_known_command, translate_reply},
};

const AUTH_ATTEMPTS: u32 = 3;

/// Per-client toggles and target state.
struct ClientSession {
    target: TargetSelection,
    table_mode: bool,
    unicode_tables: bool,
    translate: bool,
}

enum Response {
    Quit,
    Text(String),
}

/// Worker for one operator connection: authenticate, then serve one
/// command per line until quit, idle timeout or shutdown. Commands from
/// one client run strictly in issue order.
pub async fn run_command_client(
    core: Arc<Core>,
    slot: Arc<ClientSlot>,
    read: OwnedReadHalf,
    cancel: CancellationToken,
) -> Result<()> {
    let cfg = core.cfg();
    let mut reader = BufReader::new(read);

    if cfg.server.require_password.as_bool() {
        if !authenticate(&cfg, &slot, &mut reader, &cancel).await? {
            info!(peer = %slot.peer, "authentication failed, closing");
            return Ok(());
        }
    } else {
        slot.write_all(format!("trackerd {}\r\n\r\n", env!("CARGO_PKG_VERSION")).as_bytes())
            .await?;
    }

    let mut session = ClientSession {
        target: TargetSelection::default(),
        table_mode: false,
        unicode_tables: false,
        translate: cfg.mail.translate_device_reply.as_bool(),
    };

    loop {
        let Some(line) =
            read_client_line(&mut reader, cfg.server.client_idle_timeout, &cancel).await?
        else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(peer = %slot.peer, command = line, "client command");

        let text = match execute_line(&core, &cfg, &mut session, line, &cancel).await {
            Ok(Response::Quit) => break,
            Ok(Response::Text(text)) => text,
            Err(e) => format!("[ERR] {e}"),
        };
        send_response(&slot, &text).await?;
    }
    Ok(())
}

/// One buffered line, or `None` on quit conditions (EOF, idle timeout,
/// shutdown). The reader buffers across reads, so a command split over
/// several TCP segments is reassembled here.
async fn read_client_line(
    reader: &mut BufReader<OwnedReadHalf>,
    idle: Duration,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let mut line = String::new();
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        res = timeout(idle, reader.read_line(&mut line)) => match res {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(line)),
            Ok(Err(e)) => Err(e.into()),
        },
    }
}

async fn authenticate(
    cfg: &Config,
    slot: &ClientSlot,
    reader: &mut BufReader<OwnedReadHalf>,
    cancel: &CancellationToken,
) -> Result<bool> {
    for attempt in 1..=AUTH_ATTEMPTS {
        slot.write_all(b"Password: ").await?;
        let Some(line) = read_client_line(reader, cfg.server.client_idle_timeout, cancel).await?
        else {
            return Ok(false);
        };
        if line.trim() == cfg.server.password {
            slot.write_all(b"\r\n").await?;
            return Ok(true);
        }
        warn!(peer = %slot.peer, attempt, "wrong password");
        slot.write_all(b"Authentication failed.\r\n").await?;
    }
    Ok(false)
}

/// Write a response followed by the empty terminator line.
async fn send_response(slot: &ClientSlot, text: &str) -> Result<()> {
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    slot.write_all(out.as_bytes()).await?;
    Ok(())
}

async fn execute_line(
    core: &Arc<Core>,
    cfg: &Arc<Config>,
    session: &mut ClientSession,
    line: &str,
    cancel: &CancellationToken,
) -> Result<Response, SessionError> {
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };

    match verb.to_ascii_lowercase().as_str() {
        "exit" | "quit" => Ok(Response::Quit),
        v if v.starts_with('.') => execute_meta(core, cfg, session, v, rest, cancel)
            .await
            .map(Response::Text),
        "get" | "set" | "do" => {
            let (name, args) = parse_device_args(verb, rest)?;
            execute_device(core, cfg, session, &name, args)
                .await
                .map(Response::Text)
        },
        "preset" => execute_preset(core, cfg, session, rest)
            .await
            .map(Response::Text),
        "db" => execute_db(core, rest).map(Response::Text),
        other => Err(SessionError::Protocol(format!(
            "unknown command {other:?}, expected get/set/do, preset, db or a .meta command"
        ))),
    }
}

/// Split `get imei` / `set track 1,60,0` / `do reset` into a device
/// command name and its comma-separated argument list.
fn parse_device_args(verb: &str, rest: &str) -> Result<(String, Vec<String>), SessionError> {
    let (name, arg_str) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest, ""),
    };
    if name.is_empty() {
        return Err(SessionError::Protocol(format!(
            "{verb} requires a command name"
        )));
    }

    let args = match verb.to_ascii_lowercase().as_str() {
        "get" => vec!["?".to_string()],
        _ if arg_str.is_empty() => Vec::new(),
        _ => arg_str.split(',').map(|a| a.trim().to_string()).collect(),
    };
    Ok((name.to_string(), args))
}

async fn execute_device(
    core: &Arc<Core>,
    cfg: &Arc<Config>,
    session: &ClientSession,
    name: &str,
    args: Vec<String>,
) -> Result<String, SessionError> {
    if !is_known_command(name) && !cfg.server.enable_raw_device_commands.as_bool() {
        return Err(SessionError::Protocol(format!(
            "unknown device command {name:?} (raw commands are disabled)"
        )));
    }

    let wait = if name.eq_ignore_ascii_case("dlrec") {
        cfg.server.dlrec_timeout
    } else {
        cfg.server.command_timeout
    };

    let reply = match session.target.current() {
        Target::Gprs { device_id } => dispatch_gprs(core, device_id, name, args, wait).await?,
        Target::Usb { index } => dispatch_usb(core, index, name, args, wait).await?,
    };
    Ok(render_reply(core, session, &reply))
}

/// Send a command to a GPRS-connected tracker and wait for the matching
/// reply. Also used by the geofence auto-tracker.
pub(crate) async fn dispatch_gprs(
    core: &Arc<Core>,
    device_id: u32,
    name: &str,
    args: Vec<String>,
    wait: Duration,
) -> Result<DeviceReply, SessionError> {
    let key = TargetKey::Gprs(device_id);
    let slot = core
        .slots
        .find_tracker(device_id)
        .ok_or_else(|| SessionError::Transport(format!("device {device_id} not connected")))?;

    let (tag, mut rx) = core
        .tags
        .allocate(key)
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    let cmd = match DeviceCommand::new(name, tag, args) {
        Ok(cmd) => cmd,
        Err(e) => {
            core.tags.release(key, tag);
            return Err(SessionError::Protocol(e.to_string()));
        },
    };

    if let Err(e) = slot.write_all(cmd.frame().as_bytes()).await {
        core.tags.release(key, tag);
        return Err(SessionError::Transport(format!(
            "write to device {device_id} failed: {e}"
        )));
    }

    match timeout(wait, rx.recv()).await {
        Ok(Some(reply)) => Ok(reply),
        Ok(None) => Err(SessionError::Transport(format!(
            "device {device_id} disconnected while waiting for reply"
        ))),
        Err(_) => {
            core.tags.release(key, tag);
            Err(SessionError::Timeout)
        },
    }
}

/// Send a command over the USB serial adapter and read lines until the
/// reply with the matching tag appears.
pub(crate) async fn dispatch_usb(
    core: &Arc<Core>,
    index: usize,
    name: &str,
    args: Vec<String>,
    wait: Duration,
) -> Result<DeviceReply, SessionError> {
    let key = TargetKey::Usb(index);
    let (tag, _rx) = core
        .tags
        .allocate(key)
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    let cmd = match DeviceCommand::new(name, tag, args) {
        Ok(cmd) => cmd,
        Err(e) => {
            core.tags.release(key, tag);
            return Err(SessionError::Protocol(e.to_string()));
        },
    };

    let serial = core.serial.clone();
    let frame = cmd.frame();
    let joined = tokio::task::spawn_blocking(move || -> Result<DeviceReply, SessionError> {
        serial
            .open(index, DEVICE_BAUD)
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        serial
            .write(frame.as_bytes())
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let deadline = std::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout);
            }
            let line = serial
                .read_line(remaining)
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            match DeviceReply::parse(&line) {
                Ok(reply) if reply.tag == tag => return Ok(reply),
                // Unsolicited serial traffic; keep reading.
                _ => continue,
            }
        }
    })
    .await;

    core.tags.release(key, tag);
    match joined {
        Ok(res) => res,
        Err(e) => Err(SessionError::Transport(format!("serial task failed: {e}"))),
    }
}

fn render_reply(core: &Arc<Core>, session: &ClientSession, reply: &DeviceReply) -> String {
    if !reply.ok {
        let code = reply.args.first().map(String::as_str).unwrap_or("?");
        return format!("[ERR] Device error {code}");
    }

    if !session.translate {
        return reply.args.join(",");
    }

    let rows = translate_reply(reply);
    if session.table_mode {
        let table_rows: Vec<Vec<String>> = rows
            .into_iter()
            .map(|(label, value)| vec![label, value])
            .collect();
        core.renderer
            .render_table(&["Field", "Value"], &table_rows, session.unicode_tables)
    } else {
        rows.into_iter()
            .map(|(label, value)| format!("{label}: {value}"))
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

async fn execute_meta(
    core: &Arc<Core>,
    cfg: &Arc<Config>,
    session: &mut ClientSession,
    cmd: &str,
    rest: &str,
    cancel: &CancellationToken,
) -> Result<String, SessionError> {
    let fields: Vec<&str> = rest.split_whitespace().collect();

    match cmd {
        ".use" => {
            let device_id: u32 = fields
                .first()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| SessionError::Protocol(".use requires a device id".into()))?;
            session.target.use_device(device_id, &core.slots)?;
            Ok(format!("[OK] Target is {}", session.target.current()))
        },
        ".usb" => {
            let index: usize = fields.first().and_then(|f| f.parse().ok()).unwrap_or(0);
            session.target.use_usb(index);
            Ok(format!("[OK] Target is {}", session.target.current()))
        },
        ".target" => Ok(format!("Current target: {}", session.target.current())),
        ".lc" => {
            let rows: Vec<String> = core
                .slots
                .snapshot()
                .into_iter()
                .filter(|s| s.role == ClientRole::Command)
                .map(|s| {
                    format!(
                        "{:>3}  {}  connected {}s",
                        s.index,
                        s.peer,
                        s.connected_at.elapsed().as_secs()
                    )
                })
                .collect();
            Ok(if rows.is_empty() {
                "No command clients connected.".to_string()
            } else {
                rows.join("\r\n")
            })
        },
        ".ld" => {
            let rows: Vec<String> = core
                .slots
                .snapshot()
                .into_iter()
                .filter(|s| s.role == ClientRole::Tracker)
                .map(|s| {
                    let id = s.device_id();
                    let nick = core
                        .nicknames
                        .get(&id)
                        .map(|n| format!(" ({})", n.value()))
                        .unwrap_or_default();
                    format!("{:>3}  device {}{}  {}", s.index, id, nick, s.peer)
                })
                .collect();
            Ok(if rows.is_empty() {
                "No trackers connected.".to_string()
            } else {
                rows.join("\r\n")
            })
        },
        ".ln" => {
            let mut rows: Vec<String> = core
                .nicknames
                .iter()
                .map(|e| format!("{} = {}", e.key(), e.value()))
                .collect();
            rows.sort();
            Ok(if rows.is_empty() {
                "No nicknames defined.".to_string()
            } else {
                rows.join("\r\n")
            })
        },
        ".dn" => {
            let id: u32 = fields
                .first()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| SessionError::Protocol(".dn requires a device id".into()))?;
            match core.nicknames.remove(&id) {
                Some((_, name)) => Ok(format!("[OK] Removed nickname {name} for {id}")),
                None => Err(SessionError::Protocol(format!("no nickname for {id}"))),
            }
        },
        ".nick" => match fields.as_slice() {
            [devid, name] => {
                let id: u32 = devid
                    .parse()
                    .map_err(|_| SessionError::Protocol("bad device id".into()))?;
                core.nicknames.insert(id, (*name).to_string());
                Ok(format!("[OK] {id} = {name}"))
            },
            [name] => match session.target.current() {
                Target::Gprs { device_id } => {
                    core.nicknames.insert(device_id, (*name).to_string());
                    Ok(format!("[OK] {device_id} = {name}"))
                },
                Target::Usb { .. } => Err(SessionError::Protocol(
                    ".nick without a device id needs a GPRS target".into(),
                )),
            },
            _ => Err(SessionError::Protocol(".nick [deviceid] <name>".into())),
        },
        ".table" => match fields.first().copied() {
            Some("on") => {
                session.table_mode = true;
                Ok("[OK] Table output on".to_string())
            },
            Some("off") => {
                session.table_mode = false;
                Ok("[OK] Table output off".to_string())
            },
            Some("unicode") => {
                session.unicode_tables = true;
                Ok("[OK] Unicode tables".to_string())
            },
            Some("ascii") => {
                session.unicode_tables = false;
                Ok("[OK] ASCII tables".to_string())
            },
            _ => Err(SessionError::Protocol(".table on|off|unicode|ascii".into())),
        },
        ".address" => {
            let (lat, lon) = match fields.as_slice() {
                [lat, lon] => (
                    lat.parse::<f64>()
                        .map_err(|_| SessionError::Protocol("bad latitude".into()))?,
                    lon.parse::<f64>()
                        .map_err(|_| SessionError::Protocol("bad longitude".into()))?,
                ),
                _ => return Err(SessionError::Protocol(".address <lat> <lon>".into())),
            };
            match core.pipeline.address_for(cfg, lat, lon, cancel).await {
                Some(address) => Ok(format!("{lat:.6}, {lon:.6}: {address}")),
                None => Ok("[ERR] No address found".to_string()),
            }
        },
        ".cachestat" => Ok(format!(
            "{}\r\naddresses={} minimaps={}",
            core.pipeline.stats.summary(),
            core.pipeline.addr_cache.len(),
            core.pipeline.minimap_cache.len()
        )),
        ".ratereset" => {
            core.pipeline.geocode_limiter.reset().await;
            core.pipeline.map_limiter.reset().await;
            Ok("[OK] Rate limiter history cleared".to_string())
        },
        ".date" => Ok(Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        ".ver" => Ok(format!("trackerd {}", env!("CARGO_PKG_VERSION"))),
        other => Err(SessionError::Protocol(format!(
            "unknown meta command {other:?}"
        ))),
    }
}

async fn execute_preset(
    core: &Arc<Core>,
    cfg: &Arc<Config>,
    session: &ClientSession,
    rest: &str,
) -> Result<String, SessionError> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    match fields.as_slice() {
        ["list"] | [] => {
            let rows: Vec<String> = core
                .presets
                .list()
                .into_iter()
                .map(|(name, short)| format!("{name:<16} {short}"))
                .collect();
            Ok(if rows.is_empty() {
                "No presets installed.".to_string()
            } else {
                rows.join("\r\n")
            })
        },
        ["refresh"] => {
            let n = core
                .presets
                .refresh()
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            Ok(format!("[OK] {n} presets loaded"))
        },
        ["use", name, rest_pin @ ..] => {
            let preset = core
                .presets
                .get(name)
                .ok_or_else(|| SessionError::Protocol(format!("no preset named {name:?}")))?;
            let pin = rest_pin.first().copied().unwrap_or("0000");
            let substitutions =
                std::collections::HashMap::from([("PIN".to_string(), pin.to_string())]);

            let mut out = Vec::new();
            for line in preset.expand_commands(&substitutions) {
                let (verb, args_part) = match line.split_once(char::is_whitespace) {
                    Some((v, r)) => (v, r.trim()),
                    None => (line.as_str(), ""),
                };
                let (name, args) = parse_device_args(verb, args_part)?;
                match execute_device(core, cfg, session, &name, args).await {
                    Ok(text) => out.push(format!("{line}\r\n{text}")),
                    Err(e) => {
                        out.push(format!("[ERR] Preset aborted at {line:?}: {e}"));
                        break;
                    },
                }
            }
            Ok(out.join("\r\n"))
        },
        _ => Err(SessionError::Protocol(
            "preset list | preset refresh | preset use <name> [pin]".into(),
        )),
    }
}

fn execute_db(core: &Arc<Core>, rest: &str) -> Result<String, SessionError> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let store_err = |e: anyhow::Error| SessionError::Transport(format!("store: {e}"));

    match fields.as_slice() {
        ["size"] => {
            let n = core.store.size().map_err(store_err)?;
            Ok(format!("{n} records"))
        },
        ["head", n] | ["tail", n] => {
            let count: usize = n
                .parse()
                .map_err(|_| SessionError::Protocol("bad record count".into()))?;
            let mut query = HistoryQuery::default();
            if fields[0] == "head" {
                query.head = Some(count);
            } else {
                query.tail = Some(count);
            }
            let records = core.store.query(&query).map_err(store_err)?;
            Ok(records
                .iter()
                .map(|r| r.serialize())
                .collect::<Vec<_>>()
                .join("\r\n"))
        },
        ["deleterange", from, to] => {
            let from = parse_db_datetime(from)?;
            let to = parse_db_datetime(to)?;
            let n = core.store.delete_range(from, to).map_err(store_err)?;
            Ok(format!("[OK] Deleted {n} records"))
        },
        ["export", format, range @ ..] => {
            let Some(exporter) = &core.exporter else {
                return Err(SessionError::Transport("no exporter configured".into()));
            };
            let format = ExportFormat::parse(format)
                .ok_or_else(|| SessionError::Protocol(format!("unknown format {format:?}")))?;
            let mut query = HistoryQuery::default();
            if let Some(from) = range.first() {
                query.from = Some(parse_db_datetime(from)?);
            }
            if let Some(to) = range.get(1) {
                query.to = Some(parse_db_datetime(to)?);
            }
            let bytes = exporter
                .render(format, &query)
                .map_err(|e| SessionError::Transport(format!("export: {e}")))?;
            match format {
                ExportFormat::Csv => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                _ => Ok(format!("[OK] Rendered {} bytes", bytes.len())),
            }
        },
        _ => Err(SessionError::Protocol(
            "db size | db head <n> | db tail <n> | db deleterange <from> <to> | db export <fmt> [from [to]]"
                .into(),
        )),
    }
}

fn parse_db_datetime(s: &str) -> Result<chrono::DateTime<Utc>, SessionError> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S")
        .map_err(|_| SessionError::Protocol(format!("bad datetime {s:?}, expected YYYYMMDDhhmmss")))?;
    Ok(chrono::DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_args_for_get_set_do() {
        let (name, args) = parse_device_args("get", "imei").expect("parse");
        assert_eq!(name, "imei");
        assert_eq!(args, vec!["?"]);

        let (name, args) = parse_device_args("set", "track 1,60,0").expect("parse");
        assert_eq!(name, "track");
        assert_eq!(args, vec!["1", "60", "0"]);

        let (name, args) = parse_device_args("do", "reset").expect("parse");
        assert_eq!(name, "reset");
        assert!(args.is_empty());

        assert!(parse_device_args("get", "").is_err());
    }

    #[test]
    fn db_datetime_parses() {
        let dt = parse_db_datetime("20140107232526").expect("parse");
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2014-01-07 23:25:26");
        assert!(parse_db_datetime("2014-01-07").is_err());
    }
}
