// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use anyhow::{Context, Result, bail};

/// Longest command name the device accepts.
pub const MAX_COMMAND_NAME: usize = 12;

/// A 4-digit decimal correlation tag, `0001..=9999`.
///
/// Tags are unique over the outstanding-command set of a single target and
/// reused only after the command completes or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u16);

impl Tag {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 9999;

    pub fn new(n: u16) -> Result<Self> {
        if !(Self::MIN..=Self::MAX).contains(&n) {
            bail!("tag {n} outside 4-digit range");
        }
        Ok(Self(n))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
            bail!("tag must be exactly 4 decimal digits, got {s:?}");
        }
        let n: u16 = s.parse().context("tag parse")?;
        Self::new(n)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// An outgoing device command, framed as `$NAME+TTTT=args\r\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    pub name: String,
    pub tag: Tag,
    pub args: Vec<String>,
}

impl DeviceCommand {
    pub fn new(name: &str, tag: Tag, args: Vec<String>) -> Result<Self> {
        validate_name(name)?;
        for a in &args {
            if a.contains('\r') || a.contains('\n') {
                bail!("command argument must not contain CR or LF");
            }
        }
        Ok(Self {
            name: name.to_ascii_uppercase(),
            tag,
            args,
        })
    }

    /// The wire form, CRLF-terminated.
    pub fn frame(&self) -> String {
        format!("${}+{}={}\r\n", self.name, self.tag, self.args.join(","))
    }
}

/// A parsed `$OK:`/`$ERR:` reply line from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReply {
    pub ok: bool,
    pub name: String,
    pub tag: Tag,
    /// Result fields for `$OK`, the single error code for `$ERR`.
    pub args: Vec<String>,
}

impl DeviceReply {
    /// Parse a reply line of the form `$OK:NAME+TTTT=args` or
    /// `$ERR:NAME+TTTT=code` (trailing CRLF tolerated).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (ok, rest) = if let Some(r) = line.strip_prefix("$OK:") {
            (true, r)
        } else if let Some(r) = line.strip_prefix("$ERR:") {
            (false, r)
        } else {
            bail!("reply must start with $OK: or $ERR:, got {line:?}");
        };

        let (head, args_str) = rest
            .split_once('=')
            .with_context(|| format!("reply missing '=' separator: {line:?}"))?;
        let (name, tag_str) = head
            .split_once('+')
            .with_context(|| format!("reply missing '+TAG': {line:?}"))?;
        validate_name(name)?;
        let tag = Tag::parse(tag_str)?;

        let args = if args_str.is_empty() {
            Vec::new()
        } else {
            args_str.split(',').map(str::to_string).collect()
        };

        Ok(Self {
            ok,
            name: name.to_ascii_uppercase(),
            tag,
            args,
        })
    }
}

/// True when the buffer starts like a command reply.
#[inline]
pub fn looks_like_reply(buf: &[u8]) -> bool {
    buf.starts_with(b"$OK") || buf.starts_with(b"$ERR")
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_COMMAND_NAME {
        bail!("command name length must be 1..={MAX_COMMAND_NAME}, got {:?}", name.len());
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
        bail!("command name must be alphanumeric, got {name:?}");
    }
    Ok(())
}
