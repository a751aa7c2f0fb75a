// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32};

/// Fixed two-byte header that separates keep-alive frames from textual
/// traffic arriving on the same socket.
pub const KEEP_ALIVE_HEADER: [u8; 2] = [0xD0, 0xD7];

/// Length of a keep-alive frame on the wire.
pub const KEEP_ALIVE_LEN: usize = 8;

/// The 8-byte liveness frame a tracker sends periodically over GPRS.
///
/// Layout: `D0 D7 seq_lo seq_hi id_b0 id_b1 id_b2 id_b3`, a 16-bit
/// little-endian sequence number followed by the 32-bit little-endian
/// device id. The server answers with an identical echo.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct KeepAliveFrame {
    pub header: [u8; 2],              // 0..2
    pub seq: U16<LittleEndian>,       // 2..4
    pub device_id: U32<LittleEndian>, // 4..8
}

impl KeepAliveFrame {
    pub fn new(seq: u16, device_id: u32) -> Self {
        Self {
            header: KEEP_ALIVE_HEADER,
            seq: U16::new(seq),
            device_id: U32::new(device_id),
        }
    }

    /// Parse a frame from exactly [`KEEP_ALIVE_LEN`] bytes, validating the
    /// fixed header.
    pub fn from_wire_bytes(buf: &[u8]) -> Result<&Self> {
        if buf.len() != KEEP_ALIVE_LEN {
            bail!("keep-alive frame must be {KEEP_ALIVE_LEN} bytes, got {}", buf.len());
        }
        let frame = <Self as zerocopy::FromBytes>::ref_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to convert buffer to KeepAliveFrame: {e}"))?;
        if frame.header != KEEP_ALIVE_HEADER {
            bail!(
                "invalid keep-alive header 0x{:02X} 0x{:02X}",
                frame.header[0],
                frame.header[1]
            );
        }
        Ok(frame)
    }

    /// Serialize the frame into its 8-byte wire form.
    pub fn to_wire_bytes(&self) -> [u8; KEEP_ALIVE_LEN] {
        let mut out = [0u8; KEEP_ALIVE_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }

    #[inline]
    pub fn seq(&self) -> u16 {
        self.seq.get()
    }

    #[inline]
    pub fn device_id(&self) -> u32 {
        self.device_id.get()
    }
}

/// True when the buffer starts like a keep-alive frame.
#[inline]
pub fn looks_like_keepalive(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == KEEP_ALIVE_HEADER[0] && buf[1] == KEEP_ALIVE_HEADER[1]
}
