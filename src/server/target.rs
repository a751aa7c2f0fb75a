// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use crate::server::{SessionError, registry::SlotTable, tags::TargetKey};

/// Which device a command client is talking to. Exactly one of the two
/// forms at any time; retargeting is pure bookkeeping with no device
/// round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Usb { index: usize },
    Gprs { device_id: u32 },
}

impl Default for Target {
    fn default() -> Self {
        Target::Usb { index: 0 }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Usb { index } => write!(f, "USB port {index}"),
            Target::Gprs { device_id } => write!(f, "device {device_id} (GPRS)"),
        }
    }
}

impl Target {
    pub fn key(&self) -> TargetKey {
        match self {
            Target::Usb { index } => TargetKey::Usb(*index),
            Target::Gprs { device_id } => TargetKey::Gprs(*device_id),
        }
    }
}

/// Per-client target state. Fresh clients talk to USB index 0.
#[derive(Debug, Default)]
pub struct TargetSelection {
    current: Target,
}

impl TargetSelection {
    pub fn current(&self) -> Target {
        self.current
    }

    /// `.use <deviceId>`: retarget to a GPRS-connected tracker. Fails
    /// when no session with that device id exists.
    pub fn use_device(&mut self, device_id: u32, slots: &SlotTable) -> Result<(), SessionError> {
        if slots.find_tracker(device_id).is_none() {
            return Err(SessionError::Transport(format!(
                "device {device_id} not connected"
            )));
        }
        self.current = Target::Gprs { device_id };
        Ok(())
    }

    /// `.usb <n>`: retarget to a locally attached device.
    pub fn use_usb(&mut self, index: usize) {
        self.current = Target::Usb { index };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::{ClientRole, SlotTable, loopback_writer};

    #[tokio::test]
    async fn defaults_to_usb_zero() {
        let sel = TargetSelection::default();
        assert_eq!(sel.current(), Target::Usb { index: 0 });
    }

    #[tokio::test]
    async fn use_device_requires_connected_tracker() {
        let table = SlotTable::new(2);
        let mut sel = TargetSelection::default();

        assert!(sel.use_device(42, &table).is_err());
        assert_eq!(sel.current(), Target::Usb { index: 0 }, "target unchanged");

        let (w, _keep) = loopback_writer().await.expect("pair");
        let peer = "127.0.0.1:1".parse().expect("addr");
        let slot = table.reserve(ClientRole::Tracker, peer, w).expect("slot");
        slot.set_device_id(42);

        sel.use_device(42, &table).expect("retarget");
        assert_eq!(sel.current(), Target::Gprs { device_id: 42 });

        sel.use_usb(1);
        assert_eq!(sel.current(), Target::Usb { index: 1 });
    }
}
