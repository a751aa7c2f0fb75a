// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use anyhow::Result;
use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Command,
    Tracker,
}

/// One accepted connection of either role. The slot index is the client's
/// stable identifier while connected; the write half doubles as the
/// per-session write lock that serialises keep-alive echoes with
/// dispatched command frames.
#[derive(Debug)]
pub struct ClientSlot {
    pub index: usize,
    pub role: ClientRole,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    /// Tracker role only; zero until the first keep-alive identifies the
    /// device, immutable afterwards.
    pub device_id: AtomicU32,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl ClientSlot {
    /// Write the whole buffer under the session write lock.
    pub async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(bytes).await?;
        w.flush().await
    }

    pub fn device_id(&self) -> u32 {
        self.device_id.load(Ordering::Acquire)
    }

    /// Record the device id learned from the first keep-alive. Returns
    /// true the first time, false when the id was already set.
    pub fn set_device_id(&self, id: u32) -> bool {
        self.device_id
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Fixed-capacity connection registry. Reservation scans for the first
/// free index; a slot becomes reusable only after its worker released it.
#[derive(Debug)]
pub struct SlotTable {
    capacity: usize,
    slots: Mutex<Vec<Option<Arc<ClientSlot>>>>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.slots
            .lock()
            .expect("slot table poisoned")
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Reserve the first free slot, or `None` when the table is full.
    pub fn reserve(
        &self,
        role: ClientRole,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
    ) -> Option<Arc<ClientSlot>> {
        let mut slots = self.slots.lock().expect("slot table poisoned");
        let index = slots.iter().position(|s| s.is_none())?;
        let slot = Arc::new(ClientSlot {
            index,
            role,
            peer,
            connected_at: Instant::now(),
            device_id: AtomicU32::new(0),
            writer: tokio::sync::Mutex::new(writer),
        });
        slots[index] = Some(slot.clone());
        Some(slot)
    }

    /// Free a slot for reuse. Called exactly once, after the worker
    /// returned.
    pub fn release(&self, index: usize) {
        let mut slots = self.slots.lock().expect("slot table poisoned");
        if index < slots.len() {
            slots[index] = None;
        }
    }

    /// The connected tracker session for a device id, if any.
    pub fn find_tracker(&self, device_id: u32) -> Option<Arc<ClientSlot>> {
        if device_id == 0 {
            return None;
        }
        self.slots
            .lock()
            .expect("slot table poisoned")
            .iter()
            .flatten()
            .find(|s| s.role == ClientRole::Tracker && s.device_id() == device_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSlot>> {
        self.slots
            .lock()
            .expect("slot table poisoned")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Build a detached slot for unit tests: the writer half comes from a
/// loopback socket pair.
#[doc(hidden)]
pub async fn loopback_writer() -> Result<(OwnedWriteHalf, tokio::net::TcpStream)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client = tokio::net::TcpStream::connect(addr).await?;
    let (server, _) = listener.accept().await?;
    let (_r, w) = server.into_split();
    Ok((w, client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_release_reuse() {
        let table = SlotTable::new(2);
        let peer: SocketAddr = "127.0.0.1:9999".parse().expect("addr");

        let (w1, _k1) = loopback_writer().await.expect("pair");
        let (w2, _k2) = loopback_writer().await.expect("pair");
        let (w3, _k3) = loopback_writer().await.expect("pair");

        let a = table.reserve(ClientRole::Command, peer, w1).expect("slot 0");
        assert_eq!(a.index, 0);
        let b = table.reserve(ClientRole::Tracker, peer, w2).expect("slot 1");
        assert_eq!(b.index, 1);
        assert_eq!(table.count(), 2);

        let (w4, _k4) = loopback_writer().await.expect("pair");
        assert!(table.reserve(ClientRole::Command, peer, w4).is_none());

        table.release(0);
        let c = table.reserve(ClientRole::Command, peer, w3).expect("slot reused");
        assert_eq!(c.index, 0);
    }

    #[tokio::test]
    async fn tracker_lookup_by_device_id() {
        let table = SlotTable::new(2);
        let peer: SocketAddr = "127.0.0.1:9999".parse().expect("addr");
        let (w, _k) = loopback_writer().await.expect("pair");

        let slot = table.reserve(ClientRole::Tracker, peer, w).expect("slot");
        assert!(table.find_tracker(42).is_none());

        assert!(slot.set_device_id(42));
        assert!(!slot.set_device_id(43), "id is immutable once set");
        assert_eq!(slot.device_id(), 42);
        assert!(table.find_tracker(42).is_some());
        assert!(table.find_tracker(0).is_none());
    }
}
