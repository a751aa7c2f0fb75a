// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use anyhow::{Result, bail};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::command::{DeviceReply, Tag};

/// A command destination as the tag registry sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKey {
    Gprs(u32),
    Usb(usize),
}

#[derive(Debug, Default)]
struct TargetWaiters {
    waiters: HashMap<u16, mpsc::Sender<DeviceReply>>,
}

/// Correlates device replies with the dispatcher that issued the command.
///
/// One waiter channel per outstanding `(target, tag)`. Tracker workers
/// publish replies without blocking; a reply with no registered taker is
/// dropped and logged. Dropping a whole target wakes every waiter with a
/// closed channel, which dispatchers surface as a transport error.
#[derive(Debug, Default)]
pub struct TagRegistry {
    targets: DashMap<TargetKey, TargetWaiters>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the smallest free 4-digit tag against `key` and register
    /// a reply channel for it.
    pub fn allocate(&self, key: TargetKey) -> Result<(Tag, mpsc::Receiver<DeviceReply>)> {
        let mut entry = self.targets.entry(key).or_default();
        let free = (Tag::MIN..=Tag::MAX).find(|n| !entry.waiters.contains_key(n));
        let Some(n) = free else {
            bail!("no free command tag for {key:?}");
        };
        let (tx, rx) = mpsc::channel(1);
        entry.waiters.insert(n, tx);
        Ok((Tag::new(n).expect("n is in range"), rx))
    }

    /// Unregister a tag after completion or timeout.
    pub fn release(&self, key: TargetKey, tag: Tag) {
        if let Some(mut entry) = self.targets.get_mut(&key) {
            entry.waiters.remove(&tag.get());
        }
    }

    /// Publish a reply to the waiter registered for its tag. Never blocks.
    /// Returns false when no taker was registered (the reply is dropped).
    pub fn deliver(&self, key: TargetKey, reply: DeviceReply) -> bool {
        let sender = match self.targets.get_mut(&key) {
            Some(mut entry) => entry.waiters.remove(&reply.tag.get()),
            None => None,
        };
        match sender {
            Some(tx) => match tx.try_send(reply) {
                Ok(()) => true,
                Err(e) => {
                    // The waiter timed out in the same instant.
                    debug!(?key, "reply arrived for an abandoned waiter: {e}");
                    false
                },
            },
            None => {
                warn!(?key, tag = %reply.tag, "dropping reply with no registered taker");
                false
            },
        }
    }

    /// Drop every waiter for a target. Their receivers observe a closed
    /// channel immediately.
    pub fn drop_target(&self, key: TargetKey) -> usize {
        match self.targets.remove(&key) {
            Some((_, state)) => state.waiters.len(),
            None => 0,
        }
    }

    pub fn outstanding(&self, key: TargetKey) -> usize {
        self.targets.get(&key).map_or(0, |e| e.waiters.len())
    }
}
