// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection and command-routing engine: the dual-listener acceptor,
//! per-connection workers for trackers and command clients, the tag
//! correlation registry and the supervising lifecycle.

/// Dual-listener accept loop.
pub mod acceptor;
/// Command client worker and device dispatch.
pub mod dispatcher;
/// Client slot table.
pub mod registry;
/// Lifecycle owner: start, reload, shutdown.
pub mod supervisor;
/// Tag allocation and reply correlation per target.
pub mod tags;
/// Per-client target selection.
pub mod target;
/// Tracker session worker.
pub mod tracker;

use thiserror::Error;

/// Classified session-level failures surfaced to workers and clients.
/// Only fatal conditions (listener loss, store failure on the persist
/// path) escape a worker and reach the supervisor.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device error {0}")]
    Device(String),
    #[error("authentication failed")]
    Auth,
    #[error("too many client connections")]
    Capacity,
    #[error("timeout contacting device")]
    Timeout,
}
