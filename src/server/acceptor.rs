// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpSocket, TcpStream},
};
use tracing::{debug, info, warn};

use crate::server::{
    dispatcher,
    registry::ClientRole,
    supervisor::Core,
    tags::TargetKey,
    tracker,
};

/// Line written before closing a connection that exceeds `max_clients`.
pub const CAPACITY_REJECTION: &str = "[ERR] Too many client connections.\r\n";

/// Bind a listener on all interfaces with address reuse, so a restarted
/// daemon does not trip over sockets in TIME_WAIT.
pub async fn bind_listener(port: u16) -> Result<TcpListener> {
    let socket = TcpSocket::new_v4().context("creating listener socket")?;
    socket.set_reuseaddr(true)?;
    socket
        .bind(format!("0.0.0.0:{port}").parse()?)
        .with_context(|| format!("binding port {port}"))?;
    socket.listen(16).context("listening")
}

/// Accept loop over both listening sockets. Returns `Ok` on orderly
/// cancellation; a listener failure is unrecoverable and flips the fatal
/// token before returning the error.
pub async fn run_acceptor(
    core: Arc<Core>,
    cmd_listener: TcpListener,
    tracker_listener: TcpListener,
) -> Result<()> {
    loop {
        let (accepted, role) = tokio::select! {
            _ = core.cancel.cancelled() => break,
            res = cmd_listener.accept() => (res, ClientRole::Command),
            res = tracker_listener.accept() => (res, ClientRole::Tracker),
        };

        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                core.trigger_fatal("listening socket lost");
                return Err(e).context("accept failed");
            },
        };

        if let Err(e) = admit(&core, stream, role).await {
            warn!(error = %e, "failed to admit connection");
        }
    }

    debug!("closing listening sockets");
    Ok(())
}

/// Reserve a slot and hand the connection to its worker, or reject it
/// when the table is full.
async fn admit(core: &Arc<Core>, mut stream: TcpStream, role: ClientRole) -> Result<()> {
    let peer = stream.peer_addr().context("peer address")?;

    if core.slots.count() >= core.slots.capacity() {
        warn!(
            %peer,
            max = core.slots.capacity(),
            "connection rejected, maximum number of clients already connected"
        );
        let _ = stream.write_all(CAPACITY_REJECTION.as_bytes()).await;
        return Ok(());
    }

    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let Some(slot) = core.slots.reserve(role, peer, write_half) else {
        // Lost the race for the last slot.
        return Ok(());
    };
    info!(index = slot.index, %peer, ?role, "client connected");

    let worker_core = core.clone();
    let cancel = core.cancel.child_token();
    tokio::spawn(async move {
        let index = slot.index;
        match role {
            ClientRole::Tracker => {
                let device_id =
                    tracker::run_tracker_session(worker_core.clone(), slot, read_half, cancel)
                        .await;
                if device_id != 0 {
                    let woken = worker_core.tags.drop_target(TargetKey::Gprs(device_id));
                    if woken > 0 {
                        debug!(device = device_id, woken, "woke waiters for disconnected tracker");
                    }
                }
            },
            ClientRole::Command => {
                if let Err(e) =
                    dispatcher::run_command_client(worker_core.clone(), slot, read_half, cancel)
                        .await
                {
                    debug!(error = %e, "command client finished with error");
                }
            },
        }
        worker_core.slots.release(index);
        debug!(index, "slot released");
    });

    Ok(())
}
