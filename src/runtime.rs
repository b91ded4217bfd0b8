// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Drives a `Node` with tokio: one task owns the node and the socket, and
//! reacts to datagrams, commands and timer deadlines as they come.

use crate::error::Error;
use crate::failure::Suspicion;
use crate::node::{Node, Protocol};
use crate::output::EventSink;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Large enough for any datagram UDP can carry.
pub const MAX_DATAGRAM: usize = 65_536;

// Wake-up interval when no timer is armed.
const IDLE: Duration = Duration::from_secs(1);

/// Writes out everything the node queued. Send failures are logged and left
/// to retransmission.
async fn flush<P: Protocol>(node: &mut Node<P>, socket: &UdpSocket) {
    for t in node.drain_transmits() {
        if let Err(err) = socket.send_to(&t.datagram, t.to).await {
            warn!(to = %t.to, "send failed: {}", err);
        }
    }
}

fn record<P: Protocol, S: EventSink>(node: &mut Node<P>, sink: &mut S) -> Result<(), Error> {
    for event in node.drain_events() {
        sink.record_event(&event)?;
    }
    for change in node.drain_suspicions() {
        match change {
            Suspicion::Suspect(peer) => info!(peer, "peer suspected"),
            Suspicion::Restore { peer, timeout } => {
                info!(peer, ?timeout, "peer restored")
            }
        }
    }
    Ok(())
}

/// Runs `node` until `cancel` fires. Commands are applied in arrival order;
/// a command that fails is logged and dropped. On exit the node is stopped
/// and the sink flushed.
#[instrument(skip_all, fields(node = node.local().id))]
pub async fn run<P, S>(
    mut node: Node<P>,
    socket: UdpSocket,
    mut commands: mpsc::Receiver<P::Command>,
    sink: &mut S,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    P: Protocol,
    S: EventSink,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut commands_open = true;
    node.start(Instant::now());
    debug!(addr = %node.local().addr, "running");

    loop {
        flush(&mut node, &socket).await;
        record(&mut node, sink)?;

        let deadline = node
            .poll_timeout()
            .unwrap_or_else(|| Instant::now() + IDLE);
        select! {
            _ = cancel.cancelled() => break,
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((len, from)) => {
                    trace!(%from, len, "datagram");
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    node.handle_datagram(from, datagram, Instant::now());
                }
                Err(err) => warn!("receive failed: {}", err),
            },
            cmd = commands.recv(), if commands_open => match cmd {
                Some(cmd) => {
                    if let Err(err) = node.handle_command(cmd, Instant::now()) {
                        warn!("command rejected: {}", err);
                    }
                }
                None => commands_open = false,
            },
            _ = tokio::time::sleep_until(deadline.into()) => {
                node.handle_timeout(Instant::now());
            }
        }
    }

    node.stop();
    record(&mut node, sink)?;
    sink.flush()?;
    debug!("stopped");
    Ok(())
}

/// Control over a spawned node.
#[derive(Debug)]
pub struct NodeHandle<C> {
    pub commands: mpsc::Sender<C>,
    pub cancel: CancellationToken,
}

impl<C> NodeHandle<C> {
    pub async fn send(&self, cmd: C) -> bool {
        self.commands.send(cmd).await.is_ok()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel()
    }
}

/// Spawns `run` on the current runtime. The join handle yields the sink back
/// once the node has stopped.
pub fn spawn<P, S>(
    node: Node<P>,
    socket: UdpSocket,
    mut sink: S,
) -> (NodeHandle<P::Command>, JoinHandle<Result<S, Error>>)
where
    P: Protocol + Send + 'static,
    P::Command: Send + 'static,
    S: EventSink + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1024);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        run(node, socket, rx, &mut sink, token).await?;
        Ok(sink)
    });
    (
        NodeHandle {
            commands: tx,
            cancel,
        },
        task,
    )
}
