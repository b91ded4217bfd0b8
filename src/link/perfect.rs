// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::host::{HostId, HostIdentity};
use crate::link::fair_loss::Transmit;
use crate::link::stubborn::StubbornLink;
use crate::link::window::DedupWindow;
use crate::message::{Message, MessageKind};
use std::time::{Duration, Instant};
use tracing::trace;

/// A `PerfectLink` surfaces each DATA message from its peer exactly once. It
/// sits on a `StubbornLink`, which keeps acknowledging duplicates, and
/// filters them out with a per-peer window of delivered ids.
///
/// Heartbeat traffic passes straight through: the failure detector treats a
/// repeated heartbeat or reply the same as the first.
#[derive(Clone, Debug)]
pub struct PerfectLink {
    sl: StubbornLink,
    sent: u64,
    delivered: DedupWindow,
}

impl PerfectLink {
    pub fn new(local: HostId, peer: HostIdentity, interval: Duration) -> Self {
        PerfectLink {
            sl: StubbornLink::new(local, peer, interval),
            sent: 0,
            delivered: DedupWindow::new(),
        }
    }

    pub fn peer(&self) -> &HostIdentity {
        self.sl.peer()
    }

    pub fn send(&mut self, msg: Message, now: Instant, out: &mut Vec<Transmit>) -> u32 {
        self.sent += 1;
        self.sl.send(msg, now, out)
    }

    pub fn deliver(&mut self, msg: Message, out: &mut Vec<Transmit>) -> Option<Message> {
        let msg = self.sl.deliver(msg, out)?;
        if msg.kind != MessageKind::Data {
            return Some(msg);
        }
        if !self.delivered.insert(msg.id) {
            trace!("duplicate #{} from {}", msg.id, self.peer().id);
            return None;
        }
        Some(msg)
    }

    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.sl.handle_timeout(now, out)
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.sl.poll_timeout()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn delivered(&self) -> usize {
        self.delivered.len()
    }

    pub fn in_flight(&self) -> usize {
        self.sl.in_flight()
    }

    pub fn stop(&mut self) {
        self.sl.stop()
    }
}
