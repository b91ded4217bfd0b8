// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::config::Tuning;
use crate::error::{ConfigError, Error};
use crate::host::{HostId, Hosts};
use crate::link::{PerfectLinks, Transmit};
use crate::message::Message;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Best-effort broadcast: one perfect link per member of the group, self
/// included. If the sender stays up, every correct member delivers.
#[derive(Clone, Debug)]
pub struct BestEffortBroadcast {
    hosts: Arc<Hosts>,
    links: PerfectLinks,
}

impl BestEffortBroadcast {
    pub fn new(local: HostId, hosts: Arc<Hosts>, tuning: &Tuning) -> Result<Self, ConfigError> {
        if !hosts.contains(local) {
            return Err(ConfigError::UnknownHost(local));
        }
        let links = PerfectLinks::new(local, &hosts, tuning);
        Ok(BestEffortBroadcast { hosts, links })
    }

    pub fn local(&self) -> HostId {
        self.links.local()
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    /// Size of the destination set.
    pub fn group_size(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.hosts.quorum()
    }

    /// Each destination gets its own envelope; the receiver id and link id
    /// are filled in by that destination's link.
    pub fn broadcast(&mut self, msg: &Message, now: Instant, out: &mut Vec<Transmit>) {
        trace!("beb broadcast {}", msg);
        self.links.send_all(msg, now, out);
    }

    /// Point-to-point over the same per-peer links.
    pub fn send(
        &mut self,
        to: HostId,
        msg: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) -> Result<u32, Error> {
        self.links.send(to, msg, now, out)
    }

    pub fn deliver(
        &mut self,
        from: HostId,
        msg: Message,
        out: &mut Vec<Transmit>,
    ) -> Option<Message> {
        self.links.deliver(from, msg, out)
    }

    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.links.handle_timeout(now, out)
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.links.poll_timeout()
    }

    pub fn in_flight(&self) -> usize {
        self.links.in_flight()
    }

    pub fn stop(&mut self) {
        self.links.stop()
    }
}
