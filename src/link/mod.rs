// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Point-to-point links, from a lossy datagram up to exactly-once delivery.

mod fair_loss;
mod perfect;
mod stubborn;
mod window;

pub use fair_loss::{FairLossLink, Transmit};
pub use perfect::PerfectLink;
pub use stubborn::StubbornLink;
pub use window::DedupWindow;

use crate::config::Tuning;
use crate::error::Error;
use crate::host::{HostId, HostIdentity, Hosts};
use crate::message::Message;
use crate::node::Protocol;
use crate::output::Event;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, trace};

/// One `PerfectLink` per member of the group, self included.
#[derive(Clone, Debug)]
pub struct PerfectLinks {
    local: HostId,
    links: BTreeMap<HostId, PerfectLink>,
}

impl PerfectLinks {
    pub fn new(local: HostId, hosts: &Hosts, tuning: &Tuning) -> Self {
        Self::to_peers(local, hosts.iter().copied(), tuning)
    }

    /// Links to an explicit subset of the group.
    pub fn to_peers<I>(local: HostId, peers: I, tuning: &Tuning) -> Self
    where
        I: IntoIterator<Item = HostIdentity>,
    {
        let interval = tuning.retransmit_interval();
        let links = peers
            .into_iter()
            .map(|peer| (peer.id, PerfectLink::new(local, peer, interval)))
            .collect();
        PerfectLinks { local, links }
    }

    pub fn local(&self) -> HostId {
        self.local
    }

    pub fn peers(&self) -> impl Iterator<Item = HostId> + '_ {
        self.links.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn link(&self, peer: HostId) -> Option<&PerfectLink> {
        self.links.get(&peer)
    }

    pub fn send(
        &mut self,
        to: HostId,
        msg: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) -> Result<u32, Error> {
        let link = self.links.get_mut(&to).ok_or(Error::UnknownHost(to))?;
        Ok(link.send(msg, now, out))
    }

    /// Sends a copy of `msg` on every link, in id order.
    pub fn send_all(&mut self, msg: &Message, now: Instant, out: &mut Vec<Transmit>) {
        for link in self.links.values_mut() {
            link.send(msg.clone(), now, out);
        }
    }

    pub fn deliver(
        &mut self,
        from: HostId,
        msg: Message,
        out: &mut Vec<Transmit>,
    ) -> Option<Message> {
        match self.links.get_mut(&from) {
            Some(link) => link.deliver(msg, out),
            None => {
                trace!("no link from {}, dropping {}", from, msg);
                None
            }
        }
    }

    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        for link in self.links.values_mut() {
            link.handle_timeout(now, out);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.links.values().filter_map(|l| l.poll_timeout()).min()
    }

    pub fn in_flight(&self) -> usize {
        self.links.values().map(|l| l.in_flight()).sum()
    }

    pub fn stop(&mut self) {
        for link in self.links.values_mut() {
            link.stop();
        }
    }
}

/// A point-to-point send, logged as `b <seq>` by the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkCommand {
    pub to: HostId,
    pub seq: u32,
    pub payload: Bytes,
}

impl Protocol for PerfectLinks {
    type Command = LinkCommand;

    fn on_command(
        &mut self,
        cmd: LinkCommand,
        now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let msg = Message::data(self.local, cmd.seq, cmd.payload);
        self.send(cmd.to, msg, now, out)?;
        events.push(Event::Broadcast { seq: cmd.seq });
        Ok(())
    }

    fn on_message(
        &mut self,
        from: HostId,
        msg: Message,
        _now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) {
        if let Some(msg) = self.deliver(from, msg, out) {
            debug!("delivered seq {} from {}", msg.seq_num, from);
            events.push(Event::Deliver {
                sender: msg.sender_id,
                seq: msg.seq_num,
            });
        }
    }

    fn on_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.handle_timeout(now, out)
    }

    fn poll_timeout(&self) -> Option<Instant> {
        PerfectLinks::poll_timeout(self)
    }

    fn stop(&mut self) {
        PerfectLinks::stop(self)
    }
}
