// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::host::{HostId, HostIdentity};
use crate::link::fair_loss::{FairLossLink, Transmit};
use crate::link::window::DedupWindow;
use crate::message::{Message, MessageKind};
use crate::timer::Timers;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A `StubbornLink` keeps resending each DATA message to its peer until the
/// peer acknowledges it. It does not dedup: every copy that arrives is
/// acknowledged and passed upward.
///
/// Ids are stamped here, counting up from 1 per link. Heartbeat traffic is
/// sent once; the failure detector supplies its own periodicity.
#[derive(Clone, Debug)]
pub struct StubbornLink {
    local: HostId,
    fll: FairLossLink,
    interval: Duration,
    next_id: u32,
    sent: BTreeMap<u32, Message>,
    acked: DedupWindow,
    retransmit: Timers<u32>,
}

impl StubbornLink {
    pub fn new(local: HostId, peer: HostIdentity, interval: Duration) -> Self {
        StubbornLink {
            local,
            fll: FairLossLink::new(peer),
            interval,
            next_id: 0,
            sent: BTreeMap::new(),
            acked: DedupWindow::new(),
            retransmit: Timers::new(),
        }
    }

    pub fn peer(&self) -> &HostIdentity {
        self.fll.peer()
    }

    /// Stamps `msg` with the next link id, sends it once and, for DATA, keeps
    /// resending every interval until acked. Returns the stamped id.
    pub fn send(&mut self, mut msg: Message, now: Instant, out: &mut Vec<Transmit>) -> u32 {
        self.next_id += 1;
        msg.id = self.next_id;
        msg.receiver_id = self.peer().id;
        self.fll.send(&msg, out);
        if msg.kind == MessageKind::Data {
            self.retransmit
                .schedule(msg.id, now + self.interval, self.interval);
            self.sent.insert(msg.id, msg);
        }
        self.next_id
    }

    /// Handles a message the peer sent us. ACKs are consumed here; DATA is
    /// acknowledged and returned, as is heartbeat traffic.
    pub fn deliver(&mut self, msg: Message, out: &mut Vec<Transmit>) -> Option<Message> {
        match msg.kind {
            MessageKind::Ack => {
                match msg.acked_id() {
                    Ok(id) => self.on_ack(id),
                    Err(err) => trace!("dropping ack from {}: {}", self.peer(), err),
                }
                None
            }
            MessageKind::Data => {
                self.fll.send(&msg.ack(self.local), out);
                Some(msg)
            }
            MessageKind::Heartbeat | MessageKind::HeartbeatAck => Some(msg),
        }
    }

    fn on_ack(&mut self, id: u32) {
        if self.sent.remove(&id).is_some() {
            self.acked.insert(id);
            self.retransmit.cancel(&id);
            debug!("peer {} acked #{}", self.peer().id, id);
        } else {
            trace!("peer {} re-acked #{}", self.peer().id, id);
        }
    }

    /// Resends every message whose retransmission interval elapsed.
    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        for id in self.retransmit.expired(now) {
            if self.acked.contains(id) {
                self.retransmit.cancel(&id);
                continue;
            }
            if let Some(msg) = self.sent.get(&id) {
                trace!("retransmitting #{} to {}", id, self.fll.peer());
                self.fll.send(msg, out);
            }
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.retransmit.next_deadline()
    }

    pub fn is_acked(&self, id: u32) -> bool {
        self.acked.contains(id)
    }

    /// Messages still waiting for an ACK.
    pub fn in_flight(&self) -> usize {
        self.sent.len()
    }

    /// Gives up on everything in flight.
    pub fn stop(&mut self) {
        self.retransmit.cancel_all();
        self.sent.clear();
    }
}
