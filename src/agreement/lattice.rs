// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::agreement::proposal::{AgreementMessage, Proposal, Slot, Value};
use crate::agreement::slot::SlotState;
use crate::broadcast::BestEffortBroadcast;
use crate::config::Tuning;
use crate::error::{ConfigError, Error};
use crate::host::{HostId, Hosts};
use crate::link::Transmit;
use crate::message::Message;
use crate::node::Protocol;
use crate::output::Event;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, trace, warn};

/// A slot's decision, surfaced once per slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub slot: Slot,
    pub values: BTreeSet<Value>,
}

/// Ask the local process to propose `values` for `slot`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Propose {
    pub slot: Slot,
    pub values: BTreeSet<Value>,
}

/// Lattice agreement over any number of independent slots. Proposals go out
/// by best-effort broadcast; acks and nacks return point-to-point on the same
/// per-peer links. Each slot runs its own rounds and nothing orders one slot
/// against another.
#[derive(Clone, Debug)]
pub struct LatticeAgreement {
    beb: BestEffortBroadcast,
    slots: BTreeMap<Slot, SlotState>,
}

impl LatticeAgreement {
    pub fn new(local: HostId, hosts: Arc<Hosts>, tuning: &Tuning) -> Result<Self, ConfigError> {
        Ok(LatticeAgreement {
            beb: BestEffortBroadcast::new(local, hosts, tuning)?,
            slots: BTreeMap::new(),
        })
    }

    pub fn local(&self) -> HostId {
        self.beb.local()
    }

    pub fn slot(&self, slot: Slot) -> Option<&SlotState> {
        self.slots.get(&slot)
    }

    pub fn propose(
        &mut self,
        slot: Slot,
        values: &BTreeSet<Value>,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) -> Result<(), Error> {
        let proposal = self
            .slots
            .entry(slot)
            .or_insert_with(|| SlotState::new(slot))
            .propose(values)?;
        self.broadcast(proposal, now, out);
        Ok(())
    }

    fn broadcast(&mut self, proposal: Proposal, now: Instant, out: &mut Vec<Transmit>) {
        let payload = AgreementMessage::Propose(proposal).encode();
        let msg = Message::data(self.local(), 0, payload);
        self.beb.broadcast(&msg, now, out);
    }

    fn reply(
        &mut self,
        to: HostId,
        reply: AgreementMessage,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) {
        let msg = Message::data(self.local(), 0, reply.encode());
        if let Err(err) = self.beb.send(to, msg, now, out) {
            warn!("cannot reply to {}: {}", to, err);
        }
    }

    /// Handles agreement traffic from `from`; returns a decision if this
    /// message completed one.
    pub fn deliver(
        &mut self,
        from: HostId,
        msg: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) -> Option<Decision> {
        let msg = self.beb.deliver(from, msg, out)?;
        let agreement = match AgreementMessage::decode(msg.payload) {
            Ok(agreement) => agreement,
            Err(err) => {
                trace!("dropping agreement message from {}: {}", from, err);
                return None;
            }
        };
        let quorum = self.beb.quorum();
        match agreement {
            AgreementMessage::Propose(proposal) => {
                let slot = proposal.slot;
                let reply = self
                    .slots
                    .entry(slot)
                    .or_insert_with(|| SlotState::new(slot))
                    .on_proposal(&proposal);
                self.reply(from, reply, now, out);
                None
            }
            AgreementMessage::Ack { round, slot } => {
                let state = self.known_slot(slot, from)?;
                let values = state.on_ack(from, round, quorum)?;
                info!("slot {} decided {:?}", slot, values);
                Some(Decision { slot, values })
            }
            AgreementMessage::Nack(nack) => {
                let state = self.known_slot(nack.slot, from)?;
                let next = state.on_nack(from, nack.round, &nack.values, quorum)?;
                self.broadcast(next, now, out);
                None
            }
        }
    }

    fn known_slot(&mut self, slot: Slot, from: HostId) -> Option<&mut SlotState> {
        let state = self.slots.get_mut(&slot);
        if state.is_none() {
            trace!("reply from {} for unknown slot {}", from, slot);
        }
        state
    }

    pub fn decided(&self) -> impl Iterator<Item = Slot> + '_ {
        self.slots
            .values()
            .filter(|s| s.is_decided())
            .map(|s| s.slot())
    }

    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.beb.handle_timeout(now, out)
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.beb.poll_timeout()
    }

    pub fn in_flight(&self) -> usize {
        self.beb.in_flight()
    }

    pub fn stop(&mut self) {
        self.beb.stop()
    }
}

impl Protocol for LatticeAgreement {
    type Command = Propose;

    fn on_command(
        &mut self,
        cmd: Propose,
        now: Instant,
        out: &mut Vec<Transmit>,
        _events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        self.propose(cmd.slot, &cmd.values, now, out)
    }

    fn on_message(
        &mut self,
        from: HostId,
        msg: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) {
        if let Some(decision) = self.deliver(from, msg, now, out) {
            events.push(Event::Decide {
                slot: decision.slot,
                values: decision.values,
            });
        }
    }

    fn on_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.handle_timeout(now, out)
    }

    fn poll_timeout(&self) -> Option<Instant> {
        LatticeAgreement::poll_timeout(self)
    }

    fn stop(&mut self) {
        LatticeAgreement::stop(self)
    }
}
