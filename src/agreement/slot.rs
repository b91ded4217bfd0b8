// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::agreement::proposal::{AgreementMessage, Proposal, Slot, Value};
use crate::error::Error;
use crate::host::HostId;
use pergola::{BTreeSetWithUnion, LatticeElt};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Sets of values ordered by inclusion and joined by union. Accepted and
/// proposed values only ever move up this lattice.
pub type ValueSetLD = BTreeSetWithUnion<Value>;
pub type ValueSet = LatticeElt<ValueSetLD>;

/// `SlotState` is one process's view of a single slot, as both proposer and
/// acceptor. It is a plain state machine: callers feed it proposals, acks and
/// nacks and route whatever it returns, which keeps it cloneable and easy to
/// hand to a model checker.
///
/// The acceptor half acks a proposal that includes everything it has
/// accepted so far and nacks anything else, replying with the larger set.
/// Either way it absorbs the proposal.
///
/// The proposer half counts replies for its current round. A majority of
/// acks decides the values offered in that round. Once a majority has
/// replied with at least one nack, the proposal grows by everything the
/// nacks carried and a new round starts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotState {
    slot: Slot,
    active: bool,
    decided: bool,
    round: u32,
    proposed: ValueSet,
    // what went out in `round`; a decision is always on this
    offered: ValueSet,
    accepted: ValueSet,
    ack_count: usize,
    nack_count: usize,
    responded: BTreeSet<HostId>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        SlotState {
            slot,
            active: false,
            decided: false,
            round: 0,
            proposed: ValueSet::default(),
            offered: ValueSet::default(),
            accepted: ValueSet::default(),
            ack_count: 0,
            nack_count: 0,
            responded: BTreeSet::new(),
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_decided(&self) -> bool {
        self.decided
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn proposed(&self) -> &BTreeSet<Value> {
        &self.proposed.value
    }

    pub fn accepted(&self) -> &BTreeSet<Value> {
        &self.accepted.value
    }

    pub fn ack_count(&self) -> usize {
        self.ack_count
    }

    pub fn nack_count(&self) -> usize {
        self.nack_count
    }

    /// Adds `values` to our proposal and returns what to broadcast. A slot
    /// that is already collecting replies restarts in a fresh round, since
    /// the replies so far were for a smaller proposal.
    pub fn propose(&mut self, values: &BTreeSet<Value>) -> Result<Proposal, Error> {
        if self.decided {
            return Err(Error::AlreadyDecided(self.slot));
        }
        self.proposed = &self.proposed + &ValueSet::new_from(values.clone());
        if self.active {
            self.next_round();
        } else {
            self.active = true;
        }
        self.offered = self.proposed.clone();
        debug!(
            "slot {} proposing {:?} in round {}",
            self.slot, self.offered.value, self.round
        );
        Ok(self.current_proposal())
    }

    pub fn current_proposal(&self) -> Proposal {
        Proposal {
            round: self.round,
            slot: self.slot,
            values: self.offered.value.clone(),
        }
    }

    /// Acceptor side. A slot first seen through someone else's proposal also
    /// remembers it as proposed, so a later local proposal builds on it.
    pub fn on_proposal(&mut self, proposal: &Proposal) -> AgreementMessage {
        let incoming = ValueSet::new_from(proposal.values.clone());
        if !self.active && !self.decided {
            self.proposed = &self.proposed + &incoming;
        }
        let covers = proposal.values.is_superset(&self.accepted.value);
        self.accepted = &self.accepted + &incoming;
        if covers {
            trace!("slot {} acks round {}", self.slot, proposal.round);
            AgreementMessage::Ack {
                round: proposal.round,
                slot: self.slot,
            }
        } else {
            trace!("slot {} nacks round {}", self.slot, proposal.round);
            AgreementMessage::Nack(Proposal {
                round: proposal.round,
                slot: self.slot,
                values: self.accepted.value.clone(),
            })
        }
    }

    fn counts(&mut self, from: HostId, round: u32) -> bool {
        if round != self.round || self.responded.contains(&from) {
            trace!(
                "slot {} ignoring reply from {} for round {} (at {})",
                self.slot,
                from,
                round,
                self.round
            );
            return false;
        }
        self.responded.insert(from);
        true
    }

    /// Returns the decided values when this ack completes a majority. Those
    /// are the values offered in this round, not `proposed`, which late nacks
    /// may have grown past what the majority acked ("Decided values" in
    /// DESIGN.md).
    pub fn on_ack(&mut self, from: HostId, round: u32, quorum: usize) -> Option<BTreeSet<Value>> {
        if !self.counts(from, round) {
            return None;
        }
        self.ack_count += 1;
        if self.active && self.ack_count >= quorum {
            self.active = false;
            self.decided = true;
            debug!(
                "slot {} decided {:?} in round {}",
                self.slot, self.offered.value, self.round
            );
            return Some(self.offered.value.clone());
        }
        None
    }

    /// Returns the next round's proposal when this nack completes a majority
    /// of replies.
    pub fn on_nack(
        &mut self,
        from: HostId,
        round: u32,
        values: &BTreeSet<Value>,
        quorum: usize,
    ) -> Option<Proposal> {
        if !self.counts(from, round) {
            return None;
        }
        self.nack_count += 1;
        self.proposed = &self.proposed + &ValueSet::new_from(values.clone());
        if self.active && self.ack_count + self.nack_count >= quorum {
            self.next_round();
            self.offered = self.proposed.clone();
            debug!(
                "slot {} advancing to round {} with {:?}",
                self.slot, self.round, self.offered.value
            );
            return Some(self.current_proposal());
        }
        None
    }

    fn next_round(&mut self) {
        self.round += 1;
        self.ack_count = 0;
        self.nack_count = 0;
        self.responded.clear();
    }
}
