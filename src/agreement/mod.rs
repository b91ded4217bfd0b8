// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-slot lattice agreement: every process proposes a set of values and
//! decides a set that includes its own proposal, such that any two decisions
//! for a slot are ordered by inclusion.

mod lattice;
mod proposal;
mod slot;

pub use lattice::{Decision, LatticeAgreement, Propose};
pub use proposal::{AgreementMessage, Proposal, Slot, Value};
pub use slot::{SlotState, ValueSet, ValueSetLD};
