// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements a small tower of distributed-communication
 * primitives for a fixed, statically-known group of processes talking over
 * plain UDP datagrams, which may be lost, duplicated or reordered, and which
 * may come from processes that crash:
 *
 *   - Links. A fair-loss link is one datagram per send. A stubborn link
 *     resends until acknowledged. A perfect link dedups on top of that, so
 *     each message sent between correct processes is delivered exactly once.
 *
 *   - Broadcasts. Best-effort broadcast is a perfect link per member.
 *     Uniform reliable broadcast relays every message and delivers only
 *     once a majority holds it, so anything delivered anywhere is delivered
 *     everywhere correct. FIFO broadcast piggy-backs each sender's history
 *     to deliver its messages in the order it sent them.
 *
 *   - A failure detector that heartbeats every peer and suspects the silent
 *     ones, backing off its timeout each time it turns out to be wrong.
 *
 *   - Lattice agreement, run independently per numbered slot: each process
 *     proposes a set of values and decides a set that includes its proposal,
 *     and any two decisions for the same slot are ordered by inclusion.
 *
 * Every layer is a plain state machine that owns the layer beneath it. None
 * of them touch a socket or a clock: datagrams to send are pushed onto an
 * outbox and time is passed in. A `Node` bundles a stack with an optional
 * failure detector, and `runtime` drives a node with tokio. The same nodes
 * run unchanged under the deterministic simulated network in the tests and
 * under the stateright model checker.
 *
 * ## Wire format
 *
 * Every datagram is a 20-byte big-endian header
 * `[kind][senderId][receiverId][id][seqNum]` followed by the payload. Layers
 * above the links nest their own messages in the payload.
 */

mod agreement;
mod broadcast;
mod config;
mod error;
mod failure;
mod host;
mod link;
mod message;
mod node;
mod output;
pub mod runtime;
mod timer;

pub use agreement::{
    AgreementMessage, Decision, LatticeAgreement, Proposal, Propose, Slot, SlotState, Value,
    ValueSet, ValueSetLD,
};
pub use broadcast::{
    decode_history, encode_history, BestEffortBroadcast, FifoBroadcast, History, MessageKey,
    UniformReliableBroadcast, HISTORY_BUDGET,
};
pub use config::{load_hosts, parse_hosts, Mode, NodeConfig, Scenario, Tuning};
pub use error::{ConfigError, DecodeError, Error};
pub use failure::{PerfectFailureDetector, Suspicion};
pub use host::{quorum, HostId, HostIdentity, Hosts, NO_HOST};
pub use link::{
    DedupWindow, FairLossLink, LinkCommand, PerfectLink, PerfectLinks, StubbornLink, Transmit,
};
pub use message::{Message, MessageKind, HEADER_LEN, MAX_UDP_PAYLOAD};
pub use node::{Node, Protocol};
pub use output::{Event, EventSink, MemoryLog, OutputLog};
pub use timer::Timers;

#[cfg(test)]
mod tests;
