// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::broadcast::urb::UniformReliableBroadcast;
use crate::config::Tuning;
use crate::error::{ConfigError, DecodeError, Error};
use crate::host::{HostId, Hosts};
use crate::link::Transmit;
use crate::message::{need, Message, HEADER_LEN, MAX_UDP_PAYLOAD};
use crate::node::Protocol;
use crate::output::Event;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use im::OrdMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Messages a process has broadcast or delivered, by sender then seq. It is
/// an `im` map so the snapshot attached to each broadcast is a cheap clone.
pub type History = OrdMap<HostId, OrdMap<u32, Message>>;

/// Bytes of history an envelope may carry besides its own message's payload:
/// a datagram less the URB envelope header, the URB message header and the
/// framed carried message's header.
pub const HISTORY_BUDGET: usize = MAX_UDP_PAYLOAD - 3 * HEADER_LEN - 4;

/// Writes `history` as `[blocks]` then per sender `[peer][count][framed msg]*`
/// in at most `budget` bytes. Senders take turns adding their next-newest
/// message, so each block is a run of that sender's newest messages and no
/// sender crowds out the rest. Senders left with nothing get no block.
pub fn encode_history(history: &History, budget: usize, buf: &mut BytesMut) {
    // nothing older than this many messages can fit anyway
    let deepest = budget / (4 + HEADER_LEN);
    let tails: Vec<(HostId, Vec<&Message>)> = history
        .keys()
        .zip(history.values())
        .map(|(peer, msgs)| {
            let skip = msgs.len().saturating_sub(deepest);
            (*peer, msgs.values().skip(skip).collect())
        })
        .collect();

    let mut counts = vec![0usize; tails.len()];
    let mut used = 4;
    loop {
        let mut grew = false;
        for ((_, msgs), count) in tails.iter().zip(counts.iter_mut()) {
            let msg = match msgs.len().checked_sub(*count + 1) {
                Some(i) => msgs[i],
                None => continue,
            };
            let mut cost = 4 + msg.encoded_len();
            if *count == 0 {
                cost += 8;
            }
            if used + cost <= budget {
                used += cost;
                *count += 1;
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    buf.put_u32(counts.iter().filter(|c| **c > 0).count() as u32);
    for ((peer, msgs), count) in tails.iter().zip(counts) {
        if count == 0 {
            continue;
        }
        buf.put_u32(*peer);
        buf.put_u32(count as u32);
        for msg in &msgs[msgs.len() - count..] {
            msg.encode_framed(buf);
        }
    }
}

pub fn decode_history(buf: &mut Bytes) -> Result<Vec<(HostId, Vec<Message>)>, DecodeError> {
    need(buf, 4)?;
    let blocks = buf.get_u32();
    let mut history = Vec::new();
    for _ in 0..blocks {
        need(buf, 8)?;
        let peer = buf.get_u32();
        let count = buf.get_u32();
        let mut msgs = Vec::new();
        for _ in 0..count {
            msgs.push(Message::decode_framed(buf)?);
        }
        history.push((peer, msgs));
    }
    Ok(history)
}

/// FIFO broadcast over uniform reliable broadcast. Each message carries the
/// sender's whole history, so a receiver that missed or got ahead of some
/// message can fill the gap from whichever later message reaches it first.
///
/// Messages from a sender are delivered in the order that sender broadcast
/// them, each exactly once. Messages that arrive ahead of their turn wait in
/// a per-sender backlog until the gap closes.
#[derive(Clone, Debug)]
pub struct FifoBroadcast {
    urb: UniformReliableBroadcast,
    next_seq: u32,
    next: BTreeMap<HostId, u32>,
    history: History,
    backlog: BTreeMap<HostId, BTreeMap<u32, Message>>,
    delivered: HashSet<(HostId, u32)>,
}

impl FifoBroadcast {
    pub fn new(local: HostId, hosts: Arc<Hosts>, tuning: &Tuning) -> Result<Self, ConfigError> {
        Ok(FifoBroadcast {
            urb: UniformReliableBroadcast::new(local, hosts, tuning)?,
            next_seq: 1,
            next: BTreeMap::new(),
            history: History::new(),
            backlog: BTreeMap::new(),
            delivered: HashSet::new(),
        })
    }

    pub fn local(&self) -> HostId {
        self.urb.local()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Next seq expected from `sender`.
    pub fn next_expected(&self, sender: HostId) -> u32 {
        self.next.get(&sender).copied().unwrap_or(1)
    }

    /// Broadcasts `payload` under the next local seq, which is returned.
    pub fn broadcast(&mut self, payload: Bytes, now: Instant, out: &mut Vec<Transmit>) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = Message::data(self.local(), seq, payload);

        let mut body = BytesMut::new();
        let budget = HISTORY_BUDGET.saturating_sub(msg.payload.len());
        encode_history(&self.history, budget, &mut body);
        msg.encode_framed(&mut body);
        self.urb
            .broadcast(Message::data(self.local(), seq, body.freeze()), now, out);

        debug!("fifo broadcast seq {}", seq);
        self.history
            .entry(msg.sender_id)
            .or_insert_with(OrdMap::new)
            .insert(seq, msg);
        seq
    }

    /// Handles an envelope from `from`; returns whatever became deliverable,
    /// in delivery order.
    pub fn deliver(
        &mut self,
        from: HostId,
        envelope: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) -> Vec<Message> {
        let mut delivered = Vec::new();
        let carrier = match self.urb.deliver(from, envelope, now, out) {
            Some(carrier) => carrier,
            None => return delivered,
        };
        let mut body = carrier.payload;
        let (history, msg) = match decode_history(&mut body)
            .and_then(|h| Message::decode_framed(&mut body).map(|m| (h, m)))
        {
            Ok(decoded) => decoded,
            Err(err) => {
                trace!("dropping fifo message from {}: {}", carrier.sender_id, err);
                return delivered;
            }
        };
        if msg.sender_id != carrier.sender_id {
            trace!(
                "dropping fifo message from {} claiming sender {}",
                carrier.sender_id,
                msg.sender_id
            );
            return delivered;
        }

        let sender = msg.sender_id;
        self.accept(msg);
        self.drain(sender, &mut delivered);
        for (peer, msgs) in history {
            if !self.urb.hosts().contains(peer) {
                continue;
            }
            for m in msgs.into_iter().filter(|m| m.sender_id == peer) {
                self.accept(m);
            }
            self.drain(peer, &mut delivered);
        }
        self.drain(sender, &mut delivered);
        delivered
    }

    // Parks `msg` in its sender's backlog unless it was already delivered.
    fn accept(&mut self, msg: Message) {
        let key = (msg.sender_id, msg.seq_num);
        if self.delivered.contains(&key) || msg.seq_num < self.next_expected(msg.sender_id) {
            return;
        }
        self.backlog
            .entry(msg.sender_id)
            .or_default()
            .insert(msg.seq_num, msg);
    }

    fn drain(&mut self, sender: HostId, delivered: &mut Vec<Message>) {
        let next = self.next.entry(sender).or_insert(1);
        let backlog = match self.backlog.get_mut(&sender) {
            Some(backlog) => backlog,
            None => return,
        };
        while let Some(msg) = backlog.remove(&*next) {
            debug!("fifo deliver {} #{}", sender, *next);
            self.delivered.insert((sender, *next));
            self.history
                .entry(sender)
                .or_insert_with(OrdMap::new)
                .insert(*next, msg.clone());
            *next += 1;
            delivered.push(msg);
        }
        if backlog.is_empty() {
            self.backlog.remove(&sender);
        }
    }

    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.urb.handle_timeout(now, out)
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.urb.poll_timeout()
    }

    pub fn in_flight(&self) -> usize {
        self.urb.in_flight()
    }

    pub fn stop(&mut self) {
        self.urb.stop()
    }
}

impl Protocol for FifoBroadcast {
    type Command = Bytes;

    fn on_command(
        &mut self,
        payload: Bytes,
        now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let seq = self.broadcast(payload, now, out);
        events.push(Event::Broadcast { seq });
        Ok(())
    }

    fn on_message(
        &mut self,
        from: HostId,
        msg: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) {
        for msg in self.deliver(from, msg, now, out) {
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
        FifoBroadcast::poll_timeout(self)
    }

    fn stop(&mut self) {
        FifoBroadcast::stop(self)
    }
}
