// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::broadcast::beb::BestEffortBroadcast;
use crate::config::Tuning;
use crate::error::{ConfigError, Error};
use crate::host::{HostId, Hosts};
use crate::link::Transmit;
use crate::message::Message;
use crate::node::Protocol;
use crate::output::Event;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// A broadcast message is named by who originated it and the id its
/// originator gave it; relays never change either.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageKey {
    pub sender: HostId,
    pub id: u32,
}

impl MessageKey {
    pub fn of(msg: &Message) -> Self {
        MessageKey {
            sender: msg.sender_id,
            id: msg.id,
        }
    }
}

#[derive(Clone, Debug)]
struct Pending {
    message: Message,
    seen_by: BTreeSet<HostId>,
}

/// Uniform reliable broadcast. Every member relays a message the first time
/// it sees it, and delivers only once a majority of the group is known to
/// hold it. A message delivered anywhere, even by a process that then
/// crashes, is therefore held by at least one correct process and reaches
/// every correct process.
#[derive(Clone, Debug)]
pub struct UniformReliableBroadcast {
    beb: BestEffortBroadcast,
    next_id: u32,
    // original sender -> origin ids relayed
    forwarded: HashMap<HostId, HashSet<u32>>,
    pending: HashMap<MessageKey, Pending>,
    delivered: HashSet<MessageKey>,
}

impl UniformReliableBroadcast {
    pub fn new(local: HostId, hosts: Arc<Hosts>, tuning: &Tuning) -> Result<Self, ConfigError> {
        Ok(UniformReliableBroadcast {
            beb: BestEffortBroadcast::new(local, hosts, tuning)?,
            next_id: 0,
            forwarded: HashMap::new(),
            pending: HashMap::new(),
            delivered: HashSet::new(),
        })
    }

    pub fn local(&self) -> HostId {
        self.beb.local()
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        self.beb.hosts()
    }

    /// Originates `msg`: stamps our id as sender and a fresh origin id, then
    /// relays it to everyone.
    pub fn broadcast(
        &mut self,
        mut msg: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) -> MessageKey {
        self.next_id += 1;
        msg.id = self.next_id;
        msg.sender_id = self.local();
        let key = MessageKey::of(&msg);
        debug!("urb broadcast {:?}", key);
        self.forwarded.entry(key.sender).or_default().insert(key.id);
        self.pending.entry(key).or_insert_with(|| Pending {
            message: msg.clone(),
            seen_by: BTreeSet::new(),
        });
        self.relay(&msg, now, out);
        key
    }

    fn relay(&mut self, msg: &Message, now: Instant, out: &mut Vec<Transmit>) {
        let envelope = Message::data(self.local(), msg.seq_num, msg.encode());
        self.beb.broadcast(&envelope, now, out);
    }

    /// Handles an envelope that arrived from `from`. Returns the original
    /// message once, when a majority of the group has been seen holding it.
    pub fn deliver(
        &mut self,
        from: HostId,
        envelope: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
    ) -> Option<Message> {
        let envelope = self.beb.deliver(from, envelope, out)?;
        let inner = match Message::decode(envelope.payload) {
            Ok(inner) => inner,
            Err(err) => {
                trace!("dropping relay from {}: {}", from, err);
                return None;
            }
        };
        if !self.hosts().contains(inner.sender_id) {
            trace!("dropping relay of unknown origin {}", inner.sender_id);
            return None;
        }
        let key = MessageKey::of(&inner);
        if self.delivered.contains(&key) {
            return None;
        }
        let entry = self.pending.entry(key).or_insert_with(|| Pending {
            message: inner.clone(),
            seen_by: BTreeSet::new(),
        });
        entry.seen_by.insert(from);
        trace!("{:?} held by {:?}", key, entry.seen_by);
        if self.forwarded.entry(key.sender).or_default().insert(key.id) {
            self.relay(&inner, now, out);
        }
        self.check_deliver(key)
    }

    fn check_deliver(&mut self, key: MessageKey) -> Option<Message> {
        let quorum = self.beb.quorum();
        let ready = self
            .pending
            .get(&key)
            .map_or(false, |p| p.seen_by.len() >= quorum);
        if !ready {
            return None;
        }
        let pending = self.pending.remove(&key)?;
        self.delivered.insert(key);
        debug!("urb deliver {:?}", key);
        Some(pending.message)
    }

    pub fn is_delivered(&self, key: &MessageKey) -> bool {
        self.delivered.contains(key)
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

/// Broadcasts a payload; the origin id doubles as the logged sequence number.
impl Protocol for UniformReliableBroadcast {
    type Command = Bytes;

    fn on_command(
        &mut self,
        payload: Bytes,
        now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let seq = self.next_id + 1;
        let key = self.broadcast(Message::data(self.local(), seq, payload), now, out);
        events.push(Event::Broadcast { seq: key.id });
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
        if let Some(msg) = self.deliver(from, msg, now, out) {
            events.push(Event::Deliver {
                sender: msg.sender_id,
                seq: msg.id,
            });
        }
    }

    fn on_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.handle_timeout(now, out)
    }

    fn poll_timeout(&self) -> Option<Instant> {
        UniformReliableBroadcast::poll_timeout(self)
    }

    fn stop(&mut self) {
        UniformReliableBroadcast::stop(self)
    }
}
