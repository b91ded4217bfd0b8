// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::config::Tuning;
use crate::host::{HostId, Hosts};
use crate::link::{PerfectLinks, Transmit};
use crate::message::{Message, MessageKind};
use crate::timer::Timers;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
enum Beat {
    Send(HostId),
    Monitor(HostId),
}

/// A change in what the detector believes about a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suspicion {
    Suspect(HostId),
    /// The peer answered again; it is now watched at the doubled `timeout`.
    Restore { peer: HostId, timeout: Duration },
}

#[derive(Clone, Debug, Default)]
struct PeerWatch {
    outstanding: BTreeSet<u32>,
    acked: BTreeSet<u32>,
}

/// Heartbeat-based failure detector. For each peer it runs two timers with
/// the same period: one sends a heartbeat, the other checks that at least one
/// outstanding heartbeat was answered since it last looked. A silent peer is
/// suspected; a suspected peer that answers again is restored, and its
/// period doubles so the same delay does not trip the detector twice.
///
/// The detector has its own links to every peer other than itself, which
/// only ever carry heartbeats and their replies.
#[derive(Clone, Debug)]
pub struct PerfectFailureDetector {
    local: HostId,
    links: PerfectLinks,
    window: usize,
    timeouts: BTreeMap<HostId, Duration>,
    watches: BTreeMap<HostId, PeerWatch>,
    suspected: BTreeSet<HostId>,
    timers: Timers<Beat>,
}

impl PerfectFailureDetector {
    pub fn new(local: HostId, hosts: &Hosts, tuning: &Tuning) -> Self {
        let peers: Vec<_> = hosts.iter().filter(|h| h.id != local).copied().collect();
        let timeouts = peers
            .iter()
            .map(|p| (p.id, tuning.heartbeat_timeout()))
            .collect();
        let watches = peers.iter().map(|p| (p.id, PeerWatch::default())).collect();
        PerfectFailureDetector {
            local,
            links: PerfectLinks::to_peers(local, peers, tuning),
            window: tuning.heartbeat_window.max(1),
            timeouts,
            watches,
            suspected: BTreeSet::new(),
            timers: Timers::new(),
        }
    }

    /// Arms both timers for every peer: heartbeats go out immediately, the
    /// first check happens one period later.
    pub fn start(&mut self, now: Instant) {
        for (peer, timeout) in self.timeouts.iter() {
            self.timers.schedule(Beat::Send(*peer), now, *timeout);
            self.timers
                .schedule(Beat::Monitor(*peer), now + *timeout, *timeout);
        }
    }

    pub fn stop(&mut self) {
        self.timers.cancel_all();
        self.links.stop();
    }

    pub fn suspected(&self) -> &BTreeSet<HostId> {
        &self.suspected
    }

    pub fn is_suspected(&self, peer: HostId) -> bool {
        self.suspected.contains(&peer)
    }

    pub fn timeout(&self, peer: HostId) -> Option<Duration> {
        self.timeouts.get(&peer).copied()
    }

    pub fn handle_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>) -> Vec<Suspicion> {
        let mut changes = Vec::new();
        self.links.handle_timeout(now, out);
        for beat in self.timers.expired(now) {
            match beat {
                Beat::Send(peer) => self.send_heartbeat(peer, now, out),
                Beat::Monitor(peer) => {
                    if let Some(change) = self.check(peer, now) {
                        changes.push(change);
                    }
                }
            }
        }
        changes
    }

    fn send_heartbeat(&mut self, peer: HostId, now: Instant, out: &mut Vec<Transmit>) {
        let id = match self.links.send(peer, Message::heartbeat(self.local), now, out) {
            Ok(id) => id,
            Err(err) => {
                warn!("heartbeat to {} not sent: {}", peer, err);
                return;
            }
        };
        let window = self.window;
        if let Some(watch) = self.watches.get_mut(&peer) {
            watch.outstanding.insert(id);
            while watch.outstanding.len() > window {
                if let Some(oldest) = watch.outstanding.iter().next().copied() {
                    watch.outstanding.remove(&oldest);
                    watch.acked.remove(&oldest);
                }
            }
        }
    }

    fn check(&mut self, peer: HostId, now: Instant) -> Option<Suspicion> {
        let watch = self.watches.get_mut(&peer)?;
        let answered: BTreeSet<u32> = watch
            .outstanding
            .intersection(&watch.acked)
            .copied()
            .collect();
        if answered.is_empty() {
            if self.suspected.insert(peer) {
                info!("suspecting {}", peer);
                return Some(Suspicion::Suspect(peer));
            }
            trace!("{} still silent", peer);
            return None;
        }
        for id in answered.iter() {
            watch.outstanding.remove(id);
            watch.acked.remove(id);
        }
        if !self.suspected.remove(&peer) {
            return None;
        }
        let timeout = self.timeouts.get_mut(&peer)?;
        *timeout *= 2;
        let timeout = *timeout;
        self.timers.reschedule(&Beat::Send(peer), timeout, now);
        self.timers.reschedule(&Beat::Monitor(peer), timeout, now);
        info!("{} answered again, timeout now {:?}", peer, timeout);
        Some(Suspicion::Restore { peer, timeout })
    }

    /// Handles heartbeat traffic from `from`. Heartbeats are answered at once;
    /// replies count only for heartbeats still outstanding.
    pub fn deliver(&mut self, from: HostId, msg: Message, now: Instant, out: &mut Vec<Transmit>) {
        let msg = match self.links.deliver(from, msg, out) {
            Some(msg) => msg,
            None => return,
        };
        match msg.kind {
            MessageKind::Heartbeat => {
                let reply = msg.heartbeat_ack(self.local);
                if let Err(err) = self.links.send(from, reply, now, out) {
                    trace!("cannot answer heartbeat from {}: {}", from, err);
                }
            }
            MessageKind::HeartbeatAck => {
                let id = match msg.acked_id() {
                    Ok(id) => id,
                    Err(err) => {
                        trace!("dropping heartbeat reply from {}: {}", from, err);
                        return;
                    }
                };
                if let Some(watch) = self.watches.get_mut(&from) {
                    if watch.outstanding.contains(&id) {
                        watch.acked.insert(id);
                    }
                }
            }
            _ => trace!("failure detector ignoring {}", msg),
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        let links = self.links.poll_timeout();
        let beats = self.timers.next_deadline();
        links.into_iter().chain(beats).min()
    }
}
