// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::error::{ConfigError, Error};
use crate::failure::{PerfectFailureDetector, Suspicion};
use crate::host::{HostId, HostIdentity, Hosts};
use crate::link::{FairLossLink, Transmit};
use crate::message::Message;
use crate::output::Event;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, trace};

/// The seam between a `Node` and whichever stack it runs. Implementations
/// never perform I/O: datagrams go into `out`, observable outcomes into
/// `events`, and the node decides when to call back in.
pub trait Protocol {
    /// What the local application can ask for.
    type Command;

    fn on_command(
        &mut self,
        cmd: Self::Command,
        now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    ) -> Result<(), Error>;

    /// A decoded message from a known member of the group.
    fn on_message(
        &mut self,
        from: HostId,
        msg: Message,
        now: Instant,
        out: &mut Vec<Transmit>,
        events: &mut Vec<Event>,
    );

    fn on_timeout(&mut self, now: Instant, out: &mut Vec<Transmit>);

    /// Earliest instant `on_timeout` has work to do.
    fn poll_timeout(&self) -> Option<Instant>;

    /// Cancels every timer; nothing is retried afterwards.
    fn stop(&mut self);
}

/// One process: a protocol stack plus an optional failure detector, fed
/// datagrams, commands and clock ticks from outside.
///
/// Inbound datagrams are attributed to a member only when the source address
/// and the sender id in the header agree; anything else is dropped.
/// Heartbeat traffic goes to the failure detector, everything else to the
/// protocol.
pub struct Node<P: Protocol> {
    local: HostIdentity,
    hosts: Arc<Hosts>,
    protocol: P,
    detector: Option<PerfectFailureDetector>,
    outbox: Vec<Transmit>,
    events: Vec<Event>,
    suspicions: Vec<Suspicion>,
}

impl<P: Protocol> Node<P> {
    pub fn new(local: HostId, hosts: Arc<Hosts>, protocol: P) -> Result<Self, ConfigError> {
        let local = *hosts.get(local).ok_or(ConfigError::UnknownHost(local))?;
        Ok(Node {
            local,
            hosts,
            protocol,
            detector: None,
            outbox: Vec::new(),
            events: Vec::new(),
            suspicions: Vec::new(),
        })
    }

    pub fn with_failure_detector(mut self, detector: PerfectFailureDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn local(&self) -> &HostIdentity {
        &self.local
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn detector(&self) -> Option<&PerfectFailureDetector> {
        self.detector.as_ref()
    }

    pub fn start(&mut self, now: Instant) {
        info!("node {} starting", self.local);
        if let Some(detector) = self.detector.as_mut() {
            detector.start(now);
        }
    }

    pub fn handle_datagram(&mut self, from: SocketAddr, datagram: Bytes, now: Instant) {
        let msg = match FairLossLink::deliver(datagram) {
            Some(msg) => msg,
            None => return,
        };
        let sender = match self.hosts.identify(&from, msg.sender_id) {
            Some(sender) => sender.id,
            None => {
                trace!("dropping {} from {}: sender mismatch", msg, from);
                return;
            }
        };
        if msg.kind.is_control() {
            if let Some(detector) = self.detector.as_mut() {
                detector.deliver(sender, msg, now, &mut self.outbox);
            }
            return;
        }
        self.protocol
            .on_message(sender, msg, now, &mut self.outbox, &mut self.events);
    }

    pub fn handle_command(&mut self, cmd: P::Command, now: Instant) -> Result<(), Error> {
        self.protocol
            .on_command(cmd, now, &mut self.outbox, &mut self.events)
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.protocol.on_timeout(now, &mut self.outbox);
        if let Some(detector) = self.detector.as_mut() {
            let changes = detector.handle_timeout(now, &mut self.outbox);
            self.suspicions.extend(changes);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        let detector = self.detector.as_ref().and_then(|d| d.poll_timeout());
        self.protocol.poll_timeout().into_iter().chain(detector).min()
    }

    pub fn drain_transmits(&mut self) -> std::vec::Drain<'_, Transmit> {
        self.outbox.drain(..)
    }

    pub fn drain_events(&mut self) -> std::vec::Drain<'_, Event> {
        self.events.drain(..)
    }

    pub fn drain_suspicions(&mut self) -> std::vec::Drain<'_, Suspicion> {
        self.suspicions.drain(..)
    }

    pub fn stop(&mut self) {
        info!("node {} stopping", self.local);
        self.protocol.stop();
        if let Some(detector) = self.detector.as_mut() {
            detector.stop();
        }
    }
}
