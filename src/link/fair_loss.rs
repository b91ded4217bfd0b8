// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::host::HostIdentity;
use crate::message::Message;
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::trace;

/// One datagram waiting to be written to the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub datagram: Bytes,
}

/// The bottom of the stack: each send becomes exactly one datagram, with no
/// retry and no dedup. Whatever the network does to it is passed upward.
#[derive(Clone, Debug)]
pub struct FairLossLink {
    peer: HostIdentity,
}

impl FairLossLink {
    pub fn new(peer: HostIdentity) -> Self {
        FairLossLink { peer }
    }

    pub fn peer(&self) -> &HostIdentity {
        &self.peer
    }

    pub fn send(&self, msg: &Message, out: &mut Vec<Transmit>) {
        trace!("fair-loss send {} to {}", msg, self.peer);
        out.push(Transmit {
            to: self.peer.addr,
            datagram: msg.encode(),
        });
    }

    /// Decodes an inbound datagram. Malformed input is dropped here and never
    /// reaches the layers above.
    pub fn deliver(datagram: Bytes) -> Option<Message> {
        match Message::decode(datagram) {
            Ok(msg) => Some(msg),
            Err(err) => {
                trace!("dropping malformed datagram: {}", err);
                None
            }
        }
    }
}
