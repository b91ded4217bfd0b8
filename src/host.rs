// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::error::ConfigError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;

/// Hosts are numbered 1..N; 0 is reserved to mean "no receiver".
pub type HostId = u32;

pub const NO_HOST: HostId = 0;

/// A process taking part in the group. Both the id and the address identify
/// it: two `HostIdentity`s are equal only if both agree.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostIdentity {
    pub id: HostId,
    pub addr: SocketAddr,
}

impl HostIdentity {
    pub fn new(id: HostId, addr: SocketAddr) -> Self {
        HostIdentity { id, addr }
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.id, self.addr)
    }
}

/// Size of a majority of `n` processes.
#[must_use]
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// `Hosts` is the fixed, statically-known group. It is built once at startup
/// and shared read-only between every layer of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hosts {
    by_id: BTreeMap<HostId, HostIdentity>,
    by_addr: HashMap<SocketAddr, HostId>,
}

impl Hosts {
    pub fn new<I>(hosts: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = HostIdentity>,
    {
        let mut table = Hosts::default();
        for host in hosts {
            if host.id == NO_HOST {
                return Err(ConfigError::ZeroId);
            }
            if table.by_id.contains_key(&host.id) {
                return Err(ConfigError::DuplicateId(host.id));
            }
            if table.by_addr.contains_key(&host.addr) {
                return Err(ConfigError::DuplicateAddr(host.addr));
            }
            table.by_addr.insert(host.addr, host.id);
            table.by_id.insert(host.id, host);
        }
        Ok(table)
    }

    pub fn get(&self, id: HostId) -> Option<&HostIdentity> {
        self.by_id.get(&id)
    }

    pub fn by_addr(&self, addr: &SocketAddr) -> Option<&HostIdentity> {
        self.by_addr.get(addr).and_then(|id| self.by_id.get(id))
    }

    /// Attributes a datagram to a host: the source address and the id the
    /// sender claims must name the same member.
    pub fn identify(&self, addr: &SocketAddr, claimed: HostId) -> Option<&HostIdentity> {
        self.by_addr(addr).filter(|h| h.id == claimed)
    }

    pub fn contains(&self, id: HostId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Members in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &HostIdentity> {
        self.by_id.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = HostId> + '_ {
        self.by_id.keys().copied()
    }

    /// Majority of the full group, self included.
    #[must_use]
    pub fn quorum(&self) -> usize {
        quorum(self.len())
    }
}
