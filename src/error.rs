// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::host::HostId;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons an inbound datagram is not a well-formed message. These never
/// travel further than a trace log: malformed input is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("unknown agreement message tag {0}")]
    UnknownTag(u32),
    #[error("{0} trailing bytes after message")]
    Trailing(usize),
}

/// Startup failures; all of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("host ids must be positive")]
    ZeroId,
    #[error("duplicate host id {0}")]
    DuplicateId(HostId),
    #[error("duplicate host address {0}")]
    DuplicateAddr(SocketAddr),
    #[error("host {0} is not in the host table")]
    UnknownHost(HostId),
    #[error("could not resolve {host}:{port}")]
    Unresolved { host: String, port: u16 },
    #[error("tuning value {0} must be positive")]
    ZeroTuning(&'static str),
    #[error("invalid tuning file: {0}")]
    Tuning(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("slot {0} has already decided")]
    AlreadyDecided(u32),
    #[error("no link to host {0}")]
    UnknownHost(HostId),
}
