// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::agreement::Value;
use crate::error::ConfigError;
use crate::host::{HostId, HostIdentity, Hosts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Timing knobs. Every field has a default, so an empty file is valid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// How long a stubborn link waits for an ACK before resending.
    pub retransmit_ms: u64,
    /// Initial heartbeat period and timeout of the failure detector.
    pub heartbeat_ms: u64,
    /// Unanswered heartbeats remembered per peer.
    pub heartbeat_window: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            retransmit_ms: 100,
            heartbeat_ms: 500,
            heartbeat_window: 8,
        }
    }
}

impl Tuning {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&read(path)?)
    }

    /// Periods and the heartbeat window must be positive.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let tuning: Tuning = toml::from_str(text)?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("retransmit_ms", self.retransmit_ms),
            ("heartbeat_ms", self.heartbeat_ms),
            ("heartbeat_window", self.heartbeat_window as u64),
        ];
        match fields.iter().find(|(_, v)| *v == 0) {
            Some((field, _)) => Err(ConfigError::ZeroTuning(*field)),
            None => Ok(()),
        }
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

/// What a run does once the node is up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Every process but `receiver` sends `messages` messages to it.
    Links { messages: u32, receiver: HostId },
    /// Every process broadcasts `messages` messages.
    Fifo { messages: u32 },
    /// `proposals[k]` is proposed for slot `k + 1`.
    Lattice { proposals: Vec<BTreeSet<Value>> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Links,
    Fifo,
    Lattice,
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// Non-blank lines, numbered from 1.
fn lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
}

struct Parser<'a> {
    path: &'a Path,
}

impl<'a> Parser<'a> {
    fn error(&self, line: usize, reason: impl Into<String>) -> ConfigError {
        ConfigError::Parse {
            path: self.path.to_path_buf(),
            line,
            reason: reason.into(),
        }
    }

    fn field<T: FromStr>(
        &self,
        line: usize,
        word: Option<&str>,
        what: &str,
    ) -> Result<T, ConfigError> {
        let word = word.ok_or_else(|| self.error(line, format!("missing {}", what)))?;
        word.parse()
            .map_err(|_| self.error(line, format!("bad {} {:?}", what, word)))
    }

    fn numbers<T: FromStr>(
        &self,
        line: usize,
        text: &str,
        what: &str,
    ) -> Result<Vec<T>, ConfigError> {
        text.split_whitespace()
            .map(|w| self.field(line, Some(w), what))
            .collect()
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let unresolved = || ConfigError::Unresolved {
        host: host.to_string(),
        port,
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(unresolved)
}

/// Parses a hosts file of `id host port` lines.
pub fn parse_hosts(path: &Path, text: &str) -> Result<Hosts, ConfigError> {
    let p = Parser { path };
    let mut hosts = Vec::new();
    for (n, line) in lines(text) {
        let mut words = line.split_whitespace();
        let id: HostId = p.field(n, words.next(), "host id")?;
        let host: String = p.field(n, words.next(), "host name")?;
        let port: u16 = p.field(n, words.next(), "port")?;
        if words.next().is_some() {
            return Err(p.error(n, "expected `id host port`"));
        }
        hosts.push(HostIdentity::new(id, resolve(&host, port)?));
    }
    Hosts::new(hosts)
}

pub fn load_hosts(path: &Path) -> Result<Hosts, ConfigError> {
    parse_hosts(path, &read(path)?)
}

impl Scenario {
    pub fn parse(mode: Mode, path: &Path, text: &str) -> Result<Self, ConfigError> {
        let p = Parser { path };
        let mut lines = lines(text);
        let (n, header) = lines.next().ok_or_else(|| p.error(1, "empty config"))?;
        match mode {
            Mode::Links => {
                let nums: Vec<u32> = p.numbers(n, header, "number")?;
                match nums[..] {
                    [messages, receiver] => Ok(Scenario::Links { messages, receiver }),
                    _ => Err(p.error(n, "expected `messages receiver`")),
                }
            }
            Mode::Fifo => {
                let nums: Vec<u32> = p.numbers(n, header, "number")?;
                match nums[..] {
                    [messages] => Ok(Scenario::Fifo { messages }),
                    _ => Err(p.error(n, "expected `messages`")),
                }
            }
            Mode::Lattice => {
                let nums: Vec<usize> = p.numbers(n, header, "number")?;
                let (slots, max_values) = match nums[..] {
                    [slots, max_values, _distinct] => (slots, max_values),
                    _ => return Err(p.error(n, "expected `slots max-values distinct-values`")),
                };
                let mut proposals = Vec::with_capacity(slots);
                for (n, line) in lines.by_ref().take(slots) {
                    let values: Vec<Value> = p.numbers(n, line, "value")?;
                    if values.len() > max_values {
                        return Err(p.error(n, format!("more than {} values", max_values)));
                    }
                    proposals.push(values.into_iter().collect());
                }
                if proposals.len() != slots {
                    return Err(p.error(n, format!("expected {} proposal lines", slots)));
                }
                Ok(Scenario::Lattice { proposals })
            }
        }
    }

    pub fn load(mode: Mode, path: &Path) -> Result<Self, ConfigError> {
        Self::parse(mode, path, &read(path)?)
    }
}

/// Everything a process needs at startup.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub local: HostId,
    pub hosts: Hosts,
    pub scenario: Scenario,
    pub tuning: Tuning,
    pub output: PathBuf,
}

impl NodeConfig {
    pub fn local_identity(&self) -> Result<HostIdentity, ConfigError> {
        self.hosts
            .get(self.local)
            .copied()
            .ok_or(ConfigError::UnknownHost(self.local))
    }
}
