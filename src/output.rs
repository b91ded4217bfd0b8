// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::agreement::{Slot, Value};
use crate::host::HostId;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tokio::sync::mpsc;

/// Something worth recording about a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// We sent or broadcast `seq`; point-to-point sends are logged the same.
    Broadcast { seq: u32 },
    Deliver { sender: HostId, seq: u32 },
    Decide { slot: Slot, values: BTreeSet<Value> },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Broadcast { seq } => write!(f, "b {}", seq),
            Event::Deliver { sender, seq } => write!(f, "d {} {}", sender, seq),
            Event::Decide { values, .. } => write!(f, "{}", values.iter().join(" ")),
        }
    }
}

/// Where events end up. Decisions are indexed by slot and must come out in
/// slot order even though slots decide in any order.
pub trait EventSink {
    fn record(&mut self, event: &Event) -> io::Result<()>;
    fn record_indexed(&mut self, index: u32, event: &Event) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;

    /// Routes decisions to `record_indexed` and everything else to `record`.
    fn record_event(&mut self, event: &Event) -> io::Result<()> {
        match event {
            Event::Decide { slot, .. } => self.record_indexed(*slot, event),
            _ => self.record(event),
        }
    }
}

/// Line-per-event log. Indexed events starting from slot 1 are written as
/// soon as they extend the contiguous run; the rest wait for `flush`.
#[derive(Debug)]
pub struct OutputLog<W: Write> {
    out: BufWriter<W>,
    next_index: u32,
    pending: BTreeMap<u32, String>,
}

impl OutputLog<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(OutputLog::new(File::create(path)?))
    }
}

impl<W: Write> OutputLog<W> {
    pub fn new(writer: W) -> Self {
        OutputLog {
            out: BufWriter::new(writer),
            next_index: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Flushes and hands back the writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        EventSink::flush(&mut self)?;
        self.out.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write> EventSink for OutputLog<W> {
    fn record(&mut self, event: &Event) -> io::Result<()> {
        writeln!(self.out, "{}", event)
    }

    fn record_indexed(&mut self, index: u32, event: &Event) -> io::Result<()> {
        if index < self.next_index {
            return Ok(());
        }
        self.pending.insert(index, event.to_string());
        while let Some(line) = self.pending.remove(&self.next_index) {
            writeln!(self.out, "{}", line)?;
            self.next_index += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        for (index, line) in std::mem::take(&mut self.pending) {
            writeln!(self.out, "{}", line)?;
            self.next_index = index + 1;
        }
        self.out.flush()
    }
}

/// Keeps everything in memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryLog {
    pub events: Vec<Event>,
    pub indexed: BTreeMap<u32, Event>,
}

impl EventSink for MemoryLog {
    fn record(&mut self, event: &Event) -> io::Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn record_indexed(&mut self, index: u32, event: &Event) -> io::Result<()> {
        self.indexed.entry(index).or_insert_with(|| event.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Forwards every event to a channel, for watching a running node.
impl EventSink for mpsc::UnboundedSender<Event> {
    fn record(&mut self, event: &Event) -> io::Result<()> {
        self.send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event receiver dropped"))
    }

    fn record_indexed(&mut self, _index: u32, event: &Event) -> io::Result<()> {
        self.record(event)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
