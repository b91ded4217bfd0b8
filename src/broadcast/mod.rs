// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Broadcasts of increasing strength, each owning the one below it.

mod beb;
mod fifo;
mod urb;

pub use beb::BestEffortBroadcast;
pub use fifo::{decode_history, encode_history, FifoBroadcast, History, HISTORY_BUDGET};
pub use urb::{MessageKey, UniformReliableBroadcast};
