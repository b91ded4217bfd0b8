// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use std::collections::BTreeSet;

/// A set of link ids. Link ids are handed out densely from 1, so the set is
/// stored as the highest id below which every id is present, plus the sparse
/// ids above it. Membership is exact; nothing is ever evicted.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct DedupWindow {
    floor: u32,
    above: BTreeSet<u32>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u32) -> bool {
        id <= self.floor || self.above.contains(&id)
    }

    /// Returns true if `id` was not already present.
    pub fn insert(&mut self, id: u32) -> bool {
        if self.contains(id) {
            return false;
        }
        self.above.insert(id);
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
        true
    }

    /// Every id in `1..=floor` is present.
    pub fn floor(&self) -> u32 {
        self.floor
    }

    pub fn len(&self) -> usize {
        self.floor as usize + self.above.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids held individually, i.e. the holes' worth of bookkeeping.
    pub fn sparse(&self) -> usize {
        self.above.len()
    }
}
