// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Task {
    period: Duration,
    due: Instant,
}

/// `Timers` holds recurring timers keyed by `K`. It never looks at a clock on
/// its own: callers ask for the next deadline, wait for it however they like,
/// and then hand the current time to `expired`, which returns every key that
/// came due and re-arms it one period later.
///
/// Keys are unique; scheduling an existing key replaces its timer.
#[derive(Clone, Debug)]
pub struct Timers<K: Ord + Clone + Debug> {
    tasks: BTreeMap<K, Task>,
    queue: BTreeSet<(Instant, K)>,
}

impl<K: Ord + Clone + Debug> Default for Timers<K> {
    fn default() -> Self {
        Timers {
            tasks: BTreeMap::new(),
            queue: BTreeSet::new(),
        }
    }
}

impl<K: Ord + Clone + Debug> Timers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `key` to fire first at `first` and then every `period`.
    pub fn schedule(&mut self, key: K, first: Instant, period: Duration) {
        self.cancel(&key);
        self.queue.insert((first, key.clone()));
        self.tasks.insert(key, Task { period, due: first });
    }

    /// Changes the period of a live timer; the next firing is one new period
    /// from `now`. Returns false if `key` is not scheduled.
    pub fn reschedule(&mut self, key: &K, period: Duration, now: Instant) -> bool {
        if !self.tasks.contains_key(key) {
            return false;
        }
        self.schedule(key.clone(), now + period, period);
        true
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.tasks.remove(key) {
            Some(task) => {
                self.queue.remove(&(task.due, key.clone()));
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.tasks.clear();
        self.queue.clear();
    }

    pub fn contains(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn period(&self, key: &K) -> Option<Duration> {
        self.tasks.get(key).map(|t| t.period)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().next().map(|(due, _)| *due)
    }

    /// Keys due at or before `now`, in deadline order, each at most once per
    /// call. Each is re-armed at its next period boundary; boundaries already
    /// in the past are skipped rather than fired in a burst.
    pub fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut fired = Vec::new();
        while let Some((due, key)) = self.queue.iter().next().cloned() {
            if due > now {
                break;
            }
            self.queue.remove(&(due, key.clone()));
            fired.push((due, key));
        }
        for (due, key) in fired.iter() {
            if let Some(task) = self.tasks.get_mut(key) {
                let mut next = *due + task.period;
                if next <= now {
                    next = now + task.period;
                }
                task.due = next;
                self.queue.insert((next, key.clone()));
            }
        }
        fired.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn fires_and_rearms() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule("a", t0, 10 * MS);
        timers.schedule("b", t0 + 5 * MS, 10 * MS);
        assert_eq!(timers.next_deadline(), Some(t0));
        assert_eq!(timers.expired(t0), vec!["a"]);
        assert_eq!(timers.expired(t0 + 4 * MS), Vec::<&str>::new());
        assert_eq!(timers.expired(t0 + 10 * MS), vec!["b", "a"]);
        assert_eq!(timers.next_deadline(), Some(t0 + 15 * MS));
    }

    #[test]
    fn missed_periods_fire_once() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(1u32, t0, 10 * MS);
        assert_eq!(timers.expired(t0 + 35 * MS), vec![1]);
        assert_eq!(timers.next_deadline(), Some(t0 + 45 * MS));
    }

    #[test]
    fn zero_period_fires_once_per_call() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule('z', t0, Duration::ZERO);
        timers.schedule('y', t0, 10 * MS);
        assert_eq!(timers.expired(t0), vec!['y', 'z']);
        assert_eq!(timers.next_deadline(), Some(t0));
        assert_eq!(timers.expired(t0), vec!['z']);
        assert_eq!(timers.expired(t0 + MS), vec!['z']);
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn reschedule_and_cancel() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(1u32, t0 + 10 * MS, 10 * MS);
        assert!(timers.reschedule(&1, 20 * MS, t0 + 3 * MS));
        assert_eq!(timers.period(&1), Some(20 * MS));
        assert!(timers.expired(t0 + 10 * MS).is_empty());
        assert_eq!(timers.expired(t0 + 23 * MS), vec![1]);
        assert!(timers.cancel(&1));
        assert!(!timers.cancel(&1));
        assert!(!timers.reschedule(&1, 20 * MS, t0));
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
