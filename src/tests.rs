// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::*;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(10);

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lattice_bcast=debug")),
        )
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}

#[test]
fn log_filters_parse() {
    let _guard = init_tracing();
    for directive in ["info", "lattice_bcast=trace", "warn,lattice_bcast::failure=debug"] {
        assert!(directive.parse::<EnvFilter>().is_ok(), "{}", directive);
    }
}

fn hosts(n: u32) -> Arc<Hosts> {
    Arc::new(
        Hosts::new((1..=n).map(|id| {
            HostIdentity::new(id, SocketAddr::from(([127, 0, 0, 1], 11000 + id as u16)))
        }))
        .unwrap(),
    )
}

fn tuning() -> Tuning {
    Tuning {
        retransmit_ms: 50,
        heartbeat_ms: 100,
        heartbeat_window: 8,
    }
}

fn set(vs: &[Value]) -> BTreeSet<Value> {
    vs.iter().copied().collect()
}

/// Order in which one tick's worth of datagrams is handed out.
enum Order {
    Sent,
    /// Each receiver hears from itself first, then from the next id up,
    /// wrapping around.
    Rotating,
    Shuffled,
}

enum Loss {
    Nothing,
    /// Every nth datagram is dropped, but no datagram is dropped twice.
    EveryNthOnce(usize),
    Random(f64),
}

/// A simulated network. Time moves in fixed ticks; everything sent during a
/// tick arrives during the next one, unless the loss policy or an isolated
/// endpoint eats it.
struct Network<P: Protocol> {
    hosts: Arc<Hosts>,
    start: Instant,
    now: Instant,
    nodes: BTreeMap<HostId, Node<P>>,
    in_flight: Vec<(HostId, Transmit)>,
    order: Order,
    loss: Loss,
    rng: StdRng,
    sent: usize,
    dropped: HashSet<Bytes>,
    isolated: BTreeSet<HostId>,
    // drops every datagram to a host it returns true for
    blocked: Option<fn(HostId, &Transmit) -> bool>,
    logs: BTreeMap<HostId, Vec<Event>>,
    suspicions: BTreeMap<HostId, Vec<(Duration, Suspicion)>>,
}

impl<P: Protocol> Network<P> {
    fn new(hosts: &Arc<Hosts>, mut make: impl FnMut(HostId) -> Node<P>) -> Self {
        let start = Instant::now();
        let mut nodes = BTreeMap::new();
        for id in hosts.ids() {
            let mut node = make(id);
            node.start(start);
            nodes.insert(id, node);
        }
        Network {
            hosts: hosts.clone(),
            start,
            now: start,
            nodes,
            in_flight: Vec::new(),
            order: Order::Sent,
            loss: Loss::Nothing,
            rng: StdRng::seed_from_u64(0),
            sent: 0,
            dropped: HashSet::new(),
            isolated: BTreeSet::new(),
            blocked: None,
            logs: BTreeMap::new(),
            suspicions: BTreeMap::new(),
        }
    }

    fn with(mut self, order: Order, loss: Loss, seed: u64) -> Self {
        self.order = order;
        self.loss = loss;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    fn command(&mut self, id: HostId, cmd: P::Command) {
        let now = self.now;
        self.nodes
            .get_mut(&id)
            .unwrap()
            .handle_command(cmd, now)
            .unwrap();
        self.collect();
    }

    fn collect(&mut self) {
        let elapsed = self.elapsed();
        for (id, node) in self.nodes.iter_mut() {
            for t in node.drain_transmits() {
                self.in_flight.push((*id, t));
            }
            self.logs.entry(*id).or_default().extend(node.drain_events());
            let changes = node.drain_suspicions().map(|s| (elapsed, s));
            self.suspicions.entry(*id).or_default().extend(changes);
        }
    }

    fn dest(&self, t: &Transmit) -> HostId {
        self.hosts.by_addr(&t.to).unwrap().id
    }

    fn lost(&mut self, from: HostId, to: HostId, t: &Transmit) -> bool {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            return true;
        }
        if self.blocked.map_or(false, |blocked| blocked(to, t)) {
            return true;
        }
        self.sent += 1;
        match self.loss {
            Loss::Nothing => false,
            Loss::EveryNthOnce(n) => {
                self.sent % n == 0 && self.dropped.insert(t.datagram.clone())
            }
            Loss::Random(p) => self.rng.gen_bool(p),
        }
    }

    fn step(&mut self) {
        self.now += TICK;
        let now = self.now;
        for node in self.nodes.values_mut() {
            node.handle_timeout(now);
        }

        let mut batch = std::mem::take(&mut self.in_flight);
        match self.order {
            Order::Sent => (),
            Order::Shuffled => batch.shuffle(&mut self.rng),
            Order::Rotating => {
                let n = self.hosts.len() as u32;
                let hosts = self.hosts.clone();
                batch.sort_by_key(|(from, t)| {
                    let to = hosts.by_addr(&t.to).unwrap().id;
                    (to, (from + n - to) % n)
                });
            }
        }
        for (from, t) in batch {
            let to = self.dest(&t);
            if self.lost(from, to, &t) {
                debug!("network dropped datagram {} -> {}", from, to);
                continue;
            }
            let from_addr = self.hosts.get(from).unwrap().addr;
            self.nodes
                .get_mut(&to)
                .unwrap()
                .handle_datagram(from_addr, t.datagram, now);
        }
        self.collect();
    }

    fn run_until(&mut self, max_steps: usize, done: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    fn run_for(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    fn deliveries(&self, id: HostId) -> Vec<(HostId, u32)> {
        self.logs
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|e| match e {
                Event::Deliver { sender, seq } => Some((*sender, *seq)),
                _ => None,
            })
            .collect()
    }

    fn decisions(&self, id: HostId) -> BTreeMap<Slot, Vec<BTreeSet<Value>>> {
        let mut out: BTreeMap<Slot, Vec<BTreeSet<Value>>> = BTreeMap::new();
        for e in self.logs.get(&id).into_iter().flatten() {
            if let Event::Decide { slot, values } = e {
                out.entry(*slot).or_default().push(values.clone());
            }
        }
        out
    }
}

fn comparable(a: &BTreeSet<Value>, b: &BTreeSet<Value>) -> bool {
    a.is_subset(b) || b.is_subset(a)
}

#[test]
fn perfect_link_survives_loss() {
    let _guard = init_tracing();
    let hosts = hosts(2);
    let mut net = Network::new(&hosts, |id| {
        Node::new(id, hosts.clone(), PerfectLinks::new(id, &hosts, &tuning())).unwrap()
    })
    .with(Order::Sent, Loss::EveryNthOnce(3), 0);

    for seq in 1..=5 {
        net.command(
            1,
            LinkCommand {
                to: 2,
                seq,
                payload: Bytes::from(seq.to_string()),
            },
        );
    }
    assert!(net.run_until(500, |n| n.nodes[&1].protocol().in_flight() == 0));
    net.run_for(50);

    let mut got = net.deliveries(2);
    got.sort_unstable();
    assert_eq!(got, (1..=5).map(|s| (1, s)).collect::<Vec<_>>());
    assert!(!net.dropped.is_empty());
    assert_eq!(
        net.logs[&1],
        (1..=5).map(|seq| Event::Broadcast { seq }).collect::<Vec<_>>()
    );
}

#[test]
fn uniform_broadcast_waits_for_a_majority() {
    let _guard = init_tracing();
    let hosts = hosts(3);
    let mut net = Network::new(&hosts, |id| {
        let urb = UniformReliableBroadcast::new(id, hosts.clone(), &tuning()).unwrap();
        Node::new(id, hosts.clone(), urb).unwrap()
    });
    net.isolated.extend([2, 3].iter().copied());
    net.command(1, Bytes::from_static(b"alone"));
    net.run_for(100);
    assert!(net.deliveries(1).is_empty());

    net.isolated.clear();
    assert!(net.run_until(500, |n| hosts.ids().all(|id| n.deliveries(id).len() == 1)));
    net.run_for(50);
    for id in hosts.ids() {
        assert_eq!(net.deliveries(id), vec![(1, 1)]);
    }
}

#[test]
fn fifo_broadcast_orders_per_sender() {
    let _guard = init_tracing();
    for seed in 0..4 {
        let hosts = hosts(3);
        let mut net = Network::new(&hosts, |id| {
            let fifo = FifoBroadcast::new(id, hosts.clone(), &tuning()).unwrap();
            Node::new(id, hosts.clone(), fifo).unwrap()
        })
        .with(Order::Shuffled, Loss::Random(0.2), seed);

        for round in 1..=3u32 {
            for id in hosts.ids() {
                net.command(id, Bytes::from(format!("{}:{}", id, round)));
            }
            net.run_for(3);
        }
        assert!(
            net.run_until(20_000, |n| hosts.ids().all(|id| n.deliveries(id).len() == 9)),
            "seed {} did not converge",
            seed
        );
        net.run_for(100);

        for id in hosts.ids() {
            let got = net.deliveries(id);
            assert_eq!(got.len(), 9, "seed {} host {}", seed, id);
            for sender in hosts.ids() {
                let seqs: Vec<u32> = got
                    .iter()
                    .filter(|(s, _)| *s == sender)
                    .map(|(_, q)| *q)
                    .collect();
                assert_eq!(seqs, vec![1, 2, 3], "seed {} host {} sender {}", seed, id, sender);
            }
        }
    }
}

// Whether `t` is a broadcast of FIFO seq 1 from host 1 heading for host 3,
// either from host 1 itself or relayed.
fn first_from_one_to_three(to: HostId, t: &Transmit) -> bool {
    let carried = Message::decode(t.datagram.clone())
        .ok()
        .filter(|m| m.kind == MessageKind::Data)
        .and_then(|m| Message::decode(m.payload).ok());
    to == 3 && carried.map_or(false, |m| (m.sender_id, m.seq_num) == (1, 1))
}

#[test]
fn fifo_fills_gaps_from_piggybacked_history() {
    let _guard = init_tracing();
    let hosts = hosts(3);
    let mut net = Network::new(&hosts, |id| {
        let fifo = FifoBroadcast::new(id, hosts.clone(), &tuning()).unwrap();
        Node::new(id, hosts.clone(), fifo).unwrap()
    });
    net.blocked = Some(first_from_one_to_three);

    net.command(1, Bytes::from_static(b"first"));
    net.command(1, Bytes::from_static(b"second"));
    assert!(net.run_until(500, |n| n.deliveries(3).len() == 2));
    net.run_for(100);

    assert_eq!(net.deliveries(3), vec![(1, 1), (1, 2)]);
    assert_eq!(net.deliveries(2), vec![(1, 1), (1, 2)]);
    let fifo = net.nodes[&3].protocol();
    assert_eq!(fifo.next_expected(1), 3);
    let first = &fifo.history()[&1][&1];
    assert_eq!(first.payload, Bytes::from_static(b"first"));
}

fn lattice_network(hosts: &Arc<Hosts>) -> Network<LatticeAgreement> {
    Network::new(hosts, |id| {
        let la = LatticeAgreement::new(id, hosts.clone(), &tuning()).unwrap();
        Node::new(id, hosts.clone(), la).unwrap()
    })
}

#[test]
fn lattice_agreement_joins_crossed_proposals() {
    let _guard = init_tracing();
    let hosts = hosts(3);
    let mut net = lattice_network(&hosts).with(Order::Rotating, Loss::Nothing, 0);
    let proposals = [set(&[1, 2]), set(&[2, 3]), set(&[1, 3])];
    for (id, values) in hosts.ids().zip(proposals.iter()) {
        net.command(
            id,
            Propose {
                slot: 1,
                values: values.clone(),
            },
        );
    }
    assert!(net.run_until(1_000, |n| hosts.ids().all(|id| !n.decisions(id).is_empty())));
    for id in hosts.ids() {
        assert_eq!(net.decisions(id)[&1], vec![set(&[1, 2, 3])]);
        assert_eq!(net.nodes[&id].protocol().slot(1).unwrap().round(), 1);
    }
}

#[test]
fn lattice_decisions_are_comparable() {
    let _guard = init_tracing();
    let hosts = hosts(3);
    let proposals: BTreeMap<HostId, Vec<BTreeSet<Value>>> = [
        (1, vec![set(&[1, 2]), set(&[10]), set(&[7])]),
        (2, vec![set(&[2, 3]), set(&[11, 12]), set(&[7])]),
        (3, vec![set(&[1, 3]), set(&[13]), set(&[8, 9])]),
    ]
    .iter()
    .cloned()
    .collect();

    for seed in 0..6 {
        let mut net = lattice_network(&hosts).with(Order::Shuffled, Loss::Random(0.1), seed);
        for (id, values) in proposals.iter() {
            for (slot, v) in (1..).zip(values.iter()) {
                net.command(
                    *id,
                    Propose {
                        slot,
                        values: v.clone(),
                    },
                );
            }
        }
        assert!(
            net.run_until(20_000, |n| hosts
                .ids()
                .all(|id| n.decisions(id).len() == 3)),
            "seed {} did not converge",
            seed
        );
        net.run_for(100);

        for slot in 1..=3u32 {
            let mut decided = Vec::new();
            for id in hosts.ids() {
                let d = &net.decisions(id)[&slot];
                assert_eq!(d.len(), 1, "seed {} host {} decided twice", seed, id);
                let own = &proposals[&id][slot as usize - 1];
                assert!(d[0].is_superset(own), "seed {} host {}", seed, id);
                decided.push(d[0].clone());
            }
            for a in decided.iter() {
                for b in decided.iter() {
                    assert!(comparable(a, b), "seed {} slot {}: {:?} vs {:?}", seed, slot, a, b);
                }
            }
        }
    }
}

#[test]
fn proposing_a_decided_slot_is_rejected() {
    let hosts = hosts(1);
    let mut net = lattice_network(&hosts);
    net.command(
        1,
        Propose {
            slot: 4,
            values: set(&[1]),
        },
    );
    assert!(net.run_until(100, |n| !n.decisions(1).is_empty()));
    let now = net.now;
    let again = net.nodes.get_mut(&1).unwrap().handle_command(
        Propose {
            slot: 4,
            values: set(&[2]),
        },
        now,
    );
    assert!(matches!(again, Err(Error::AlreadyDecided(4))));
}

#[test]
fn failure_detector_suspects_and_restores() {
    let _guard = init_tracing();
    let hosts = hosts(2);
    let period = tuning().heartbeat_timeout();
    let mut net = Network::new(&hosts, |id| {
        let links = PerfectLinks::new(id, &hosts, &tuning());
        let pfd = PerfectFailureDetector::new(id, &hosts, &tuning());
        Node::new(id, hosts.clone(), links)
            .unwrap()
            .with_failure_detector(pfd)
    });
    let suspects = |n: &Network<PerfectLinks>| n.nodes[&1].detector().unwrap().is_suspected(2);

    net.run_for(30);
    assert!(!suspects(&net));

    let cut = net.elapsed();
    net.isolated.insert(2);
    assert!(net.run_until(100, |n| suspects(n)));
    assert!(net.elapsed() - cut <= 2 * period);
    assert_eq!(
        net.suspicions[&1].last().map(|(_, s)| *s),
        Some(Suspicion::Suspect(2))
    );

    net.run_for(20);
    net.isolated.clear();
    assert!(net.run_until(200, |n| !suspects(n)));
    let detector = net.nodes[&1].detector().unwrap();
    assert_eq!(detector.timeout(2), Some(2 * period));
    assert_eq!(
        net.suspicions[&1].last().map(|(_, s)| *s),
        Some(Suspicion::Restore {
            peer: 2,
            timeout: 2 * period
        })
    );

    net.run_for(100);
    assert!(!suspects(&net));
}
