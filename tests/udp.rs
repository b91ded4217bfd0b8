// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use bytes::Bytes;
use lattice_bcast::runtime::{self, NodeHandle};
use lattice_bcast::{
    Event, FifoBroadcast, HostIdentity, Hosts, LatticeAgreement, Node, PerfectFailureDetector,
    Propose, Protocol, Tuning,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

type Watch = mpsc::UnboundedSender<Event>;

fn tuning() -> Tuning {
    Tuning {
        retransmit_ms: 20,
        heartbeat_ms: 100,
        heartbeat_window: 8,
    }
}

async fn bind(n: u32) -> (Arc<Hosts>, Vec<UdpSocket>) {
    let mut sockets = Vec::new();
    let mut idents = Vec::new();
    for id in 1..=n {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        idents.push(HostIdentity::new(id, socket.local_addr().unwrap()));
        sockets.push(socket);
    }
    (Arc::new(Hosts::new(idents).unwrap()), sockets)
}

struct Running<C> {
    handle: NodeHandle<C>,
    task: JoinHandle<Result<Watch, lattice_bcast::Error>>,
    events: mpsc::UnboundedReceiver<Event>,
}

fn start<P>(node: Node<P>, socket: UdpSocket) -> Running<P::Command>
where
    P: Protocol + Send + 'static,
    P::Command: Send + 'static,
{
    let (tx, events) = mpsc::unbounded_channel();
    let (handle, task) = runtime::spawn(node, socket, tx);
    Running {
        handle,
        task,
        events,
    }
}

async fn collect(
    events: &mut mpsc::UnboundedReceiver<Event>,
    want: usize,
    keep: impl Fn(&Event) -> bool,
) -> Vec<Event> {
    let mut got = Vec::new();
    while got.len() < want {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("node stopped early");
        if keep(&event) {
            got.push(event);
        }
    }
    got
}

async fn stop<C>(running: Running<C>) {
    running.handle.shutdown();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn fifo_over_loopback() {
    let (hosts, sockets) = bind(3).await;
    let mut nodes = Vec::new();
    for (id, socket) in hosts.ids().zip(sockets) {
        let fifo = FifoBroadcast::new(id, hosts.clone(), &tuning()).unwrap();
        nodes.push(start(Node::new(id, hosts.clone(), fifo).unwrap(), socket));
    }
    for (id, node) in hosts.ids().zip(nodes.iter()) {
        for i in 1..=3 {
            assert!(node.handle.send(Bytes::from(format!("{}/{}", id, i))).await);
        }
    }

    for node in nodes.iter_mut() {
        let delivered = collect(&mut node.events, 9, |e| matches!(e, Event::Deliver { .. })).await;
        for sender in hosts.ids() {
            let seqs: Vec<u32> = delivered
                .iter()
                .filter_map(|e| match e {
                    Event::Deliver { sender: s, seq } if *s == sender => Some(*seq),
                    _ => None,
                })
                .collect();
            assert_eq!(seqs, vec![1, 2, 3]);
        }
    }
    for node in nodes {
        stop(node).await;
    }
}

#[tokio::test]
async fn lattice_over_loopback_with_detector() {
    let (hosts, sockets) = bind(3).await;
    let mut nodes = Vec::new();
    for (id, socket) in hosts.ids().zip(sockets) {
        let la = LatticeAgreement::new(id, hosts.clone(), &tuning()).unwrap();
        let pfd = PerfectFailureDetector::new(id, &hosts, &tuning());
        let node = Node::new(id, hosts.clone(), la)
            .unwrap()
            .with_failure_detector(pfd);
        nodes.push(start(node, socket));
    }

    let proposals: Vec<BTreeSet<u32>> = vec![
        [1, 2].iter().copied().collect(),
        [2, 3].iter().copied().collect(),
        [4].iter().copied().collect(),
    ];
    for (node, values) in nodes.iter().zip(proposals.iter()) {
        for slot in 1..=2 {
            let cmd = Propose {
                slot,
                values: values.clone(),
            };
            assert!(node.handle.send(cmd).await);
        }
    }

    let mut decided = Vec::new();
    for (node, own) in nodes.iter_mut().zip(proposals.iter()) {
        let events = collect(&mut node.events, 2, |e| matches!(e, Event::Decide { .. })).await;
        for e in events {
            if let Event::Decide { slot, values } = e {
                assert!(values.is_superset(own));
                decided.push((slot, values));
            }
        }
    }
    for (s1, a) in decided.iter() {
        for (s2, b) in decided.iter() {
            if s1 == s2 {
                assert!(a.is_subset(b) || b.is_subset(a));
            }
        }
    }
    for node in nodes {
        stop(node).await;
    }
}
