use std::time::{Duration, Instant};

use paxos::instance::Role;
use paxos::message::{Action, MessageDestination, Prepare, Promise, Rpc};
use paxos::{Ballot, Config, Topology};

use common::*;

mod common;

const KEY: u64 = 1;

fn prepares(group: &TestGroup) -> usize {
    group.count_sent(|sendable| matches!(sendable.message.rpc, Rpc::Prepare(_)))
}

#[test]
pub fn single_replica_leads_at_once() {
    let mut group = TestGroup::new(1, 1);
    let request = group.request(id(1, 1), 1, put(KEY, "one"));
    group.run();

    assert_eq!(group.leaders(KEY), vec![id(1, 1)]);
    let replies = group.replies_to(request);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].ok);
    assert_eq!(replies[0].slot, 1);
}

#[test]
pub fn three_replicas_elect_one_leader() {
    let mut group = TestGroup::new(1, 3);
    group.request(id(1, 1), 1, put(KEY, "one"));
    group.run();

    assert_eq!(group.leaders(KEY), vec![id(1, 1)]);
    let ballot = group.node(id(1, 1)).ballot(KEY);
    assert_eq!(ballot.id(), id(1, 1));
    for node in &group.nodes {
        assert_eq!(node.ballot(KEY), ballot);
        assert_eq!(node.leader(KEY), Some(id(1, 1)));
    }
    assert_eq!(prepares(&group), 1);
}

#[test]
pub fn follower_forwards_to_leader() {
    let mut group = TestGroup::new(1, 3);
    group.request(id(1, 1), 1, put(KEY, "one"));
    group.run();

    let request = group.request(id(1, 3), 1, put(KEY, "two"));
    group.run();

    assert_eq!(prepares(&group), 1);
    assert_eq!(group.leaders(KEY), vec![id(1, 1)]);
    let (from, reply) = group
        .replies
        .iter()
        .find(|(_, reply)| reply.request == request)
        .expect("no reply");
    assert_eq!(*from, id(1, 1));
    assert!(reply.ok);
    assert_eq!(reply.slot, 2);
}

#[test]
pub fn stale_leader_contact_triggers_election() {
    let mut group = TestGroup::new(1, 3);
    group.request(id(1, 1), 1, put(KEY, "one"));
    group.run();

    group.advance(Duration::from_secs(10));
    let request = group.request(id(1, 3), 1, put(KEY, "two"));
    group.run();

    assert_eq!(prepares(&group), 2);
    assert_eq!(group.leaders(KEY), vec![id(1, 3)]);
    assert!(group.replies_to(request)[0].ok);
}

#[test]
pub fn higher_prepare_deposes_leader() {
    let mut group = TestGroup::new(1, 3);
    group.elect(id(1, 1), KEY).run();
    assert_eq!(group.leaders(KEY), vec![id(1, 1)]);

    group.elect(id(1, 2), KEY).run();
    assert_eq!(group.leaders(KEY), vec![id(1, 2)]);
    assert_eq!(*group.node(id(1, 1)).instance(KEY).unwrap().role(), Role::Follower);
}

#[test]
pub fn dueling_candidates_settle() {
    let mut group = TestGroup::new(1, 3);
    let first = group.request(id(1, 1), 1, put(KEY, "one"));
    let second = group.request(id(1, 2), 1, put(KEY, "two"));
    group.run();

    assert_eq!(group.leaders(KEY).len(), 1);
    assert!(group.replies_to(first)[0].ok);
    assert!(group.replies_to(second)[0].ok);
    let writes = group.node(id(1, 1)).store().writes().len();
    assert_eq!(writes, 2);
    for node in &group.nodes {
        assert_eq!(node.store().applied, group.node(id(1, 1)).store().applied);
    }
}

#[test]
pub fn leader_survives_zone_failure() {
    let mut config = Config::new(Topology::uniform(3, 3));
    config.fz = 1;
    let mut group = TestGroup::with_config(config);
    group.config = common::config()
        .node_down(id(3, 1))
        .node_down(id(3, 2))
        .node_down(id(3, 3));

    let request = group.request(id(1, 1), 1, put(KEY, "one"));
    group.run();

    assert_eq!(group.leaders(KEY), vec![id(1, 1)]);
    assert!(group.replies_to(request)[0].ok);
}

#[test]
pub fn no_leader_without_phase_one_quorum() {
    let mut config = Config::new(Topology::uniform(3, 3));
    config.fz = 1;
    let mut group = TestGroup::with_config(config);
    let mut down = common::config();
    for zone in 2..=3 {
        for node in 1..=3 {
            down = down.node_down(id(zone, node));
        }
    }
    group.config = down;

    let request = group.request(id(1, 1), 1, put(KEY, "one"));
    group.run_messages();

    assert!(group.leaders(KEY).is_empty());
    assert!(group.replies_to(request).is_empty());
    let candidate = group.node(id(1, 1)).instance(KEY).unwrap();
    assert!(candidate.is_electing());
    assert!(candidate.election_timer().is_some());
}

#[test]
pub fn unanswered_election_is_retried() {
    let mut group = TestGroup::new(1, 3);
    group.config = common::config().isolate(id(1, 1));
    let first = group.request(id(1, 1), 1, put(KEY, "one"));
    group.run_messages();
    let candidate = group.node(id(1, 1)).instance(KEY).unwrap();
    assert!(candidate.is_electing());
    assert!(candidate.election_timer().is_some());
    assert_eq!(group.timers.len(), 1);

    // Connectivity returns, but the lost prepares are never redelivered.
    group.config = common::config();
    group.dropped.clear();
    group.run();

    assert_eq!(prepares(&group), 2);
    assert_eq!(group.leaders(KEY), vec![id(1, 1)]);
    assert_eq!(group.node(id(1, 1)).ballot(KEY).counter(), 2);
    assert_eq!(group.node(id(1, 1)).instance(KEY).unwrap().election_timer(), None);
    assert!(group.timers.is_empty());
    let reply = group.replies_to(first)[0];
    assert!(reply.ok);
    assert_eq!(reply.slot, 1);

    let second = group.request(id(1, 1), 1, put(KEY, "two"));
    group.run();
    let reply = group.replies_to(second)[0];
    assert!(reply.ok);
    assert_eq!(reply.slot, 2);
}

#[test]
pub fn won_election_cancels_its_timeout() {
    let now = Instant::now();
    let mut replica = replica(id(1, 1), Config::new(Topology::uniform(1, 3)));
    let actions = replica.elect(KEY, now);
    let timer = replica.instance(KEY).unwrap().election_timer().expect("no election timeout");
    assert!(actions.iter().any(|action| match action {
        Action::Schedule { timer: scheduled, delay, .. } => *scheduled == timer && *delay >= replica.config().leader_timeout,
        _ => false,
    }));

    let promise = Promise {
        from: id(1, 2),
        ballot: replica.ballot(KEY),
        slot: 0,
        log: Vec::new(),
    };
    let actions = send(&mut replica, KEY, Rpc::Promise(promise), now);
    assert!(replica.is_leader(KEY));
    assert!(actions.contains(&Action::Cancel(timer)));
    assert_eq!(replica.instance(KEY).unwrap().election_timer(), None);

    // A timeout racing the win changes nothing.
    assert!(replica.timeout(KEY, timer, now + Duration::from_secs(5)).is_empty());
    assert!(replica.is_leader(KEY));
}

#[test]
pub fn preempted_candidate_backs_off_then_retries() {
    let now = Instant::now();
    let config = Config::new(Topology::uniform(1, 3));
    let backoff = config.backoff;
    let mut replica = replica(id(1, 1), config);

    let actions = replica.handle_request(paxos::Request::new(1, paxos::ClientId::new(1, 1), put(KEY, "one")), now);
    assert!(sent(&actions)
        .iter()
        .any(|sendable| matches!(sendable.message.rpc, Rpc::Prepare(_))));
    let round = replica.instance(KEY).unwrap().election_timer().expect("no election timeout");

    let higher = Ballot::new(5, id(1, 2));
    let promise = Promise {
        from: id(1, 3),
        ballot: higher,
        slot: 0,
        log: Vec::new(),
    };
    let actions = send(&mut replica, KEY, Rpc::Promise(promise), now);
    let (timer, delay) = match actions.as_slice() {
        [Action::Cancel(cancelled), Action::Schedule { key, timer, delay }] if *cancelled == round && *key == KEY => {
            (*timer, *delay)
        }
        other => panic!("expected the round timeout replaced by one retry, got {:?}", other),
    };
    assert!(delay <= backoff);
    assert_eq!(replica.instance(KEY).unwrap().election_timer(), None);
    let instance = replica.instance(KEY).unwrap();
    assert_eq!(*instance.role(), Role::Follower);
    assert_eq!(instance.ballot(), higher);
    assert_eq!(instance.pending(), 1);
    assert_eq!(instance.backoff_timer(), Some(timer));

    let stale = paxos::TimerHandle::new(timer.id() + 100);
    assert!(replica.timeout(KEY, stale, now + delay).is_empty());

    let actions = replica.timeout(KEY, timer, now + delay);
    let retried = sent(&actions);
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].dest, MessageDestination::Broadcast);
    assert_eq!(
        retried[0].message.rpc,
        Rpc::Prepare(Prepare {
            ballot: Ballot::new(6, id(1, 1)),
            execute: 1,
        })
    );
}

#[test]
pub fn prepare_hands_queued_requests_to_candidate() {
    let now = Instant::now();
    let mut replica = replica(id(1, 1), Config::new(Topology::uniform(1, 3)));
    let _ = replica.handle_request(paxos::Request::new(1, paxos::ClientId::new(1, 1), put(KEY, "one")), now);
    let promise = Promise {
        from: id(1, 2),
        ballot: Ballot::new(3, id(1, 2)),
        slot: 0,
        log: Vec::new(),
    };
    let actions = send(&mut replica, KEY, Rpc::Promise(promise), now);
    let timer = match actions.as_slice() {
        [Action::Cancel(_), Action::Schedule { timer, .. }] => *timer,
        other => panic!("expected one retry, got {:?}", other),
    };

    let prepare = Prepare {
        ballot: Ballot::new(4, id(1, 3)),
        execute: 1,
    };
    let actions = send(&mut replica, KEY, Rpc::Prepare(prepare), now);
    assert!(actions.contains(&Action::Cancel(timer)));
    assert!(actions.iter().any(|action| match action {
        Action::Forward { to, request } => *to == id(1, 3) && request.forwards == 1,
        _ => false,
    }));
    let promises = sent(&actions);
    assert_eq!(promises.len(), 1);
    assert_eq!(promises[0].dest, MessageDestination::To(id(1, 3)));
    assert_eq!(replica.instance(KEY).unwrap().pending(), 0);
}

#[test]
pub fn lower_prepare_is_refused() {
    let now = Instant::now();
    let mut replica = replica(id(1, 2), Config::new(Topology::uniform(1, 3)));
    let high = Ballot::new(5, id(1, 3));
    let _ = send(&mut replica, KEY, Rpc::Prepare(Prepare { ballot: high, execute: 1 }), now);

    let low = Ballot::new(4, id(1, 1));
    let actions = send(&mut replica, KEY, Rpc::Prepare(Prepare { ballot: low, execute: 1 }), now);
    match &sent(&actions)[..] {
        [sendable] => match &sendable.message.rpc {
            Rpc::Promise(promise) => {
                assert_eq!(promise.ballot, high);
                assert_eq!(sendable.dest, MessageDestination::To(id(1, 1)));
            }
            other => panic!("expected a promise, got {}", other),
        },
        other => panic!("expected one message, got {:?}", other),
    }
    assert_eq!(replica.ballot(KEY), high);
}
