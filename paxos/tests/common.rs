#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand_chacha::ChaChaRng;
use rand_core::{RngCore, SeedableRng};

use paxos::message::{Action, Command, Key, Message, Reply, Request, RequestId, Rpc, SendableMessage};
use paxos::{ClientId, Config, InMemoryStore, NodeId, Replica, StateMachine, TimerHandle, Topology};

const RANDOM_SEED: u64 = 0;
const MAX_STEPS: u32 = 100_000;

pub type TestReplica = Replica<RecordingStore, ChaChaRng>;

/// A store remembering every command applied to it, in order.
#[derive(Default)]
pub struct RecordingStore {
    store: InMemoryStore,
    pub applied: Vec<Command>,
}

pub struct TestGroup {
    pub nodes: Vec<TestReplica>,
    pub now: Instant,
    pub config: TestGroupConfig,
    pub deliveries: VecDeque<Delivery>,
    pub dropped: Vec<Delivery>,
    pub timers: Vec<PendingTimer>,
    pub replies: Vec<(NodeId, Reply)>,
    pub sent: Vec<(NodeId, SendableMessage)>,
    next_request: RequestId,
}

/// Something in flight towards a replica. Client requests have no sending replica.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub from: Option<NodeId>,
    pub to: NodeId,
    pub envelope: Envelope,
}

#[derive(Clone, Debug)]
pub enum Envelope {
    Message(Message),
    Request(Request),
}

#[derive(Clone, Debug)]
pub struct PendingTimer {
    pub deadline: Instant,
    pub node: NodeId,
    pub key: Key,
    pub timer: TimerHandle,
}

#[derive(Clone, Default)]
pub struct TestGroupConfig {
    pub drops: BTreeSet<(Option<NodeId>, Option<NodeId>)>,
    pub down: BTreeSet<NodeId>,
}

pub struct TestLogger;

pub struct TestLoggerContext {
    node_id: Option<NodeId>,
}

pub fn init_random() -> ChaChaRng {
    ChaChaRng::seed_from_u64(RANDOM_SEED)
}

pub fn config() -> TestGroupConfig {
    TestGroupConfig::default()
}

pub fn id(zone: u16, node: u16) -> NodeId {
    NodeId::new(zone, node)
}

pub fn put(key: Key, value: &'static str) -> Command {
    Command::put(key, Bytes::from_static(value.as_bytes()))
}

/// A lone replica for driving handlers by hand.
pub fn replica(id: NodeId, config: Config) -> TestReplica {
    TestLogger::init();
    Replica::new(id, config, RecordingStore::default(), init_random())
}

/// Delivers one protocol message to `replica`.
pub fn send(replica: &mut TestReplica, key: Key, rpc: Rpc, now: Instant) -> Vec<Action> {
    TestLogger::set_node_id(Some(replica.id()));
    replica.receive(Message { key, rpc }, now)
}

/// The protocol messages among `actions`.
pub fn sent(actions: &[Action]) -> Vec<&SendableMessage> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Send(sendable) => Some(sendable),
            _ => None,
        })
        .collect()
}

/// The client replies among `actions`.
pub fn replies(actions: &[Action]) -> Vec<&Reply> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Reply(reply) => Some(reply),
            _ => None,
        })
        .collect()
}

//
// RecordingStore impls
//

impl RecordingStore {
    pub fn get(&self, key: Key) -> Option<&Bytes> {
        self.store.get(key)
    }

    /// The non-read commands applied so far.
    pub fn writes(&self) -> Vec<&Command> {
        self.applied.iter().filter(|command| command.is_write()).collect()
    }
}

impl StateMachine for RecordingStore {
    fn execute(&mut self, command: &Command) -> Option<Bytes> {
        self.applied.push(command.clone());
        self.store.execute(command)
    }
}

//
// TestGroup impls
//

impl TestGroup {
    pub fn new(zones: u16, nodes_per_zone: u16) -> Self {
        Self::with_config(Config::new(Topology::uniform(zones, nodes_per_zone)))
    }

    pub fn with_config(config: Config) -> Self {
        TestLogger::init();
        assert_eq!(config.validate(), Ok(()));
        let mut random = init_random();
        let nodes = config
            .topology
            .nodes()
            .map(|id| {
                Replica::new(
                    id,
                    config.clone(),
                    RecordingStore::default(),
                    ChaChaRng::seed_from_u64(random.next_u64()),
                )
            })
            .collect();
        Self {
            nodes,
            now: Instant::now(),
            config: TestGroupConfig::default(),
            deliveries: VecDeque::new(),
            dropped: Vec::new(),
            timers: Vec::new(),
            replies: Vec::new(),
            sent: Vec::new(),
            next_request: 0,
        }
    }

    pub fn node(&self, id: NodeId) -> &TestReplica {
        self.nodes
            .iter()
            .find(|node| node.id() == id)
            .unwrap_or_else(|| panic!("no replica {}", id))
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TestReplica {
        self.nodes
            .iter_mut()
            .find(|node| node.id() == id)
            .unwrap_or_else(|| panic!("no replica {}", id))
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id()).collect()
    }

    /// Queues a client request from `zone` at replica `at`, returning its request number.
    pub fn request(&mut self, at: NodeId, zone: u16, command: Command) -> RequestId {
        self.next_request += 1;
        let request = Request::new(self.next_request, ClientId::new(zone, 1), command);
        self.deliveries.push_back(Delivery {
            from: None,
            to: at,
            envelope: Envelope::Request(request),
        });
        self.next_request
    }

    /// Makes `at` start an election for `key`.
    pub fn elect(&mut self, at: NodeId, key: Key) -> &mut Self {
        TestLogger::set_node_id(Some(at));
        let now = self.now;
        let actions = self.node_mut(at).elect(key, now);
        self.perform(at, actions);
        self
    }

    /// Delivers everything in flight and fires timers until the group is quiet.
    pub fn run(&mut self) -> &mut Self {
        let mut steps_remaining = MAX_STEPS;
        loop {
            steps_remaining = steps_remaining
                .checked_sub(1)
                .expect("group did not settle within the maximum simulation length");
            if let Some(delivery) = self.deliveries.pop_front() {
                self.deliver(delivery);
            } else if !self.fire_next_timer() {
                break;
            }
        }
        TestLogger::set_node_id(None);
        self
    }

    /// Delivers what is in flight without firing any timer.
    pub fn run_messages(&mut self) -> &mut Self {
        while let Some(delivery) = self.deliveries.pop_front() {
            self.deliver(delivery);
        }
        TestLogger::set_node_id(None);
        self
    }

    pub fn advance(&mut self, duration: Duration) -> &mut Self {
        self.now += duration;
        self
    }

    /// Restores full connectivity and redelivers everything dropped meanwhile.
    pub fn heal(&mut self) -> &mut Self {
        self.config = config();
        self.deliveries.extend(self.dropped.drain(..));
        self
    }

    /// Queues a second copy of every protocol message sent so far.
    pub fn replay_sent(&mut self) -> &mut Self {
        let ids = self.ids();
        for (from, sendable) in self.sent.clone() {
            for &to in &ids {
                if sendable.dest.includes(from, to) {
                    self.deliveries.push_back(Delivery {
                        from: Some(from),
                        to,
                        envelope: Envelope::Message(sendable.message.clone()),
                    });
                }
            }
        }
        self
    }

    pub fn modify(&mut self, fun: impl FnOnce(&mut Self)) -> &mut Self {
        fun(self);
        self
    }

    pub fn inspect(&mut self, fun: impl FnOnce(&Self)) -> &mut Self {
        fun(self);
        self
    }

    /// The replicas leading `key`.
    pub fn leaders(&self, key: Key) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.is_leader(key))
            .map(|node| node.id())
            .collect()
    }

    pub fn applied(&self, id: NodeId) -> &[Command] {
        &self.node(id).store().applied
    }

    pub fn replies_to(&self, request: RequestId) -> Vec<&Reply> {
        self.replies
            .iter()
            .map(|(_, reply)| reply)
            .filter(|reply| reply.request == request)
            .collect()
    }

    /// The messages sent so far matching `fun`.
    pub fn count_sent(&self, fun: impl Fn(&SendableMessage) -> bool) -> usize {
        self.sent.iter().filter(|(_, sendable)| fun(sendable)).count()
    }

    fn deliver(&mut self, delivery: Delivery) {
        let Delivery { from, to, envelope } = delivery.clone();
        if self.config.should_drop(from, to) {
            log::info!("{} <- {:?} DROPPED", to, from);
            self.dropped.push(delivery);
            return;
        }
        TestLogger::set_node_id(Some(to));
        let now = self.now;
        let node = self.node_mut(to);
        let actions = match envelope {
            Envelope::Message(message) => {
                log::debug!("<- {} {}", from.map(|id| id.to_string()).unwrap_or_default(), message);
                node.receive(message, now)
            }
            Envelope::Request(request) => {
                log::debug!("<- {}", request);
                node.handle_request(request, now)
            }
        };
        self.perform(to, actions);
    }

    fn fire_next_timer(&mut self) -> bool {
        let next = self
            .timers
            .iter()
            .enumerate()
            .min_by_key(|(_, pending)| pending.deadline)
            .map(|(index, _)| index);
        let pending = match next {
            Some(index) => self.timers.remove(index),
            None => return false,
        };
        if self.now < pending.deadline {
            self.now = pending.deadline;
        }
        if self.config.is_node_down(pending.node) {
            return true;
        }
        TestLogger::set_node_id(Some(pending.node));
        let now = self.now;
        let actions = self.node_mut(pending.node).timeout(pending.key, pending.timer, now);
        self.perform(pending.node, actions);
        true
    }

    fn perform(&mut self, from: NodeId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(sendable) => {
                    log::debug!("-> {}", sendable);
                    for to in self.ids() {
                        if sendable.dest.includes(from, to) {
                            self.deliveries.push_back(Delivery {
                                from: Some(from),
                                to,
                                envelope: Envelope::Message(sendable.message.clone()),
                            });
                        }
                    }
                    self.sent.push((from, sendable));
                }
                Action::Forward { to, request } => self.deliveries.push_back(Delivery {
                    from: Some(from),
                    to,
                    envelope: Envelope::Request(request),
                }),
                Action::Reply(reply) => self.replies.push((from, reply)),
                Action::Schedule { key, timer, delay } => self.timers.push(PendingTimer {
                    deadline: self.now + delay,
                    node: from,
                    key,
                    timer,
                }),
                Action::Cancel(timer) => self
                    .timers
                    .retain(|pending| !(pending.node == from && pending.timer == timer)),
            }
        }
    }
}

//
// TestGroupConfig impls
//

impl TestGroupConfig {
    pub fn node_down(mut self, id: NodeId) -> Self {
        self.down.insert(id);
        self
    }

    pub fn isolate(mut self, id: NodeId) -> Self {
        self.drops.insert((Some(id), None));
        self.drops.insert((None, Some(id)));
        self
    }

    pub fn drop_between(mut self, from: NodeId, to: NodeId) -> Self {
        self.drops.insert((Some(from), Some(to)));
        self.drops.insert((Some(to), Some(from)));
        self
    }

    pub fn is_node_down(&self, id: NodeId) -> bool {
        self.down.contains(&id)
    }

    /// Clients reach every replica that is up.
    pub fn should_drop(&self, from: Option<NodeId>, to: NodeId) -> bool {
        match from {
            Some(from) => {
                self.drops.contains(&(Some(from), Some(to)))
                    || self.drops.contains(&(Some(from), None))
                    || self.drops.contains(&(None, Some(to)))
                    || self.down.contains(&from)
                    || self.down.contains(&to)
            }
            None => self.down.contains(&to),
        }
    }
}

//
// TestLogger impls
//

thread_local! {
    static LOGGER_CONTEXT: RefCell<TestLoggerContext> = RefCell::new(TestLoggerContext::new());
}

impl TestLogger {
    pub fn init() {
        let _ignore = log::set_logger(&Self);
        log::set_max_level(log::LevelFilter::Debug);
    }

    pub fn set_node_id(node_id: Option<NodeId>) {
        LOGGER_CONTEXT.with(|context| {
            context.borrow_mut().node_id = node_id;
        });
    }
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        LOGGER_CONTEXT.with(|context| match context.borrow().node_id {
            Some(node_id) => eprintln!("{} {}", node_id, record.args()),
            None => eprintln!("{}", record.args()),
        })
    }

    fn flush(&self) {}
}

//
// TestLoggerContext impls
//

impl TestLoggerContext {
    const fn new() -> Self {
        Self { node_id: None }
    }
}
