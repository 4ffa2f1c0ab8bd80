//! The per-key Paxos state machine.
//!
//! A [`KeyInstance`] orders the commands of a single key. It elects itself leader with a phase-1 round
//! ([`Prepare`]/[`Promise`]) under a flexible Q1 quorum, replicates commands slot by slot with phase-2 rounds
//! ([`Accept`]/[`Accepted`]) under a Q2 quorum, announces decisions with [`Commit`], and applies decided commands to the
//! state machine strictly in slot order.
//!
//! Stale messages, carrying a lower ballot or naming an already decided slot, are ignored. Messages naming an unknown
//! slot create it. Handlers never block: a candidate whose round was preempted, or went unanswered, asks for a timer
//! and retries when it fires.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::mem;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand_core::RngCore;

use crate::ballot::Ballot;
use crate::config::Config;
use crate::id::NodeId;
use crate::message::*;
use crate::quorum::QuorumCertificate;
use crate::store::StateMachine;
use crate::timer::TimerHandle;

use self::Role::*;

/// Where a [`KeyInstance`] stands in the protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Role {
    /// Nothing has happened for the key yet.
    Idle,
    /// A phase-1 round is in progress at this replica's ballot, collecting promises.
    Electing(QuorumCertificate),
    /// This replica leads the key.
    Active,
    /// Another replica leads the key, or is trying to.
    Follower,
}

/// One slot of a key's log.
#[derive(Clone, Debug)]
pub struct LogEntry {
    ballot: Ballot,
    command: Command,
    committed: bool,
    /// The client request this replica proposed the command for, until it is answered.
    request: Option<Request>,
    /// Phase-2 acknowledgements, while this replica is the proposer.
    quorum: QuorumCertificate,
}

/// The Paxos state of one key on one replica.
#[derive(Debug)]
pub struct KeyInstance {
    key: Key,
    role: Role,
    ballot: Ballot,

    /// The highest slot known to be in use.
    slot: Slot,
    /// Every slot up to and including this one is committed.
    commit: Slot,
    /// The next slot to apply to the state machine.
    execute: Slot,

    /// Requests waiting for this replica to win an election.
    requests: Vec<Request>,
    log: BTreeMap<Slot, LogEntry>,

    /// The pending election retry, if any.
    backoff: Option<TimerHandle>,
    /// The timeout of the election round in progress, if any.
    election: Option<TimerHandle>,
    /// When this replica last heard from the leader named by `ballot`.
    leader_contact: Option<Instant>,
}

/// The replica-wide context a [`KeyInstance`] handler runs in.
pub(crate) struct Env<'a> {
    pub(crate) id: NodeId,
    pub(crate) config: &'a Config,
    pub(crate) store: &'a mut dyn StateMachine,
    pub(crate) random: &'a mut dyn RngCore,
    pub(crate) timers: &'a mut u64,
    pub(crate) now: Instant,
    pub(crate) actions: &'a mut Vec<Action>,
}

//
// LogEntry impls
//

impl LogEntry {
    fn new(ballot: Ballot, command: Command) -> Self {
        Self {
            ballot,
            command,
            committed: false,
            request: None,
            quorum: QuorumCertificate::new(),
        }
    }

    /// The ballot the stored command was last accepted or committed under.
    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Whether a client request is attached to this slot, awaiting its reply.
    pub fn has_request(&self) -> bool {
        self.request.is_some()
    }
}

//
// KeyInstance impls
//

impl KeyInstance {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            role: Idle,
            ballot: Ballot::ZERO,
            slot: 0,
            commit: 0,
            execute: 1,
            requests: Vec::new(),
            log: BTreeMap::new(),
            backoff: None,
            election: None,
            leader_contact: None,
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// The highest ballot this replica has seen for the key.
    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    /// The replica named by the current ballot, if any ballot was seen.
    pub fn leader(&self) -> Option<NodeId> {
        if self.ballot.is_zero() {
            None
        } else {
            Some(self.ballot.id())
        }
    }

    pub fn is_active(&self) -> bool {
        self.role == Active
    }

    pub fn is_electing(&self) -> bool {
        matches!(self.role, Electing(_))
    }

    /// The highest slot known to be in use.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// The highest slot such that it and every slot before it are committed.
    pub fn commit_index(&self) -> Slot {
        self.commit
    }

    /// The next slot to be applied to the state machine.
    pub fn execute_index(&self) -> Slot {
        self.execute
    }

    pub fn entry(&self, slot: Slot) -> Option<&LogEntry> {
        self.log.get(&slot)
    }

    /// The number of requests waiting for an election.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// The pending election retry timer, if any.
    pub fn backoff_timer(&self) -> Option<TimerHandle> {
        self.backoff
    }

    /// The timer restarting the election round in progress if it has not been won by then.
    pub fn election_timer(&self) -> Option<TimerHandle> {
        self.election
    }

    //
    // client requests
    //

    pub(crate) fn handle_request(&mut self, request: Request, env: &mut Env<'_>) {
        match self.role {
            Active => self.propose(request, env),
            Electing(_) => {
                debug!("key {} queued {} during election", self.key, request);
                self.requests.push(request);
            }
            Idle | Follower => match self.live_leader(env) {
                Some(leader) => self.forward(leader, request, env),
                None => {
                    self.requests.push(request);
                    if self.backoff.is_none() {
                        self.prepare(env);
                    }
                }
            },
        }
    }

    /// The leader named by the current ballot, if it is another replica heard from recently.
    fn live_leader(&self, env: &Env<'_>) -> Option<NodeId> {
        let leader = self.leader().filter(|&leader| leader != env.id)?;
        let contact = self.leader_contact?;
        if env.now.saturating_duration_since(contact) < env.config.leader_timeout {
            Some(leader)
        } else {
            None
        }
    }

    fn forward(&mut self, leader: NodeId, mut request: Request, env: &mut Env<'_>) {
        if request.forwards >= env.config.max_forwards {
            debug!("key {} redirecting {} to {}", self.key, request, leader);
            let reply = request.redirect(Some(leader), self.ballot);
            env.actions.push(Action::Reply(reply));
            return;
        }
        request.forwards += 1;
        debug!("key {} forwarding {} to {}", self.key, request, leader);
        env.actions.push(Action::Forward { to: leader, request });
    }

    /// Forwards every queued request to `leader`.
    fn hand_off(&mut self, leader: NodeId, env: &mut Env<'_>) {
        if self.requests.is_empty() || leader == env.id {
            return;
        }
        self.cancel_backoff(env);
        for request in mem::take(&mut self.requests) {
            self.forward(leader, request, env);
        }
    }

    //
    // phase 1
    //

    /// Starts an election at a fresh ballot.
    pub(crate) fn prepare(&mut self, env: &mut Env<'_>) {
        if self.is_active() {
            return;
        }
        self.cancel_backoff(env);
        self.cancel_election(env);
        self.ballot = self.ballot.next(env.id);
        let mut quorum = QuorumCertificate::new();
        quorum.ack(env.id);
        self.role = Electing(quorum);
        info!("key {} electing at {}", self.key, self.ballot);

        let prepare = Prepare {
            ballot: self.ballot,
            execute: self.execute,
        };
        env.send(self.key, Rpc::Prepare(prepare), MessageDestination::Broadcast);
        self.try_elect(env);
        if self.is_electing() {
            self.arm_election(env);
        }
    }

    pub(crate) fn handle_prepare(&mut self, msg: Prepare, env: &mut Env<'_>) {
        let candidate = msg.ballot.id();
        let log: Vec<PromiseEntry> = if msg.ballot >= self.ballot {
            if msg.ballot > self.ballot {
                self.adopt(msg.ballot, env);
                self.leader_contact = Some(env.now);
                self.hand_off(candidate, env);
            }
            self.log
                .range(msg.execute.max(1)..)
                .map(|(&slot, entry)| PromiseEntry {
                    slot,
                    ballot: entry.ballot,
                    command: entry.command.clone(),
                    committed: entry.committed,
                })
                .collect()
        } else {
            debug!("key {} refusing {} at {}", self.key, msg.ballot, self.ballot);
            Vec::new()
        };

        let promise = Promise {
            from: env.id,
            ballot: self.ballot,
            slot: self.slot,
            log,
        };
        env.send(self.key, Rpc::Promise(promise), MessageDestination::To(candidate));
    }

    pub(crate) fn handle_promise(&mut self, msg: Promise, env: &mut Env<'_>) {
        if msg.ballot > self.ballot {
            info!("key {} preempted by {} from {}", self.key, msg.ballot, msg.from);
            self.adopt(msg.ballot, env);
            self.schedule_retry(env);
            return;
        }
        if msg.ballot < self.ballot || !self.is_electing() {
            debug!("key {} ignoring stale promise from {}", self.key, msg.from);
            return;
        }

        self.slot = self.slot.max(msg.slot);
        self.merge(msg.log);
        if let Electing(quorum) = &mut self.role {
            quorum.ack(msg.from);
        }
        self.advance(env);
        self.try_elect(env);
    }

    /// Folds log entries reported in a promise into the local log, keeping the highest-ballot command per slot.
    fn merge(&mut self, entries: Vec<PromiseEntry>) {
        for reported in entries {
            if reported.slot < self.execute {
                continue;
            }
            self.slot = self.slot.max(reported.slot);
            match self.log.get_mut(&reported.slot) {
                Some(entry) if entry.committed => {}
                Some(entry) => {
                    if reported.committed || reported.ballot > entry.ballot {
                        if entry.command != reported.command {
                            if let Some(request) = entry.request.take() {
                                self.requests.push(request);
                            }
                        }
                        entry.ballot = reported.ballot;
                        entry.command = reported.command;
                        entry.committed = reported.committed;
                    }
                }
                None => {
                    let mut entry = LogEntry::new(reported.ballot, reported.command);
                    entry.committed = reported.committed;
                    self.log.insert(reported.slot, entry);
                }
            }
        }
    }

    fn try_elect(&mut self, env: &mut Env<'_>) {
        let elected = match &self.role {
            Electing(quorum) => env.config.q1(quorum),
            _ => false,
        };
        if elected {
            self.become_active(env);
        }
    }

    fn become_active(&mut self, env: &mut Env<'_>) {
        self.role = Active;
        self.leader_contact = None;
        self.cancel_backoff(env);
        self.cancel_election(env);
        info!("key {} became leader at {}", self.key, self.ballot);

        // Re-propose every undecided slot under the new ballot, filling holes with no-ops.
        let key = self.key;
        let ballot = self.ballot;
        let mut recovered = Vec::new();
        for slot in self.execute..=self.slot {
            let entry = self
                .log
                .entry(slot)
                .or_insert_with(|| LogEntry::new(ballot, Command::noop(key)));
            if entry.committed {
                continue;
            }
            entry.ballot = ballot;
            entry.quorum.reset();
            entry.quorum.ack(env.id);
            let accept = Accept {
                ballot,
                slot,
                command: entry.command.clone(),
            };
            env.send(key, Rpc::Accept(accept), MessageDestination::Broadcast);
            recovered.push(slot);
        }
        if !recovered.is_empty() {
            info!("key {} recovering {} slots", key, recovered.len());
        }
        for slot in recovered {
            self.try_commit(slot, env);
        }

        for request in mem::take(&mut self.requests) {
            self.propose(request, env);
        }
    }

    /// Moves to a higher ballot, giving up any leadership or candidacy at the old one.
    fn adopt(&mut self, ballot: Ballot, env: &mut Env<'_>) {
        if ballot <= self.ballot {
            return;
        }
        match self.role {
            Active | Electing(_) => info!("key {} stepping down for {}", self.key, ballot),
            Idle | Follower => {}
        }
        self.cancel_election(env);
        self.ballot = ballot;
        self.role = Follower;
    }

    //
    // election retries
    //

    /// Asks for a randomized delay before retrying the election for queued requests.
    fn schedule_retry(&mut self, env: &mut Env<'_>) {
        if self.requests.is_empty() || self.backoff.is_some() {
            return;
        }
        let timer = env.timer();
        let delay = env.backoff();
        debug!("key {} retrying election in {:?}", self.key, delay);
        self.backoff = Some(timer);
        env.actions.push(Action::Schedule {
            key: self.key,
            timer,
            delay,
        });
    }

    fn cancel_backoff(&mut self, env: &mut Env<'_>) {
        if let Some(timer) = self.backoff.take() {
            env.actions.push(Action::Cancel(timer));
        }
    }

    /// Restarts the current round if its prepares or promises are lost.
    fn arm_election(&mut self, env: &mut Env<'_>) {
        let timer = env.timer();
        let delay = env.config.leader_timeout.saturating_add(env.backoff());
        self.election = Some(timer);
        env.actions.push(Action::Schedule {
            key: self.key,
            timer,
            delay,
        });
    }

    fn cancel_election(&mut self, env: &mut Env<'_>) {
        if let Some(timer) = self.election.take() {
            env.actions.push(Action::Cancel(timer));
        }
    }

    pub(crate) fn handle_timeout(&mut self, timer: TimerHandle, env: &mut Env<'_>) {
        if self.election == Some(timer) {
            self.election = None;
            if self.is_electing() {
                warn!("key {} election at {} timed out", self.key, self.ballot);
                self.prepare(env);
            }
            return;
        }
        if self.backoff != Some(timer) {
            debug!("key {} ignoring stale {}", self.key, timer);
            return;
        }
        self.backoff = None;
        if self.requests.is_empty() || self.is_active() || self.is_electing() {
            return;
        }
        match self.live_leader(env) {
            Some(leader) => self.hand_off(leader, env),
            None => self.prepare(env),
        }
    }

    //
    // phase 2
    //

    fn propose(&mut self, request: Request, env: &mut Env<'_>) {
        self.slot += 1;
        let slot = self.slot;
        let command = request.command.clone();
        debug!("key {} proposing {} at slot {}", self.key, request, slot);

        let mut entry = LogEntry::new(self.ballot, command.clone());
        entry.request = Some(request);
        entry.quorum.ack(env.id);
        self.log.insert(slot, entry);

        let accept = Accept {
            ballot: self.ballot,
            slot,
            command,
        };
        env.send(self.key, Rpc::Accept(accept), MessageDestination::Broadcast);
        self.try_commit(slot, env);
    }

    pub(crate) fn handle_accept(&mut self, msg: Accept, env: &mut Env<'_>) {
        let Accept {
            ballot,
            slot,
            command,
        } = msg;
        let leader = ballot.id();
        let mut displaced = None;
        if ballot >= self.ballot {
            self.adopt(ballot, env);
            if self.role == Idle {
                self.role = Follower;
            }
            self.leader_contact = Some(env.now);
            self.slot = self.slot.max(slot);
            match self.log.get_mut(&slot) {
                Some(entry) if entry.committed => {}
                Some(entry) if ballot >= entry.ballot => {
                    if entry.command != command {
                        displaced = entry.request.take();
                    }
                    entry.ballot = ballot;
                    entry.command = command;
                }
                Some(_) => {}
                None => {
                    self.log.insert(slot, LogEntry::new(ballot, command));
                }
            }
            self.hand_off(leader, env);
        } else {
            debug!("key {} refusing accept at {} below {}", self.key, ballot, self.ballot);
        }

        let accepted = Accepted {
            from: env.id,
            ballot: self.ballot,
            slot,
        };
        env.send(self.key, Rpc::Accepted(accepted), MessageDestination::To(leader));

        if let Some(request) = displaced {
            self.handle_request(request, env);
        }
    }

    pub(crate) fn handle_accepted(&mut self, msg: Accepted, env: &mut Env<'_>) {
        let Accepted { from, ballot, slot } = msg;
        let entry = match self.log.get_mut(&slot) {
            Some(entry) => entry,
            None => {
                debug!("key {} ignoring accepted for unknown slot {}", self.key, slot);
                return;
            }
        };
        if entry.committed || ballot < entry.ballot {
            return;
        }
        if ballot == entry.ballot {
            if ballot.id() == env.id {
                entry.quorum.ack(from);
                self.try_commit(slot, env);
            }
            return;
        }

        // The responder promised a higher ballot: this proposal is superseded.
        warn!("key {} slot {} superseded by {} from {}", self.key, slot, ballot, from);
        let request = entry.request.take();
        self.adopt(ballot, env);
        if let Some(request) = request {
            self.requests.push(request);
            self.schedule_retry(env);
        }
    }

    fn try_commit(&mut self, slot: Slot, env: &mut Env<'_>) {
        let key = self.key;
        let entry = match self.log.get_mut(&slot) {
            Some(entry) => entry,
            None => return,
        };
        if entry.committed || !env.config.q2(&entry.quorum) {
            return;
        }
        entry.committed = true;
        debug!("key {} committed {} at slot {}", key, entry.command, slot);

        let commit = Commit {
            ballot: entry.ballot,
            slot,
            command: entry.command.clone(),
        };
        env.send(key, Rpc::Commit(commit), MessageDestination::Broadcast);
        if env.config.reply_when_commit {
            if let Some(request) = entry.request.take() {
                let reply = request.reply(None, env.id, slot, entry.ballot);
                env.actions.push(Action::Reply(reply));
            }
        }
        self.advance(env);
    }

    //
    // phase 3
    //

    pub(crate) fn handle_commit(&mut self, msg: Commit, env: &mut Env<'_>) {
        let Commit {
            ballot,
            slot,
            command,
        } = msg;
        self.adopt(ballot, env);
        if ballot == self.ballot && ballot.id() != env.id {
            if self.role == Idle {
                self.role = Follower;
            }
            self.leader_contact = Some(env.now);
        }
        self.slot = self.slot.max(slot);

        let mut displaced = None;
        match self.log.get_mut(&slot) {
            Some(entry) if entry.committed => {
                if entry.command != command {
                    error!(
                        "key {} slot {} committed as {} and {}",
                        self.key, slot, entry.command, command
                    );
                    panic!("conflicting commits for key {} slot {}", self.key, slot);
                }
                return;
            }
            Some(entry) => {
                if entry.command != command {
                    displaced = entry.request.take();
                }
                entry.ballot = entry.ballot.max(ballot);
                entry.command = command;
                entry.committed = true;
                if env.config.reply_when_commit {
                    if let Some(request) = entry.request.take() {
                        let reply = request.reply(None, env.id, slot, entry.ballot);
                        env.actions.push(Action::Reply(reply));
                    }
                }
            }
            None => {
                let mut entry = LogEntry::new(ballot, command);
                entry.committed = true;
                self.log.insert(slot, entry);
            }
        }
        self.advance(env);

        if let Some(request) = displaced {
            self.handle_request(request, env);
        }
    }

    /// Moves the commit cursor over newly contiguous commits and applies them in slot order.
    fn advance(&mut self, env: &mut Env<'_>) {
        while self
            .log
            .get(&(self.commit + 1))
            .map_or(false, |entry| entry.committed)
        {
            self.commit += 1;
        }
        while self.execute <= self.commit {
            let slot = self.execute;
            let entry = match self.log.get_mut(&slot) {
                Some(entry) => entry,
                None => break,
            };
            let value = if entry.command.is_noop() {
                None
            } else {
                env.store.execute(&entry.command)
            };
            entry.quorum.reset();
            if let Some(request) = entry.request.take() {
                let reply = request.reply(value, env.id, slot, entry.ballot);
                env.actions.push(Action::Reply(reply));
            }
            self.execute += 1;
        }
    }

    //
    // migration
    //

    pub(crate) fn handle_leader_change(&mut self, msg: LeaderChange, env: &mut Env<'_>) {
        if self.is_active() {
            debug!("key {} already led here, ignoring handoff from {}", self.key, msg.from);
            return;
        }
        info!("key {} taking over from {} past {}", self.key, msg.from, msg.ballot);
        self.adopt(msg.ballot, env);
        self.prepare(env);
    }
}

//
// Env impls
//

impl Env<'_> {
    fn send(&mut self, key: Key, rpc: Rpc, dest: MessageDestination) {
        self.actions
            .push(Action::Send(SendableMessage::new(key, rpc, dest)));
    }

    fn timer(&mut self) -> TimerHandle {
        *self.timers += 1;
        TimerHandle::new(*self.timers)
    }

    /// A random delay in `[0, backoff]`, at microsecond granularity.
    fn backoff(&mut self) -> Duration {
        let bound = u64::try_from(self.config.backoff.as_micros()).unwrap_or(u64::MAX);
        let random = self.random.next_u64();
        let micros = match bound.checked_add(1) {
            Some(range) => random % range,
            None => random,
        };
        Duration::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;

    use crate::quorum::Topology;
    use crate::store::InMemoryStore;

    use super::*;

    fn backoffs(backoff: Duration) -> Vec<Duration> {
        let mut config = Config::new(Topology::uniform(1, 3));
        config.backoff = backoff;
        let mut store = InMemoryStore::new();
        let mut random = ChaChaRng::seed_from_u64(7);
        let mut timers = 0;
        let mut actions = Vec::new();
        let mut env = Env {
            id: NodeId::new(1, 1),
            config: &config,
            store: &mut store,
            random: &mut random,
            timers: &mut timers,
            now: Instant::now(),
            actions: &mut actions,
        };
        (0..100).map(|_| env.backoff()).collect()
    }

    #[test]
    fn zero_backoff_never_waits() {
        assert!(backoffs(Duration::from_secs(0))
            .iter()
            .all(|&delay| delay == Duration::from_secs(0)));
    }

    #[test]
    fn backoff_stays_within_bound() {
        let bound = Duration::from_millis(100);
        let delays = backoffs(bound);
        assert!(delays.iter().all(|&delay| delay <= bound));
        assert!(delays.iter().any(|&delay| delay != delays[0]));
    }

    #[test]
    fn huge_backoff_does_not_overflow() {
        let delays = backoffs(Duration::MAX);
        assert_eq!(delays.len(), 100);
        assert!(delays.iter().all(|&delay| delay <= Duration::MAX));
    }
}
