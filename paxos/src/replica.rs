//! The replica coordinator.
//!
//! A [`Replica`] owns one [`KeyInstance`] per key it has heard of, created lazily, and routes client requests,
//! protocol messages and timer callbacks to them. While it leads a key it also feeds the key's request origins into a
//! leader migration [`Policy`] and hands the key over when the policy asks for it.
//!
//! A replica performs no I/O. Every entry point takes the current time and returns the [`Action`]s the caller must
//! carry out.

use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, error, info};
use rand_core::RngCore;

use crate::ballot::Ballot;
use crate::config::Config;
use crate::id::NodeId;
use crate::instance::{Env, KeyInstance};
use crate::message::*;
use crate::policy::{new_policy, Policy};
use crate::store::StateMachine;
use crate::timer::TimerHandle;

/// One member of a replica group.
pub struct Replica<S, R> {
    id: NodeId,
    config: Config,
    store: S,
    random: R,
    timers: u64,
    instances: BTreeMap<Key, KeyInstance>,
    policies: BTreeMap<Key, Box<dyn Policy>>,
}

impl<S, R> Replica<S, R>
where
    S: StateMachine,
    R: RngCore,
{
    /// Constructs a replica named `id`, applying committed commands to `store` and drawing election backoff delays
    /// from `random`.
    pub fn new(id: NodeId, config: Config, store: S, random: R) -> Self {
        Self {
            id,
            config,
            store,
            random,
            timers: 0,
            instances: BTreeMap::new(),
            policies: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consumes the replica, returning its state machine.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn instance(&self, key: Key) -> Option<&KeyInstance> {
        self.instances.get(&key)
    }

    /// Whether this replica currently leads `key`.
    pub fn is_leader(&self, key: Key) -> bool {
        self.instances
            .get(&key)
            .map_or(false, KeyInstance::is_active)
    }

    /// The replica this one believes leads `key`.
    pub fn leader(&self, key: Key) -> Option<NodeId> {
        self.instances.get(&key).and_then(KeyInstance::leader)
    }

    pub fn ballot(&self, key: Key) -> Ballot {
        self.instances
            .get(&key)
            .map_or(Ballot::ZERO, KeyInstance::ballot)
    }

    /// The number of keys this replica currently leads.
    pub fn active_keys(&self) -> usize {
        self.instances.values().filter(|instance| instance.is_active()).count()
    }

    /// Orders a client request, directly if this replica leads its key and otherwise through the known leader or a
    /// new election.
    #[must_use]
    pub fn handle_request(&mut self, request: Request, now: Instant) -> Vec<Action> {
        let key = request.command.key;
        let zone = request.client.zone;
        let led = self.is_leader(key);
        let mut actions = self.dispatch(key, now, |instance, env| instance.handle_request(request, env));
        if led {
            self.observe(key, zone, now, &mut actions);
        }
        actions
    }

    /// Handles a protocol message from another replica.
    #[must_use]
    pub fn receive(&mut self, message: Message, now: Instant) -> Vec<Action> {
        let Message { key, rpc } = message;
        match rpc {
            Rpc::Prepare(msg) => self.dispatch(key, now, |instance, env| instance.handle_prepare(msg, env)),
            Rpc::Promise(msg) => {
                self.expect_instance(key, "promise", msg.from);
                self.dispatch(key, now, |instance, env| instance.handle_promise(msg, env))
            }
            Rpc::Accept(msg) => self.dispatch(key, now, |instance, env| instance.handle_accept(msg, env)),
            Rpc::Accepted(msg) => {
                self.expect_instance(key, "accepted", msg.from);
                self.dispatch(key, now, |instance, env| instance.handle_accepted(msg, env))
            }
            Rpc::Commit(msg) => self.dispatch(key, now, |instance, env| instance.handle_commit(msg, env)),
            Rpc::LeaderChange(msg) => {
                if msg.to != self.id {
                    debug!("ignoring handoff of key {} addressed to {}", key, msg.to);
                    return Vec::new();
                }
                self.dispatch(key, now, |instance, env| instance.handle_leader_change(msg, env))
            }
        }
    }

    /// Handles a timer requested through [`Action::Schedule`].
    #[must_use]
    pub fn timeout(&mut self, key: Key, timer: TimerHandle, now: Instant) -> Vec<Action> {
        if !self.instances.contains_key(&key) {
            debug!("ignoring {} for unknown key {}", timer, key);
            return Vec::new();
        }
        self.dispatch(key, now, |instance, env| instance.handle_timeout(timer, env))
    }

    /// Starts an election for `key` regardless of known leadership.
    #[must_use]
    pub fn elect(&mut self, key: Key, now: Instant) -> Vec<Action> {
        self.dispatch(key, now, |instance, env| instance.prepare(env))
    }

    //
    // internal
    //

    /// Replies to our own prepares and accepts can only concern keys we already track.
    fn expect_instance(&self, key: Key, what: &str, from: NodeId) {
        if !self.instances.contains_key(&key) {
            error!("{} from {} for key {} with no local instance", what, from, key);
            panic!("{} for untracked key {}", what, key);
        }
    }

    fn dispatch<F>(&mut self, key: Key, now: Instant, handler: F) -> Vec<Action>
    where
        F: FnOnce(&mut KeyInstance, &mut Env<'_>),
    {
        let Self {
            id,
            config,
            store,
            random,
            timers,
            instances,
            policies,
        } = self;
        let instance = instances.entry(key).or_insert_with(|| KeyInstance::new(key));
        policies
            .entry(key)
            .or_insert_with(|| new_policy(&config.policy, now));

        let mut actions = Vec::new();
        let mut env = Env {
            id: *id,
            config,
            store,
            random,
            timers,
            now,
            actions: &mut actions,
        };
        handler(instance, &mut env);
        actions
    }

    fn observe(&mut self, key: Key, zone: u16, now: Instant, actions: &mut Vec<Action>) {
        let policy = match self.policies.get_mut(&key) {
            Some(policy) => policy,
            None => return,
        };
        let to = match policy.observe(zone, now) {
            Some(to) if to.zone != self.id.zone => to,
            _ => return,
        };
        let ballot = self.ballot(key);
        info!("key {} migrating to {} at {}", key, to, ballot);
        let handoff = LeaderChange {
            from: self.id,
            to,
            ballot,
        };
        actions.push(Action::Send(SendableMessage::new(
            key,
            Rpc::LeaderChange(handoff),
            MessageDestination::To(to),
        )));
    }
}
