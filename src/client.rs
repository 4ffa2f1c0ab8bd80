use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, warn};
use rand::seq::SliceRandom;

use paxos::message::{Key, RequestId};
use paxos::{ClientId, Command, NodeId, Reply, Request};

use crate::error::ClientError;
use crate::history::{History, Operation};
use crate::node::{Address, Bus, Envelope};

/// A handle submitting commands to a [`Cluster`](crate::Cluster) from one zone.
///
/// Requests go to a random replica of the client's zone, which orders them or forwards them to the key's leader. A
/// redirecting reply sends the next attempt straight to the leader it names.
pub struct Client {
    id: ClientId,
    bus: Bus,
    inbox: Receiver<Envelope>,
    local: Vec<NodeId>,
    timeout: Duration,
    retries: usize,
    next_request: RequestId,
    history: History,
}

impl Client {
    pub(crate) fn new(id: ClientId, bus: Bus, local: Vec<NodeId>, timeout: Duration, retries: usize) -> Self {
        let inbox = bus.subscribe(Address::Client(id));
        Client {
            id,
            bus,
            inbox,
            local,
            timeout,
            retries,
            next_request: 0,
            history: History::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The value of `key`.
    pub fn get(&mut self, key: Key) -> Result<Option<Bytes>, ClientError> {
        self.execute(Command::get(key)).map(|reply| reply.value)
    }

    /// Sets `key` to `value`, returning the value it replaced.
    pub fn put<V: Into<Bytes>>(&mut self, key: Key, value: V) -> Result<Option<Bytes>, ClientError> {
        self.execute(Command::put(key, value)).map(|reply| reply.value)
    }

    /// Removes `key`, returning the value it held.
    pub fn delete(&mut self, key: Key) -> Result<Option<Bytes>, ClientError> {
        self.execute(Command::delete(key)).map(|reply| reply.value)
    }

    /// Orders `command`, retrying on timeouts and redirects. A retried command may be executed more than once.
    pub fn execute(&mut self, command: Command) -> Result<Reply, ClientError> {
        let start = Utc::now();
        let mut target = self.pick()?;
        let mut failure = ClientError::Rejected { leader: None };

        for attempt in 0..=self.retries {
            self.next_request += 1;
            let request = Request::new(self.next_request, self.id, command.clone());
            debug!("{} attempt {} of {} to {}", self.id, attempt + 1, command, target);
            if self
                .bus
                .send(&Address::Node(target), Envelope::Request(request))
                .is_err()
            {
                return Err(ClientError::Disconnected);
            }

            match self.wait(self.next_request)? {
                Some(reply) if reply.ok => {
                    self.history.add(Operation {
                        command,
                        value: reply.value.clone(),
                        slot: reply.slot,
                        leader: reply.leader,
                        start,
                        end: Utc::now(),
                    });
                    return Ok(reply);
                }
                Some(reply) => {
                    debug!("{} redirected to {:?}", self.id, reply.leader);
                    failure = ClientError::Rejected { leader: reply.leader };
                    target = match reply.leader {
                        Some(leader) => leader,
                        None => self.pick()?,
                    };
                }
                None => {
                    warn!("{} got no reply from {} within {:?}", self.id, target, self.timeout);
                    failure = ClientError::Timeout {
                        request: self.next_request,
                        after: self.timeout,
                    };
                    target = self.pick()?;
                }
            }
        }
        Err(failure)
    }

    /// The operations this client completed.
    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn take_history(&mut self) -> History {
        std::mem::take(&mut self.history)
    }

    fn pick(&self) -> Result<NodeId, ClientError> {
        self.local
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(ClientError::UnknownZone(self.id.zone))
    }

    /// Waits for the reply to `request`, discarding late replies to earlier attempts.
    fn wait(&self, request: RequestId) -> Result<Option<Reply>, ClientError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.inbox.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(Envelope::Reply(reply)) if reply.request == request => return Ok(Some(reply)),
                Ok(envelope) => debug!("{} discarding {:?}", self.id, envelope),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Disconnected),
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.bus.unsubscribe(&Address::Client(self.id));
    }
}
