use std::collections::BTreeMap;

use bytes::Bytes;

use crate::message::{Command, Key, Op};

use super::StateMachine;

/// A [`StateMachine`] holding values in a [`BTreeMap`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    data: BTreeMap<Key, Bytes>,
    applied: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: Key) -> Option<&Bytes> {
        self.data.get(&key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The number of commands applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

impl StateMachine for InMemoryStore {
    fn execute(&mut self, command: &Command) -> Option<Bytes> {
        self.applied += 1;
        match &command.op {
            Op::Get => self.data.get(&command.key).cloned(),
            Op::Put(value) => self.data.insert(command.key, value.clone()),
            Op::Delete => self.data.remove(&command.key),
            Op::Noop => None,
        }
    }
}
