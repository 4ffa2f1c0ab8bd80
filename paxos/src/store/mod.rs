//! The replicated state machine.
//!
//! Committed commands are applied to a [`StateMachine`] strictly in slot order, once per key per slot. The crate
//! ships [`InMemoryStore`], a key-value map.

pub use memory::InMemoryStore;

use bytes::Bytes;

use crate::message::Command;

mod memory;

/// A deterministic state machine driven by committed commands.
pub trait StateMachine {
    /// Applies `command`, returning the value it read or replaced.
    fn execute(&mut self, command: &Command) -> Option<Bytes>;
}

impl<S: StateMachine + ?Sized> StateMachine for Box<S> {
    fn execute(&mut self, command: &Command) -> Option<Bytes> {
        (**self).execute(command)
    }
}
