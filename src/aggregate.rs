//! # Summary
//!
//! This module wraps one `Instance` per key behind an event-sourced identity.
//! The recorded history is the instance's input: replaying it through
//! `apply_event` rebuilds the state, and live processing goes through the
//! same function for every event it records.
//!
//! Messages the instance emits are recorded as `Announced` events and then
//! delivered back to the same instance as `Received`, since every message is
//! addressed to all participants including the sender.

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::message::Message;
use crate::state::{self, NodeId};

/// Entry in an aggregate's history.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""), PartialEq(bound = ""))]
pub enum Event<V: state::Value> {
    /// First event of every aggregate.
    Started {
        network_uid: NodeId,
        quorum_size: usize,
    },

    /// A client asked this participant to propose a value.
    Proposed(V),

    /// A message was consumed by the instance.
    Received(Message<V>),

    /// A message was emitted for every participant.
    Announced(Message<V>),
}

/// Input driving an aggregate forward.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub enum Input<V: state::Value> {
    /// Synthetic start message carrying the client's value.
    Start(V),

    /// Protocol message from a peer.
    Deliver(Message<V>),
}

#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct Aggregate<K: state::Identifier, V: state::Value> {
    key: K,

    instance: Instance<V>,

    /// Events applied, including pending ones
    version: u64,

    /// Events known to be in the log
    committed: u64,

    /// Events not yet appended to the log
    pending: Vec<Event<V>>,
}

impl<K: state::Identifier, V: state::Value> Aggregate<K, V> {
    /// Creates a new aggregate whose `Started` event is pending.
    pub fn start(key: K, network_uid: NodeId, quorum_size: usize) -> Self {
        let mut aggregate = Aggregate {
            key,
            instance: Instance::new(network_uid, quorum_size),
            version: 0,
            committed: 0,
            pending: Vec::new(),
        };
        aggregate.pending.push(Event::Started { network_uid, quorum_size });
        aggregate.version = 1;
        aggregate
    }

    /// Rebuilds an aggregate from its recorded history.
    pub fn load(key: K, events: Vec<Event<V>>) -> Result<Self> {
        let mut events = events.into_iter();
        let instance = match events.next() {
        | Some(Event::Started { network_uid, quorum_size }) => Instance::new(network_uid, quorum_size),
        | Some(event) => return Err(Error::Corrupted(format!("history of {:?} starts with {:?}", key, event))),
        | None => return Err(Error::NotFound),
        };
        let mut aggregate = Aggregate {
            key,
            instance,
            version: 1,
            committed: 1,
            pending: Vec::new(),
        };
        for event in events {
            aggregate.apply_event(&event)?;
            aggregate.version += 1;
        }
        aggregate.committed = aggregate.version;
        Ok(aggregate)
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn instance(&self) -> &Instance<V> {
        &self.instance
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version the log held when this aggregate was read or last saved.
    pub fn committed_version(&self) -> u64 {
        self.committed
    }

    pub fn final_value(&self) -> Result<&V> {
        self.instance.final_value().ok_or(Error::NotResolved)
    }

    /// Runs `input` through the instance and returns every announced message.
    pub fn apply(&mut self, input: Input<V>) -> Result<Vec<Message<V>>> {
        let event = match input {
        | Input::Start(value) => Event::Proposed(value),
        | Input::Deliver(message) => Event::Received(message),
        };
        let output = self.trigger(event)?;
        self.announce(output)
    }

    pub fn propose(&mut self, value: V) -> Result<Vec<Message<V>>> {
        self.apply(Input::Start(value))
    }

    pub fn receive(&mut self, message: Message<V>) -> Result<Vec<Message<V>>> {
        self.apply(Input::Deliver(message))
    }

    /// Hands over the pending events for appending.
    pub fn take_pending(&mut self) -> Vec<Event<V>> {
        std::mem::replace(&mut self.pending, Vec::new())
    }

    /// Marks every applied event as stored.
    pub fn mark_committed(&mut self) {
        self.committed = self.version;
    }

    fn trigger(&mut self, event: Event<V>) -> Result<Option<Message<V>>> {
        let output = self.apply_event(&event)?;
        self.pending.push(event);
        self.version += 1;
        Ok(output)
    }

    /// Records `output` and delivers it back to this instance, repeating
    /// for whatever that delivery emits. A resolution ends the chain.
    fn announce(&mut self, mut output: Option<Message<V>>) -> Result<Vec<Message<V>>> {
        let mut announced = Vec::new();
        while let Some(message) = output.take() {
            self.trigger(Event::Announced(message.clone()))?;
            announced.push(message.clone());
            if message.is_resolution() {
                break
            }
            output = self.trigger(Event::Received(message))?;
        }
        Ok(announced)
    }

    /// State transition for one recorded event.
    fn apply_event(&mut self, event: &Event<V>) -> Result<Option<Message<V>>> {
        match event {
        | Event::Started { .. } => {
            Err(Error::Corrupted(format!("{:?} started twice", self.key)))
        }
        | Event::Proposed(value) => Ok(self.instance.propose(value.clone())),
        | Event::Received(message) => self.instance.receive(message),
        | Event::Announced(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProposalId;

    #[test]
    fn propose_records_self_delivery() {
        let mut aggregate: Aggregate<u8, u64> = Aggregate::start(7, 0, 2);
        let announced = aggregate.propose(11111).unwrap();
        let round = ProposalId::new(1, 0);
        let promise = Message::Promise {
            from: 0,
            proposer: 0,
            proposal_id: round,
            last_accepted_id: None,
            last_accepted_value: None,
        };
        assert_eq!(announced, vec![
            Message::Prepare { from: 0, proposal_id: round },
            promise.clone(),
        ]);
        assert_eq!(aggregate.take_pending(), vec![
            Event::Started { network_uid: 0, quorum_size: 2 },
            Event::Proposed(11111),
            Event::Announced(Message::Prepare { from: 0, proposal_id: round }),
            Event::Received(Message::Prepare { from: 0, proposal_id: round }),
            Event::Announced(promise.clone()),
            Event::Received(promise),
        ]);
        assert_eq!(aggregate.version(), 6);
        assert_eq!(aggregate.committed_version(), 0);
    }

    #[test]
    fn replay_rebuilds_live_state() {
        let mut live: Aggregate<u8, u64> = Aggregate::start(7, 1, 2);
        let round = ProposalId::new(1, 0);
        live.receive(Message::Accept { from: 0, proposal_id: round, value: 5 }).unwrap();
        let resolved = live.receive(Message::Accepted { from: 0, proposal_id: round, value: 5 }).unwrap();
        assert_eq!(resolved, vec![Message::Resolution { from: 1, value: 5 }]);

        let history = live.take_pending();
        let replayed = Aggregate::load(7, history).unwrap();
        assert_eq!(replayed.version(), live.version());
        assert_eq!(replayed.committed_version(), replayed.version());
        assert_eq!(replayed.final_value().unwrap(), &5);
        assert_eq!(replayed.instance().accepted_id(), Some(round));
        assert_eq!(replayed.instance().promised_id(), live.instance().promised_id());
    }

    #[test]
    fn load_requires_started_history() {
        let empty: Result<Aggregate<u8, u64>> = Aggregate::load(1, Vec::new());
        assert!(matches!(empty, Err(Error::NotFound)));

        let headless: Result<Aggregate<u8, u64>> = Aggregate::load(1, vec![Event::Proposed(3)]);
        assert!(matches!(headless, Err(Error::Corrupted(_))));
    }

    #[test]
    fn unresolved_aggregate_reports_not_resolved() {
        let mut aggregate: Aggregate<u8, u64> = Aggregate::start(1, 2, 2);
        aggregate.propose(9).unwrap();
        assert!(matches!(aggregate.final_value(), Err(Error::NotResolved)));
    }
}
