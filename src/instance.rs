//! # Summary
//!
//! This module defines `Instance`, the single-decree Paxos state machine for
//! one key. A participant plays all three roles in the same instance:
//!
//! - as a proposer it opens rounds, collects promises and issues `Accept`;
//! - as an acceptor it answers `Prepare` and `Accept`;
//! - as a learner it counts `Accepted` messages and resolves on a quorum.
//!
//! Every transition consumes one message and emits at most one. The instance
//! performs no I/O: routing the emitted message is the caller's concern.

use std::collections::HashSet as Set;

use hashbrown::HashMap as Map;

use crate::error::{Error, Result};
use crate::message::{Message, ProposalId};
use crate::state::{self, NodeId};

/// Coarse protocol phase, derived from the instance fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Not driving a round.
    Following,
    /// Driving a round, waiting for a quorum of promises.
    Preparing,
    /// Driving a round whose `Accept` has been issued.
    Accepting,
    /// Driving a round an acceptor rejected, waiting to be restarted.
    Preempted,
    /// Final value known.
    Resolved,
}

/// Acceptors counted for one round by the learner role.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
struct Acceptance<V: state::Value> {
    value: V,
    acceptors: Set<NodeId>,
}

#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct Instance<V: state::Value> {
    /// Participant owning this instance
    network_uid: NodeId,

    /// Number of distinct participants needed for a decision
    quorum_size: usize,

    /// Value this participant asked for, if it ever proposed
    proposed_value: Option<V>,

    /// Round this participant is driving
    proposal_id: Option<ProposalId>,

    /// Highest round observed in any message
    highest_proposal_id: ProposalId,

    /// Whether this participant drives `proposal_id`
    leader: bool,

    /// Promises for `proposal_id`
    promises_received: Set<NodeId>,

    /// Nacks for `proposal_id`. Any entry stalls the round until the
    /// next `propose`
    nacks_received: Set<NodeId>,

    /// Highest accepted round reported by promises for `proposal_id`
    last_accepted_id: Option<ProposalId>,

    /// Value accepted under `last_accepted_id`
    last_accepted_value: Option<V>,

    /// Highest round this acceptor promised
    promised_id: Option<ProposalId>,

    /// Round of the most recently accepted value
    accepted_id: Option<ProposalId>,

    /// Most recently accepted value
    accepted_value: Option<V>,

    /// Acceptances seen by the learner, per round
    accepts_received: Map<ProposalId, Acceptance<V>>,

    /// Latest round counted for each acceptor
    acceptors: Map<NodeId, ProposalId>,

    final_value: Option<V>,

    final_proposal_id: Option<ProposalId>,
}

impl<V: state::Value> Instance<V> {
    pub fn new(network_uid: NodeId, quorum_size: usize) -> Self {
        Instance {
            network_uid,
            quorum_size,
            proposed_value: None,
            proposal_id: None,
            highest_proposal_id: ProposalId::default(),
            leader: false,
            promises_received: Set::default(),
            nacks_received: Set::default(),
            last_accepted_id: None,
            last_accepted_value: None,
            promised_id: None,
            accepted_id: None,
            accepted_value: None,
            accepts_received: Map::default(),
            acceptors: Map::default(),
            final_value: None,
            final_proposal_id: None,
        }
    }

    pub fn network_uid(&self) -> NodeId {
        self.network_uid
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn proposed_value(&self) -> Option<&V> {
        self.proposed_value.as_ref()
    }

    pub fn proposal_id(&self) -> Option<ProposalId> {
        self.proposal_id
    }

    pub fn promised_id(&self) -> Option<ProposalId> {
        self.promised_id
    }

    pub fn accepted_id(&self) -> Option<ProposalId> {
        self.accepted_id
    }

    pub fn accepted_value(&self) -> Option<&V> {
        self.accepted_value.as_ref()
    }

    pub fn final_value(&self) -> Option<&V> {
        self.final_value.as_ref()
    }

    pub fn final_proposal_id(&self) -> Option<ProposalId> {
        self.final_proposal_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn promises_received(&self) -> usize {
        self.promises_received.len()
    }

    pub fn nacks_received(&self) -> usize {
        self.nacks_received.len()
    }

    pub fn is_resolved(&self) -> bool {
        self.final_value.is_some()
    }

    pub fn is_preempted(&self) -> bool {
        self.leader && !self.nacks_received.is_empty()
    }

    pub fn phase(&self) -> Phase {
        if self.is_resolved() {
            Phase::Resolved
        } else if !self.leader {
            Phase::Following
        } else if self.is_preempted() {
            Phase::Preempted
        } else if self.promises_received.len() < self.quorum_size {
            Phase::Preparing
        } else {
            Phase::Accepting
        }
    }

    /// Client request to decide `value`. The first proposed value sticks.
    /// A participant driving a live round does not open another one, while
    /// a preempted one restarts above everything it has observed.
    pub fn propose(&mut self, value: V) -> Option<Message<V>> {
        if self.is_resolved() {
            return None
        }
        if self.proposed_value.is_none() {
            self.proposed_value = Some(value);
        }
        if self.leader && !self.is_preempted() {
            return None
        }
        Some(self.prepare())
    }

    /// Consume one inbound message.
    pub fn receive(&mut self, message: &Message<V>) -> Result<Option<Message<V>>> {
        trace!("{} received {:?}", self.network_uid, message);
        if self.is_resolved() {
            return self.receive_resolved(message)
        }
        match message {
        | Message::Prepare { from, proposal_id } => {
            Ok(Some(self.receive_prepare(*from, *proposal_id)))
        }
        | Message::Promise { from, proposer, proposal_id, last_accepted_id, last_accepted_value } => {
            Ok(self.receive_promise(
                *from,
                *proposer,
                *proposal_id,
                *last_accepted_id,
                last_accepted_value.as_ref(),
            ))
        }
        | Message::Accept { from, proposal_id, value } => {
            Ok(Some(self.receive_accept(*from, *proposal_id, value)))
        }
        | Message::Accepted { from, proposal_id, value } => {
            self.receive_accepted(*from, *proposal_id, value)
        }
        | Message::Nack { from, proposer, proposal_id, promised_id } => {
            Ok(self.receive_nack(*from, *proposer, *proposal_id, *promised_id))
        }
        | Message::Resolution { value, .. } => {
            self.resolve(None, value.clone());
            Ok(None)
        }
        }
    }

    fn observe(&mut self, proposal_id: ProposalId) {
        if proposal_id > self.highest_proposal_id {
            self.highest_proposal_id = proposal_id;
        }
    }

    /// Open a round strictly above everything observed so far.
    fn prepare(&mut self) -> Message<V> {
        let proposal_id = self.highest_proposal_id.next(self.network_uid);
        debug!("{} preparing round {}", self.network_uid, proposal_id);
        self.observe(proposal_id);
        self.proposal_id = Some(proposal_id);
        self.leader = true;
        self.promises_received.clear();
        self.nacks_received.clear();
        self.last_accepted_id = None;
        self.last_accepted_value = None;
        Message::Prepare {
            from: self.network_uid,
            proposal_id,
        }
    }

    fn receive_prepare(&mut self, from: NodeId, proposal_id: ProposalId) -> Message<V> {
        self.observe(proposal_id);
        match self.promised_id {
        | Some(promised_id) if proposal_id <= promised_id => {
            Message::Nack {
                from: self.network_uid,
                proposer: from,
                proposal_id,
                promised_id,
            }
        }
        | _ => {
            self.promised_id = Some(proposal_id);
            Message::Promise {
                from: self.network_uid,
                proposer: from,
                proposal_id,
                last_accepted_id: self.accepted_id,
                last_accepted_value: self.accepted_value.clone(),
            }
        }
        }
    }

    fn receive_promise(
        &mut self,
        from: NodeId,
        proposer: NodeId,
        proposal_id: ProposalId,
        last_accepted_id: Option<ProposalId>,
        last_accepted_value: Option<&V>,
    ) -> Option<Message<V>> {
        self.observe(proposal_id);
        if !self.leader
        || self.is_preempted()
        || proposer != self.network_uid
        || self.proposal_id != Some(proposal_id)
        || !self.promises_received.insert(from) {
            return None
        }

        // Adopt the value accepted under the highest round in the quorum
        if last_accepted_id > self.last_accepted_id {
            self.last_accepted_id = last_accepted_id;
            self.last_accepted_value = last_accepted_value.cloned();
        }

        if self.promises_received.len() != self.quorum_size {
            return None
        }

        let value = self.last_accepted_value
            .clone()
            .or_else(|| self.proposed_value.clone())?;
        debug!("{} round {} promised by quorum", self.network_uid, proposal_id);
        Some(Message::Accept {
            from: self.network_uid,
            proposal_id,
            value,
        })
    }

    fn receive_accept(&mut self, from: NodeId, proposal_id: ProposalId, value: &V) -> Message<V> {
        self.observe(proposal_id);
        match self.promised_id {
        | Some(promised_id) if proposal_id < promised_id => {
            Message::Nack {
                from: self.network_uid,
                proposer: from,
                proposal_id,
                promised_id,
            }
        }
        | _ => {
            self.promised_id = Some(proposal_id);
            self.accepted_id = Some(proposal_id);
            self.accepted_value = Some(value.clone());
            Message::Accepted {
                from: self.network_uid,
                proposal_id,
                value: value.clone(),
            }
        }
        }
    }

    fn receive_accepted(&mut self, from: NodeId, proposal_id: ProposalId, value: &V) -> Result<Option<Message<V>>> {
        self.observe(proposal_id);

        if let Some(acceptance) = self.accepts_received.get(&proposal_id) {
            if acceptance.value != *value {
                return Err(Error::SafetyViolation(format!(
                    "round {} accepted both {:?} and {:?}",
                    proposal_id, acceptance.value, value,
                )))
            }
        }

        // Out-of-date or repeated acceptance from this acceptor
        if let Some(previous) = self.acceptors.get(&from).copied() {
            if proposal_id <= previous {
                return Ok(None)
            }
            let empty = match self.accepts_received.get_mut(&previous) {
            | Some(acceptance) => {
                acceptance.acceptors.remove(&from);
                acceptance.acceptors.is_empty()
            }
            | None => false,
            };
            if empty {
                self.accepts_received.remove(&previous);
            }
        }
        self.acceptors.insert(from, proposal_id);

        let acceptance = self.accepts_received
            .entry(proposal_id)
            .or_insert_with(|| Acceptance {
                value: value.clone(),
                acceptors: Set::default(),
            });

        acceptance.acceptors.insert(from);
        if acceptance.acceptors.len() < self.quorum_size {
            return Ok(None)
        }

        self.resolve(Some(proposal_id), value.clone());
        Ok(Some(Message::Resolution {
            from: self.network_uid,
            value: value.clone(),
        }))
    }

    fn receive_nack(
        &mut self,
        from: NodeId,
        proposer: NodeId,
        proposal_id: ProposalId,
        promised_id: ProposalId,
    ) -> Option<Message<V>> {
        self.observe(promised_id);
        if !self.leader
        || proposer != self.network_uid
        || self.proposal_id != Some(proposal_id) {
            return None
        }
        if self.nacks_received.is_empty() {
            debug!("{} round {} preempted by {}", self.network_uid, proposal_id, promised_id);
        }
        self.nacks_received.insert(from);
        None
    }

    fn receive_resolved(&mut self, message: &Message<V>) -> Result<Option<Message<V>>> {
        let final_value = match &self.final_value {
        | Some(value) => value.clone(),
        | None => return Ok(None),
        };
        match message {
        | Message::Resolution { value, .. } if *value != final_value => {
            Err(Error::SafetyViolation(format!(
                "resolved to {:?} but received resolution {:?}",
                final_value, value,
            )))
        }
        | Message::Prepare { .. }
        | Message::Accept { .. } => {
            Ok(Some(Message::Resolution {
                from: self.network_uid,
                value: final_value,
            }))
        }
        | _ => Ok(None),
        }
    }

    fn resolve(&mut self, proposal_id: Option<ProposalId>, value: V) {
        info!("{} resolved {:?}", self.network_uid, value);
        self.final_value = Some(value);
        self.final_proposal_id = proposal_id;
        self.leader = false;
        self.accepts_received.clear();
        self.acceptors.clear();
    }
}
