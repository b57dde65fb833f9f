use serde_derive::{Deserialize, Serialize};

use crate::state::{self, NodeId};

/// Round identifier. Ordered by `number` first, then by the proposing
/// participant, which gives a total order across the roster.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProposalId {
    pub number: u64,
    pub uid: NodeId,
}

impl ProposalId {
    pub fn new(number: u64, uid: NodeId) -> Self {
        ProposalId { number, uid }
    }

    /// Smallest round owned by `uid` that is strictly greater than `self`.
    pub fn next(self, uid: NodeId) -> Self {
        ProposalId {
            number: self.number + 1,
            uid,
        }
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}", self.number, self.uid)
    }
}

/// Protocol messages exchanged between participants.
///
/// Replies (`Promise`, `Nack`) name the `proposer` they answer; every
/// message is still broadcast, and participants that are not `proposer`
/// ignore them.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""), PartialEq(bound = ""))]
pub enum Message<V: state::Value> {
    Prepare {
        from: NodeId,
        proposal_id: ProposalId,
    },
    Nack {
        from: NodeId,
        proposer: NodeId,
        proposal_id: ProposalId,
        promised_id: ProposalId,
    },
    Promise {
        from: NodeId,
        proposer: NodeId,
        proposal_id: ProposalId,
        last_accepted_id: Option<ProposalId>,
        last_accepted_value: Option<V>,
    },
    Accept {
        from: NodeId,
        proposal_id: ProposalId,
        value: V,
    },
    Accepted {
        from: NodeId,
        proposal_id: ProposalId,
        value: V,
    },
    Resolution {
        from: NodeId,
        value: V,
    },
}

impl<V: state::Value> Message<V> {
    /// Participant that emitted this message.
    pub fn from(&self) -> NodeId {
        match self {
        | Message::Prepare { from, .. }
        | Message::Nack { from, .. }
        | Message::Promise { from, .. }
        | Message::Accept { from, .. }
        | Message::Accepted { from, .. }
        | Message::Resolution { from, .. } => *from,
        }
    }

    /// Round this message belongs to. `Resolution` is round-less.
    pub fn proposal_id(&self) -> Option<ProposalId> {
        match self {
        | Message::Prepare { proposal_id, .. }
        | Message::Nack { proposal_id, .. }
        | Message::Promise { proposal_id, .. }
        | Message::Accept { proposal_id, .. }
        | Message::Accepted { proposal_id, .. } => Some(*proposal_id),
        | Message::Resolution { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
        | Message::Prepare { .. } => "prepare",
        | Message::Nack { .. } => "nack",
        | Message::Promise { .. } => "promise",
        | Message::Accept { .. } => "accept",
        | Message::Accepted { .. } => "accepted",
        | Message::Resolution { .. } => "resolution",
        }
    }

    pub fn is_resolution(&self) -> bool {
        match self {
        | Message::Resolution { .. } => true,
        | _ => false,
        }
    }
}
