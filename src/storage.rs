//! # Summary
//!
//! This module abstracts over a participant's durable log. A log stores the
//! event history of every aggregate it owns, publishes the announced messages
//! of those aggregates as pipeline notifications, and tracks how far this
//! participant has consumed each upstream pipeline.
//!
//! All three are written by one atomic `append`, so a crash can never leave
//! events without the cursor that produced them, or the reverse.

use serde_derive::{Deserialize, Serialize};

use crate::aggregate::Event;
use crate::error::Result;
use crate::message::Message;
use crate::state::{self, NodeId, PipelineId};

/// Append-only backing store.
pub(crate) mod memory;

/// File-backed store.
pub(crate) mod file;

pub use self::file::FileLog;
pub use self::memory::MemoryLog;

/// Position of the last notification applied from `upstream` on `pipeline`.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tracking {
    pub upstream: NodeId,
    pub pipeline: PipelineId,
    pub position: u64,
}

/// One atomic write against a participant's log.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct Record<K: state::Identifier, V: state::Value> {
    pub key: K,

    /// Number of events the writer saw for `key`
    pub expected_version: u64,

    pub events: Vec<Event<V>>,

    /// Pipeline the `Announced` events are published on
    pub pipeline: PipelineId,

    /// Cursor advanced together with these events
    pub tracking: Option<Tracking>,
}

/// Announced message as seen by downstream participants.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""), PartialEq(bound = ""))]
pub struct Notification<K: state::Identifier, V: state::Value> {
    pub pipeline: PipelineId,

    /// Gap-free, starting at 1
    pub position: u64,

    pub originator: NodeId,

    pub key: K,

    pub message: Message<V>,
}

/// Durable event log owned by one participant.
///
/// `append` must check `expected_version` against the stored history of the
/// key and `tracking.position` against the stored cursor (it must be exactly
/// one past it), failing with `ConcurrencyConflict` otherwise, and must apply
/// the whole record or nothing.
pub trait EventLog<K: state::Identifier, V: state::Value>: Send + Sync {
    /// Participant owning this log.
    fn owner(&self) -> NodeId;

    /// Recorded history of `key`, oldest first. Empty if unknown.
    fn read(&self, key: &K) -> Result<Vec<Event<V>>>;

    /// Every key with recorded history, in no particular order.
    fn keys(&self) -> Result<Vec<K>>;

    /// Appends a record, returning the positions assigned to its
    /// announced messages.
    fn append(&self, record: Record<K, V>) -> Result<Vec<u64>>;

    /// Up to `limit` notifications on `pipeline` with position above `after`.
    fn read_from(&self, pipeline: PipelineId, after: u64, limit: usize) -> Result<Vec<Notification<K, V>>>;

    /// Last applied position from `upstream` on `pipeline`, 0 if none.
    fn position(&self, upstream: NodeId, pipeline: PipelineId) -> Result<u64>;
}
