//! # Summary
//!
//! Loads and saves the aggregates owned by one participant. Every change is
//! a read-modify-append cycle against the participant's log, retried with a
//! fresh read when another writer got there first.

use std::sync::Arc;

use hashbrown::HashMap as Map;
use parking_lot::Mutex;

use crate::aggregate::{Aggregate, Input};
use crate::error::{Error, Result};
use crate::instance::Phase;
use crate::retry::Backoff;
use crate::state::{self, NodeId, PipelineId};
use crate::storage::{EventLog, Record, Tracking};

/// Outcome of one appended change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    /// Positions assigned to the announced messages
    pub positions: Vec<u64>,

    /// Phase of the instance after the change
    pub phase: Phase,
}

pub struct Repository<K: state::Identifier, V: state::Value> {
    uid: NodeId,
    quorum_size: usize,
    log: Arc<dyn EventLog<K, V>>,

    /// Last committed state of recently used aggregates
    cache: Option<Mutex<Map<K, Aggregate<K, V>>>>,

    backoff: Backoff,
}

impl<K: state::Identifier, V: state::Value> Repository<K, V> {
    pub fn new(
        uid: NodeId,
        quorum_size: usize,
        log: Arc<dyn EventLog<K, V>>,
        cache: bool,
        backoff: Backoff,
    ) -> Self {
        Repository {
            uid,
            quorum_size,
            log,
            cache: if cache { Some(Mutex::new(Map::default())) } else { None },
            backoff,
        }
    }

    pub fn log(&self) -> &Arc<dyn EventLog<K, V>> {
        &self.log
    }

    /// Current state of the aggregate for `key`.
    pub fn load(&self, key: &K) -> Result<Aggregate<K, V>> {
        if let Some(cache) = &self.cache {
            if let Some(aggregate) = cache.lock().get(key) {
                return Ok(aggregate.clone())
            }
        }
        let aggregate = Aggregate::load(key.clone(), self.log.read(key)?)?;
        let owner = aggregate.instance().network_uid();
        if owner != self.uid {
            return Err(Error::Corrupted(format!(
                "{:?} was started by participant {}, read by {}",
                key, owner, self.uid,
            )))
        }
        Ok(aggregate)
    }

    /// Loads the aggregate for `key`, creating it if it has no history.
    pub fn load_or_start(&self, key: &K) -> Result<Aggregate<K, V>> {
        match self.load(key) {
        | Err(Error::NotFound) => Ok(Aggregate::start(key.clone(), self.uid, self.quorum_size)),
        | result => result,
        }
    }

    /// Applies `input` to the aggregate for `key` and appends the resulting
    /// events, publishing announced messages on `pipeline`.
    ///
    /// With `tracking`, the cursor advances in the same append. Returns
    /// `None` if that position was already applied, and fails with `Gap` if
    /// it is not the next one.
    pub fn apply(
        &self,
        key: &K,
        input: &Input<V>,
        pipeline: PipelineId,
        tracking: Option<Tracking>,
    ) -> Result<Option<Applied>> {
        self.backoff.retry(|_| {
            if let Some(tracking) = tracking {
                let current = self.log.position(tracking.upstream, tracking.pipeline)?;
                if tracking.position <= current {
                    return Ok(None)
                }
                if tracking.position > current + 1 {
                    return Err(Error::Gap {
                        upstream: tracking.upstream,
                        pipeline: tracking.pipeline,
                        expected: current + 1,
                        found: tracking.position,
                    })
                }
            }
            let mut aggregate = self.load_or_start(key)?;
            let announced = aggregate.apply(input.clone())?;
            for message in &announced {
                trace!("{} announcing {} for {:?}: {:?}", self.uid, message.kind(), key, message);
            }
            let phase = aggregate.instance().phase();
            let positions = self.save(aggregate, pipeline, tracking)?;
            Ok(Some(Applied { positions, phase }))
        })
    }

    fn save(
        &self,
        mut aggregate: Aggregate<K, V>,
        pipeline: PipelineId,
        tracking: Option<Tracking>,
    ) -> Result<Vec<u64>> {
        let record = Record {
            key: aggregate.key().clone(),
            expected_version: aggregate.committed_version(),
            events: aggregate.take_pending(),
            pipeline,
            tracking,
        };
        match self.log.append(record) {
        | Ok(positions) => {
            aggregate.mark_committed();
            self.remember(aggregate);
            Ok(positions)
        }
        | Err(error) => {
            self.forget(aggregate.key());
            Err(error)
        }
        }
    }

    fn remember(&self, aggregate: Aggregate<K, V>) {
        let cache = match &self.cache {
        | Some(cache) => cache,
        | None => return,
        };
        let mut cache = cache.lock();
        let stale = cache
            .get(aggregate.key())
            .map_or(true, |cached| cached.version() < aggregate.version());
        if stale {
            cache.insert(aggregate.key().clone(), aggregate);
        }
    }

    fn forget(&self, key: &K) {
        if let Some(cache) = &self.cache {
            cache.lock().remove(key);
        }
    }

    /// Decided value for `key`. An aggregate that does not exist yet is
    /// reported as `NotResolved`.
    pub fn final_value(&self, key: &K) -> Result<V> {
        match self.load(key) {
        | Ok(aggregate) => aggregate.final_value().map(Clone::clone),
        | Err(Error::NotFound) => Err(Error::NotResolved),
        | Err(error) => Err(error),
        }
    }

    /// Last position applied from `upstream` on `pipeline`.
    pub fn position(&self, upstream: NodeId, pipeline: PipelineId) -> Result<u64> {
        self.log.position(upstream, pipeline)
    }
}
