use hashbrown::HashMap as Map;
use parking_lot::Mutex;

use crate::aggregate::Event;
use crate::error::{Error, Result};
use crate::state::{self, NodeId, PipelineId};
use crate::storage::{EventLog, Notification, Record};

/// Indexed contents of a log. Callers serialize access.
pub(crate) struct Inner<K: state::Identifier, V: state::Value> {
    owner: NodeId,
    aggregates: Map<K, Vec<Event<V>>>,
    pipelines: Map<PipelineId, Vec<Notification<K, V>>>,
    tracking: Map<(NodeId, PipelineId), u64>,
}

impl<K: state::Identifier, V: state::Value> Inner<K, V> {
    pub(crate) fn new(owner: NodeId) -> Self {
        Inner {
            owner,
            aggregates: Map::default(),
            pipelines: Map::default(),
            tracking: Map::default(),
        }
    }

    /// Fails unless `record` applies cleanly on top of the current contents.
    pub(crate) fn check(&self, record: &Record<K, V>) -> Result<()> {
        if let Some(tracking) = record.tracking {
            let actual = self.position(tracking.upstream, tracking.pipeline);
            if tracking.position != actual + 1 {
                return Err(Error::ConcurrencyConflict {
                    expected: tracking.position.saturating_sub(1),
                    actual,
                })
            }
        }
        let actual = self.aggregates
            .get(&record.key)
            .map_or(0, |events| events.len() as u64);
        if actual != record.expected_version {
            return Err(Error::ConcurrencyConflict {
                expected: record.expected_version,
                actual,
            })
        }
        Ok(())
    }

    /// Applies a checked record.
    pub(crate) fn commit(&mut self, record: Record<K, V>) -> Vec<u64> {
        let Record { key, events, pipeline, tracking, .. } = record;
        let owner = self.owner;
        let notifications = self.pipelines
            .entry(pipeline)
            .or_insert_with(Vec::new);
        let mut positions = Vec::new();
        for event in &events {
            if let Event::Announced(message) = event {
                let position = notifications.len() as u64 + 1;
                notifications.push(Notification {
                    pipeline,
                    position,
                    originator: owner,
                    key: key.clone(),
                    message: message.clone(),
                });
                positions.push(position);
            }
        }
        if let Some(tracking) = tracking {
            self.tracking.insert((tracking.upstream, tracking.pipeline), tracking.position);
        }
        self.aggregates
            .entry(key)
            .or_insert_with(Vec::new)
            .extend(events);
        positions
    }

    pub(crate) fn owner(&self) -> NodeId {
        self.owner
    }

    pub(crate) fn read(&self, key: &K) -> Vec<Event<V>> {
        self.aggregates
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        self.aggregates.keys().cloned().collect()
    }

    pub(crate) fn read_from(&self, pipeline: PipelineId, after: u64, limit: usize) -> Vec<Notification<K, V>> {
        match self.pipelines.get(&pipeline) {
        | Some(notifications) => {
            notifications.iter()
                .skip(after as usize)
                .take(limit)
                .cloned()
                .collect()
        }
        | None => Vec::new(),
        }
    }

    pub(crate) fn position(&self, upstream: NodeId, pipeline: PipelineId) -> u64 {
        self.tracking
            .get(&(upstream, pipeline))
            .copied()
            .unwrap_or(0)
    }
}

/// In-process log. Contents are lost when dropped.
pub struct MemoryLog<K: state::Identifier, V: state::Value>(Mutex<Inner<K, V>>);

impl<K: state::Identifier, V: state::Value> MemoryLog<K, V> {
    pub fn new(owner: NodeId) -> Self {
        MemoryLog(Mutex::new(Inner::new(owner)))
    }
}

impl<K: state::Identifier, V: state::Value> EventLog<K, V> for MemoryLog<K, V> {
    fn owner(&self) -> NodeId {
        self.0.lock().owner()
    }

    fn read(&self, key: &K) -> Result<Vec<Event<V>>> {
        Ok(self.0.lock().read(key))
    }

    fn keys(&self) -> Result<Vec<K>> {
        Ok(self.0.lock().keys())
    }

    fn append(&self, record: Record<K, V>) -> Result<Vec<u64>> {
        let mut inner = self.0.lock();
        inner.check(&record)?;
        trace!("{} appending {} events for {:?}", inner.owner(), record.events.len(), record.key);
        Ok(inner.commit(record))
    }

    fn read_from(&self, pipeline: PipelineId, after: u64, limit: usize) -> Result<Vec<Notification<K, V>>> {
        Ok(self.0.lock().read_from(pipeline, after, limit))
    }

    fn position(&self, upstream: NodeId, pipeline: PipelineId) -> Result<u64> {
        Ok(self.0.lock().position(upstream, pipeline))
    }
}
