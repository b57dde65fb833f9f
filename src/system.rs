//! # Summary
//!
//! Wires a roster of participants into a full mesh: each one owns a log and
//! reads the logs of all others. Also provides the sequential substrate,
//! which drives delivery by polling every participant in turn on the
//! caller's thread until nothing new is applied.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::participant::{Participant, Upstream};
use crate::state::{self, NodeId};
use crate::storage::{EventLog, FileLog, MemoryLog};

pub struct System<K: state::Identifier, V: state::Value> {
    config: Config<K, V>,
    participants: Vec<Arc<Participant<K, V>>>,
}

impl<K: state::Identifier, V: state::Value> System<K, V> {
    /// Roster backed by in-process logs.
    pub fn memory(config: Config<K, V>) -> Self {
        let logs = config.roster()
            .map(|uid| Arc::new(MemoryLog::new(uid)) as Arc<dyn EventLog<K, V>>)
            .collect();
        Self::assemble(config, logs)
    }

    /// Roster backed by one file per participant under `dir`, reopening
    /// whatever logs are already there.
    pub fn file<P: AsRef<std::path::Path>>(config: Config<K, V>, dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let logs = config.roster()
            .map(|uid| {
                let path = dir.join(format!("participant-{:>02}.synod", uid));
                FileLog::open(uid, path).map(|log| Arc::new(log) as Arc<dyn EventLog<K, V>>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(config, logs).recovered()
    }

    /// Roster over caller-provided logs, one per participant in id order.
    pub fn with_logs(config: Config<K, V>, logs: Vec<Arc<dyn EventLog<K, V>>>) -> Result<Self> {
        if logs.len() != config.count() {
            return Err(Error::Corrupted(format!(
                "{} logs for a roster of {}", logs.len(), config.count(),
            )))
        }
        if let Some((uid, log)) = logs.iter().enumerate().find(|(uid, log)| log.owner() != *uid) {
            return Err(Error::Corrupted(format!(
                "log of participant {} is owned by {}", uid, log.owner(),
            )))
        }
        Self::assemble(config, logs).recovered()
    }

    /// Resumes rounds that were preempted when the logs were last written.
    fn recovered(self) -> Result<Self> {
        for participant in &self.participants {
            participant.recover()?;
        }
        Ok(self)
    }

    fn assemble(config: Config<K, V>, logs: Vec<Arc<dyn EventLog<K, V>>>) -> Self {
        let upstreams = logs.iter()
            .enumerate()
            .map(|(uid, log)| Upstream::new(uid, log.clone()))
            .collect::<Vec<_>>();
        let participants = logs.into_iter()
            .enumerate()
            .map(|(uid, log)| Arc::new(Participant::new(uid, log, upstreams.clone(), &config)))
            .collect();
        info!("Assembled {} participants, quorum {}", config.count(), config.quorum_size());
        System { config, participants }
    }

    pub fn config(&self) -> &Config<K, V> {
        &self.config
    }

    pub fn participant(&self, uid: NodeId) -> Result<&Arc<Participant<K, V>>> {
        self.participants
            .get(uid)
            .ok_or(Error::UnknownParticipant(uid))
    }

    pub fn participants(&self) -> &[Arc<Participant<K, V>>] {
        &self.participants
    }

    /// Polls every participant in id order until a full pass applies
    /// nothing with no restart pending, or `max_passes` passes have run.
    /// Returns whether the network went quiet.
    pub fn run_until_quiescent(&self, max_passes: usize) -> Result<bool> {
        for pass in 0..max_passes {
            let mut applied = 0;
            for participant in &self.participants {
                applied += participant.poll()?;
            }
            trace!("Pass {} applied {} notifications", pass, applied);
            let parked = self.participants
                .iter()
                .map(|participant| participant.pending_restarts())
                .sum::<usize>();
            if applied == 0 && parked == 0 {
                debug!("Quiescent after {} passes", pass + 1);
                return Ok(true)
            }
        }
        warn!("Still delivering after {} passes", max_passes);
        Ok(false)
    }

    /// Proposes `value` for `key` at participant `uid`, then drives the
    /// network until it goes quiet and reads the decision there.
    pub fn propose_value(&self, uid: NodeId, key: K, value: V) -> Result<V> {
        let participant = self.participant(uid)?;
        participant.propose(key.clone(), value)?;
        self.run_until_quiescent(self.config.max_passes())?;
        participant.get_final_value(&key)
    }
}
