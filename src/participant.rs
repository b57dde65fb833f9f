//! # Summary
//!
//! A participant owns one log and reads the logs of every other participant.
//! Proposals and deliveries both go through its repository; deliveries are
//! driven by polling upstream pipelines, each notification applied exactly
//! once thanks to the cursor recorded with its effects.
//!
//! A proposer whose round is rejected does not retry on the spot. The key is
//! parked and restarted a random number of delivery passes later, with the
//! range doubling on every preemption, so competing proposers drift apart
//! instead of preempting each other forever.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap as Map;
use parking_lot::Mutex;
use rand::Rng;

use crate::aggregate::{Aggregate, Input};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::instance::Phase;
use crate::repository::{Applied, Repository};
use crate::retry::Backoff;
use crate::state::{self, NodeId, PipelineId};
use crate::storage::{EventLog, Tracking};

/// Log of another participant, read through its pipelines.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Upstream<K: state::Identifier, V: state::Value> {
    uid: NodeId,
    log: Arc<dyn EventLog<K, V>>,
}

impl<K: state::Identifier, V: state::Value> Upstream<K, V> {
    pub fn new(uid: NodeId, log: Arc<dyn EventLog<K, V>>) -> Self {
        Upstream { uid, log }
    }

    pub fn uid(&self) -> NodeId {
        self.uid
    }
}

/// Largest restart window is `2^MAX_RESTART_EXPONENT` passes.
const MAX_RESTART_EXPONENT: u32 = 8;

/// Backoff state of a preempted key.
#[derive(Copy, Clone, Debug)]
struct Restart {
    /// Preemptions seen so far
    attempts: u32,

    /// Pass at which the next round opens, if one is scheduled
    due: Option<u64>,

    /// Pipeline the preemption arrived on
    pipeline: PipelineId,
}

pub struct Participant<K: state::Identifier, V: state::Value> {
    uid: NodeId,
    repository: Repository<K, V>,
    upstreams: Vec<Upstream<K, V>>,

    /// Pipelines read from every upstream
    pipelines: Vec<PipelineId>,

    /// Pipeline new proposals are published on
    pipeline: AtomicU32,

    batch: usize,

    /// Delivery passes made so far
    passes: AtomicU64,

    restarts: Mutex<Map<K, Restart>>,
}

impl<K: state::Identifier, V: state::Value> Participant<K, V> {
    pub fn new(
        uid: NodeId,
        log: Arc<dyn EventLog<K, V>>,
        upstreams: Vec<Upstream<K, V>>,
        config: &Config<K, V>,
    ) -> Self {
        let backoff = Backoff::new(config.retries(), config.retry_wait());
        let repository = Repository::new(uid, config.quorum_size(), log, config.cache(), backoff);
        let upstreams = upstreams
            .into_iter()
            .filter(|upstream| upstream.uid != uid)
            .collect();
        Participant {
            uid,
            repository,
            upstreams,
            pipelines: config.pipelines().to_vec(),
            pipeline: AtomicU32::new(0),
            batch: config.batch(),
            passes: AtomicU64::new(0),
            restarts: Mutex::new(Map::default()),
        }
    }

    pub fn uid(&self) -> NodeId {
        self.uid
    }

    pub fn repository(&self) -> &Repository<K, V> {
        &self.repository
    }

    pub fn upstreams(&self) -> &[Upstream<K, V>] {
        &self.upstreams
    }

    pub fn pipelines(&self) -> &[PipelineId] {
        &self.pipelines
    }

    /// Starts deciding `key`, proposing `value` unless a value was already
    /// proposed here. Returns once the first round is in the log.
    pub fn propose(&self, key: K, value: V) -> Result<()> {
        let pipeline = self.pipeline();
        let applied = self.repository.apply(&key, &Input::Start(value), pipeline, None)?;
        debug!(
            "{} proposed for {:?} on pipeline {}, announced {} messages",
            self.uid, key, pipeline, applied.as_ref().map_or(0, |applied| applied.positions.len()),
        );
        if let Some(applied) = applied {
            self.observe(&key, &applied, pipeline);
        }
        Ok(())
    }

    pub fn get_final_value(&self, key: &K) -> Result<V> {
        self.repository.final_value(key)
    }

    pub fn aggregate(&self, key: &K) -> Result<Aggregate<K, V>> {
        self.repository.load(key)
    }

    /// Publishes later proposals on `pipeline`.
    pub fn change_pipeline(&self, pipeline: PipelineId) {
        if !self.pipelines.contains(&pipeline) {
            warn!("{} switching to pipeline {}, which peers do not read", self.uid, pipeline);
        }
        self.pipeline.store(pipeline, Ordering::SeqCst);
    }

    pub fn pipeline(&self) -> PipelineId {
        self.pipeline.load(Ordering::SeqCst)
    }

    /// Applies up to `limit` new notifications from `upstream` on `pipeline`,
    /// returning how many changed this participant's log.
    pub fn poll_upstream(&self, upstream: NodeId, pipeline: PipelineId, limit: usize) -> Result<usize> {
        match self.upstreams.iter().find(|candidate| candidate.uid == upstream) {
        | Some(upstream) => self.poll_from(upstream, pipeline, limit),
        | None => {
            warn!("{} has no upstream {}", self.uid, upstream);
            Ok(0)
        }
        }
    }

    /// One pass: restarts whatever preempted rounds are due, then reads
    /// every upstream on every pipeline. Returns the number of changes.
    pub fn poll(&self) -> Result<usize> {
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut applied = self.restart_due(pass)?;
        for upstream in &self.upstreams {
            for pipeline in &self.pipelines {
                applied += self.poll_from(upstream, *pipeline, self.batch)?;
            }
        }
        Ok(applied)
    }

    /// Preempted keys with a restart scheduled.
    pub fn pending_restarts(&self) -> usize {
        self.restarts
            .lock()
            .values()
            .filter(|restart| restart.due.is_some())
            .count()
    }

    /// Schedules restarts for every preempted key in this participant's
    /// log. Called when reopening existing logs.
    pub fn recover(&self) -> Result<usize> {
        let mut preempted = 0;
        for key in self.repository.log().keys()? {
            if self.repository.load(&key)?.instance().is_preempted() {
                self.schedule(&key, self.pipeline());
                preempted += 1;
            }
        }
        if preempted > 0 {
            info!("{} recovered {} preempted rounds", self.uid, preempted);
        }
        Ok(preempted)
    }

    fn observe(&self, key: &K, applied: &Applied, pipeline: PipelineId) {
        match applied.phase {
        | Phase::Preempted => self.schedule(key, pipeline),
        | Phase::Resolved => {
            self.restarts.lock().remove(key);
        }
        | _ => (),
        }
    }

    fn schedule(&self, key: &K, pipeline: PipelineId) {
        let mut restarts = self.restarts.lock();
        let restart = restarts
            .entry(key.clone())
            .or_insert(Restart { attempts: 0, due: None, pipeline });
        if restart.due.is_some() {
            return
        }
        restart.attempts += 1;
        restart.pipeline = pipeline;
        let window = 1u64 << restart.attempts.min(MAX_RESTART_EXPONENT);
        let delay = rand::thread_rng().gen_range(1..=window);
        let pass = self.passes.load(Ordering::SeqCst);
        restart.due = Some(pass + delay);
        debug!(
            "{} restarting {:?} in {} passes after {} preemptions",
            self.uid, key, delay, restart.attempts,
        );
    }

    /// Opens a new round for every parked key whose restart is due.
    fn restart_due(&self, pass: u64) -> Result<usize> {
        let due = {
            let mut restarts = self.restarts.lock();
            let mut due = Vec::new();
            for (key, restart) in restarts.iter_mut() {
                if restart.due.map_or(false, |at| at <= pass) {
                    restart.due = None;
                    due.push((key.clone(), restart.pipeline));
                }
            }
            due
        };

        let mut restarted = 0;
        for (key, pipeline) in due {
            let aggregate = self.repository.load(&key)?;
            let instance = aggregate.instance();
            if instance.is_resolved() {
                self.restarts.lock().remove(&key);
                continue
            }
            let value = match instance.proposed_value() {
            | Some(value) if instance.is_preempted() => value.clone(),
            | _ => continue,
            };
            if let Some(applied) = self.repository.apply(&key, &Input::Start(value), pipeline, None)? {
                self.observe(&key, &applied, pipeline);
                restarted += 1;
            }
        }
        Ok(restarted)
    }

    fn poll_from(&self, upstream: &Upstream<K, V>, pipeline: PipelineId, limit: usize) -> Result<usize> {
        let cursor = self.repository.position(upstream.uid, pipeline)?;
        let notifications = upstream.log.read_from(pipeline, cursor, limit)?;
        let mut expected = cursor + 1;
        let mut applied = 0;
        for notification in notifications {
            if notification.position < expected {
                continue
            }
            if notification.position > expected {
                warn!(
                    "{} found gap in pipeline {} from {}: expected {}, found {}",
                    self.uid, pipeline, upstream.uid, expected, notification.position,
                );
                break
            }
            if notification.originator != upstream.uid {
                return Err(Error::Corrupted(format!(
                    "notification {} on pipeline {} of participant {} claims originator {}",
                    notification.position, pipeline, upstream.uid, notification.originator,
                )))
            }
            trace!(
                "{} delivering {} from {} for {:?}",
                self.uid, notification.message.kind(), upstream.uid, notification.key,
            );
            let tracking = Tracking {
                upstream: upstream.uid,
                pipeline,
                position: notification.position,
            };
            let input = Input::Deliver(notification.message);
            match self.repository.apply(&notification.key, &input, pipeline, Some(tracking)) {
            | Ok(Some(outcome)) => {
                self.observe(&notification.key, &outcome, pipeline);
                applied += 1;
            }
            | Ok(None) => (),
            | Err(error @ Error::Gap { .. }) => {
                warn!("{} stopping pass: {}", self.uid, error);
                break
            }
            | Err(error) => return Err(error),
            }
            expected += 1;
        }
        Ok(applied)
    }
}
