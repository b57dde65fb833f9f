//! # Summary
//!
//! Threaded substrate on top of `tokio`. Each participant gets one delivery
//! task that polls its upstreams in a loop, backing off exponentially while
//! nothing arrives and no preempted round is waiting to restart. Log access
//! is synchronous, so every pass and every read runs on the blocking pool.
//! Transient pass failures are retried at the floor interval.
//!
//! Tasks exit when the `Running` handle shuts them down or is dropped, or
//! when a fatal error surfaces from a pass.

use std::sync::Arc;
use std::time;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::participant::Participant;
use crate::state::{self, NodeId};
use crate::system::System;

/// Handle to a running roster.
pub struct Running<K: state::Identifier, V: state::Value> {
    system: Arc<System<K, V>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

/// Starts a delivery task for every participant.
pub fn spawn<K: state::Identifier, V: state::Value>(system: Arc<System<K, V>>) -> Running<K, V> {
    let live = system.config().roster().collect::<Vec<_>>();
    spawn_partial(system, &live)
}

/// Starts delivery tasks for the participants in `live` only. The rest
/// keep their logs readable but never react to messages.
pub fn spawn_partial<K: state::Identifier, V: state::Value>(
    system: Arc<System<K, V>>,
    live: &[NodeId],
) -> Running<K, V> {
    let (shutdown, signal) = watch::channel(false);
    let floor = system.config().poll_interval();
    let ceiling = system.config().max_poll_interval().max(floor);
    let tasks = system.participants()
        .iter()
        .filter(|participant| live.contains(&participant.uid()))
        .map(|participant| tokio::spawn(deliver(participant.clone(), floor, ceiling, signal.clone())))
        .collect();
    Running { system, shutdown, tasks }
}

async fn deliver<K: state::Identifier, V: state::Value>(
    participant: Arc<Participant<K, V>>,
    floor: time::Duration,
    ceiling: time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let uid = participant.uid();
    info!("{} delivering", uid);
    let mut wait = floor;
    while !*shutdown.borrow() {
        let polling = participant.clone();
        let pass = tokio::task::spawn_blocking(move || polling.poll())
            .await
            .unwrap_or_else(|error| Err(Error::Stopped(error.to_string())));

        match pass {
        | Ok(0) if participant.pending_restarts() == 0 => wait = (wait * 2).min(ceiling),
        | Ok(_) => wait = floor,
        | Err(error) if error.is_fatal() => {
            error!("{} stopping: {}", uid, error);
            return Err(error)
        }
        | Err(error) if error.is_transient() => {
            debug!("{} retrying pass: {}", uid, error);
            wait = floor;
        }
        | Err(error) => {
            warn!("{} pass failed: {}", uid, error);
            wait = (wait * 2).min(ceiling);
        }
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => (),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break
                }
            }
        }
    }
    info!("{} stopped", uid);
    Ok(())
}

impl<K: state::Identifier, V: state::Value> Running<K, V> {
    pub fn system(&self) -> &Arc<System<K, V>> {
        &self.system
    }

    pub fn participant(&self, uid: NodeId) -> Result<&Arc<Participant<K, V>>> {
        self.system.participant(uid)
    }

    /// Starts a proposal at `uid` without waiting for the outcome.
    pub async fn propose(&self, uid: NodeId, key: K, value: V) -> Result<()> {
        let participant = self.participant(uid)?.clone();
        tokio::task::spawn_blocking(move || participant.propose(key, value))
            .await
            .unwrap_or_else(|error| Err(Error::Stopped(error.to_string())))
    }

    /// Proposes `value` for `key` at `uid` and waits for that participant
    /// to learn the decision, which may be another participant's value.
    ///
    /// Fails with `Timeout` once the configured budget runs out. The round
    /// stays in progress and may still resolve later.
    pub async fn propose_value(&self, uid: NodeId, key: K, value: V) -> Result<V> {
        self.propose(uid, key.clone(), value).await?;
        self.wait_final_value(uid, &key, self.system.config().timeout()).await
    }

    /// Polls participant `uid` until it has decided `key`.
    pub async fn wait_final_value(&self, uid: NodeId, key: &K, timeout: time::Duration) -> Result<V> {
        let participant = self.participant(uid)?;
        let interval = self.system.config().poll_interval();
        let waiting = async {
            loop {
                let reading = participant.clone();
                let key = key.clone();
                let read = tokio::task::spawn_blocking(move || reading.get_final_value(&key))
                    .await
                    .unwrap_or_else(|error| Err(Error::Stopped(error.to_string())));
                match read {
                | Err(Error::NotResolved) => tokio::time::sleep(interval).await,
                | result => return result,
                }
            }
        };
        match tokio::time::timeout(timeout, waiting).await {
        | Ok(result) => result,
        | Err(_) => {
            debug!("{} timed out waiting for {:?}", uid, key);
            Err(Error::Timeout)
        }
        }
    }

    pub fn get_final_value(&self, uid: NodeId, key: &K) -> Result<V> {
        self.participant(uid)?.get_final_value(key)
    }

    /// Stops every delivery task and reports the first task failure.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let mut outcome = Ok(());
        for joined in futures::future::join_all(self.tasks).await {
            let result = joined.unwrap_or_else(|error| Err(Error::Stopped(error.to_string())));
            if let Err(error) = result {
                if outcome.is_ok() {
                    outcome = Err(error);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivery_tasks_resolve_a_proposal() {
        let system: System<u8, u64> = System::memory(Config::new(3));
        let running = spawn(Arc::new(system));
        assert_eq!(running.propose_value(1, 9, 99).await.unwrap(), 99);
        for uid in 0..3 {
            let value = running.wait_final_value(uid, &9, time::Duration::from_secs(5)).await.unwrap();
            assert_eq!(value, 99);
        }
        running.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_handle_stops_tasks() {
        let system = Arc::new(System::<u8, u64>::memory(Config::new(2)));
        let running = spawn(system.clone());
        tokio::time::sleep(time::Duration::from_millis(20)).await;
        assert!(Arc::strong_count(&system.participants()[0]) > 1);

        drop(running);
        tokio::time::sleep(time::Duration::from_millis(200)).await;
        assert_eq!(Arc::strong_count(&system.participants()[0]), 1);
    }
}
