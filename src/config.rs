use std::time;

use crate::state::{self, NodeId, PipelineId};

#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct Config<K, V> {
    /// Total number of participants
    count: usize,

    /// Budget for a proposal to resolve locally
    timeout: time::Duration,

    /// Delay between delivery passes that applied something
    poll_interval: time::Duration,

    /// Ceiling for the idle backoff between delivery passes
    max_poll_interval: time::Duration,

    /// Notifications read per upstream per pass
    batch: usize,

    /// Appends retried after a concurrency conflict
    retries: usize,

    /// Base wait between conflict retries
    retry_wait: time::Duration,

    /// Pipelines every participant reads from
    pipelines: Vec<PipelineId>,

    /// Keep loaded aggregates in memory
    cache: bool,

    /// Delivery passes the sequential runner makes before giving up
    max_passes: usize,

    #[derivative(Debug = "ignore")]
    _marker: std::marker::PhantomData<fn() -> (K, V)>,
}

impl<K: state::Identifier, V: state::Value> Config<K, V> {
    pub fn new(count: usize) -> Self {
        Config {
            count,
            timeout: time::Duration::from_secs(1),
            poll_interval: time::Duration::from_millis(1),
            max_poll_interval: time::Duration::from_millis(50),
            batch: 64,
            retries: 8,
            retry_wait: time::Duration::from_millis(1),
            pipelines: vec![0],
            cache: true,
            max_passes: 1000,
            _marker: Default::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: time::Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_poll_interval(mut self, max_poll_interval: time::Duration) -> Self {
        self.max_poll_interval = max_poll_interval;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_wait(mut self, retry_wait: time::Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    /// Replaces the pipelines each participant reads. Always includes 0,
    /// the pipeline proposals start on.
    pub fn with_pipelines<I: IntoIterator<Item = PipelineId>>(mut self, pipelines: I) -> Self {
        let mut pipelines = pipelines.into_iter().collect::<Vec<_>>();
        pipelines.push(0);
        pipelines.sort();
        pipelines.dedup();
        self.pipelines = pipelines;
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn count(&self) -> usize { self.count }

    /// Majority of the roster.
    pub fn quorum_size(&self) -> usize {
        self.count / 2 + 1
    }

    pub fn roster(&self) -> impl Iterator<Item = NodeId> {
        0..self.count
    }

    pub fn timeout(&self) -> time::Duration { self.timeout }

    pub fn poll_interval(&self) -> time::Duration { self.poll_interval }

    pub fn max_poll_interval(&self) -> time::Duration { self.max_poll_interval }

    pub fn batch(&self) -> usize { self.batch }

    pub fn retries(&self) -> usize { self.retries }

    pub fn retry_wait(&self) -> time::Duration { self.retry_wait }

    pub fn pipelines(&self) -> &[PipelineId] { &self.pipelines }

    pub fn cache(&self) -> bool { self.cache }

    pub fn max_passes(&self) -> usize { self.max_passes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_a_majority() {
        let sizes = (1..=6)
            .map(|count| Config::<u8, u64>::new(count).quorum_size())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![1, 2, 2, 3, 3, 4]);
    }

    #[test]
    fn pipelines_always_include_default() {
        let config = Config::<u8, u64>::new(3).with_pipelines(vec![4, 2, 4]);
        assert_eq!(config.pipelines(), &[0, 2, 4]);
        assert_eq!(config.roster().collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
