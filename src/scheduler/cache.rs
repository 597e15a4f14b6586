use std::time::{Duration, Instant};

use log::debug;

use crate::error::SchedulerError;
use crate::job::status::Job;

/// Result of the last bulk job query, reused until it is older than `ttl`.
///
/// Bounds the load a busy monitor puts on the cluster head node: however
/// many units ask for status, the scheduler sees at most one bulk query per
/// time-to-live window.
#[derive(Debug)]
pub struct JobCache {
    ttl: Duration,
    entry: Option<(Instant, Vec<Job>)>,
}

impl JobCache {
    pub fn new(ttl: Duration) -> Self {
        JobCache { ttl, entry: None }
    }

    /// Cached jobs if still fresh
    pub fn fresh(&self) -> Option<&[Job]> {
        match &self.entry {
            Some((fetched, jobs)) if fetched.elapsed() < self.ttl => Some(jobs),
            _ => None,
        }
    }

    pub fn store(&mut self, jobs: Vec<Job>) {
        self.entry = Some((Instant::now(), jobs));
    }

    /// Serve from the cache, calling `fetch` only when the entry is missing or stale.
    /// A failed fetch leaves the previous entry untouched.
    pub fn get_or_fetch<F>(&mut self, fetch: F) -> Result<Vec<Job>, SchedulerError>
    where
        F: FnOnce() -> Result<Vec<Job>, SchedulerError>,
    {
        if let Some(jobs) = self.fresh() {
            debug!("Serving {} jobs from cache", jobs.len());
            return Ok(jobs.to_vec());
        }
        let jobs = fetch()?;
        self.store(jobs.clone());
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::job::status::JobStatus;
    use crate::scheduler::SchedulerKind;

    fn jobs() -> Vec<Job> {
        vec![Job::polled("1".into(), SchedulerKind::Slurm, JobStatus::Running)]
    }

    #[test]
    fn fetches_once_within_ttl() {
        let calls = Cell::new(0);
        let mut cache = JobCache::new(Duration::from_secs(3600));
        for _ in 0..5 {
            let got = cache
                .get_or_fetch(|| {
                    calls.set(calls.get() + 1);
                    Ok(jobs())
                })
                .unwrap();
            assert_eq!(got.len(), 1);
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn zero_ttl_always_refetches() {
        let calls = Cell::new(0);
        let mut cache = JobCache::new(Duration::ZERO);
        for _ in 0..3 {
            cache
                .get_or_fetch(|| {
                    calls.set(calls.get() + 1);
                    Ok(jobs())
                })
                .unwrap();
        }
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn failed_fetch_is_not_cached() {
        let mut cache = JobCache::new(Duration::from_secs(3600));
        let err = cache.get_or_fetch(|| Err(SchedulerError::Parse("garbage".into())));
        assert!(err.is_err());
        assert!(cache.fresh().is_none());
        assert_eq!(cache.get_or_fetch(|| Ok(jobs())).unwrap().len(), 1);
    }
}
