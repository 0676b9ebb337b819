//! Bounded pool for scan and assembly jobs
//!
//! Jobs run on tokio's blocking pool, at most `workers` at a time. A job is
//! keyed by what it works on; submitting a key that is already running does
//! not start a second copy but makes the running one go again once it
//! finishes, so the last submission is always observed.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::content::PathId;

/// What a job works on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    /// Index the file at this absolute path
    Scan(PathBuf),
    /// Bring this path in line with its indexed meta
    Assemble(PathId),
}

type JobFn = dyn Fn(&AtomicBool) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Running,
    /// Submitted again while running
    Rerun,
}

#[derive(Debug)]
pub struct JobPool<K = JobKey> {
    inner: Arc<PoolInner<K>>,
}

impl<K> Clone for JobPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct PoolInner<K> {
    workers: u32,
    permits: Semaphore,
    jobs: Mutex<HashMap<K, JobState>>,
    interrupt: AtomicBool,
    idle: Notify,
}

impl<K> JobPool<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(workers: usize) -> Self {
        let workers = workers.clamp(1, u32::MAX as usize) as u32;
        Self {
            inner: Arc::new(PoolInner {
                workers,
                permits: Semaphore::new(workers as usize),
                jobs: Mutex::new(HashMap::new()),
                interrupt: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Run `job` for `key` unless a run for `key` is already underway
    ///
    /// Returns false when the submission was coalesced into the running job.
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, key: K, job: F) -> bool
    where
        F: Fn(&AtomicBool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.is_shutting_down() {
            tracing::debug!("not running {:?}, pool is shutting down", key);
            return false;
        }
        {
            let mut jobs = self.inner.jobs.lock();
            if let Some(state) = jobs.get_mut(&key) {
                *state = JobState::Rerun;
                return false;
            }
            jobs.insert(key.clone(), JobState::Running);
        }

        let inner = self.inner.clone();
        let job: Arc<JobFn> = Arc::new(job);
        tokio::spawn(async move {
            loop {
                let Ok(permit) = inner.permits.acquire().await else {
                    break;
                };
                if inner.interrupt.load(Ordering::Relaxed) {
                    break;
                }

                let run_inner = inner.clone();
                let run_job = job.clone();
                let result =
                    tokio::task::spawn_blocking(move || run_job(&run_inner.interrupt)).await;
                drop(permit);
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("job {:?} failed: {}", key, e),
                    Err(e) => tracing::warn!("job {:?} panicked: {}", key, e),
                }

                // decide and remove under one guard, or a submit in between is lost
                let mut jobs = inner.jobs.lock();
                if jobs.get(&key) == Some(&JobState::Rerun) {
                    jobs.insert(key.clone(), JobState::Running);
                    continue;
                }
                inner.finish(&mut jobs, &key);
                return;
            }
            inner.finish(&mut inner.jobs.lock(), &key);
        });
        true
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.inner.jobs.lock().contains_key(key)
    }

    pub fn active(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.interrupt.load(Ordering::Relaxed)
    }

    /// Wait until no job is running or queued
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.jobs.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Interrupt running jobs, drop queued ones and wait for both
    pub async fn shutdown(&self) {
        self.inner.interrupt.store(true, Ordering::Relaxed);
        // queued jobs ahead of us see the flag and bail; running ones finish
        if let Ok(all) = self.inner.permits.acquire_many(self.inner.workers).await {
            all.forget();
        }
        self.inner.permits.close();
        self.wait_idle().await;
    }
}

impl<K: Eq + Hash> PoolInner<K> {
    fn finish(&self, jobs: &mut HashMap<K, JobState>, key: &K) {
        jobs.remove(key);
        if jobs.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_flight_coalesces() {
        let pool: JobPool<u32> = JobPool::new(4);
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(std::sync::Barrier::new(2));

        let job = {
            let runs = runs.clone();
            let gate = gate.clone();
            move |_: &AtomicBool| -> anyhow::Result<()> {
                // the first run waits until the test has piled up submissions
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    gate.wait();
                }
                Ok(())
            }
        };
        assert!(pool.submit(7, job.clone()));
        for _ in 0..5 {
            assert!(!pool.submit(7, job.clone()));
        }
        assert!(pool.is_running(&7));
        tokio::task::spawn_blocking(move || gate.wait()).await.unwrap();

        pool.wait_idle().await;
        // one run plus exactly one coalesced rerun
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!pool.is_running(&7));
    }

    #[tokio::test]
    async fn test_workers_bound_concurrency() {
        let pool: JobPool<u32> = JobPool::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for key in 0..6 {
            let current = current.clone();
            let peak = peak.clone();
            pool.submit(key, move |_: &AtomicBool| {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_and_waits() {
        let pool: JobPool<u32> = JobPool::new(1);
        let finished = Arc::new(AtomicBool::new(false));
        let started = Arc::new(std::sync::Barrier::new(2));
        {
            let finished = finished.clone();
            let started = started.clone();
            pool.submit(1, move |interrupt: &AtomicBool| {
                started.wait();
                while !interrupt.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                finished.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        let queued_ran = Arc::new(AtomicBool::new(false));
        {
            let queued_ran = queued_ran.clone();
            pool.submit(2, move |_: &AtomicBool| {
                queued_ran.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        tokio::task::spawn_blocking(move || started.wait()).await.unwrap();

        pool.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!queued_ran.load(Ordering::SeqCst));
        assert!(!pool.submit(3, |_: &AtomicBool| Ok(())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_during_completion_is_observed() {
        let pool: JobPool<u32> = JobPool::new(2);
        for _ in 0..200 {
            let submitted = Arc::new(AtomicUsize::new(0));
            let observed = Arc::new(AtomicUsize::new(0));
            let job = {
                let submitted = submitted.clone();
                let observed = observed.clone();
                move |_: &AtomicBool| -> anyhow::Result<()> {
                    observed.fetch_max(submitted.load(Ordering::SeqCst), Ordering::SeqCst);
                    Ok(())
                }
            };
            for generation in 1..=20 {
                submitted.store(generation, Ordering::SeqCst);
                pool.submit(1, job.clone());
                tokio::task::yield_now().await;
            }
            pool.wait_idle().await;
            assert_eq!(observed.load(Ordering::SeqCst), 20);
        }
    }
}
