use super::{ManagedThread, panic_message};
use crate::error::{QueueError, SyncError, SyncResult, TaskError};
use crate::sync::{BoundedQueue, Deferred, Mutex};
use crate::utils::CancelToken;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Fixed-capacity pool of managed threads draining one shared work queue.
///
/// Workers are started lazily on `submit`, one per submission, until
/// `max_workers` exist. They never exit on their own; only
/// [`shutdown`](Self::shutdown) or dropping the pool stops them.
pub struct ThreadPool {
    name: String,
    max_workers: usize,
    queue: Arc<BoundedQueue<Job>>,
    workers: Mutex<Vec<ManagedThread<()>>>,
    cancel: CancelToken,
}

impl ThreadPool {
    pub fn new(max_workers: usize) -> SyncResult<Self> {
        Self::with_name("pool", max_workers)
    }

    pub fn with_name(name: impl Into<String>, max_workers: usize) -> SyncResult<Self> {
        if max_workers == 0 {
            return Err(SyncError::InvalidArgument("max_workers should be > 0"));
        }
        Ok(Self {
            name: name.into(),
            max_workers,
            queue: Arc::new(BoundedQueue::new(usize::MAX)),
            workers: Mutex::new(Vec::new()),
            cancel: CancelToken::new_root(),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of workers currently started.
    pub fn workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Jobs waiting for a free worker.
    pub fn pending(&self) -> usize {
        self.queue.size()
    }

    /// Queue `f` and return the handle its outcome lands in.
    pub fn submit<F, T>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let result = Deferred::new();
        let slot = result.clone();
        let job: Job = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskError::from(err)),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            let _ = slot.set(outcome);
        });

        if let Err(rejected) = self.queue.try_put(job) {
            tracing::warn!("[ThreadPool] {} rejected job: {}", self.name, rejected.reason);
            let _ = result.set_error(anyhow::anyhow!("pool queue {}", rejected.reason).into());
            return result;
        }

        self.grow();
        result
    }

    fn grow(&self) {
        let mut workers = self.workers.lock();
        if workers.len() >= self.max_workers {
            return;
        }

        let queue = self.queue.clone();
        let worker = ManagedThread::new(
            format!("{}-w{}", self.name, workers.len()),
            move |cancel: &CancelToken| {
                while !cancel.is_cancelled() {
                    match queue.get(true, Some(WORKER_POLL)) {
                        Ok(job) => job(),
                        Err(QueueError::Empty) => continue,
                        Err(_) => break,
                    }
                }
                Ok(())
            },
        )
        .with_parent(&self.cancel);

        worker.start(Duration::ZERO);
        workers.push(worker);
    }

    /// Stop every worker and forget them. Queued jobs stay queued and are
    /// picked up by workers started on a later `submit`.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        for worker in workers.iter() {
            worker.stop();
        }
        tracing::debug!("[ThreadPool] {} stopped {} workers", self.name, workers.len());
        workers.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn zero_workers_is_invalid() {
        assert!(matches!(ThreadPool::new(0), Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn submit_returns_outcomes() {
        let pool = ThreadPool::new(2).unwrap();
        let ok = pool.submit(|| Ok(2 + 2));
        let failed: Deferred<()> = pool.submit(|| anyhow::bail!("bad frame"));
        let panicked: Deferred<()> = pool.submit(|| panic!("worker boom"));

        assert_eq!(ok.get(Some(Duration::from_secs(5))).unwrap(), 4);
        assert!(matches!(
            failed.get(Some(Duration::from_secs(5))),
            Err(TaskError::Failed(_))
        ));
        assert!(matches!(
            panicked.get(Some(Duration::from_secs(5))),
            Err(TaskError::Panicked(ref m)) if m == "worker boom"
        ));

        // Workers survive a panicking job.
        let again = pool.submit(|| Ok("still alive"));
        assert_eq!(again.get(Some(Duration::from_secs(5))).unwrap(), "still alive");
    }

    #[test]
    fn workers_grow_lazily_up_to_max() {
        let pool = ThreadPool::new(3).unwrap();
        assert_eq!(pool.workers(), 0);

        let results: Vec<_> = (0..10).map(|i| pool.submit(move || Ok(i))).collect();
        assert_eq!(pool.workers(), 3);
        for (i, r) in results.into_iter().enumerate() {
            assert_eq!(r.get(Some(Duration::from_secs(5))).unwrap(), i);
        }
    }

    #[test]
    fn concurrency_is_bounded_by_max_workers() {
        let pool = ThreadPool::new(2).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results: Vec<_> = (0..8)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                pool.submit(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for r in results {
            r.get(Some(Duration::from_secs(5))).unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn shutdown_leaves_queued_jobs_for_later_workers() {
        let pool = ThreadPool::new(1).unwrap();
        let started = Arc::new(crate::sync::Event::new());
        let gate = Arc::new(crate::sync::Event::new());

        let blocker = {
            let started = started.clone();
            let gate = gate.clone();
            pool.submit(move || {
                started.set();
                gate.wait(Some(Duration::from_secs(5)));
                Ok(())
            })
        };
        let queued = pool.submit(|| Ok(1));
        assert!(started.wait(Some(Duration::from_secs(5))));

        pool.shutdown();
        assert_eq!(pool.workers(), 0);
        gate.set();
        blocker.get(Some(Duration::from_secs(5))).unwrap();

        // The stopped worker finishes its current job and exits; the queued
        // one waits for a new worker.
        thread::sleep(Duration::from_millis(50));
        assert!(!queued.is_done());
        assert_eq!(pool.pending(), 1);

        let revived = pool.submit(|| Ok(2));
        assert_eq!(queued.get(Some(Duration::from_secs(5))).unwrap(), 1);
        assert_eq!(revived.get(Some(Duration::from_secs(5))).unwrap(), 2);
    }
}
