use super::panic_message;
use crate::error::TaskError;
use crate::sync::Deferred;
use crate::utils::CancelToken;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Body of a managed thread. It receives the run's cancel token and is
/// expected to return once the token trips.
pub type ThreadTarget<T> = Arc<dyn Fn(&CancelToken) -> anyhow::Result<T> + Send + Sync>;

struct Running {
    handle: JoinHandle<()>,
    cancel: CancelToken,
}

/// Restartable handle over one native thread at a time.
///
/// [`start`](Self::start) spawns only when no previous run is alive, which is
/// what makes reconnect loops and pump loops single-flight. Errors and panics
/// of the target are captured into the run's [`Deferred`] and never escape
/// the thread.
pub struct ManagedThread<T> {
    name: String,
    target: ThreadTarget<T>,
    parent: CancelToken,
    running: Mutex<Option<Running>>,
}

impl<T> ManagedThread<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<F>(name: impl Into<String>, target: F) -> Self
    where
        F: Fn(&CancelToken) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            target: Arc::new(target),
            parent: CancelToken::new_root(),
            running: Mutex::new(None),
        }
    }

    /// Derive every run's token from `parent`, so cancelling the parent
    /// stops this thread too.
    pub fn with_parent(mut self, parent: &CancelToken) -> Self {
        self.parent = parent.clone();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the target after `delay` unless a run is still alive.
    ///
    /// Returns the run's outcome handle, or `None` if already running. A
    /// failed spawn is reported through the returned handle.
    pub fn start(&self, delay: Duration) -> Option<Deferred<T>> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return None;
        }

        let result = Deferred::new();
        let cancel = self.parent.new_child();
        let thread_name = format!("{}-{}", self.name, &Uuid::new_v4().simple().to_string()[..8]);

        let spawned = thread::Builder::new().name(thread_name).spawn({
            let name = self.name.clone();
            let target = self.target.clone();
            let cancel = cancel.clone();
            let result = result.clone();
            move || {
                if !delay.is_zero() && !cancel.sleep_cancellable(delay) {
                    let _ = result.set_error(TaskError::Cancelled);
                    return;
                }

                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| target(&cancel))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => {
                        tracing::error!("[ManagedThread] {} failed: {:#}", name, err);
                        Err(TaskError::from(err))
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        tracing::error!("[ManagedThread] {} panicked: {}", name, msg);
                        Err(TaskError::Panicked(msg))
                    }
                };
                let _ = result.set(outcome);
            }
        });

        match spawned {
            Ok(handle) => {
                *running = Some(Running { handle, cancel });
            }
            Err(err) => {
                tracing::error!("[ManagedThread] failed to spawn {}: {}", self.name, err);
                let err = anyhow::Error::new(err).context(format!("spawn {}", self.name));
                let _ = result.set_error(err.into());
            }
        }
        Some(result)
    }

    /// Ask the current run to stop. The target sees its token tripped at the
    /// next loop boundary; this call does not wait.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Wait for the current run to finish. Must not be called from the
    /// managed thread itself.
    pub fn join(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running
            && running.handle.thread().id() != thread::current().id()
        {
            let _ = running.handle.join();
        }
    }
}

impl<T> Drop for ManagedThread<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_ref() {
            running.cancel.cancel();
        }
    }
}

impl<T> fmt::Debug for ManagedThread<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alive = self
            .running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished());
        f.debug_struct("ManagedThread")
            .field("name", &self.name)
            .field("running", &alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn start_captures_value() {
        let t = ManagedThread::new("answer", |_| Ok(42u32));
        let result = t.start(Duration::ZERO).unwrap();
        assert_eq!(result.get(Some(Duration::from_secs(5))).unwrap(), 42);
        t.join();
        assert!(!t.is_running());
    }

    #[test]
    fn error_and_panic_are_captured() {
        let failing: ManagedThread<()> = ManagedThread::new("failing", |_| anyhow::bail!("no carrier"));
        let err = failing.start(Duration::ZERO).unwrap().get(None).unwrap_err();
        assert!(matches!(err, TaskError::Failed(ref e) if e.to_string() == "no carrier"));

        let panicking: ManagedThread<()> = ManagedThread::new("panicking", |_| panic!("modem gone"));
        let err = panicking.start(Duration::ZERO).unwrap().get(None).unwrap_err();
        assert!(matches!(err, TaskError::Panicked(ref m) if m == "modem gone"));
    }

    #[test]
    fn second_start_while_running_is_refused() {
        let runs = Arc::new(AtomicUsize::new(0));
        let t = {
            let runs = runs.clone();
            ManagedThread::new("looping", move |cancel: &CancelToken| {
                runs.fetch_add(1, Ordering::SeqCst);
                while !cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
        };

        let first = t.start(Duration::ZERO).unwrap();
        assert!(t.start(Duration::ZERO).is_none());
        assert!(t.is_running());

        t.stop();
        first.get(Some(Duration::from_secs(5))).unwrap();
        t.join();

        let second = t.start(Duration::ZERO).unwrap();
        t.stop();
        second.get(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_during_delay_cancels_run() {
        let t = ManagedThread::new("delayed", |_| Ok(()));
        let result = t.start(Duration::from_secs(30)).unwrap();
        let start = Instant::now();
        t.stop();
        let err = result.get(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn parent_cancel_reaches_run() {
        let parent = CancelToken::new_root();
        let t = ManagedThread::new("child", |cancel: &CancelToken| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(7u8)
        })
        .with_parent(&parent);
        let result = t.start(Duration::ZERO).unwrap();
        parent.cancel();
        assert_eq!(result.get(Some(Duration::from_secs(5))).unwrap(), 7);
    }
}
