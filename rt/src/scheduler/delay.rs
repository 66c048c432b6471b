//! Running of jobs after a delay.
use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::scheduler::pool::{Executor, ThreadPool};
use crate::scheduler::timeouts::{Deadline, Id, Task, Timeouts};
use std::io;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The state shared between a scheduler and its dispatch thread.
struct Shared<E> {
    timeouts: Mutex<Timeouts>,
    cvar: Condvar,
    alive: AtomicBool,

    /// The number of IDs handed out so far.
    next_id: AtomicU64,

    /// The time to wait when there are no tasks.
    idle_wait: Duration,
    clock: Arc<dyn Clock>,
    executor: E,
}

impl<E: Executor> Shared<E> {
    fn new(executor: E, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Shared {
            timeouts: Mutex::new(Timeouts::new()),
            cvar: Condvar::new(),
            alive: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            idle_wait: Duration::from_millis(config.idle_wait),
            clock,
            executor,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn next_id(&self) -> Id {
        // Running out of IDs takes centuries, but if it happens we can't hand
        // out any more IDs without cancelling the wrong tasks.
        self.next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                id.checked_add(1)
            })
            .ok()
            .and_then(|id| NonZeroU64::MIN.checked_add(id))
            .map(Id)
            .expect("the scheduler ran out of task IDs")
    }

    /// Marks the scheduler as stopped and wakes up the dispatch thread.
    ///
    /// Returns `true` if the scheduler was still running.
    fn terminate(&self) -> bool {
        let _timeouts = self.timeouts.lock().unwrap();
        let was_alive = self.alive.swap(false, Ordering::AcqRel);

        self.cvar.notify_one();
        was_alive
    }

    fn run(&self) {
        let mut expired = Vec::new();

        log::debug!("started the dispatch thread");

        while self.is_alive() {
            self.run_iteration(&mut expired);
        }

        log::debug!(
            "stopped the dispatch thread, discarding {} pending tasks",
            self.timeouts.lock().unwrap().len()
        );
    }

    fn run_iteration(&self, expired: &mut Vec<Task>) {
        let mut timeouts = self.timeouts.lock().unwrap();
        let next = self.take_expired(&mut timeouts, expired);

        if !expired.is_empty() {
            // An executor may run jobs on this thread, and those jobs may in
            // turn use the scheduler, so we can't hold on to the lock here.
            drop(timeouts);
            self.dispatch(expired);

            // Tasks may have been scheduled or expired in the mean time, so
            // we look again before waiting.
            return;
        }

        // The lock is held from checking the state until we start waiting,
        // so a call to `terminate()` or `schedule()` can't slip in between
        // and go unnoticed.
        if !self.is_alive() {
            return;
        }

        // In the event of a spurious wakeup we just move on to the next
        // iteration of the run loop.
        let time = next.unwrap_or(self.idle_wait);
        let _res = self.cvar.wait_timeout(timeouts, time).unwrap();
    }

    /// Moves all tasks of which the deadline passed into `expired`, returning
    /// the time until the next deadline.
    fn take_expired(
        &self,
        timeouts: &mut Timeouts,
        expired: &mut Vec<Task>,
    ) -> Option<Duration> {
        timeouts.compact();
        timeouts.expired(self.clock.now(), expired)
    }

    fn dispatch(&self, expired: &mut Vec<Task>) {
        for task in expired.drain(..) {
            log::trace!(
                "dispatching task {} (deadline: {} ms)",
                task.id,
                task.deadline.as_millis()
            );

            if let Err(err) = self.executor.submit(task.job) {
                log::warn!("task {} was dropped: {}", task.id, err);
            }
        }
    }
}

/// A type for running jobs after a delay.
///
/// A scheduler uses a single thread to wait for deadlines to pass. Once a
/// deadline passes the jobs are handed over to an executor (a `ThreadPool` by
/// default), so slow jobs don't delay the jobs scheduled after them.
///
/// Jobs with the same deadline are submitted in the order they were
/// scheduled in. Jobs with different deadlines are submitted in the order of
/// their deadlines. Since the executor may use multiple threads, the order in
/// which jobs _finish_ isn't guaranteed.
pub struct Scheduler<E: Executor + 'static = ThreadPool> {
    shared: Arc<Shared<E>>,

    /// The handle of the dispatch thread, taken when joining it.
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler<ThreadPool> {
    /// Starts a scheduler that runs its jobs on a new `ThreadPool`.
    pub fn start(config: &Config) -> io::Result<Self> {
        let pool = ThreadPool::from_config("delay", config)?;

        Scheduler::start_with(pool, Arc::new(MonotonicClock::new()), config)
    }
}

impl<E: Executor + 'static> Scheduler<E> {
    /// Starts a scheduler using a custom executor and clock.
    pub fn start_with(
        executor: E,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared::new(executor, clock, config));
        let dispatcher = shared.clone();
        let handle = thread::Builder::new()
            .name("delay dispatch".to_string())
            .spawn(move || dispatcher.run())?;

        Ok(Scheduler { shared, thread: Mutex::new(Some(handle)) })
    }

    /// Schedules a job to run once the given delay has passed.
    ///
    /// If the scheduler is shut down the job is dropped without running it,
    /// and a warning is logged. An ID is still returned, but cancelling it
    /// has no effect.
    pub fn schedule<F>(&self, job: F, delay: Duration) -> Id
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.shared.next_id();
        let mut timeouts = self.shared.timeouts.lock().unwrap();

        if !self.shared.is_alive() {
            log::warn!(
                "task {} was scheduled after the scheduler shut down, and \
                won't run",
                id
            );

            return id;
        }

        let deadline = Deadline::after(self.shared.clock.now(), delay);

        timeouts.insert(id, deadline, Box::new(job));
        self.shared.cvar.notify_one();
        log::trace!(
            "scheduled task {} to run at {} ms",
            id,
            deadline.as_millis()
        );

        id
    }

    /// Cancels a scheduled job, returning `true` if it hadn't been dispatched
    /// yet.
    ///
    /// Cancelling a job that already ran, or was already cancelled, does
    /// nothing.
    pub fn cancel(&self, id: Id) -> bool {
        let cancelled = self.shared.timeouts.lock().unwrap().cancel(id);

        if cancelled {
            log::trace!("cancelled task {}", id);
        }

        cancelled
    }

    /// Shuts down the scheduler.
    ///
    /// Jobs that are still waiting for their deadline are discarded. Jobs
    /// already handed over to the executor still run.
    pub fn shutdown(&self) {
        self.stop();
        self.shared.executor.shutdown();
    }

    /// Shuts down the scheduler, and discards all jobs the executor didn't
    /// start yet.
    pub fn shutdown_now(&self) {
        self.stop();
        self.shared.executor.shutdown_now();
    }

    /// Returns the number of jobs waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared.timeouts.lock().unwrap().len()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    fn stop(&self) {
        if self.shared.terminate() {
            log::debug!("shutting down the scheduler");
        }

        let Some(handle) = self.thread.lock().unwrap().take() else {
            return;
        };

        // A job running on the dispatch thread (e.g. when using an executor
        // that runs jobs inline) may shut the scheduler down.
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

impl<E: Executor + 'static> Drop for Scheduler<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
