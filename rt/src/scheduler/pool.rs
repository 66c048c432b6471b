//! A pool of OS threads for running jobs submitted by other threads.
use crate::config::Config;
use crate::error::Error;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// A unit of work to run on an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A type that runs jobs asynchronously from the threads submitting them.
pub trait Executor: Send + Sync {
    /// Submits a job for execution.
    ///
    /// This method doesn't wait for the job to run. If the executor no longer
    /// accepts work, an `Error::ShutDown` is returned and the job is dropped.
    fn submit(&self, job: Job) -> Result<(), Error>;

    /// Stops accepting new jobs, while still running the jobs already
    /// submitted.
    fn shutdown(&self);

    /// Stops accepting new jobs and discards the jobs that haven't started
    /// yet.
    ///
    /// Jobs that are already running are not interrupted.
    fn shutdown_now(&self);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn submit(&self, job: Job) -> Result<(), Error> {
        (**self).submit(job)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }

    fn shutdown_now(&self) {
        (**self).shutdown_now()
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
enum Status {
    /// New jobs are accepted and run.
    Running,

    /// New jobs are rejected, but pending jobs still run.
    Draining,

    /// New jobs are rejected, and pending jobs are discarded.
    Terminated,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::Running,
            1 => Status::Draining,
            _ => Status::Terminated,
        }
    }
}

/// The state of a pool, shared between the pool and its threads.
struct State {
    /// The queue new jobs are submitted to.
    global: Injector<Job>,

    /// The stealing halves of the queues owned by each thread.
    stealers: Vec<Stealer<Job>>,

    status: AtomicU8,

    /// The mutex idle threads use for going to sleep.
    ///
    /// This mutex doesn't guard any data. Instead it's used to ensure we don't
    /// wake up threads between them checking for work and going to sleep.
    ///
    /// The status only changes while holding this lock, and jobs are only
    /// pushed onto the global queue while holding it.
    lock: Mutex<()>,

    /// A condition variable used for waking up idle threads.
    cvar: Condvar,

    /// The number of jobs that panicked.
    panicked: AtomicUsize,
}

impl State {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Moves the pool from one status to another one that comes after it.
    ///
    /// Returns `true` if the status changed.
    fn transition(&self, to: Status) -> bool {
        let _lock = self.lock.lock().unwrap();
        let old = self.status();

        if (old as u8) >= (to as u8) {
            return false;
        }

        self.status.store(to as u8, Ordering::Release);
        self.cvar.notify_all();
        true
    }
}

/// A thread that's part of a pool.
struct Worker {
    /// The index of this thread in the pool.
    id: usize,

    /// The thread-local queue jobs are moved into when stealing them.
    queue: Deque<Job>,

    state: Arc<State>,
}

impl Worker {
    fn run(&self) {
        loop {
            match self.state.status() {
                Status::Terminated => return,
                Status::Draining => {
                    // Nobody can submit jobs at this point, so once we run out
                    // of work we're done.
                    if let Some(job) = self.next_job() {
                        self.run_job(job);
                    } else {
                        return;
                    }
                }
                Status::Running => {
                    if let Some(job) = self.next_job() {
                        self.run_job(job);
                    } else {
                        self.sleep();
                    }
                }
            }
        }
    }

    fn next_job(&self) -> Option<Job> {
        self.queue
            .pop()
            .or_else(|| self.steal_from_global())
            .or_else(|| self.steal_from_thread())
    }

    fn steal_from_global(&self) -> Option<Job> {
        loop {
            match self.state.global.steal_batch_and_pop(&self.queue) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    fn steal_from_thread(&self) -> Option<Job> {
        // We start stealing at the thread that comes after ours, wrapping
        // around as needed.
        let start = self.id + 1;
        let len = self.state.stealers.len();

        for index in 0..len {
            let index = (start + index) % len;

            if index == self.id {
                continue;
            }

            let stealer = &self.state.stealers[index];

            loop {
                match stealer.steal_batch_and_pop(&self.queue) {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }

        None
    }

    fn sleep(&self) {
        let mut lock = self.state.lock.lock().unwrap();

        // We don't handle spurious wakeups here, as we'll just look for work
        // again and come back here if there's none.
        if self.state.is_running() && self.state.global.is_empty() {
            lock = self.state.cvar.wait(lock).unwrap();
        }

        drop(lock);
    }

    fn run_job(&self, job: Job) {
        // A panicking job mustn't take the thread down with it, otherwise the
        // pool would slowly run out of threads.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            self.state.panicked.fetch_add(1, Ordering::AcqRel);

            log::error!(
                "a job running on pool thread {} panicked: {}",
                self.id,
                panic_message(payload.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// A fixed-size pool of threads that run submitted jobs.
///
/// Jobs are submitted to a global queue. Threads take jobs from this queue in
/// batches, moving them into their own queues, and steal from the queues of
/// other threads when running out of work. Threads that find no work at all
/// go to sleep until new jobs are submitted.
pub struct ThreadPool {
    state: Arc<State>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Starts a new pool with the given number of threads.
    ///
    /// Each thread is named after the pool's name and the thread's index.
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        assert!(threads > 0, "a ThreadPool requires at least a single thread");

        let queues: Vec<Deque<Job>> =
            (0..threads).map(|_| Deque::new_fifo()).collect();

        let state = Arc::new(State {
            global: Injector::new(),
            stealers: queues.iter().map(|q| q.stealer()).collect(),
            status: AtomicU8::new(Status::Running as u8),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
            panicked: AtomicUsize::new(0),
        });

        let pool = ThreadPool { state, threads: Mutex::new(Vec::new()) };

        for (id, queue) in queues.into_iter().enumerate() {
            let worker = Worker { id, queue, state: pool.state.clone() };
            let handle = thread::Builder::new()
                .name(format!("{} {}", name, id))
                .spawn(move || worker.run())?;

            pool.threads.lock().unwrap().push(handle);
        }

        log::debug!("started pool '{}' with {} threads", name, threads);
        Ok(pool)
    }

    pub fn from_config(name: &str, config: &Config) -> io::Result<Self> {
        Self::new(name, config.pool_threads as usize)
    }

    /// Returns the number of jobs that panicked while running.
    pub fn panicked(&self) -> usize {
        self.state.panicked.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Waits for all threads of the pool to finish.
    ///
    /// Threads only finish after the pool is shut down, so calling this method
    /// on a running pool blocks the calling thread until another thread shuts
    /// the pool down.
    pub fn join(&self) {
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        let current = thread::current().id();

        for handle in handles {
            // A job may end up dropping the pool it runs on, in which case we
            // can't wait for our own thread.
            if handle.thread().id() == current {
                continue;
            }

            let _ = handle.join();
        }
    }
}

impl Executor for ThreadPool {
    fn submit(&self, job: Job) -> Result<(), Error> {
        // The status may only change while holding this lock, so a job we
        // accept here is always seen by threads draining the pool. Holding it
        // also ensures we don't signal a thread just before it goes to sleep.
        let _lock = self.state.lock.lock().unwrap();

        if !self.state.is_running() {
            return Err(Error::ShutDown);
        }

        self.state.global.push(job);
        self.state.cvar.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        if self.state.transition(Status::Draining) {
            log::debug!("draining pool");
        }
    }

    fn shutdown_now(&self) {
        if !self.state.transition(Status::Terminated) {
            return;
        }

        let mut discarded = 0;

        loop {
            match self.state.global.steal() {
                Steal::Success(job) => {
                    discarded += 1;
                    drop(job);
                }
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }

        log::debug!("terminated pool, discarding {} pending jobs", discarded);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};

    fn wait_for(counter: &AtomicUsize, value: usize) {
        let start = Instant::now();

        while counter.load(Ordering::Acquire) < value
            && start.elapsed() < Duration::from_secs(5)
        {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    #[should_panic]
    fn test_new_with_zero_threads() {
        let _ = ThreadPool::new("test", 0);
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::new();

        config.pool_threads = 3;

        let pool = ThreadPool::from_config("test", &config).unwrap();

        assert_eq!(pool.threads.lock().unwrap().len(), 3);
        assert_eq!(pool.state.stealers.len(), 3);
    }

    #[test]
    fn test_status_from_u8() {
        assert_eq!(Status::from_u8(0), Status::Running);
        assert_eq!(Status::from_u8(1), Status::Draining);
        assert_eq!(Status::from_u8(2), Status::Terminated);
    }

    #[test]
    fn test_submit() {
        let pool = ThreadPool::new("test", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();

            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();
        }

        wait_for(&counter, 10);
        assert_eq!(counter.load(Ordering::Acquire), 10);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = ThreadPool::new("test", 1).unwrap();

        pool.shutdown();

        assert_eq!(pool.submit(Box::new(|| {})), Err(Error::ShutDown));
        assert!(!pool.is_running());
    }

    #[test]
    fn test_submit_while_shutting_down() {
        for _ in 0..50 {
            let pool = ThreadPool::new("test", 2).unwrap();
            let accepted = AtomicUsize::new(0);
            let ran = Arc::new(AtomicUsize::new(0));

            thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(|| {
                        for _ in 0..500 {
                            let ran = ran.clone();
                            let job = Box::new(move || {
                                ran.fetch_add(1, Ordering::AcqRel);
                            });

                            if pool.submit(job).is_ok() {
                                accepted.fetch_add(1, Ordering::AcqRel);
                            }
                        }
                    });
                }

                s.spawn(|| pool.shutdown());
            });

            pool.join();

            // Every job the pool accepted must also run, even when it was
            // submitted right before the pool started draining.
            assert_eq!(
                ran.load(Ordering::Acquire),
                accepted.load(Ordering::Acquire)
            );
        }
    }

    #[test]
    fn test_shutdown_runs_pending_jobs() {
        let pool = ThreadPool::new("test", 1).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let counter = Arc::new(AtomicUsize::new(0));
        let blocker = barrier.clone();

        // This keeps the only thread busy, so the jobs below are still pending
        // when we shut down.
        pool.submit(Box::new(move || {
            blocker.wait();
        }))
        .unwrap();

        for _ in 0..5 {
            let counter = counter.clone();

            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();
        }

        pool.shutdown();
        barrier.wait();
        pool.join();

        assert_eq!(counter.load(Ordering::Acquire), 5);
    }

    #[test]
    fn test_shutdown_now_discards_pending_jobs() {
        let pool = ThreadPool::new("test", 1).unwrap();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let counter = Arc::new(AtomicUsize::new(0));
        let (started_job, release_job) = (started.clone(), release.clone());

        pool.submit(Box::new(move || {
            started_job.wait();
            release_job.wait();
        }))
        .unwrap();

        started.wait();

        for _ in 0..5 {
            let counter = counter.clone();

            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();
        }

        pool.shutdown_now();
        release.wait();
        pool.join();

        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_shutdown_now_after_shutdown() {
        let pool = ThreadPool::new("test", 1).unwrap();

        pool.shutdown();
        pool.shutdown_now();

        assert_eq!(pool.state.status(), Status::Terminated);
    }

    #[test]
    fn test_shutdown_after_shutdown_now() {
        let pool = ThreadPool::new("test", 1).unwrap();

        pool.shutdown_now();
        pool.shutdown();

        assert_eq!(pool.state.status(), Status::Terminated);
    }

    #[test]
    fn test_panicking_job() {
        let pool = ThreadPool::new("test", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let after = counter.clone();

        pool.submit(Box::new(|| panic!("oh no"))).unwrap();
        pool.submit(Box::new(move || {
            after.fetch_add(1, Ordering::AcqRel);
        }))
        .unwrap();

        wait_for(&counter, 1);

        // The thread survived the panic and ran the second job.
        assert_eq!(counter.load(Ordering::Acquire), 1);
        assert_eq!(pool.panicked(), 1);
    }

    #[test]
    fn test_panic_message() {
        let borrowed: Box<dyn Any + Send> = Box::new("foo");
        let owned: Box<dyn Any + Send> = Box::new("bar".to_string());
        let other: Box<dyn Any + Send> = Box::new(10);

        assert_eq!(panic_message(borrowed.as_ref()), "foo");
        assert_eq!(panic_message(owned.as_ref()), "bar");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_steal_from_thread() {
        let queue0: Deque<Job> = Deque::new_fifo();
        let queue1: Deque<Job> = Deque::new_fifo();
        let state = Arc::new(State {
            global: Injector::new(),
            stealers: vec![queue0.stealer(), queue1.stealer()],
            status: AtomicU8::new(Status::Running as u8),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
            panicked: AtomicUsize::new(0),
        });
        let thief = Worker { id: 1, queue: queue1, state };

        queue0.push(Box::new(|| {}));
        queue0.push(Box::new(|| {}));

        assert!(thief.steal_from_thread().is_some());
        assert!(queue0.len() < 2);
        assert!(thief.steal_from_global().is_none());
    }

    #[test]
    fn test_drop_joins_threads() {
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let pool = ThreadPool::new("test", 2).unwrap();

            for _ in 0..4 {
                let counter = counter.clone();

                pool.submit(Box::new(move || {
                    counter.fetch_add(1, Ordering::AcqRel);
                }))
                .unwrap();
            }
        }

        assert_eq!(counter.load(Ordering::Acquire), 4);
    }
}
