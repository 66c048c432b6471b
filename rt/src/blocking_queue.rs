//! A bounded queue that blocks producers and consumers.
use crate::config::Config;
use crate::error::Error;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A first-in-first-out queue with a fixed capacity.
///
/// Pushing a value onto a full queue blocks the calling thread until a value
/// is popped, and popping from an empty queue blocks until a value is pushed.
///
/// Unlike `Queue` this type uses a lock, and the length it reports is exact.
pub struct BlockingQueue<T> {
    values: Mutex<VecDeque<T>>,
    capacity: usize,

    /// Signalled whenever a value is popped.
    not_full: Condvar,

    /// Signalled whenever a value is pushed.
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "the capacity of a blocking queue must be greater than zero",
            ));
        }

        Ok(BlockingQueue {
            values: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::new(config.queue_capacity)
    }

    /// Pushes a value onto the end of the queue, blocking the calling thread
    /// while the queue is full.
    pub fn push(&self, value: T) {
        let mut values = self.values.lock().unwrap();

        while values.len() == self.capacity {
            values = self.not_full.wait(values).unwrap();
        }

        values.push_back(value);
        self.not_empty.notify_one();
    }

    /// Pushes a value onto the end of the queue, without blocking.
    ///
    /// If the queue is full the value is handed back.
    pub fn try_push(&self, value: T) -> Result<(), (T, Error)> {
        let mut values = self.values.lock().unwrap();

        if values.len() == self.capacity {
            return Err((value, Error::Full));
        }

        values.push_back(value);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pops a value from the front of the queue, blocking the calling thread
    /// while the queue is empty.
    pub fn pop(&self) -> T {
        let mut values = self.values.lock().unwrap();

        loop {
            if let Some(value) = values.pop_front() {
                self.not_full.notify_one();
                return value;
            }

            values = self.not_empty.wait(values).unwrap();
        }
    }

    /// Pops a value from the front of the queue, without blocking.
    pub fn try_pop(&self) -> Result<T, Error> {
        let mut values = self.values.lock().unwrap();
        let value = values.pop_front().ok_or(Error::Empty)?;

        self.not_full.notify_one();
        Ok(value)
    }

    /// Pops a value from the front of the queue, waiting at most the given
    /// duration for one to become available.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut values = self.values.lock().unwrap();

        loop {
            if let Some(value) = values.pop_front() {
                self.not_full.notify_one();
                return Ok(value);
            }

            // In case of a spurious wakeup we only wait for the remainder of
            // the time, not the full duration.
            let Some(remaining) =
                deadline.checked_duration_since(Instant::now())
            else {
                return Err(Error::Empty);
            };

            values = self.not_empty.wait_timeout(values, remaining).unwrap().0;
        }
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
