//! Tasks waiting for their deadline to pass.
use crate::scheduler::pool::Job;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

/// The percentage of bucketed tasks (from 0.0 to 1.0) that can be cancelled
/// before the buckets must be cleaned up.
const FRAGMENTATION_THRESHOLD: f64 = 0.1;

/// The ID of a scheduled task, used for cancelling it.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone, Debug)]
pub struct Id(pub(crate) NonZeroU64);

impl Id {
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point in time relative to the epoch of a `Clock`, in milliseconds.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub(crate) struct Deadline(u64);

impl Deadline {
    pub(crate) fn at(millis: u64) -> Self {
        Deadline(millis)
    }

    pub(crate) fn after(now: u64, delay: Duration) -> Self {
        let delay = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        Deadline::at(now.saturating_add(delay))
    }

    /// Returns the time left until the deadline, or `None` if it already
    /// passed.
    pub(crate) fn remaining(self, now: u64) -> Option<Duration> {
        if self.0 > now {
            Some(Duration::from_millis(self.0 - now))
        } else {
            None
        }
    }

    pub(crate) fn as_millis(self) -> u64 {
        self.0
    }
}

/// A job waiting for its deadline.
pub(crate) struct Task {
    pub(crate) id: Id,
    pub(crate) deadline: Deadline,
    pub(crate) job: Job,
}

/// A collection of tasks, grouped by the time they need to run at.
///
/// Tasks are stored in buckets ordered by their deadline. Within a bucket the
/// tasks are ordered by the time they were inserted.
///
/// Cancelling a task only removes it from the list of active tasks, leaving
/// its ID in its bucket. These IDs are skipped when expiring a bucket, and
/// periodically removed when there are too many of them.
pub(crate) struct Timeouts {
    /// The IDs of all tasks (including cancelled tasks yet to be removed),
    /// grouped by their deadlines.
    buckets: BTreeMap<Deadline, Vec<Id>>,

    /// The tasks that haven't run nor have been cancelled.
    active: HashMap<Id, Task>,

    /// The number of IDs stored across all buckets.
    bucketed: usize,

    /// The number of cancelled IDs still stored in a bucket.
    cancelled: usize,
}

impl Timeouts {
    pub(crate) fn new() -> Self {
        Timeouts {
            buckets: BTreeMap::new(),
            active: HashMap::new(),
            bucketed: 0,
            cancelled: 0,
        }
    }

    pub(crate) fn insert(&mut self, id: Id, deadline: Deadline, job: Job) {
        self.buckets.entry(deadline).or_default().push(id);
        self.active.insert(id, Task { id, deadline, job });
        self.bucketed += 1;
    }

    /// Cancels a task, returning `true` if the task was still waiting for its
    /// deadline.
    pub(crate) fn cancel(&mut self, id: Id) -> bool {
        if self.active.remove(&id).is_some() {
            self.cancelled += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn compact(&mut self) {
        if self.bucketed == 0 {
            return;
        }

        let ratio = self.cancelled as f64 / self.bucketed as f64;

        if ratio >= FRAGMENTATION_THRESHOLD {
            self.remove_cancelled();
        }
    }

    /// Moves the tasks of all buckets of which the deadline passed into
    /// `expired`, in the order they need to run in.
    ///
    /// The return value is the time until the next deadline, if any.
    pub(crate) fn expired(
        &mut self,
        now: u64,
        expired: &mut Vec<Task>,
    ) -> Option<Duration> {
        while let Some(entry) = self.buckets.first_entry() {
            if let Some(time) = entry.key().remaining(now) {
                // Buckets are ordered, so the remaining buckets haven't
                // expired either.
                return Some(time);
            }

            let ids = entry.remove();

            self.bucketed -= ids.len();

            for id in ids {
                if let Some(task) = self.active.remove(&id) {
                    expired.push(task);
                } else {
                    self.cancelled -= 1;
                }
            }
        }

        None
    }

    /// Returns the number of tasks waiting for their deadline.
    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    fn remove_cancelled(&mut self) {
        let active = &self.active;

        self.buckets.retain(|_, ids| {
            ids.retain(|id| active.contains_key(id));
            !ids.is_empty()
        });

        log::debug!(
            "removed {} cancelled tasks from {} buckets",
            self.cancelled,
            self.buckets.len()
        );

        self.bucketed = self.buckets.values().map(|ids| ids.len()).sum();
        self.cancelled = 0;
    }
}
