#![allow(clippy::new_without_default)]

mod blocking_queue;
mod clock;
mod config;
mod error;
mod queue;
mod scheduler;
mod stack;


pub use crate::blocking_queue::BlockingQueue;
pub use crate::clock::{Clock, ManualClock, MonotonicClock};
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::queue::Queue;
pub use crate::scheduler::delay::Scheduler;
pub use crate::scheduler::pool::{Executor, Job, ThreadPool};
pub use crate::scheduler::timeouts::Id;
pub use crate::stack::Stack;
