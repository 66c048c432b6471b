use std::env::var;
use std::thread::available_parallelism;

/// Sets a configuration field based on an environment variable.
macro_rules! set_from_env {
    ($config:expr, $field:ident, $key:expr, $value_type:ty) => {{
        if let Ok(raw_value) = var(concat!("LOCKSTEP_", $key)) {
            if let Ok(value) = raw_value.parse::<$value_type>() {
                if value > 0 {
                    $config.$field = value;
                }
            }
        };
    }};
}

/// The maximum number of threads a single pool allows.
pub(crate) const MAX_THREADS: u16 = 255;

/// The default time (in milliseconds) the dispatch thread waits when no tasks
/// are scheduled.
///
/// The dispatch thread is woken up whenever a task is scheduled, so this
/// value only bounds how long it takes to notice state changes that don't
/// notify it.
const DEFAULT_IDLE_WAIT: u64 = 1000;

/// The default capacity of a blocking queue created from a configuration.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Structure containing the configuration settings for the runtime.
pub struct Config {
    /// The number of threads to use for running dispatched tasks.
    pub pool_threads: u16,

    /// The maximum time (in milliseconds) the dispatch thread sleeps when
    /// there's no work to do.
    pub idle_wait: u64,

    /// The capacity of blocking queues created using
    /// `BlockingQueue::from_config()`.
    pub queue_capacity: usize,
}

impl Config {
    pub fn new() -> Config {
        let cpu_count =
            available_parallelism().map(|v| v.get()).unwrap_or(1) as u16;

        let mut config = Config {
            pool_threads: cpu_count,
            idle_wait: DEFAULT_IDLE_WAIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        };

        config.verify();
        config
    }

    pub fn from_env() -> Config {
        let mut config = Config::new();

        set_from_env!(config, pool_threads, "POOL_THREADS", u16);
        set_from_env!(config, idle_wait, "IDLE_WAIT", u64);
        set_from_env!(config, queue_capacity, "QUEUE_CAPACITY", usize);

        config.verify();
        config
    }

    fn verify(&mut self) {
        if self.pool_threads == 0 {
            self.pool_threads = 1;
        }

        if self.pool_threads > MAX_THREADS {
            self.pool_threads = MAX_THREADS;
        }
    }
}
