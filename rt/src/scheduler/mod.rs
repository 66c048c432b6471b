pub mod delay;
pub mod pool;
pub mod timeouts;
