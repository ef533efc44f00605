//! Cron-driven pipeline runs for `serve`.

pub mod cron;
pub mod engine;

pub use self::cron::Scheduler;
pub use self::engine::run_scheduler_loop;
