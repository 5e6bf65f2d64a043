/// Builder for constructing job runners.
pub mod builder;
/// Job handler trait, per-attempt context and job definitions.
pub mod handler;
/// Tick loop, execution state machine, stats and replay.
pub mod runner;
/// Schedules deciding when a job is due.
pub mod schedule;

pub use builder::JobRunnerBuilder;
pub use handler::{JobContext, JobDefinition, JobHandler, handler_fn};
pub use runner::{JobCounters, JobRunner, RunnerStats};
pub use schedule::{DailySchedule, IntervalSchedule, ManualSchedule, Schedule};
