pub mod executions;
pub mod schedule;
pub mod tasks;
