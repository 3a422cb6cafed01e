pub mod jobs;
pub mod runner;
pub mod services;

pub use runner::{Job, JobLease, PeriodicTask, RunStatus, TaskRunner};
pub use services::Services;
