pub mod events;
pub mod pod;
pub mod profile;
pub mod schedule;
