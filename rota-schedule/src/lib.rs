pub mod leave;
pub mod scheduler;
pub mod suspension;

pub use leave::{LeaveCoordinator, LeaveOutcome, SweepReport};
pub use scheduler::{PodRoster, RepairOutcome, Scheduler};
pub use suspension::{StrikeOutcome, SuspensionGate};
