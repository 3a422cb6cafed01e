pub mod matchmaker;
pub mod profiles;
pub mod rescue;

pub use matchmaker::{partition_sizes, BatchReport, InstantMatch, Matchmaker};
pub use profiles::{CommuteRequest, ProfileService, Registration};
pub use rescue::rescue_candidates;
