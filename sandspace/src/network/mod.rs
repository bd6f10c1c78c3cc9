pub mod egress;

pub use egress::{EgressFilter, SyncOutcome};
