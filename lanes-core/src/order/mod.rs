pub mod diff;
pub mod reconcile;

pub use diff::{diff, normalize};
pub use reconcile::{plan, plan_mutations, CapacityWarning, MutationBatch};
