mod state;
mod store;

pub use state::{HistoryEntry, RotationState, ROTATION_SCHEMA_VERSION};
pub use store::{RotationLease, RotationStore};
