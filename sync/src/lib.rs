//! Sync coordinator.
//!
//! Keeps the round machine aligned with the server while a round screen is
//! mounted: tracking pushes are folded in as server truth, and a reconnect
//! after a gap triggers a refetch of the active round.

pub mod coordinator;
pub mod error;

pub use coordinator::{SyncCoordinator, SyncOptions};
pub use error::SyncError;
