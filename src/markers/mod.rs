/// Markers subsystem - Client-owned ranges that survive edits
///
/// The store hands out ids, keeps each marker's range in the marker index,
/// applies invalidation strategies on every splice and produces the
/// snapshots that history checkpoints restore.

pub mod marker;
pub mod store;

pub use marker::{InvalidationStrategy, Marker, MarkerParams, MarkerState, MarkerUpdate, Properties};
pub use store::{
    MarkerChangeEvent, MarkerEvent, MarkerQuery, MarkerSnapshot, MarkerStore, MarkerStoreState,
};
