//! Room state synchronisation for the Tidepool relay.
//!
//! Peers join named rooms with a shared token and push opaque JSON state into
//! them; every other open member of the room receives the new value. Room
//! states are snapshotted to a single JSON file on a timer and restored at
//! startup. Transport lives elsewhere: the engine only sees [`Peer`] handles.

pub mod engine;
pub mod error;
pub mod peer;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod store;

pub use engine::{Broadcast, Dispatch, JoinOutcome, SyncConfig, SyncEngine};
pub use error::{StoreError, SyncError};
pub use peer::{ConnectionId, Peer, PeerHandle};
pub use persist::{SharedEngine, DEFAULT_SNAPSHOT_INTERVAL};
pub use registry::{Room, RoomRegistry};
pub use store::SnapshotStore;
