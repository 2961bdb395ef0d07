use std::sync::Arc;

use uuid::Uuid;

/// Identifier assigned to every transport connection by the dispatcher.
pub type ConnectionId = Uuid;

/// A connection as seen by the sync engine.
///
/// The engine never owns connection lifecycle; it only keeps handles inside
/// room member lists and asks them to deliver text or report liveness.
pub trait Peer: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queue a text frame for delivery. Delivery is best effort.
    fn send(&self, text: &str);

    fn is_open(&self) -> bool;
}

pub type PeerHandle = Arc<dyn Peer>;
