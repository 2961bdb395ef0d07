use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::SyncError;
use crate::peer::{ConnectionId, PeerHandle};
use crate::protocol::{self, Command};
use crate::registry::RoomRegistry;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Shared bearer token every join must present.
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The room did not exist; it was created with the joiner as its only member.
    Created,
    /// The joiner was attached to an existing room and sent its current state.
    Attached,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Broadcast {
    pub delivered: usize,
    /// Members that were not open at send time. They stay attached.
    pub skipped: usize,
}

/// Result of feeding one inbound frame to the engine.
#[derive(Debug)]
pub enum Dispatch {
    /// Not a recognised command.
    Ignored,
    Joined {
        room_id: String,
        outcome: JoinOutcome,
    },
    Updated {
        room_id: String,
        broadcast: Broadcast,
    },
    Rejected {
        command: &'static str,
        error: SyncError,
    },
}

/// Applies join/update commands to the room registry and fans state out.
///
/// Every method runs to completion without yielding, so a caller that
/// serialises access (one task, or one mutex) gets per-command atomicity.
pub struct SyncEngine {
    config: SyncConfig,
    registry: RoomRegistry,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_registry(config, RoomRegistry::new())
    }

    pub fn with_registry(config: SyncConfig, registry: RoomRegistry) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Current state of every room that has one, for snapshotting.
    pub fn states(&self) -> BTreeMap<String, Value> {
        self.registry.states()
    }

    /// Handle one inbound text frame from `peer`. Never fails: problems are
    /// logged here and reported back only as a [`Dispatch`] value.
    pub fn dispatch(&mut self, peer: &PeerHandle, frame: &str) -> Dispatch {
        let Some(command) = protocol::parse(frame) else {
            trace!(connection_id = %peer.id(), "ignoring unrecognised frame");
            return Dispatch::Ignored;
        };

        let result = match command {
            Command::Join { token, room_id } => self
                .join(peer, token, room_id)
                .map(|outcome| Dispatch::Joined {
                    room_id: room_id.to_owned(),
                    outcome,
                }),
            Command::Update { room_id, payload } => self
                .update(peer.id(), room_id, payload)
                .map(|broadcast| Dispatch::Updated {
                    room_id: room_id.to_owned(),
                    broadcast,
                }),
        };

        result.unwrap_or_else(|error| {
            log_rejection(peer.id(), &error);
            Dispatch::Rejected {
                command: command.metric_label(),
                error,
            }
        })
    }

    pub fn join(
        &mut self,
        peer: &PeerHandle,
        token: &str,
        room_id: &str,
    ) -> Result<JoinOutcome, SyncError> {
        if token != self.config.token {
            return Err(SyncError::Unauthorized);
        }

        match self.registry.get_mut(room_id) {
            Some(room) => {
                room.attach(peer.clone());
                peer.send(&protocol::state_frame(room.state()));
                debug!(
                    room_id,
                    connection_id = %peer.id(),
                    members = room.members().len(),
                    "peer attached to room"
                );
                Ok(JoinOutcome::Attached)
            }
            None => {
                // The first joiner is not sent anything: there is no state yet.
                self.registry.create(room_id, peer.clone());
                debug!(room_id, connection_id = %peer.id(), "room created");
                Ok(JoinOutcome::Created)
            }
        }
    }

    /// Replace the state of `room_id` and send it to every other open member.
    ///
    /// The sender does not have to be a member of the room.
    pub fn update(
        &mut self,
        sender: ConnectionId,
        room_id: &str,
        payload: &str,
    ) -> Result<Broadcast, SyncError> {
        let Some(room) = self.registry.get_mut(room_id) else {
            return Err(SyncError::UnknownRoom(room_id.to_owned()));
        };

        let state = protocol::decode_state(payload).map_err(|source| SyncError::InvalidPayload {
            room_id: room_id.to_owned(),
            source,
        })?;
        let frame = protocol::state_frame(Some(&state));
        room.replace_state(state);

        let mut broadcast = Broadcast::default();
        for member in room.members() {
            if member.id() == sender {
                continue;
            }
            if !member.is_open() {
                broadcast.skipped += 1;
                continue;
            }
            member.send(&frame);
            broadcast.delivered += 1;
        }

        trace!(
            room_id,
            connection_id = %sender,
            delivered = broadcast.delivered,
            skipped = broadcast.skipped,
            "state updated"
        );
        Ok(broadcast)
    }
}

fn log_rejection(connection_id: ConnectionId, error: &SyncError) {
    match error {
        // The supplied token is never logged.
        SyncError::Unauthorized => debug!(%connection_id, "join rejected"),
        SyncError::UnknownRoom(room_id) => {
            trace!(%connection_id, room_id = %room_id, "update for unknown room dropped")
        }
        SyncError::InvalidPayload { room_id, source } => warn!(
            %connection_id,
            room_id = %room_id,
            error = %source,
            "dropping update with malformed state payload"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use uuid::Uuid;

    struct Recorder {
        id: ConnectionId,
        open: AtomicBool,
        frames: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                open: AtomicBool::new(true),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().clone()
        }
    }

    impl Peer for Recorder {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn send(&self, text: &str) {
            self.frames.lock().push(text.to_owned());
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(SyncConfig {
            token: "abc".into(),
        })
    }

    fn handle(peer: &Arc<Recorder>) -> PeerHandle {
        peer.clone()
    }

    #[test]
    fn wrong_token_changes_nothing() {
        let mut engine = engine();
        let peer = Recorder::new();

        let dispatch = engine.dispatch(&handle(&peer), "/room ABC r1");
        assert!(matches!(
            dispatch,
            Dispatch::Rejected {
                command: "join",
                error: SyncError::Unauthorized
            }
        ));
        assert!(engine.registry().is_empty());
        assert!(peer.frames().is_empty());
    }

    #[test]
    fn first_join_creates_room_silently() {
        let mut engine = engine();
        let peer = Recorder::new();

        let outcome = engine.join(&handle(&peer), "abc", "r1").unwrap();
        assert_eq!(outcome, JoinOutcome::Created);
        assert!(peer.frames().is_empty());
        let room = engine.registry().get("r1").unwrap();
        assert!(room.state().is_none());
        assert_eq!(room.members().len(), 1);
    }

    #[test]
    fn later_join_receives_current_state() {
        let mut engine = engine();
        let first = Recorder::new();
        let second = Recorder::new();

        engine.join(&handle(&first), "abc", "r1").unwrap();
        engine.update(first.id, "r1", r#"{ "x": [1, 2] }"#).unwrap();
        let outcome = engine.join(&handle(&second), "abc", "r1").unwrap();

        assert_eq!(outcome, JoinOutcome::Attached);
        assert_eq!(second.frames(), vec![r#"/state {"x":[1,2]}"#.to_string()]);
    }

    #[test]
    fn update_on_unknown_room_is_dropped() {
        let mut engine = engine();
        let peer = Recorder::new();

        let err = engine.update(peer.id, "nope", "1").unwrap_err();
        assert!(matches!(err, SyncError::UnknownRoom(ref id) if id == "nope"));
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn malformed_payload_keeps_previous_state() {
        let mut engine = engine();
        let a = Recorder::new();
        let b = Recorder::new();
        engine.join(&handle(&a), "abc", "r1").unwrap();
        engine.join(&handle(&b), "abc", "r1").unwrap();
        engine.update(a.id, "r1", "7").unwrap();
        let before = b.frames().len();

        let dispatch = engine.dispatch(&handle(&a), "/state r1 {broken");
        assert!(matches!(
            dispatch,
            Dispatch::Rejected {
                command: "update",
                error: SyncError::InvalidPayload { .. }
            }
        ));
        assert_eq!(engine.registry().get("r1").unwrap().state(), Some(&json!(7)));
        assert_eq!(b.frames().len(), before);
    }

    #[test]
    fn closed_members_are_skipped_but_kept() {
        let mut engine = engine();
        let a = Recorder::new();
        let b = Recorder::new();
        let c = Recorder::new();
        for peer in [&a, &b, &c] {
            engine.join(&handle(peer), "abc", "r1").unwrap();
        }
        c.open.store(false, Ordering::SeqCst);

        let broadcast = engine.update(a.id, "r1", "true").unwrap();
        assert_eq!(
            broadcast,
            Broadcast {
                delivered: 1,
                skipped: 1
            }
        );
        assert_eq!(b.frames().last().map(String::as_str), Some("/state true"));
        assert_eq!(engine.registry().get("r1").unwrap().members().len(), 3);
    }

    #[test]
    fn non_member_may_update() {
        let mut engine = engine();
        let member = Recorder::new();
        let outsider = Recorder::new();
        engine.join(&handle(&member), "abc", "r1").unwrap();

        let dispatch = engine.dispatch(&handle(&outsider), r#"/state r1 "hi""#);
        assert!(matches!(dispatch, Dispatch::Updated { .. }));
        assert_eq!(member.frames(), vec![r#"/state "hi""#.to_string()]);
        assert!(outsider.frames().is_empty());
    }

    #[test]
    fn duplicate_join_duplicates_fan_out() {
        let mut engine = engine();
        let a = Recorder::new();
        let b = Recorder::new();
        engine.join(&handle(&a), "abc", "r1").unwrap();
        engine.join(&handle(&b), "abc", "r1").unwrap();
        engine.join(&handle(&b), "abc", "r1").unwrap();

        let broadcast = engine.update(a.id, "r1", "1").unwrap();
        assert_eq!(broadcast.delivered, 2);
        // Two join echoes plus two copies of the update.
        assert_eq!(b.frames().len(), 4);
    }

    #[test]
    fn garbage_frames_are_ignored() {
        let mut engine = engine();
        let peer = Recorder::new();
        assert!(matches!(
            engine.dispatch(&handle(&peer), "/room abc"),
            Dispatch::Ignored
        ));
        assert!(matches!(
            engine.dispatch(&handle(&peer), "ping"),
            Dispatch::Ignored
        ));
        assert!(engine.registry().is_empty());
    }
}
