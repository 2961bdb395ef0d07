use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::peer::PeerHandle;

/// A named bucket holding one opaque state value and its attached peers.
pub struct Room {
    id: String,
    state: Option<Value>,
    /// Attach order is kept and duplicates are allowed: a peer that joins
    /// twice receives every broadcast twice.
    members: Vec<PeerHandle>,
}

impl Room {
    fn new(id: String, state: Option<Value>) -> Self {
        Self {
            id,
            state,
            members: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `None` until the first accepted update (or a snapshot restore).
    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn replace_state(&mut self, state: Value) {
        self.state = Some(state);
    }

    pub fn attach(&mut self, peer: PeerHandle) {
        self.members.push(peer);
    }

    pub fn members(&self) -> &[PeerHandle] {
        &self.members
    }
}

/// In-memory map of room id to [`Room`]. Rooms are never removed.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from persisted states; every room starts with no members.
    pub fn from_states(states: BTreeMap<String, Value>) -> Self {
        let rooms = states
            .into_iter()
            .map(|(id, state)| (id.clone(), Room::new(id, Some(state))))
            .collect();
        Self { rooms }
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Create an unset room with `first` as its only member.
    ///
    /// Returns `false` without touching anything if the room already exists.
    pub fn create(&mut self, room_id: &str, first: PeerHandle) -> bool {
        if self.rooms.contains_key(room_id) {
            return false;
        }
        let mut room = Room::new(room_id.to_owned(), None);
        room.attach(first);
        self.rooms.insert(room_id.to_owned(), room);
        true
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> + '_ {
        self.rooms.values()
    }

    /// Copy of every written state, keyed by room id. Unset rooms and member
    /// lists are left out.
    pub fn states(&self) -> BTreeMap<String, Value> {
        self.rooms
            .values()
            .filter_map(|room| Some((room.id.clone(), room.state.clone()?)))
            .collect()
    }
}
