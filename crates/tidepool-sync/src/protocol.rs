//! Text command protocol.
//!
//! Inbound frames are split on the ASCII space character:
//!
//! ```text
//! /room <token> <room_id>        join a room (exactly three tokens)
//! /state <room_id> <payload...>  replace a room's state, payload is JSON
//! ```
//!
//! Outbound frames always have the shape `/state <json>`. A room whose state
//! was never written is announced with the JSON literal `null`.
//!
//! Anything that does not match one of the two shapes is not an error; the
//! parser returns `None` and the frame is dropped.

use serde_json::Value;

pub const JOIN_VERB: &str = "/room";
pub const STATE_VERB: &str = "/state";

/// Wire text sent in place of a state that has never been written.
pub const UNSET_STATE: &str = "null";

const SEPARATOR: char = ' ';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Join { token: &'a str, room_id: &'a str },
    /// `payload` is the raw remainder of the frame and has not been decoded yet.
    Update { room_id: &'a str, payload: &'a str },
}

impl Command<'_> {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Command::Join { .. } => "join",
            Command::Update { .. } => "update",
        }
    }
}

pub fn parse(frame: &str) -> Option<Command<'_>> {
    let (verb, _) = frame.split_once(SEPARATOR)?;
    match verb {
        JOIN_VERB => parse_join(frame),
        STATE_VERB => parse_update(frame),
        _ => None,
    }
}

fn parse_join(frame: &str) -> Option<Command<'_>> {
    let mut tokens = frame.split(SEPARATOR);
    let (_verb, token, room_id) = (tokens.next()?, tokens.next()?, tokens.next()?);
    if tokens.next().is_some() || token.is_empty() || room_id.is_empty() {
        return None;
    }
    Some(Command::Join { token, room_id })
}

fn parse_update(frame: &str) -> Option<Command<'_>> {
    // Splitting on the first two separators keeps the payload byte-identical to
    // re-joining the remaining tokens with single spaces.
    let mut tokens = frame.splitn(3, SEPARATOR);
    let (_verb, room_id, payload) = (tokens.next()?, tokens.next()?, tokens.next()?);
    Some(Command::Update { room_id, payload })
}

pub fn decode_state(payload: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(payload)
}

/// Build the outbound frame announcing `state`.
pub fn state_frame(state: Option<&Value>) -> String {
    match state {
        Some(value) => format!("{STATE_VERB} {value}"),
        None => format!("{STATE_VERB} {UNSET_STATE}"),
    }
}
