//! Typed events decoded from the room event stream.
//!
//! The platform tags every event record with a small integer `event_type`.
//! Records are decoded into the [`Event`] enum; tags this crate does not
//! recognize decode to [`Event::Unknown`] with the raw payload preserved, so
//! new platform behavior never breaks the stream.

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{BanterLinkError, Result};

/// The kind of an [`Event`], used as the handler-registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A message was posted to the room.
    MessagePosted,
    /// An existing message was edited.
    MessageEdited,
    /// A user entered the room.
    UserJoined,
    /// A user left the room.
    UserLeft,
    /// A message was starred (or its star count changed).
    Starred,
    /// A message mentioning this account was posted.
    Mentioned,
    /// A message was deleted.
    MessageDeleted,
    /// A message replying to this account was posted.
    Replied,
    /// Messages were moved out of the room.
    MovedOut,
    /// Messages were moved into the room.
    MovedIn,
    /// An event tag this crate does not recognize.
    Unknown,
}

impl EventType {
    /// Map a wire tag to an event type. Unrecognized tags map to `Unknown`.
    pub(crate) fn from_tag(tag: u32) -> Self {
        match tag {
            1 => Self::MessagePosted,
            2 => Self::MessageEdited,
            3 => Self::UserJoined,
            4 => Self::UserLeft,
            6 => Self::Starred,
            8 => Self::Mentioned,
            10 => Self::MessageDeleted,
            18 => Self::Replied,
            19 => Self::MovedOut,
            20 => Self::MovedIn,
            _ => Self::Unknown,
        }
    }
}

/// A message-bearing event: posted, edited, mention, reply, moved-in.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Stream sequence id of the event.
    pub id: u64,
    /// Event timestamp (seconds since epoch, as sent by the platform).
    pub time_stamp: u64,
    pub room_id: u64,
    pub message_id: u64,
    pub user_id: u64,
    pub user_name: String,
    /// Message body as an HTML snippet, exactly as the platform renders it.
    pub content: String,
    /// Message this one replies to, when any.
    pub parent_id: Option<u64>,
    pub stars: u32,
    pub edits: u32,
}

/// An event that references a message without carrying its content:
/// deletion, starring, moved-out.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRef {
    /// Stream sequence id of the event.
    pub id: u64,
    pub time_stamp: u64,
    pub room_id: u64,
    pub message_id: u64,
    /// User who triggered the event.
    pub user_id: u64,
    pub user_name: String,
    /// Owner of the affected message when a moderator acted on someone
    /// else's message.
    pub target_user_id: Option<u64>,
    pub stars: u32,
}

/// A user entering or leaving the room.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    /// Stream sequence id of the event.
    pub id: u64,
    pub time_stamp: u64,
    pub room_id: u64,
    pub user_id: u64,
    pub user_name: String,
}

/// An event received from a room's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MessagePosted(Message),
    MessageEdited(Message),
    MessageDeleted(MessageRef),
    Starred(MessageRef),
    Mentioned(Message),
    Replied(Message),
    UserJoined(Presence),
    UserLeft(Presence),
    MovedOut(MessageRef),
    MovedIn(Message),
    /// An event tag this crate does not recognize; the raw record is kept.
    Unknown { event_type: u32, data: JsonValue },
}

/// Raw record shape shared by all event tags.
#[derive(Debug, Deserialize)]
struct RawEvent {
    event_type: u32,
    id: u64,
    #[serde(default)]
    time_stamp: u64,
    room_id: u64,
    #[serde(default)]
    message_id: Option<u64>,
    #[serde(default)]
    user_id: Option<u64>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    parent_id: Option<u64>,
    #[serde(default)]
    target_user_id: Option<u64>,
    #[serde(default)]
    message_stars: u32,
    #[serde(default)]
    message_edits: u32,
}

impl RawEvent {
    fn require(field: &str, raw_id: u64) -> BanterLinkError {
        BanterLinkError::Protocol(format!("event {raw_id} is missing required field {field}"))
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message {
            message_id: self
                .message_id
                .ok_or_else(|| Self::require("message_id", self.id))?,
            user_id: self.user_id.ok_or_else(|| Self::require("user_id", self.id))?,
            content: self
                .content
                .ok_or_else(|| Self::require("content", self.id))?,
            id: self.id,
            time_stamp: self.time_stamp,
            room_id: self.room_id,
            user_name: self.user_name.unwrap_or_default(),
            parent_id: self.parent_id,
            stars: self.message_stars,
            edits: self.message_edits,
        })
    }

    fn into_message_ref(self) -> Result<MessageRef> {
        Ok(MessageRef {
            message_id: self
                .message_id
                .ok_or_else(|| Self::require("message_id", self.id))?,
            user_id: self.user_id.ok_or_else(|| Self::require("user_id", self.id))?,
            id: self.id,
            time_stamp: self.time_stamp,
            room_id: self.room_id,
            user_name: self.user_name.unwrap_or_default(),
            target_user_id: self.target_user_id,
            stars: self.message_stars,
        })
    }

    fn into_presence(self) -> Result<Presence> {
        Ok(Presence {
            user_id: self.user_id.ok_or_else(|| Self::require("user_id", self.id))?,
            id: self.id,
            time_stamp: self.time_stamp,
            room_id: self.room_id,
            user_name: self.user_name.unwrap_or_default(),
        })
    }
}

impl Event {
    /// Decode one event record from a stream envelope.
    ///
    /// Fails with [`BanterLinkError::Protocol`] when a recognized tag is
    /// missing a field its variant requires; the caller logs and skips the
    /// record without tearing down the connection.
    pub(crate) fn from_record(record: &JsonValue) -> Result<Event> {
        let raw: RawEvent = serde_json::from_value(record.clone())?;
        let event = match EventType::from_tag(raw.event_type) {
            EventType::MessagePosted => Event::MessagePosted(raw.into_message()?),
            EventType::MessageEdited => Event::MessageEdited(raw.into_message()?),
            EventType::Mentioned => Event::Mentioned(raw.into_message()?),
            EventType::Replied => Event::Replied(raw.into_message()?),
            EventType::MovedIn => Event::MovedIn(raw.into_message()?),
            EventType::MessageDeleted => Event::MessageDeleted(raw.into_message_ref()?),
            EventType::Starred => Event::Starred(raw.into_message_ref()?),
            EventType::MovedOut => Event::MovedOut(raw.into_message_ref()?),
            EventType::UserJoined => Event::UserJoined(raw.into_presence()?),
            EventType::UserLeft => Event::UserLeft(raw.into_presence()?),
            EventType::Unknown => Event::Unknown {
                event_type: raw.event_type,
                data: record.clone(),
            },
        };
        Ok(event)
    }

    /// The kind of this event, used as the handler-registry key.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::MessagePosted(_) => EventType::MessagePosted,
            Event::MessageEdited(_) => EventType::MessageEdited,
            Event::MessageDeleted(_) => EventType::MessageDeleted,
            Event::Starred(_) => EventType::Starred,
            Event::Mentioned(_) => EventType::Mentioned,
            Event::Replied(_) => EventType::Replied,
            Event::UserJoined(_) => EventType::UserJoined,
            Event::UserLeft(_) => EventType::UserLeft,
            Event::MovedOut(_) => EventType::MovedOut,
            Event::MovedIn(_) => EventType::MovedIn,
            Event::Unknown { .. } => EventType::Unknown,
        }
    }

    /// Stream sequence id. Monotonically increasing per room; used for
    /// ordering and reconnect deduplication.
    pub fn id(&self) -> u64 {
        match self {
            Event::MessagePosted(m)
            | Event::MessageEdited(m)
            | Event::Mentioned(m)
            | Event::Replied(m)
            | Event::MovedIn(m) => m.id,
            Event::MessageDeleted(r) | Event::Starred(r) | Event::MovedOut(r) => r.id,
            Event::UserJoined(p) | Event::UserLeft(p) => p.id,
            Event::Unknown { data, .. } => data.get("id").and_then(JsonValue::as_u64).unwrap_or(0),
        }
    }

    /// Room the event belongs to.
    pub fn room_id(&self) -> u64 {
        match self {
            Event::MessagePosted(m)
            | Event::MessageEdited(m)
            | Event::Mentioned(m)
            | Event::Replied(m)
            | Event::MovedIn(m) => m.room_id,
            Event::MessageDeleted(r) | Event::Starred(r) | Event::MovedOut(r) => r.room_id,
            Event::UserJoined(p) | Event::UserLeft(p) => p.room_id,
            Event::Unknown { data, .. } => {
                data.get("room_id").and_then(JsonValue::as_u64).unwrap_or(0)
            }
        }
    }
}
