//! Stream frame envelopes.
//!
//! Every websocket text frame is a JSON object keyed by room
//! (`{"r5": {"e": [records...], "t": watermark}, ...}`). Heartbeat frames are
//! the same envelope with empty room bodies and must decode to zero events,
//! not a failure.

use serde_json::Value as JsonValue;

use crate::error::{BanterLinkError, Result};
use crate::models::Event;

/// Decoded contents of one stream frame, restricted to a single room.
#[derive(Debug, Default)]
pub(crate) struct FrameBatch {
    /// Events in non-decreasing sequence-id order (stable for ties).
    pub events: Vec<Event>,
    /// Resume watermark (`t`) carried by the frame, when present.
    pub watermark: Option<u64>,
}

/// Parse a raw text frame and extract the batch destined for `room_id`.
///
/// Individual records that fail to decode are logged and skipped; only a
/// frame that is not a JSON object at all is a [`BanterLinkError::Protocol`]
/// failure.
pub(crate) fn parse_frame(text: &str, room_id: u64) -> Result<FrameBatch> {
    let value: JsonValue = serde_json::from_str(text)?;
    let envelope = value
        .as_object()
        .ok_or_else(|| BanterLinkError::Protocol("frame is not a JSON object".to_string()))?;

    let body = match envelope.get(&format!("r{room_id}")) {
        // heartbeat frames omit our room or send an empty body
        None => return Ok(FrameBatch::default()),
        Some(body) => body,
    };

    let mut batch = FrameBatch {
        events: Vec::new(),
        watermark: body.get("t").and_then(JsonValue::as_u64),
    };

    let records = match body.get("e").and_then(JsonValue::as_array) {
        None => return Ok(batch),
        Some(records) => records,
    };

    for record in records {
        match Event::from_record(record) {
            Ok(event) => batch.events.push(event),
            Err(e) => {
                log::warn!("[banter-link] [r{room_id}] skipping undecodable event record: {e}");
            }
        }
    }

    // The platform interleaves tags for the same action (e.g. a message and
    // the mention it carries) with equal ids; stable sort preserves their
    // arrival order.
    batch.events.sort_by_key(Event::id);

    Ok(batch)
}
