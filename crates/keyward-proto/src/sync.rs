//! Long-poll sync batches and to-device messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Event,
    ids::{DeviceId, RoomId, UserId},
};

/// Per-user per-device payloads for one send-to-device call.
pub type ToDeviceMessages = BTreeMap<UserId, BTreeMap<DeviceId, Value>>;

/// One `/sync` response.
///
/// Every section defaults to empty so partial server responses decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Token to pass as `since` on the next request
    pub next_batch: String,

    /// Room deltas
    #[serde(default)]
    pub rooms: Rooms,

    /// Events sent directly to this device
    #[serde(default)]
    pub to_device: ToDevice,

    /// Users whose device lists changed or who stopped sharing a room
    #[serde(default)]
    pub device_lists: DeviceLists,

    /// Unclaimed one-time keys on the server, by algorithm
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
}

/// Room sections of a sync response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rooms {
    /// Rooms the user is joined to
    #[serde(default)]
    pub join: BTreeMap<RoomId, JoinedRoom>,

    /// Rooms the user is invited to
    #[serde(default)]
    pub invite: BTreeMap<RoomId, InvitedRoom>,

    /// Rooms the user has left
    #[serde(default)]
    pub leave: BTreeMap<RoomId, LeftRoom>,
}

/// A list of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomEvents {
    /// Events in order
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Timeline section of a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Events in order
    #[serde(default)]
    pub events: Vec<Event>,

    /// True if the server dropped events between batches
    #[serde(default)]
    pub limited: bool,

    /// Token for back-pagination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// A joined room delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoom {
    /// State events preceding the timeline
    #[serde(default)]
    pub state: RoomEvents,

    /// New timeline events
    #[serde(default)]
    pub timeline: Timeline,
}

/// Stripped state shown with an invite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InviteState {
    /// Stripped state events
    #[serde(default)]
    pub events: Vec<Event>,
}

/// An invited room delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvitedRoom {
    /// Stripped state
    #[serde(default)]
    pub invite_state: InviteState,
}

/// A left room delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeftRoom {
    /// State events preceding the timeline
    #[serde(default)]
    pub state: RoomEvents,

    /// Timeline up to the leave
    #[serde(default)]
    pub timeline: Timeline,
}

/// To-device section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToDevice {
    /// Events in delivery order
    #[serde(default)]
    pub events: Vec<ToDeviceEvent>,
}

/// An event delivered directly to this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    /// Sending user
    pub sender: UserId,

    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Raw content
    #[serde(default)]
    pub content: Value,
}

impl ToDeviceEvent {
    /// View as a room-less [`Event`].
    pub fn into_event(self) -> Event {
        Event::new(self.event_type, self.sender, self.content)
    }
}

/// Device list changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Users whose devices changed
    #[serde(default)]
    pub changed: Vec<UserId>,

    /// Users we no longer share a room with
    #[serde(default)]
    pub left: Vec<UserId>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn minimal_sync_response_decodes() {
        let response: SyncResponse = serde_json::from_value(json!({ "next_batch": "s1" })).unwrap();
        assert_eq!(response.next_batch, "s1");
        assert!(response.rooms.join.is_empty());
        assert!(response.to_device.events.is_empty());
    }

    #[test]
    fn joined_room_timeline_decodes() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s2",
            "rooms": {
                "join": {
                    "!r:x": {
                        "timeline": {
                            "events": [
                                { "type": "m.room.message", "sender": "@a:x", "content": {} }
                            ]
                        }
                    }
                }
            },
            "to_device": {
                "events": [ { "type": "m.room.encrypted", "sender": "@a:x", "content": {} } ]
            }
        }))
        .unwrap();

        let room = response.rooms.join.get(&RoomId::from("!r:x")).unwrap();
        assert_eq!(room.timeline.events.len(), 1);
        assert_eq!(room.timeline.events[0].room_id, None);

        let event = response.to_device.events[0].clone().into_event();
        assert_eq!(event.event_type, "m.room.encrypted");
        assert!(event.room_id.is_none());
    }
}
