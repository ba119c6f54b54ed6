//! Fuzz target for wire decoding
//!
//! Feeds arbitrary bytes through every JSON entry point a homeserver can
//! reach: sync batches, encrypted envelopes, and the typed contents the
//! pipeline reads out of events.
//!
//! The decoders should NEVER panic. Invalid input must surface as an error.

#![no_main]

use keyward_proto::{
    Algorithm, EncryptedContent, EncryptionContent, Event, MemberContent, Membership,
    OlmMessageType, RoomKeyContent, SyncResponse,
};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = text.parse::<Algorithm>();
        let _ = text.parse::<Membership>();
    }

    let _ = serde_json::from_slice::<SyncResponse>(data);

    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    if let Ok(content) = EncryptedContent::parse(&value) {
        // A parsed envelope must re-encode
        let encoded = content.to_value();
        assert!(encoded.is_ok(), "parsed envelope failed to encode: {encoded:?}");
        let _ = content.sender_key();
        let _ = content.algorithm();
    }

    if let Some(kind) = value.as_u64() {
        let _ = OlmMessageType::from_u64(kind);
    }

    let event = Event::new("m.fuzz", "@fuzz:sim".into(), value);
    if let Ok(content) = event.content_as::<EncryptionContent>() {
        let _ = content.algorithm();
    }
    let _ = event.content_as::<MemberContent>();
    let _ = event.content_as::<RoomKeyContent>();
});
