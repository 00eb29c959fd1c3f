//! Fuzz target for wire message parsing
//!
//! Arbitrary frame lists must either parse or be rejected with an error. A
//! message that parses and verifies must still verify after a re-serialize.

#![no_main]

use arbitrary::Arbitrary;
use beaker_jupyter::wire::{SigningKey, WireMessage, MSG_DELIMITER};
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    identities: Vec<Vec<u8>>,
    /// Whether to place a delimiter between identities and the rest
    delimited: bool,
    rest: Vec<Vec<u8>>,
    key: Option<Vec<u8>>,
    /// Sign the frames before parsing so the verify path is reached
    sign: bool,
}

fuzz_target!(|input: FuzzInput| {
    let mut frames: Vec<Bytes> = input.identities.into_iter().map(Bytes::from).collect();
    if input.delimited {
        frames.push(Bytes::from_static(MSG_DELIMITER));
    }
    frames.extend(input.rest.into_iter().map(Bytes::from));

    let key = input.key.map(SigningKey::new);

    if input.sign {
        if let (Some(key), Ok(msg)) = (&key, WireMessage::parse(frames.clone(), None)) {
            if let Ok(signed) = msg.sign(key) {
                if let Ok(frames) = signed.serialize() {
                    let parsed = WireMessage::parse(frames, Some(key));
                    assert!(parsed.is_ok(), "signed message failed to verify");
                }
            }
        }
        return;
    }

    if let Ok(msg) = WireMessage::parse(frames, key.as_ref()) {
        let _ = msg.header();
        let _ = msg.parent_msg_id();
        if let (Some(key), Ok(frames)) = (&key, msg.serialize()) {
            assert!(WireMessage::parse(frames, Some(key)).is_ok());
        }
    }
});
