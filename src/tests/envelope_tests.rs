// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::command::CommandEnvelope;
use crate::entry::Entry;
use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Post {
    key: String,
    id: u64,
}

#[test]
fn test_envelope_wire_shape() {
    let env = CommandEnvelope::new("post", json!({"key": "k", "id": 7})).with_replica(2);
    let bytes = env.to_bytes().unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(raw["command"], "post");
    assert_eq!(raw["value"]["id"], 7);
    assert_eq!(raw["replica_id"], 2);
}

#[test]
fn test_envelope_omits_missing_replica() {
    let env = CommandEnvelope::new("post", json!(null));
    let text = String::from_utf8(env.to_bytes().unwrap()).unwrap();
    assert!(!text.contains("replica_id"));

    // And decodes without it.
    let back = CommandEnvelope::from_bytes(br#"{"command":"post","value":{}}"#).unwrap();
    assert_eq!(back.replica_id, None);
}

#[test]
fn test_malformed_bytes_rejected() {
    let err = CommandEnvelope::from_bytes(b"{not json").unwrap_err();
    assert!(matches!(err, KernelError::MalformedEnvelope(_)));
}

#[test]
fn test_entry_decodes_typed_payload() {
    let env = CommandEnvelope::encode("post", &Post { key: "a".into(), id: 1 }).unwrap();
    let entry = Entry::from_envelope(42, env);

    assert_eq!(entry.index, 42);
    assert_eq!(entry.decode_value::<Post>().unwrap(), Post { key: "a".into(), id: 1 });
}

#[test]
fn test_entry_payload_mismatch() {
    let entry = Entry::from_envelope(1, CommandEnvelope::new("post", json!("oops")));
    match entry.decode_value::<Post>() {
        Err(KernelError::InvalidPayload { command, .. }) => assert_eq!(command, "post"),
        other => panic!("unexpected: {:?}", other),
    }
}
