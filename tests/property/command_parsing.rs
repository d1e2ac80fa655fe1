// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for JSON Command Validation

use proptest::prelude::*;
use serde_json::{json, Value};

use cim_command_processor::protocol::parse_command;

/// Domain fields that never collide with the command header
fn body() -> impl Strategy<Value = serde_json::Map<String, Value>> {
    prop::collection::btree_map("[a-h]{1,8}", any::<i64>(), 0..6).prop_map(|fields| {
        fields
            .into_iter()
            .map(|(name, value)| (format!("x_{}", name), json!(value)))
            .collect()
    })
}

proptest! {
    /// Property: any integer header round-trips into the command
    #[test]
    fn prop_valid_header_is_accepted(intent in any::<i64>(), identifier in any::<i64>(), fields in body()) {
        let mut input = json!({
            "intent": intent,
            "timestamp": "2026-01-19T12:00:00Z",
            "identifier": identifier,
        });
        input.as_object_mut().unwrap().extend(fields.clone());

        let command = parse_command(input).unwrap();
        prop_assert_eq!(command.intent, intent);
        prop_assert_eq!(command.identifier, identifier);
        prop_assert_eq!(command.body, fields);
    }

    /// Property: once the intent is readable, every later failure echoes it
    #[test]
    fn prop_failures_after_intent_echo_it(intent in any::<i64>(), timestamp in "[a-z ]{0,12}") {
        let failure = parse_command(json!({
            "intent": intent,
            "timestamp": timestamp,
            "identifier": 1,
        }))
        .unwrap_err();

        prop_assert_eq!(failure.code.as_str(), "INVALID_TIMESTAMP");
        prop_assert_eq!(failure.intent, Some(intent));
    }
}
