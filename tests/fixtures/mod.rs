// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-command-processor
//!
//! Provides deterministic accounts, commands and stores for integration tests.
//! All timestamps are fixed constants so results are reproducible.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use cim_command_processor::accounts::{account_upcasters, Account, ACCOUNT_VERSION};
use cim_command_processor::domain::Command;
use cim_command_processor::store::{DocumentStore, InMemoryCollection, JsonSerde};

// Fixed test timestamp (2026-01-19T12:00:00Z)
pub const FIXED_TIMESTAMP: &str = "2026-01-19T12:00:00Z";

pub type AccountStore = DocumentStore<Account, Arc<InMemoryCollection>, JsonSerde>;

/// Parse the fixed timestamp
pub fn fixed_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(FIXED_TIMESTAMP)
        .expect("Invalid timestamp in test fixture")
        .with_timezone(&Utc)
}

/// In-memory account store and a handle on its raw collection
pub fn account_store() -> (Arc<AccountStore>, Arc<InMemoryCollection>) {
    let collection = Arc::new(InMemoryCollection::new());
    let store = DocumentStore::new(
        collection.clone(),
        JsonSerde,
        account_upcasters().expect("Invalid account upcasters"),
    )
    .expect("Invalid account store");
    (Arc::new(store), collection)
}

/// An open EUR account at the given sequence
pub fn account_fixture(identifier: i64, sequence: i64, balance: i64) -> Account {
    Account {
        identifier,
        sequence,
        version: ACCOUNT_VERSION,
        updated_on: fixed_timestamp(),
        currency: "EUR".to_string(),
        balance,
    }
}

pub fn open_command(intent: i64, identifier: i64) -> Command {
    Command::new(intent, fixed_timestamp(), identifier).with_field("operation", json!("open"))
}

pub fn deposit_command(intent: i64, identifier: i64, amount: i64) -> Command {
    Command::new(intent, fixed_timestamp(), identifier)
        .with_field("operation", json!("deposit"))
        .with_field("amount", json!(amount))
}

/// Wire form of a command
pub fn command_json(intent: i64, identifier: i64, body: Value) -> String {
    let mut json = json!({
        "intent": intent,
        "timestamp": FIXED_TIMESTAMP,
        "identifier": identifier,
    });
    if let (Some(fields), Value::Object(body)) = (json.as_object_mut(), body) {
        fields.extend(body);
    }
    json.to_string()
}
