// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Compare-and-Swap Sequencing and Upcasting
//!
//! Every successful store advances `sequence`, loads are repeatable, and the
//! upcasting chain leaves current documents untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

use cim_command_processor::accounts::{account_upcasters, Account, AccountHandler, ACCOUNT_VERSION};
use cim_command_processor::domain::{Aggregate, Command};
use cim_command_processor::processor::{execute, RetryPolicy};
use cim_command_processor::store::{AggregateStore, DocumentCollection, DocumentStore, InMemoryCollection, JsonSerde};

// ============================================================================
// Helpers
// ============================================================================

type AccountStore = DocumentStore<Account, Arc<InMemoryCollection>, JsonSerde>;

fn fixed_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-19T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn account_store() -> (AccountStore, Arc<InMemoryCollection>) {
    let collection = Arc::new(InMemoryCollection::new());
    let store = DocumentStore::new(collection.clone(), JsonSerde, account_upcasters().unwrap()).unwrap();
    (store, collection)
}

fn command(intent: i64, operation: Value) -> Command {
    let mut command = Command::new(intent, fixed_timestamp(), 1);
    if let Value::Object(body) = operation {
        command.body = body;
    }
    command
}

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Deposits and withdrawals; some withdrawals are expected to fail
fn operation() -> impl Strategy<Value = Value> {
    prop_oneof![
        (1i64..1_000).prop_map(|amount| json!({"operation": "deposit", "amount": amount})),
        (1i64..1_000).prop_map(|amount| json!({"operation": "withdraw", "amount": amount})),
    ]
}

/// A version 0 account document as an older writer would have stored it
fn v0_document() -> impl Strategy<Value = Value> {
    (any::<i64>(), 0i64..10_000, any::<i64>()).prop_map(|(identifier, sequence, balance)| {
        json!({
            "identifier": identifier,
            "sequence": sequence,
            "version": 0,
            "balance": balance,
        })
    })
}

/// A current account document
fn v1_document() -> impl Strategy<Value = Value> {
    (v0_document(), "[A-Z]{3}").prop_map(|(mut document, currency)| {
        document["version"] = json!(ACCOUNT_VERSION);
        document["currency"] = json!(currency);
        document
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: successful stores strictly increase the sequence
    ///
    /// The stored sequence after n successful commands is exactly n, and
    /// rejected commands leave it unchanged.
    #[test]
    fn prop_sequence_strictly_increases(operations in prop::collection::vec(operation(), 1..30)) {
        let (store, _) = account_store();

        tokio_test::block_on(async {
            execute::<Account>(&store, &AccountHandler, &command(0, json!({"operation": "open"})), RetryPolicy::Unbounded)
                .await
                .unwrap();

            let mut last = 0;
            let mut successes = 0;
            for (intent, operation) in operations.into_iter().enumerate() {
                let outcome = execute::<Account>(
                    &store,
                    &AccountHandler,
                    &command(intent as i64 + 1, operation),
                    RetryPolicy::Unbounded,
                )
                .await;

                let stored = store.load(1).await.unwrap().unwrap();
                match outcome {
                    Ok(processed) => {
                        successes += 1;
                        prop_assert!(processed.aggregate.sequence() > last);
                        prop_assert_eq!(stored.sequence, processed.aggregate.sequence);
                    }
                    Err(_) => {
                        prop_assert_eq!(stored.sequence, last);
                    }
                }
                last = stored.sequence;
                prop_assert!(stored.balance >= 0);
            }

            prop_assert_eq!(last, successes);
            Ok(())
        })?;
    }

    /// Property: loading is repeatable and always yields the current version
    #[test]
    fn prop_load_is_idempotent(document in v0_document()) {
        let (store, collection) = account_store();
        let identifier = document["identifier"].as_i64().unwrap();

        tokio_test::block_on(async {
            collection.insert_if_absent(identifier, document.clone()).await.unwrap();

            let first = store.load(identifier).await.unwrap().unwrap();
            let second = store.load(identifier).await.unwrap().unwrap();

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.version, ACCOUNT_VERSION);
            prop_assert_eq!(first.currency.as_str(), "EUR");
            prop_assert_eq!(Some(first.balance), document["balance"].as_i64());

            // Loading never rewrites the stored document
            prop_assert_eq!(collection.find(identifier).await.unwrap(), Some(document));
            Ok(())
        })?;
    }

    /// Property: upcasting a current document is the identity
    #[test]
    fn prop_upcast_at_max_version_is_noop(document in v1_document()) {
        let chain = account_upcasters().unwrap();
        let upcasted = chain.upcast_to_latest(document.clone()).unwrap();
        prop_assert_eq!(upcasted, document);
    }
}
