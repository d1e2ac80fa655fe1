// Copyright (c) 2025 - Cowboy AI, Inc.
//! Integration tests for command processing against a shared store
//!
//! These tests verify the complete flow:
//! 1. Submit command → worker loads aggregate
//! 2. Handler computes next aggregate
//! 3. Compare-and-swap store, retrying lost races

mod fixtures;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};

use cim_command_processor::accounts::{Account, AccountHandler, ACCOUNT_VERSION};
use cim_command_processor::domain::{Command, CommandResult, FailureResult, Handler};
use cim_command_processor::errors::{StoreError, StoreResult, SubmitError};
use cim_command_processor::processor::{CommandProcessor, ProcessorConfig, RetryPolicy};
use cim_command_processor::store::{AggregateStore, DocumentCollection};

use fixtures::*;

/// Holds every load until the test releases it
struct GatedStore {
    inner: Arc<dyn AggregateStore<Account>>,
    gate: Semaphore,
    entered: Notify,
}

#[async_trait]
impl AggregateStore<Account> for GatedStore {
    fn max_version(&self) -> i32 {
        self.inner.max_version()
    }

    async fn load(&self, identifier: i64) -> StoreResult<Option<Account>> {
        self.entered.notify_one();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.inner.load(identifier).await
    }

    async fn store(&self, expected_sequence: i64, aggregate: &Account) -> StoreResult<bool> {
        self.inner.store(expected_sequence, aggregate).await
    }
}

/// Records the expected sequence of every store call
struct RecordingStore {
    inner: Arc<dyn AggregateStore<Account>>,
    expected: Mutex<Vec<i64>>,
}

#[async_trait]
impl AggregateStore<Account> for RecordingStore {
    fn max_version(&self) -> i32 {
        self.inner.max_version()
    }

    async fn load(&self, identifier: i64) -> StoreResult<Option<Account>> {
        self.inner.load(identifier).await
    }

    async fn store(&self, expected_sequence: i64, aggregate: &Account) -> StoreResult<bool> {
        self.expected.lock().unwrap().push(expected_sequence);
        self.inner.store(expected_sequence, aggregate).await
    }
}

/// Lets the first `parties` loads return only once all of them have read
struct RendezvousStore {
    inner: Arc<dyn AggregateStore<Account>>,
    barrier: tokio::sync::Barrier,
    parties: usize,
    loads: AtomicUsize,
}

#[async_trait]
impl AggregateStore<Account> for RendezvousStore {
    fn max_version(&self) -> i32 {
        self.inner.max_version()
    }

    async fn load(&self, identifier: i64) -> StoreResult<Option<Account>> {
        let loaded = self.inner.load(identifier).await?;
        if self.loads.fetch_add(1, Ordering::SeqCst) < self.parties {
            self.barrier.wait().await;
        }
        Ok(loaded)
    }

    async fn store(&self, expected_sequence: i64, aggregate: &Account) -> StoreResult<bool> {
        self.inner.store(expected_sequence, aggregate).await
    }
}

/// Test: W commands racing on one identifier all land, one after another
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_serialize_through_cas() {
    const WRITERS: usize = 4;

    let (inner, _) = account_store();
    let start = 10;
    assert!(inner.store(-1, &account_fixture(1, start, 0)).await.unwrap());

    // Every writer's first attempt computes against the same loaded sequence
    let store = Arc::new(RendezvousStore {
        inner,
        barrier: tokio::sync::Barrier::new(WRITERS),
        parties: WRITERS,
        loads: AtomicUsize::new(0),
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = {
        let calls = calls.clone();
        move |previous: Option<&Account>, command: &Command| -> anyhow::Result<Account> {
            calls.fetch_add(1, Ordering::SeqCst);
            AccountHandler.handle(previous, command)
        }
    };

    let processor = CommandProcessor::<Account>::new(
        store.clone(),
        counted,
        ProcessorConfig::default()
            .with_min_workers(WRITERS)
            .with_max_workers(WRITERS),
    )
    .unwrap();

    let pending: Vec<_> = (0..WRITERS as i64)
        .map(|intent| processor.submit_async(deposit_command(intent, 1, 1)).unwrap())
        .collect();

    let mut sequences = Vec::new();
    for receiver in pending {
        match receiver.await.unwrap() {
            CommandResult::Success(success) => sequences.push(success.aggregate.sequence),
            CommandResult::Failure(failure) => panic!("unexpected failure: {:?}", failure),
        }
    }
    sequences.sort_unstable();

    let expected: Vec<i64> = (1..=WRITERS as i64).map(|n| start + n).collect();
    assert_eq!(sequences, expected);

    let stored = store.load(1).await.unwrap().unwrap();
    assert_eq!(stored.sequence, start + WRITERS as i64);
    assert_eq!(stored.balance, WRITERS as i64);

    // One winner on the first round; every other writer lost at least once
    assert!(calls.load(Ordering::SeqCst) >= 2 * WRITERS - 1);
}

/// Test: a full backlog rejects at the call site
#[tokio::test]
async fn test_full_backlog_rejects_synchronously() {
    let (inner, _) = account_store();
    let gated = Arc::new(GatedStore {
        inner,
        gate: Semaphore::new(0),
        entered: Notify::new(),
    });

    let processor = CommandProcessor::<Account>::new(
        gated.clone(),
        AccountHandler,
        ProcessorConfig::default()
            .with_min_workers(1)
            .with_max_workers(1)
            .with_queue_capacity(2),
    )
    .unwrap();

    // The only worker picks up the first command and blocks in load
    let first = processor.submit_async(open_command(1, 5)).unwrap();
    gated.entered.notified().await;

    let second = processor.submit_async(deposit_command(2, 5, 10)).unwrap();
    let third = processor.submit_async(deposit_command(3, 5, 10)).unwrap();
    assert_eq!(processor.queued(), 2);

    let rejected = processor.submit_async(deposit_command(4, 5, 10)).unwrap_err();
    assert_eq!(rejected, SubmitError::Rejected { capacity: 2 });

    gated.gate.add_permits(3);
    assert!(first.await.unwrap().is_success());
    assert!(second.await.unwrap().is_success());
    assert!(third.await.unwrap().is_success());

    let account = gated.load(5).await.unwrap().unwrap();
    assert_eq!(account.balance, 20);
}

/// Test: rejected callback submissions invoke neither callback
#[tokio::test]
async fn test_rejected_submission_skips_callbacks() {
    let (inner, _) = account_store();
    let gated = Arc::new(GatedStore {
        inner,
        gate: Semaphore::new(0),
        entered: Notify::new(),
    });
    let processor = CommandProcessor::<Account>::new(
        gated.clone(),
        AccountHandler,
        ProcessorConfig::default()
            .with_max_workers(1)
            .with_queue_capacity(1),
    )
    .unwrap();

    let _running = processor.submit_async(open_command(1, 5)).unwrap();
    gated.entered.notified().await;
    let _queued = processor.submit_async(open_command(2, 6)).unwrap();

    let invoked = Arc::new(AtomicUsize::new(0));
    let (on_success, on_error) = (invoked.clone(), invoked.clone());
    let submitted = processor.submit(
        open_command(3, 7),
        move |_| {
            on_success.fetch_add(1, Ordering::SeqCst);
        },
        move |_| {
            on_error.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(matches!(submitted, Err(SubmitError::Rejected { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    gated.gate.add_permits(2);
}

/// Test: a persisted v0 account loads as v1 with the default currency
#[tokio::test]
async fn test_old_account_is_upcast_on_load() {
    let (store, collection) = account_store();
    collection
        .insert_if_absent(
            7,
            json!({"identifier": 7, "sequence": 0, "version": 0, "balance": 100}),
        )
        .await
        .unwrap();

    let account = store.load(7).await.unwrap().unwrap();
    assert_eq!(account.identifier, 7);
    assert_eq!(account.sequence, 0);
    assert_eq!(account.version, ACCOUNT_VERSION);
    assert_eq!(account.balance, 100);
    assert_eq!(account.currency, "EUR");

    // The stored document is left as it was until the next write
    assert_eq!(collection.find(7).await.unwrap().unwrap()["version"], json!(0));
}

/// Test: an upcast account can be written back at the current version
#[tokio::test]
async fn test_command_against_old_account_rewrites_current_version() {
    let (store, collection) = account_store();
    collection
        .insert_if_absent(
            7,
            json!({"identifier": 7, "sequence": 0, "version": 0, "balance": 100}),
        )
        .await
        .unwrap();

    let processor =
        CommandProcessor::<Account>::new(store.clone(), AccountHandler, ProcessorConfig::default()).unwrap();
    let result = processor
        .submit_async(deposit_command(1, 7, 5))
        .unwrap()
        .await
        .unwrap();
    assert!(result.is_success());

    let raw = collection.find(7).await.unwrap().unwrap();
    assert_eq!(raw["version"], json!(ACCOUNT_VERSION));
    assert_eq!(raw["currency"], json!("EUR"));
    assert_eq!(raw["balance"], json!(105));
    assert_eq!(raw["sequence"], json!(1));
}

/// Test: the first command for an identifier inserts with the sentinel
#[tokio::test]
async fn test_first_command_inserts_at_sequence_zero() {
    let (inner, _) = account_store();
    let recording = Arc::new(RecordingStore {
        inner,
        expected: Mutex::new(Vec::new()),
    });
    let processor =
        CommandProcessor::<Account>::new(recording.clone(), AccountHandler, ProcessorConfig::default())
            .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    processor
        .submit(
            open_command(77, 42),
            move |success| {
                let _ = tx.send(success);
            },
            |failure| panic!("unexpected failure: {:?}", failure),
        )
        .unwrap();

    let success = rx.await.unwrap();
    assert_eq!(success.intent, 77);
    assert_eq!(success.aggregate, account_fixture(42, 0, 0));
    assert_eq!(recording.expected.lock().unwrap().clone(), vec![-1]);
}

/// Test: a capped retry policy gives up as UNKNOWN under contention
#[tokio::test]
async fn test_retry_cap_reports_unknown() {
    struct AlwaysStale;

    #[async_trait]
    impl AggregateStore<Account> for AlwaysStale {
        fn max_version(&self) -> i32 {
            ACCOUNT_VERSION
        }

        async fn load(&self, identifier: i64) -> StoreResult<Option<Account>> {
            Ok(Some(account_fixture(identifier, 3, 0)))
        }

        async fn store(&self, _expected: i64, _aggregate: &Account) -> StoreResult<bool> {
            Ok(false)
        }
    }

    let processor = CommandProcessor::<Account>::new(
        Arc::new(AlwaysStale),
        AccountHandler,
        ProcessorConfig::default().with_retry_policy(RetryPolicy::Limited(5)),
    )
    .unwrap();

    let result = processor
        .submit_async(deposit_command(12, 1, 1))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, CommandResult::Failure(FailureResult::unknown(12)));
}

/// Test: idle workers above the minimum are reclaimed
#[tokio::test]
async fn test_idle_workers_are_reclaimed() {
    let (store, _) = account_store();
    let processor = CommandProcessor::<Account>::new(
        store,
        AccountHandler,
        ProcessorConfig::default()
            .with_min_workers(1)
            .with_max_workers(4)
            .with_idle_timeout(std::time::Duration::from_millis(50)),
    )
    .unwrap();

    let pending: Vec<_> = (0..8)
        .map(|i| processor.submit_async(open_command(i, 100 + i)).unwrap())
        .collect();
    for receiver in pending {
        assert!(receiver.await.unwrap().is_success());
    }
    assert!(processor.worker_count() <= 4);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(processor.worker_count(), 1);
}
