// Copyright (c) 2025 - Cowboy AI, Inc.
//! Aggregate Store Abstraction
//!
//! This module defines the compare-and-swap storage contract that serializes
//! all writers of an aggregate, and the document-level collaborator contract a
//! backing technology has to satisfy.
//!
//! # Architecture
//!
//! ```text
//! Processor → AggregateStore → AggregateSerde → DocumentCollection → Storage
//!                  ↑
//!            UpcasterChain (on load)
//! ```
//!
//! # Store Requirements
//!
//! 1. **Snapshot Storage**: one document per identifier, replaced on every write
//! 2. **Compare-and-Swap**: writes succeed only against the expected `sequence`
//! 3. **Insert-if-Absent**: the first write for an identifier fails if a
//!    document already exists
//! 4. **Versioning**: documents are upcast to the current schema on read
//!
//! # Example
//!
//! ```rust,no_run
//! use cim_command_processor::accounts::{account_upcasters, Account};
//! use cim_command_processor::store::{AggregateStore, DocumentStore, InMemoryCollection, JsonSerde};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DocumentStore::<Account, _, _>::new(
//!     InMemoryCollection::new(),
//!     JsonSerde,
//!     account_upcasters()?,
//! )?;
//!
//! let current = store.load(42).await?;
//! assert!(current.is_none());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::Aggregate;
use crate::errors::{StoreError, StoreResult};

pub mod document;
pub mod memory;
pub mod nats;

pub use document::DocumentStore;
pub use memory::InMemoryCollection;
pub use nats::{NatsKvCollection, NatsStoreConfig};

/// Name of the identifier field in every stored document
pub const IDENTIFIER_FIELD: &str = "identifier";

/// Name of the sequence field in every stored document
pub const SEQUENCE_FIELD: &str = "sequence";

/// Compare-and-swap load/store over a single logical collection of aggregates
///
/// This is the only point of mutual exclusion in the system. Implementations
/// must guarantee:
///
/// - **Insert-if-Absent**: `store(-1, ..)` succeeds only if no document exists
/// - **Replace-if-Match**: `store(s, ..)` succeeds only if the stored
///   `sequence` equals `s` at the moment of the atomic compare
/// - **Current Schema**: `load` returns aggregates at [`AggregateStore::max_version`]
#[async_trait]
pub trait AggregateStore<A: Aggregate>: Send + Sync {
    /// Schema version every loaded or stored aggregate carries
    fn max_version(&self) -> i32;

    /// Load the current aggregate for `identifier`
    ///
    /// # Returns
    ///
    /// `None` when no document exists. That is not an error.
    ///
    /// # Errors
    ///
    /// - `StorageCorruption` if the raw document lacks integral structural fields
    /// - `Upcast` if the chain cannot reach the current version
    /// - `ConsistencyViolation` if the result does not match `identifier`
    ///   or the current version
    async fn load(&self, identifier: i64) -> StoreResult<Option<A>>;

    /// Store `aggregate` if the persisted sequence still equals `expected_sequence`
    ///
    /// Pass [`NO_PREVIOUS_SEQUENCE`](crate::domain::NO_PREVIOUS_SEQUENCE) when
    /// no previous version was loaded.
    ///
    /// # Returns
    ///
    /// `false` when another writer got there first. The caller must reload
    /// and recompute.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `expected_sequence < -1`, the aggregate's version
    ///   is not current, or its sequence does not advance past `expected_sequence`
    /// - `StorageCorruption` if the serializer drops a structural field
    async fn store(&self, expected_sequence: i64, aggregate: &A) -> StoreResult<bool>;
}

#[async_trait]
impl<A, S> AggregateStore<A> for Arc<S>
where
    A: Aggregate,
    S: AggregateStore<A> + ?Sized,
{
    fn max_version(&self) -> i32 {
        (**self).max_version()
    }

    async fn load(&self, identifier: i64) -> StoreResult<Option<A>> {
        (**self).load(identifier).await
    }

    async fn store(&self, expected_sequence: i64, aggregate: &A) -> StoreResult<bool> {
        (**self).store(expected_sequence, aggregate).await
    }
}

/// Backing storage contract for raw documents keyed by identifier
///
/// Both write operations must be atomic with respect to each other.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Read the raw document stored for `identifier`
    async fn find(&self, identifier: i64) -> StoreResult<Option<Value>>;

    /// Insert `document` unless a document with `identifier` already exists
    ///
    /// Returns `false` if one exists.
    async fn insert_if_absent(&self, identifier: i64, document: Value) -> StoreResult<bool>;

    /// Replace the document only if both `identifier` and `sequence` match
    ///
    /// Returns `false` if no document matched.
    async fn replace_if_sequence(
        &self,
        identifier: i64,
        expected_sequence: i64,
        document: Value,
    ) -> StoreResult<bool>;
}

#[async_trait]
impl<C: DocumentCollection + ?Sized> DocumentCollection for Arc<C> {
    async fn find(&self, identifier: i64) -> StoreResult<Option<Value>> {
        (**self).find(identifier).await
    }

    async fn insert_if_absent(&self, identifier: i64, document: Value) -> StoreResult<bool> {
        (**self).insert_if_absent(identifier, document).await
    }

    async fn replace_if_sequence(
        &self,
        identifier: i64,
        expected_sequence: i64,
        document: Value,
    ) -> StoreResult<bool> {
        (**self)
            .replace_if_sequence(identifier, expected_sequence, document)
            .await
    }
}

/// Converts aggregates to and from raw documents
///
/// The serializer owns every field except `identifier`, `sequence` and
/// `version`, which it must write as integers.
pub trait AggregateSerde<A>: Send + Sync {
    fn serialize(&self, aggregate: &A) -> StoreResult<Value>;
    fn deserialize(&self, document: Value) -> StoreResult<A>;
}

/// [`AggregateSerde`] for aggregates that derive serde's traits
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerde;

impl<A> AggregateSerde<A> for JsonSerde
where
    A: Serialize + DeserializeOwned,
{
    fn serialize(&self, aggregate: &A) -> StoreResult<Value> {
        Ok(serde_json::to_value(aggregate)?)
    }

    fn deserialize(&self, document: Value) -> StoreResult<A> {
        serde_json::from_value(document).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// The three fields the store itself depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuralFields {
    pub identifier: i64,
    pub sequence: i64,
    pub version: i64,
}

impl StructuralFields {
    /// Read the structural fields, treating anything missing or non-integral
    /// as storage corruption
    pub fn read(document: &Value, origin: &str) -> StoreResult<Self> {
        let field = |name: &str| {
            document.get(name).and_then(Value::as_i64).ok_or_else(|| {
                StoreError::StorageCorruption(format!(
                    "{} has no '{}' property or it is not an integer",
                    origin, name
                ))
            })
        };

        Ok(Self {
            identifier: field(IDENTIFIER_FIELD)?,
            sequence: field(SEQUENCE_FIELD)?,
            version: field(crate::upcasting::VERSION_FIELD)?,
        })
    }
}
