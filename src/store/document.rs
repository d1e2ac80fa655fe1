// Copyright (c) 2025 - Cowboy AI, Inc.
//! Versioned Document Store
//!
//! [`DocumentStore`] implements [`AggregateStore`] on top of any
//! [`DocumentCollection`]: it validates store preconditions, checks the
//! structural fields of every document crossing the boundary, upcasts on
//! load, and maps the collection's atomic insert/replace outcomes onto the
//! compare-and-swap contract.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{Aggregate, NO_PREVIOUS_SEQUENCE};
use crate::errors::{ConfigurationError, StoreError, StoreResult};
use crate::store::{AggregateSerde, AggregateStore, DocumentCollection, StructuralFields};
use crate::upcasting::UpcasterChain;

/// Compare-and-swap aggregate store over a raw document collection
pub struct DocumentStore<A, C, S> {
    collection: C,
    serde: S,
    upcasters: UpcasterChain,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, C, S> DocumentStore<A, C, S>
where
    A: Aggregate,
    C: DocumentCollection,
    S: AggregateSerde<A>,
{
    /// Create a store whose maximum version is the chain's maximum version
    ///
    /// # Errors
    ///
    /// `ConfigurationError` if the maximum version is negative or the chain
    /// does not hold exactly one upcaster per version below it.
    pub fn new(collection: C, serde: S, upcasters: UpcasterChain) -> Result<Self, ConfigurationError> {
        upcasters.validate()?;
        Ok(Self {
            collection,
            serde,
            upcasters,
            _aggregate: PhantomData,
        })
    }

    /// The backing collection
    pub fn collection(&self) -> &C {
        &self.collection
    }
}

impl<A, C, S> fmt::Debug for DocumentStore<A, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("upcasters", &self.upcasters)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<A, C, S> AggregateStore<A> for DocumentStore<A, C, S>
where
    A: Aggregate,
    C: DocumentCollection,
    S: AggregateSerde<A>,
{
    fn max_version(&self) -> i32 {
        self.upcasters.max_version()
    }

    async fn load(&self, identifier: i64) -> StoreResult<Option<A>> {
        let Some(raw) = self.collection.find(identifier).await? else {
            return Ok(None);
        };

        let max_version = self.max_version();
        let fields = StructuralFields::read(&raw, "Loaded document")?;
        if fields.version < 0 || fields.version > i64::from(max_version) {
            return Err(StoreError::StorageCorruption(format!(
                "Loaded document 'version' ({}) must be at least 0 and at most {}",
                fields.version, max_version
            )));
        }

        let upcasted = self.upcasters.upcast_to_latest(raw)?;
        let aggregate = self.serde.deserialize(upcasted)?;

        if aggregate.identifier() != identifier {
            return Err(StoreError::ConsistencyViolation(format!(
                "Loaded aggregate has identifier {} but {} was requested",
                aggregate.identifier(),
                identifier
            )));
        }
        if aggregate.sequence() < NO_PREVIOUS_SEQUENCE {
            return Err(StoreError::ConsistencyViolation(format!(
                "Loaded aggregate 'sequence' ({}) must be at least {}",
                aggregate.sequence(),
                NO_PREVIOUS_SEQUENCE
            )));
        }
        if aggregate.version() != max_version {
            return Err(StoreError::ConsistencyViolation(format!(
                "Loaded aggregate 'version' ({}) must equal the store's max version ({})",
                aggregate.version(),
                max_version
            )));
        }

        debug!(
            identifier,
            sequence = aggregate.sequence(),
            stored_version = fields.version,
            "Loaded aggregate"
        );
        Ok(Some(aggregate))
    }

    async fn store(&self, expected_sequence: i64, aggregate: &A) -> StoreResult<bool> {
        if expected_sequence < NO_PREVIOUS_SEQUENCE {
            return Err(StoreError::InvalidArgument(format!(
                "'expectedSequence' must be at least {}",
                NO_PREVIOUS_SEQUENCE
            )));
        }
        if aggregate.version() != self.max_version() {
            return Err(StoreError::InvalidArgument(format!(
                "Cannot store an arbitrary version of the aggregate. 'aggregate.version' ({}) must match this store's version ({})",
                aggregate.version(),
                self.max_version()
            )));
        }
        if aggregate.sequence() <= expected_sequence {
            return Err(StoreError::InvalidArgument(format!(
                "'aggregate.sequence' ({}) must be larger than 'expectedSequence' ({})",
                aggregate.sequence(),
                expected_sequence
            )));
        }

        let document = self.serde.serialize(aggregate)?;
        let fields = StructuralFields::read(&document, "Serialized document")?;
        if fields.identifier != aggregate.identifier() {
            return Err(StoreError::StorageCorruption(format!(
                "Serializer wrote identifier {} for aggregate {}. Please review serde configuration.",
                fields.identifier,
                aggregate.identifier()
            )));
        }

        let identifier = aggregate.identifier();
        let stored = if expected_sequence == NO_PREVIOUS_SEQUENCE {
            self.collection.insert_if_absent(identifier, document).await?
        } else {
            self.collection
                .replace_if_sequence(identifier, expected_sequence, document)
                .await?
        };

        if stored {
            debug!(identifier, sequence = aggregate.sequence(), "Stored aggregate");
        } else {
            debug!(identifier, expected_sequence, "Compare-and-swap lost the race");
        }
        Ok(stored)
    }
}
