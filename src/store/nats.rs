// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS JetStream Key-Value Collection
//!
//! Implements [`DocumentCollection`] on a JetStream key-value bucket. Each
//! aggregate is one key (its identifier); the bucket's per-key revision makes
//! both writes atomic:
//!
//! - insert-if-absent maps to `update` pinned to revision 0, which fails if
//!   the key holds a value
//! - replace-if-sequence reads the entry, compares the document's `sequence`,
//!   then writes with `update` pinned to the revision that was read
//!
//! A write rejected because the revision moved means another writer won.

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{StoreError, StoreResult};
use crate::store::{DocumentCollection, SEQUENCE_FIELD};

/// Configuration for the NATS-backed collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsStoreConfig {
    /// NATS server URL
    pub url: String,
    /// Key-value bucket holding one document per aggregate
    pub bucket: String,
}

impl Default for NatsStoreConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            bucket: "aggregates".to_string(),
        }
    }
}

/// Aggregate documents stored in a JetStream key-value bucket
pub struct NatsKvCollection {
    kv: kv::Store,
}

impl NatsKvCollection {
    /// Connect to NATS and open (or create) the configured bucket
    pub async fn connect(config: &NatsStoreConfig) -> StoreResult<Self> {
        let client = async_nats::connect(config.url.as_str())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let jetstream = jetstream::new(client);

        let kv = match jetstream.get_key_value(config.bucket.as_str()).await {
            Ok(kv) => kv,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: config.bucket.clone(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?,
        };

        info!("Opened key-value bucket {} at {}", config.bucket, config.url);
        Ok(Self { kv })
    }

    /// Wrap an already opened bucket
    pub fn from_store(kv: kv::Store) -> Self {
        Self { kv }
    }

    fn key(identifier: i64) -> String {
        identifier.to_string()
    }

    /// Latest entry for `key` unless it was deleted or purged
    async fn live_entry(&self, key: &str) -> StoreResult<Option<kv::Entry>> {
        let entry = self
            .kv
            .entry(key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(entry.filter(|e| matches!(e.operation, kv::Operation::Put)))
    }

    /// Revision of the current entry, whatever its operation
    async fn current_revision(&self, key: &str) -> StoreResult<Option<u64>> {
        let entry = self
            .kv
            .entry(key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(entry.map(|e| e.revision))
    }
}

#[async_trait]
impl DocumentCollection for NatsKvCollection {
    async fn find(&self, identifier: i64) -> StoreResult<Option<Value>> {
        let key = Self::key(identifier);
        match self.live_entry(&key).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    async fn insert_if_absent(&self, identifier: i64, document: Value) -> StoreResult<bool> {
        let key = Self::key(identifier);
        let payload = serde_json::to_vec(&document)?;

        // Expected revision 0 only matches a key that was never written
        match self.kv.update(key.as_str(), payload.into(), 0).await {
            Ok(revision) => {
                debug!(identifier, revision, "Created aggregate document");
                Ok(true)
            }
            Err(e) => {
                // The update fails when the key already holds a value
                if self.live_entry(&key).await?.is_some() {
                    Ok(false)
                } else {
                    Err(StoreError::Backend(e.to_string()))
                }
            }
        }
    }

    async fn replace_if_sequence(
        &self,
        identifier: i64,
        expected_sequence: i64,
        document: Value,
    ) -> StoreResult<bool> {
        let key = Self::key(identifier);
        let Some(entry) = self.live_entry(&key).await? else {
            return Ok(false);
        };

        let current: Value = serde_json::from_slice(&entry.value)?;
        if current.get(SEQUENCE_FIELD).and_then(Value::as_i64) != Some(expected_sequence) {
            return Ok(false);
        }

        let payload = serde_json::to_vec(&document)?;
        match self
            .kv
            .update(key.as_str(), payload.into(), entry.revision)
            .await
        {
            Ok(revision) => {
                debug!(identifier, revision, "Replaced aggregate document");
                Ok(true)
            }
            Err(e) => match self.current_revision(&key).await? {
                Some(latest) if latest != entry.revision => Ok(false),
                _ => Err(StoreError::Backend(e.to_string())),
            },
        }
    }
}
