// Copyright (c) 2025 - Cowboy AI, Inc.
// In memory implementation of the DocumentCollection contract.
//
// Purpose
// - Support processor tests and local development without a database.
//
// Responsibilities
// - Keep one raw document per identifier.
// - Make insert-if-absent and replace-if-sequence atomic by holding the write
//   lock across the compare and the write.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::StoreResult;
use crate::store::{DocumentCollection, SEQUENCE_FIELD};

#[derive(Debug, Default)]
pub struct InMemoryCollection {
    inner: RwLock<HashMap<i64, Value>>,
}

impl InMemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentCollection for InMemoryCollection {
    async fn find(&self, identifier: i64) -> StoreResult<Option<Value>> {
        Ok(self.inner.read().await.get(&identifier).cloned())
    }

    async fn insert_if_absent(&self, identifier: i64, document: Value) -> StoreResult<bool> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&identifier) {
            return Ok(false);
        }
        guard.insert(identifier, document);
        Ok(true)
    }

    async fn replace_if_sequence(
        &self,
        identifier: i64,
        expected_sequence: i64,
        document: Value,
    ) -> StoreResult<bool> {
        let mut guard = self.inner.write().await;
        match guard.get_mut(&identifier) {
            Some(current)
                if current.get(SEQUENCE_FIELD).and_then(Value::as_i64) == Some(expected_sequence) =>
            {
                *current = document;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
