// Copyright (c) 2025 - Cowboy AI, Inc.
//! Document Upcasting
//!
//! Stored aggregate documents keep the schema version they were written with.
//! On read, the store runs each document through an [`UpcasterChain`] until it
//! reaches the store's maximum version, so the application only ever sees the
//! latest shape.
//!
//! # Architecture
//!
//! ```text
//! Collection → Raw JSON → Upcast → Deserialize → Aggregate
//!                           ↓
//!               v0 → v1 → v2 (one step per version)
//! ```
//!
//! Each upcaster is registered under the version it reads and must write a
//! strictly higher `version` into the document it returns. The chain applies
//! the upcaster registered for the document's *current* version, one step at a
//! time, and gives up after `max_version + 1` steps.
//!
//! # Example
//!
//! ```rust
//! use cim_command_processor::upcasting::{set_document_version, FnUpcaster, UpcasterChain};
//! use serde_json::json;
//!
//! let chain = UpcasterChain::new(1)
//!     .with(FnUpcaster::new(0, |mut doc| {
//!         doc["currency"] = json!("EUR");
//!         set_document_version(&mut doc, 1)?;
//!         Ok(doc)
//!     }))
//!     .unwrap();
//!
//! let upcasted = chain
//!     .upcast_to_latest(json!({"identifier": 7, "sequence": 0, "version": 0}))
//!     .unwrap();
//! assert_eq!(upcasted["currency"], "EUR");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::trace;

use crate::errors::ConfigurationError;

/// Name of the structural version field in every stored document
pub const VERSION_FIELD: &str = "version";

/// Error type for upcasting operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpcastError {
    /// No upcaster is registered for a version below the maximum
    MissingUpcaster { version: i32 },

    /// A document declares a version outside `0..=max`
    VersionOutOfRange { version: i64, max: i32 },

    /// The chain took more than `limit` steps without reaching the maximum
    LoopLimitExceeded { limit: i64 },

    /// JSON transformation failed
    TransformationFailed(String),

    /// Missing required field in a document
    MissingField(String),

    /// Invalid field value that cannot be migrated
    InvalidFieldValue { field: String, reason: String },
}

impl fmt::Display for UpcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpcastError::MissingUpcaster { version } => {
                write!(f, "No upcaster registered for version {}", version)
            }
            UpcastError::VersionOutOfRange { version, max } => {
                write!(
                    f,
                    "Document version {} is outside the supported range 0..={}. Please review upcasters configuration.",
                    version, max
                )
            }
            UpcastError::LoopLimitExceeded { limit } => {
                write!(
                    f,
                    "Took more than {} iterations to upcast to the current version. Please review upcasters configuration.",
                    limit
                )
            }
            UpcastError::TransformationFailed(msg) => {
                write!(f, "Document transformation failed: {}", msg)
            }
            UpcastError::MissingField(field) => {
                write!(f, "Required field '{}' missing in document", field)
            }
            UpcastError::InvalidFieldValue { field, reason } => {
                write!(f, "Invalid value in field '{}': {}", field, reason)
            }
        }
    }
}

impl std::error::Error for UpcastError {}

/// Migrates a document from one schema version to the next
///
/// Implementations are pure: they consume the document as produced by the
/// previous step and return the next shape with an incremented `version`.
pub trait Upcaster: Send + Sync {
    /// Version this upcaster expects as input
    fn from_version(&self) -> i32;

    /// Transform the document to the next version
    ///
    /// This method should:
    /// 1. Apply schema transformations (add/remove/rename fields)
    /// 2. Set default values for new fields
    /// 3. Write the incremented `version` field
    fn upcast(&self, document: Value) -> Result<Value, UpcastError>;

    /// Optional: Validate the document produced by [`Upcaster::upcast`]
    fn validate(&self, _document: &Value) -> Result<(), UpcastError> {
        Ok(())
    }
}

/// Upcaster backed by a plain function or closure
pub struct FnUpcaster<F> {
    from_version: i32,
    transform: F,
}

impl<F> FnUpcaster<F>
where
    F: Fn(Value) -> Result<Value, UpcastError> + Send + Sync,
{
    /// Register `transform` as the migration out of `from_version`
    pub fn new(from_version: i32, transform: F) -> Self {
        Self {
            from_version,
            transform,
        }
    }
}

impl<F> Upcaster for FnUpcaster<F>
where
    F: Fn(Value) -> Result<Value, UpcastError> + Send + Sync,
{
    fn from_version(&self) -> i32 {
        self.from_version
    }

    fn upcast(&self, document: Value) -> Result<Value, UpcastError> {
        (self.transform)(document)
    }
}

/// Bounded chain of upcasters, keyed by the version each one reads
pub struct UpcasterChain {
    max_version: i32,
    upcasters: BTreeMap<i32, Box<dyn Upcaster>>,
}

impl UpcasterChain {
    /// Create an empty chain targeting `max_version`
    ///
    /// A chain for version 0 is complete without any upcasters.
    pub fn new(max_version: i32) -> Self {
        Self {
            max_version,
            upcasters: BTreeMap::new(),
        }
    }

    /// Register an upcaster
    ///
    /// Fails if its source version is outside `0..max_version` or if another
    /// upcaster already claims that version.
    pub fn add<U: Upcaster + 'static>(&mut self, upcaster: U) -> Result<(), ConfigurationError> {
        let from = upcaster.from_version();
        if from < 0 || from >= self.max_version {
            return Err(ConfigurationError(format!(
                "Upcaster from version {} is outside 0..{}",
                from, self.max_version
            )));
        }
        if self.upcasters.contains_key(&from) {
            return Err(ConfigurationError(format!(
                "More than one upcaster registered for version {}",
                from
            )));
        }
        self.upcasters.insert(from, Box::new(upcaster));
        Ok(())
    }

    /// Builder form of [`UpcasterChain::add`]
    pub fn with<U: Upcaster + 'static>(mut self, upcaster: U) -> Result<Self, ConfigurationError> {
        self.add(upcaster)?;
        Ok(self)
    }

    /// The version every document leaves the chain at
    pub fn max_version(&self) -> i32 {
        self.max_version
    }

    /// Number of registered upcasters
    pub fn len(&self) -> usize {
        self.upcasters.len()
    }

    /// Whether no upcasters are registered
    pub fn is_empty(&self) -> bool {
        self.upcasters.is_empty()
    }

    /// Maximum number of steps a single upcast may take
    pub fn iteration_limit(&self) -> i64 {
        i64::from(self.max_version) + 1
    }

    /// Check that the chain is complete
    ///
    /// There must be exactly one upcaster per version transition, so the
    /// number of upcasters equals the maximum version.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_version < 0 {
            return Err(ConfigurationError(
                "'maxVersion' must be at least 0".to_string(),
            ));
        }
        if self.upcasters.len() != self.max_version as usize {
            return Err(ConfigurationError(format!(
                "There must be exactly {} upcasters configured, found {}",
                self.max_version,
                self.upcasters.len()
            )));
        }
        Ok(())
    }

    /// Upcast a document to the chain's maximum version
    ///
    /// A document already at the maximum version is returned unchanged.
    pub fn upcast_to_latest(&self, mut document: Value) -> Result<Value, UpcastError> {
        let limit = self.iteration_limit();
        let mut steps = 0;

        while steps < limit {
            let version = document_version(&document)?;
            if version < 0 || version > i64::from(self.max_version) {
                return Err(UpcastError::VersionOutOfRange {
                    version,
                    max: self.max_version,
                });
            }
            let version = version as i32;
            if version == self.max_version {
                return Ok(document);
            }

            let upcaster = self
                .upcasters
                .get(&version)
                .ok_or(UpcastError::MissingUpcaster { version })?;
            document = upcaster.upcast(document)?;
            upcaster.validate(&document)?;
            trace!(from_version = version, "Upcasted document");

            steps += 1;
        }

        Err(UpcastError::LoopLimitExceeded { limit })
    }
}

impl fmt::Debug for UpcasterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcasterChain")
            .field("max_version", &self.max_version)
            .field("from_versions", &self.upcasters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Helper to extract the schema version from a document
pub fn document_version(document: &Value) -> Result<i64, UpcastError> {
    document
        .get(VERSION_FIELD)
        .and_then(Value::as_i64)
        .ok_or_else(|| UpcastError::MissingField(VERSION_FIELD.to_string()))
}

/// Helper to set the schema version in a document
pub fn set_document_version(document: &mut Value, version: i32) -> Result<(), UpcastError> {
    if let Some(obj) = document.as_object_mut() {
        obj.insert(VERSION_FIELD.to_string(), serde_json::json!(version));
        Ok(())
    } else {
        Err(UpcastError::TransformationFailed(
            "Document is not a JSON object".to_string(),
        ))
    }
}
