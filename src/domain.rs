// Copyright (c) 2025 - Cowboy AI, Inc.
//! Domain Contracts
//!
//! Value types that flow through the processor: aggregates, commands and
//! results, plus the [`Handler`] seam where business logic plugs in.
//!
//! Aggregates are values. A handler never mutates the previous aggregate; it
//! returns a fresh one with an advanced `sequence`.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Sequence passed to a store when no previous version exists
pub const NO_PREVIOUS_SEQUENCE: i64 = -1;

/// Current snapshot of a domain entity
///
/// `sequence` is the compare-and-swap token: it strictly increases with every
/// successful store for the same `identifier`. `version` is the schema
/// version and always equals the store's maximum version outside the
/// upcasting chain.
pub trait Aggregate: Clone + Send + Sync + 'static {
    fn identifier(&self) -> i64;
    fn sequence(&self) -> i64;
    fn version(&self) -> i32;
    fn updated_on(&self) -> DateTime<Utc>;
}

/// Inbound request against one aggregate
///
/// `intent` is an opaque correlation id chosen by the caller and echoed back
/// in the result. Domain fields travel in `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub intent: i64,
    pub timestamp: DateTime<Utc>,
    pub identifier: i64,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Command {
    /// Create a command with an empty body
    pub fn new(intent: i64, timestamp: DateTime<Utc>, identifier: i64) -> Self {
        Self {
            intent,
            timestamp,
            identifier,
            body: Map::new(),
        }
    }

    /// Add a domain field
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.body.insert(name.into(), value);
        self
    }

    /// Look up a domain field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

/// Business logic: computes the next aggregate from the previous one
///
/// Handlers must be free of external side effects. The processor calls them
/// again every time a store loses the compare-and-swap race, so a single
/// submission may run the handler any number of times.
pub trait Handler<A: Aggregate>: Send + Sync + 'static {
    fn handle(&self, previous: Option<&A>, command: &Command) -> anyhow::Result<A>;
}

impl<A, F> Handler<A> for F
where
    A: Aggregate,
    F: Fn(Option<&A>, &Command) -> anyhow::Result<A> + Send + Sync + 'static,
{
    fn handle(&self, previous: Option<&A>, command: &Command) -> anyhow::Result<A> {
        self(previous, command)
    }
}

/// Failure codes visible on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    InvalidJson,
    InvalidIntent,
    InvalidTimestamp,
    InvalidIdentifier,
    Rejected,
    Unknown,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::InvalidJson => "INVALID_JSON",
            FailureCode::InvalidIntent => "INVALID_INTENT",
            FailureCode::InvalidTimestamp => "INVALID_TIMESTAMP",
            FailureCode::InvalidIdentifier => "INVALID_IDENTIFIER",
            FailureCode::Rejected => "REJECTED",
            FailureCode::Unknown => "UNKNOWN",
        }
    }

    /// Fixed human-readable message sent with the code
    pub fn message(&self) -> &'static str {
        match self {
            FailureCode::InvalidJson => "The supplied data is not valid JSON",
            FailureCode::InvalidIntent => {
                "Serialized 'command' does not have an 'intent' property or it is not a number"
            }
            FailureCode::InvalidTimestamp => {
                "Serialized 'command' does not have a 'timestamp' property or it is not valid"
            }
            FailureCode::InvalidIdentifier => {
                "Serialized 'command' does not have an 'identifier' property or it is not a number"
            }
            FailureCode::Rejected => "The command queue is full",
            FailureCode::Unknown => "An unknown error has occurred",
        }
    }
}

/// Terminal success: the stored aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessfulResult<A> {
    pub intent: i64,
    pub aggregate: A,
}

impl<A: Serialize> Serialize for SuccessfulResult<A> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SuccessfulResult", 3)?;
        state.serialize_field("success", &true)?;
        state.serialize_field("intent", &self.intent)?;
        state.serialize_field("aggregate", &self.aggregate)?;
        state.end()
    }
}

/// Terminal failure
///
/// `intent` is absent when the request could not be read far enough to
/// recover it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureResult {
    pub intent: Option<i64>,
    pub code: String,
    pub message: String,
}

impl FailureResult {
    /// Failure with the fixed message for `code`
    pub fn new(intent: Option<i64>, code: FailureCode) -> Self {
        Self {
            intent,
            code: code.as_str().to_string(),
            message: code.message().to_string(),
        }
    }

    /// The catch-all failure reported for every processing error
    pub fn unknown(intent: i64) -> Self {
        Self::new(Some(intent), FailureCode::Unknown)
    }

    /// Replace the fixed message, keeping the code
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl Serialize for FailureResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FailureResult", 4)?;
        state.serialize_field("success", &false)?;
        state.serialize_field("intent", &self.intent)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        state.end()
    }
}

/// Outcome of one command submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandResult<A> {
    Success(SuccessfulResult<A>),
    Failure(FailureResult),
}

impl<A> CommandResult<A> {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Success(_))
    }

    pub fn intent(&self) -> Option<i64> {
        match self {
            CommandResult::Success(s) => Some(s.intent),
            CommandResult::Failure(f) => f.intent,
        }
    }
}
