// Copyright (c) 2025 - Cowboy AI, Inc.
//! JSON Command Protocol
//!
//! Validates inbound JSON commands, hands them to the [`CommandProcessor`] and
//! serializes results back to JSON. Every outgoing result is also written to
//! a [`ResultLogger`].
//!
//! Validation happens before a command ever reaches the processor and is
//! never retried:
//!
//! | Check | Failure code | Intent echoed |
//! |---|---|---|
//! | input parses as JSON | `INVALID_JSON` | no |
//! | `intent` is an integer | `INVALID_INTENT` | no |
//! | `timestamp` is an ISO-8601 string (no offset means UTC) | `INVALID_TIMESTAMP` | yes |
//! | `identifier` is an integer | `INVALID_IDENTIFIER` | yes |

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::domain::{Aggregate, Command, FailureCode, FailureResult};
use crate::errors::SubmitError;
use crate::processor::CommandProcessor;

/// Message of the `REJECTED` failure sent once the processor has shut down
pub const SHUT_DOWN_MESSAGE: &str = "The command processor is shut down";

/// Sink for serialized results
pub trait ResultLogger: Send + Sync {
    fn log(&self, content: &Value);
    fn log_error(&self, content: &Value);
}

/// [`ResultLogger`] that emits each result as a `tracing` event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingResultLogger;

impl ResultLogger for TracingResultLogger {
    fn log(&self, content: &Value) {
        info!(target: "cim_command_processor::results", result = %content);
    }

    fn log_error(&self, content: &Value) {
        error!(target: "cim_command_processor::results", result = %content);
    }
}

/// JSON front end for a [`CommandProcessor`]
pub struct JsonProcessor<A: Aggregate> {
    delegate: Arc<CommandProcessor<A>>,
    logger: Arc<dyn ResultLogger>,
}

impl<A> JsonProcessor<A>
where
    A: Aggregate + Serialize,
{
    pub fn new(delegate: Arc<CommandProcessor<A>>, logger: impl ResultLogger + 'static) -> Self {
        Self {
            delegate,
            logger: Arc::new(logger),
        }
    }

    /// The processor commands are forwarded to
    pub fn processor(&self) -> &Arc<CommandProcessor<A>> {
        &self.delegate
    }

    /// Submit a command given as JSON text
    ///
    /// Exactly one callback receives the serialized result.
    pub fn submit_str<S, E>(&self, input: &str, on_success: S, on_error: E)
    where
        S: FnOnce(String) + Send + 'static,
        E: FnOnce(String) + Send + 'static,
    {
        match serde_json::from_str::<Value>(input) {
            Ok(json) => self.submit_json(
                json,
                move |success| on_success(success.to_string()),
                move |failure| on_error(failure.to_string()),
            ),
            Err(_) => self.reject_invalid_json(on_error),
        }
    }

    /// Report input that could not be read as JSON at all
    pub fn reject_invalid_json<E>(&self, on_error: E)
    where
        E: FnOnce(String),
    {
        let failure = failure_json(&FailureResult::new(None, FailureCode::InvalidJson));
        self.logger.log_error(&failure);
        on_error(failure.to_string());
    }

    /// Submit a command given as a JSON value
    ///
    /// Exactly one callback receives the result.
    pub fn submit_json<S, E>(&self, json: Value, on_success: S, on_error: E)
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(Value) + Send + 'static,
    {
        let command = match parse_command(json) {
            Ok(command) => command,
            Err(failure) => {
                let failure = failure_json(&failure);
                self.logger.log_error(&failure);
                on_error(failure);
                return;
            }
        };

        let intent = command.intent;
        let success_logger = self.logger.clone();
        let failure_logger = self.logger.clone();

        // Reachable from the success path, the failure path and a rejection
        let on_error = Arc::new(Mutex::new(Some(on_error)));
        let on_error_after_success = on_error.clone();
        let on_error_after_failure = on_error.clone();

        let submitted = self.delegate.submit(
            command,
            move |success| match serde_json::to_value(&success) {
                Ok(content) => {
                    success_logger.log(&content);
                    on_success(content);
                }
                Err(e) => {
                    error!(intent, error = %e, "Failed to serialize aggregate");
                    let failure = failure_json(&FailureResult::unknown(intent));
                    success_logger.log_error(&failure);
                    respond(&on_error_after_success, failure);
                }
            },
            move |failure| {
                let content = failure_json(&failure);
                failure_logger.log_error(&content);
                respond(&on_error_after_failure, content);
            },
        );

        if let Err(e) = submitted {
            warn!(intent, error = %e, "Command not accepted");
            let rejected = FailureResult::new(Some(intent), FailureCode::Rejected);
            let rejected = match e {
                SubmitError::Rejected { .. } => rejected,
                SubmitError::ShutDown => rejected.with_message(SHUT_DOWN_MESSAGE),
            };
            let failure = failure_json(&rejected);
            self.logger.log_error(&failure);
            respond(&on_error, failure);
        }
    }
}

fn respond<E: FnOnce(Value)>(slot: &Mutex<Option<E>>, content: Value) {
    let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(callback) = callback {
        callback(content);
    }
}

/// Validate a JSON command and split it into header and domain fields
pub fn parse_command(json: Value) -> Result<Command, FailureResult> {
    let mut fields = match json {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };

    let intent = fields
        .get("intent")
        .and_then(Value::as_i64)
        .ok_or_else(|| FailureResult::new(None, FailureCode::InvalidIntent))?;

    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| FailureResult::new(Some(intent), FailureCode::InvalidTimestamp))?;

    let identifier = fields
        .get("identifier")
        .and_then(Value::as_i64)
        .ok_or_else(|| FailureResult::new(Some(intent), FailureCode::InvalidIdentifier))?;

    fields.remove("intent");
    fields.remove("timestamp");
    fields.remove("identifier");

    Ok(Command {
        intent,
        timestamp,
        identifier,
        body: fields,
    })
}

/// RFC 3339, or an ISO-8601 local date-time read as UTC
fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| input.parse::<NaiveDateTime>().map(|t| t.and_utc()))
        .ok()
}

fn failure_json(failure: &FailureResult) -> Value {
    // FailureResult holds only strings and integers
    serde_json::to_value(failure).unwrap_or(Value::Null)
}
