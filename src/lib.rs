//! Aggregate command processing for the Composable Information Machine
//!
//! Commands are executed against the current snapshot of an aggregate with
//! optimistic concurrency: a bounded worker pool loads the aggregate, runs a
//! pure handler, and stores the result with a compare-and-swap on the
//! aggregate's `sequence`, retrying whenever another writer got there first.
//! Stored documents are migrated to the latest schema on load through a
//! bounded chain of upcasters.
//!
//! Layers, outermost first:
//!
//! - [`transport`]: newline-delimited JSON over TCP
//! - [`protocol`]: JSON validation, result serialization and logging
//! - [`processor`]: worker pool and the load/compute/store retry loop
//! - [`store`]: compare-and-swap aggregate stores (in memory, NATS KV)
//! - [`upcasting`]: schema migrations for stored documents
//! - [`domain`]: aggregates, commands, results and handlers
//!
//! [`accounts`] is a small reference domain built on all of the above.

pub mod accounts;
pub mod domain;
pub mod errors;
pub mod processor;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod upcasting;

// Re-export commonly used types
pub use domain::{Aggregate, Command, CommandResult, FailureCode, FailureResult, Handler, SuccessfulResult};
pub use errors::{ConfigurationError, ProcessError, StoreError, StoreResult, SubmitError};
pub use processor::{CommandProcessor, ProcessorConfig, RetryPolicy};
pub use protocol::{JsonProcessor, ResultLogger, TracingResultLogger};
pub use store::{AggregateStore, DocumentStore, InMemoryCollection, JsonSerde};
pub use transport::{ServerConfig, TcpCommandServer};
pub use upcasting::{UpcastError, Upcaster, UpcasterChain};
