//! Library root for the `cloudlog_digest` crate
//! Fetches cloud audit logs, compresses them into bounded reports, and hands
//! the reports to a summarizer

// Core error handling
pub mod errors;

// Domain model
pub mod clock;
pub mod event;

// Persistence
pub mod event_sink;

// Retrieval
pub mod fetch;

// Classification & reporting
pub mod aggregate;

// Orchestration
pub mod collaborators;
pub mod pipeline;

// Configuration & CLI
pub mod cli;
pub mod config;

pub use aggregate::{Aggregator, Report};
pub use errors::{DigestError, DigestResult};
pub use event::{Provider, RawEvent, Severity, TimeRange};
pub use pipeline::{Pipeline, RunResult};
