//! Ingests phone-backup XML archives (calls and SMS/MMS) into a
//! content-addressed, year-partitioned repository on disk, deduplicating
//! records by a stable identity hash and extracting MMS attachments into a
//! shared blob store.

pub mod attachments;
pub mod cancel;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod extractor;
pub mod hash;
pub mod manifest;
pub mod orchestrator;
pub mod reader;
pub mod record;
pub mod test_support;
pub mod writer;

pub use cancel::CancellationToken;
pub use error::{CoreError, Result};
pub use orchestrator::{
    coalesce, manifest as build_manifest, open_repository, validate, CountMismatchDetail,
    IngestReport, Repository, ValidationReport, YearCounts, YearMismatchDetail,
};
pub use record::{Call, Message, MultimediaMessage, Record, TextMessage};
