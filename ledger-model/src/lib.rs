//! Data model, partition routing (C1) and record normalization (C2) for the
//! ledger ingestion pipeline.

pub mod error;
pub mod normalize;
pub mod partition;
pub mod schema;
pub mod types;

pub use error::{IngestError, Result};
