//! Encoder/Compressor Pool (C3) and Upload Queue (C4): the write-compress
//! upload half of the ingestion pipeline, bridging the cursor store (C5)
//! and the object store (`ledger-blobstore`).

pub mod encoder;
pub mod upload;

pub use encoder::{EncodeJob, EncodeOutcome, EncoderPool};
pub use upload::{DeadLetter, UploadJob, UploadQueue, UploadQueueConfig};
