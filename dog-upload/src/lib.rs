//! # dog-upload: Signed-URL upload orchestration
//!
//! `dog-upload` moves files from a client to object storage through
//! pre-signed URLs. A trusted issuer hands out a short-lived grant for each
//! file; the bytes then go straight to storage, streamed in bounded chunks
//! with progress, retries and cancellation.
//!
//! ## Key Features
//!
//! - **Pipeline per file**: admission, planning, transfer and reporting run as one tokio task
//! - **Streaming**: memory per upload is bounded by the chunk size, not the file size
//! - **Retries**: transient failures are retried on the same grant with bounded backoff
//! - **Grant expiry**: an expired grant triggers a fresh one instead of a silent failure
//! - **Typed events**: progress and outcome are serde-tagged enums ready to cross a host bridge
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_upload::prelude::*;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! // 1. Point the uploader at the service that signs URLs
//! let uploader = SignedUploader::http("https://api.example.com/uploads/grant", UploadConfig::default())?;
//!
//! // 2. Describe the file and where its bytes come from
//! let request = UploadRequest::for_file("photos/cat.png").await?;
//! let source = FileSource::new("photos/cat.png");
//!
//! // 3. Start it and listen for events
//! let (tx, mut events) = mpsc::unbounded_channel();
//! let handle = uploader.start_upload(request, source, Arc::new(tx), CancellationToken::new());
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}: {} bytes", event.event_name(), event.bytes_sent());
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! let state = handle.join().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  SignedUploader  │  ← one pipeline per file, bounded by the admission gate
//! ├────────┬─────────┤
//! │Planner │Executor │  ← grant issuance | chunked transfer with retries
//! ├────────┴─────────┤
//! │ OutcomeReporter  │  ← ordered progress + exactly one terminal event
//! └──────────────────┘
//! ```
//!
//! Issuers, transports, sources and sinks are traits, so the pipeline runs the
//! same against HTTP endpoints and the in-memory doubles in [`memory`].

mod config;
mod error;
mod events;
mod executor;
mod gate;
mod issuer;
pub mod memory;
mod planner;
mod reporter;
mod source;
mod transport;
mod types;
mod uploader;

// Re-export main types for clean API
pub use config::{RetryPolicy, UploadConfig};
pub use error::{FailureKind, UploadError, UploadResult};
pub use events::{EventSink, NullSink, UploadEvent};
pub use executor::{Chunker, TransferExecutor};
pub use gate::{Admission, AdmissionGate};
pub use issuer::{FixedGrantIssuer, GrantIssuer, HttpGrantIssuer, IssuerResponse};
pub use planner::RequestPlanner;
pub use reporter::{classify_status, OutcomeReporter, StatusClass};
pub use source::{FileSource, UploadSource};
pub use transport::{ChunkWriter, HttpTransport, TransportError, TransportResponse, UploadTransport};
pub use types::{
    ByteStream, HttpMethod, PipelinePhase, SignedUrlGrant, TransferState, TransferStatus,
    UploadId, UploadReceipt, UploadRequest, DEFAULT_CONTENT_TYPE,
};
pub use uploader::{SignedUploader, UploadHandle};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        EventSink, FileSource, SignedUploader, UploadConfig, UploadError, UploadEvent,
        UploadHandle, UploadRequest, UploadResult, UploadSource,
    };
}
