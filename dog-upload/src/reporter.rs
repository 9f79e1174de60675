use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{EventSink, FailureKind, TransferState, TransferStatus, UploadEvent, UploadId, UploadReceipt, UploadRequest};

/// How an HTTP status from the upload endpoint is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Success,
    /// Worth another attempt on the same grant (408, 429, 5xx)
    Transient,
    /// Anything else; retrying will not help
    Rejected,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::Rejected,
    }
}

/// Relays progress and the terminal outcome of one pipeline to its sink.
///
/// Progress is forwarded only when it moves forward and stays within the
/// declared size; the first terminal report wins and later ones are dropped.
pub struct OutcomeReporter {
    upload_id: UploadId,
    request: UploadRequest,
    sink: Arc<dyn EventSink>,
    last_progress: AtomicU64,
    progress_started: AtomicBool,
    terminated: AtomicBool,
    etag: Mutex<Option<String>>,
}

impl OutcomeReporter {
    pub fn new(upload_id: UploadId, request: UploadRequest, sink: Arc<dyn EventSink>) -> Self {
        Self {
            upload_id,
            request,
            sink,
            last_progress: AtomicU64::new(0),
            progress_started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            etag: Mutex::new(None),
        }
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    pub fn request(&self) -> &UploadRequest {
        &self.request
    }

    /// Remember the ETag the storage answered with, for the receipt
    pub fn record_etag(&self, etag: Option<String>) {
        *self.etag.lock() = etag;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Emit a progress event for the given state if it advanced
    pub fn progress(&self, state: &TransferState) {
        if self.is_terminated() || state.bytes_sent > state.total_bytes {
            return;
        }
        let previous = self.last_progress.load(Ordering::SeqCst);
        let first = !self.progress_started.swap(true, Ordering::SeqCst);
        if !first && state.bytes_sent <= previous {
            return;
        }
        self.last_progress.store(state.bytes_sent, Ordering::SeqCst);

        self.sink.emit(UploadEvent::Progress {
            upload_id: self.upload_id.clone(),
            bytes_sent: state.bytes_sent,
            total_bytes: state.total_bytes,
        });
    }

    /// Map a terminal state to exactly one event. Non-terminal states and
    /// repeated reports are ignored.
    pub fn report(&self, state: &TransferState) {
        if !state.is_terminal() {
            debug!(upload_id = %self.upload_id, status = state.status.name(), "ignoring non-terminal report");
            return;
        }
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(upload_id = %self.upload_id, "terminal event already emitted");
            return;
        }

        let event = match &state.status {
            TransferStatus::Succeeded => {
                let mut receipt = UploadReceipt::new(self.upload_id.clone(), &self.request);
                receipt.size_bytes = state.bytes_sent;
                if let Some(etag) = self.etag.lock().take() {
                    receipt = receipt.with_etag(etag);
                }
                UploadEvent::Succeeded {
                    upload_id: self.upload_id.clone(),
                    bytes_sent: state.bytes_sent,
                    receipt,
                }
            }
            TransferStatus::Failed { kind, reason } => UploadEvent::Failed {
                upload_id: self.upload_id.clone(),
                kind: *kind,
                cause: reason.clone(),
                bytes_sent: state.bytes_sent,
            },
            TransferStatus::Cancelled => UploadEvent::Cancelled {
                upload_id: self.upload_id.clone(),
                bytes_sent: state.bytes_sent,
            },
            TransferStatus::Pending | TransferStatus::InProgress => return,
        };

        debug!(upload_id = %self.upload_id, event = event.event_name(), "reporting outcome");
        self.sink.emit(event);
    }

    /// Terminal failure for a pipeline that stopped without a final state,
    /// reported with the last progress that went out
    pub fn abort(&self, reason: impl Into<String>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.emit(UploadEvent::Failed {
            upload_id: self.upload_id.clone(),
            kind: FailureKind::Internal,
            cause: reason.into(),
            bytes_sent: self.last_progress.load(Ordering::SeqCst),
        });
    }
}
