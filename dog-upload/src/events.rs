use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::{FailureKind, UploadId, UploadReceipt};

/// Event protocol between a pipeline and its caller.
///
/// Serialized with a `type` tag so it can cross a host bridge as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// More bytes were handed to the transport
    Progress {
        upload_id: UploadId,
        bytes_sent: u64,
        total_bytes: u64,
    },

    /// Upload completed
    Succeeded {
        upload_id: UploadId,
        bytes_sent: u64,
        receipt: UploadReceipt,
    },

    /// Upload failed; `bytes_sent` keeps the partial progress
    Failed {
        upload_id: UploadId,
        kind: FailureKind,
        cause: String,
        bytes_sent: u64,
    },

    /// Upload was cancelled by the caller
    Cancelled {
        upload_id: UploadId,
        bytes_sent: u64,
    },
}

impl UploadEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Get the upload ID from any event
    pub fn upload_id(&self) -> &UploadId {
        match self {
            Self::Progress { upload_id, .. } => upload_id,
            Self::Succeeded { upload_id, .. } => upload_id,
            Self::Failed { upload_id, .. } => upload_id,
            Self::Cancelled { upload_id, .. } => upload_id,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        match self {
            Self::Progress { bytes_sent, .. } => *bytes_sent,
            Self::Succeeded { bytes_sent, .. } => *bytes_sent,
            Self::Failed { bytes_sent, .. } => *bytes_sent,
            Self::Cancelled { bytes_sent, .. } => *bytes_sent,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Receives the ordered events of one or more pipelines.
///
/// `emit` is called from the pipeline task and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: UploadEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: UploadEvent) {
        (**self).emit(event)
    }
}

impl EventSink for mpsc::UnboundedSender<UploadEvent> {
    fn emit(&self, event: UploadEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.send(event);
    }
}

impl EventSink for broadcast::Sender<UploadEvent> {
    fn emit(&self, event: UploadEvent) {
        let _ = self.send(event);
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: UploadEvent) {}
}
