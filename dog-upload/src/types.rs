use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;
use uuid::Uuid;

use crate::{FailureKind, UploadError, UploadResult};

/// Stream of bytes for upload content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Content type used when neither the caller nor the grant names one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Unique identifier for one upload pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user-initiated upload of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub size_bytes: u64,
    pub content_type: String,
}

impl UploadRequest {
    pub fn new<N, C>(file_name: N, size_bytes: u64, content_type: C) -> Self
    where
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            file_name: file_name.into(),
            size_bytes,
            content_type: content_type.into(),
        }
    }

    /// Describe a file on disk: name and size from its metadata, content type
    /// guessed from the extension.
    pub async fn for_file<P: AsRef<Path>>(path: P) -> UploadResult<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::invalid(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::invalid(format!("{} has no file name", path.display())))?;

        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self::new(file_name, metadata.len(), content_type))
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// HTTP method prescribed by a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "post")]
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Post => "POST",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed URL, method and headers issued for one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrlGrant {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

impl SignedUrlGrant {
    pub fn new<S: Into<String>>(url: S, expires_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Put,
            headers: BTreeMap::new(),
            expires_at,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, `None` once expired
    pub fn remaining(&self) -> Option<std::time::Duration> {
        (self.expires_at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. } | Self::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Forward-only transitions. Pending may end directly in Failed or
    /// Cancelled when the pipeline never reaches the transfer.
    pub fn can_transition_to(&self, next: &TransferStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            (Self::Pending, Self::Failed { .. }) | (Self::Pending, Self::Cancelled) => true,
            (Self::InProgress, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Transfer progress for one upload.
///
/// `bytes_sent` is the high-water mark across attempts: a retry restarts the
/// stream but never lowers the reported progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub status: TransferStatus,
    pub attempts: u32,
}

impl TransferState {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            bytes_sent: 0,
            total_bytes,
            status: TransferStatus::Pending,
            attempts: 0,
        }
    }

    fn transition(&mut self, next: TransferStatus) -> UploadResult<()> {
        if !self.status.can_transition_to(&next) {
            return Err(UploadError::Internal(format!(
                "illegal transfer transition {} -> {}",
                self.status.name(),
                next.name()
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn begin(&mut self) -> UploadResult<()> {
        self.transition(TransferStatus::InProgress)
    }

    /// Record how many bytes the current attempt has handed to the transport.
    /// Returns true when the high-water mark moved.
    pub fn record_sent(&mut self, attempt_bytes: u64) -> UploadResult<bool> {
        if attempt_bytes > self.total_bytes {
            return Err(UploadError::Internal(format!(
                "sent {} bytes of a {} byte transfer",
                attempt_bytes, self.total_bytes
            )));
        }
        if attempt_bytes > self.bytes_sent {
            self.bytes_sent = attempt_bytes;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn succeed(&mut self) -> UploadResult<()> {
        if self.bytes_sent != self.total_bytes {
            return Err(UploadError::Internal(format!(
                "cannot succeed with {} of {} bytes sent",
                self.bytes_sent, self.total_bytes
            )));
        }
        self.transition(TransferStatus::Succeeded)
    }

    pub fn fail<S: Into<String>>(&mut self, kind: FailureKind, reason: S) -> UploadResult<()> {
        self.transition(TransferStatus::Failed {
            kind,
            reason: reason.into(),
        })
    }

    pub fn cancel(&mut self) -> UploadResult<()> {
        self.transition(TransferStatus::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whole-number percentage, as shown by a progress bar
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.bytes_sent as f64 / self.total_bytes as f64) * 100.0).round() as u8
    }
}

/// Lifecycle of a whole pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Created,
    Planning,
    Transferring,
    Succeeded,
    Failed,
    Cancelled,
}

impl PipelinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// What the caller gets back for a completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub upload_id: UploadId,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub completed_at: i64,
}

impl UploadReceipt {
    pub fn new(upload_id: UploadId, request: &UploadRequest) -> Self {
        Self {
            upload_id,
            file_name: request.file_name.clone(),
            content_type: request.content_type.clone(),
            size_bytes: request.size_bytes,
            etag: None,
            completed_at: Utc::now().timestamp(),
        }
    }

    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.etag = Some(etag.into());
        self
    }
}
