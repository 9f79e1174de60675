use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::{GrantIssuer, SignedUrlGrant, UploadConfig, UploadError, UploadRequest, UploadResult};

/// Validates an upload request and obtains a grant for it.
///
/// The planner never retries: a grant has a fixed expiry and asking again is
/// cheap, so retry policy belongs to the pipeline.
#[derive(Clone)]
pub struct RequestPlanner {
    issuer: Arc<dyn GrantIssuer>,
    config: UploadConfig,
}

impl RequestPlanner {
    pub fn new(issuer: Arc<dyn GrantIssuer>, config: UploadConfig) -> Self {
        Self { issuer, config }
    }

    /// Check a request without touching the network
    pub fn validate(&self, request: &UploadRequest) -> UploadResult<()> {
        if request.file_name.trim().is_empty() {
            return Err(UploadError::invalid("file name is empty"));
        }
        if request.size_bytes == 0 {
            return Err(UploadError::invalid(format!(
                "{} is empty (size must be greater than 0)",
                request.file_name
            )));
        }
        if request.size_bytes > self.config.max_file_bytes {
            return Err(UploadError::invalid(format!(
                "{} is {} bytes, above the {} byte limit",
                request.file_name, request.size_bytes, self.config.max_file_bytes
            )));
        }
        if request.content_type.trim().is_empty() {
            return Err(UploadError::invalid(format!(
                "{} has no content type",
                request.file_name
            )));
        }
        if self.config.is_ignored(&request.file_name) {
            return Err(UploadError::invalid(format!(
                "{} is on the ignore list",
                request.file_name
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(file_name = %request.file_name, size_bytes = request.size_bytes))]
    pub async fn plan(&self, request: &UploadRequest) -> UploadResult<SignedUrlGrant> {
        self.validate(request)?;

        let grant = self.issuer.issue(request).await.map_err(|e| {
            warn!("grant issuance failed: {}", e);
            e
        })?;

        if grant.is_expired() {
            warn!(expires_at = %grant.expires_at, "issuer handed out an expired grant");
            return Err(UploadError::rejected(None, "issued grant is already expired"));
        }

        info!(method = %grant.method, expires_at = %grant.expires_at, "grant issued");
        Ok(grant)
    }
}
