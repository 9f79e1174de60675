use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::reporter::{classify_status, OutcomeReporter, StatusClass};
use crate::{
    ByteStream, SignedUrlGrant, TransferState, TransferStatus, TransportError, TransportResponse, UploadConfig,
    UploadError, UploadResult, UploadSource, UploadTransport,
};

/// Splits a source stream into chunks of at most `chunk_size` bytes without
/// copying.
pub struct Chunker {
    stream: ByteStream,
    carry: Bytes,
    chunk_size: usize,
}

impl Chunker {
    pub fn new(stream: ByteStream, chunk_size: usize) -> Self {
        Self {
            stream,
            carry: Bytes::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        while self.carry.is_empty() {
            match self.stream.next().await {
                Some(Ok(bytes)) => self.carry = bytes,
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
        let take = self.carry.len().min(self.chunk_size);
        Ok(Some(self.carry.split_to(take)))
    }
}

/// Why one attempt stopped
enum AttemptError {
    Cancelled,
    Expired,
    Failed(TransportError),
}

/// Streams file bytes to a signed URL, retrying transient failures on the
/// same grant.
#[derive(Clone)]
pub struct TransferExecutor {
    transport: Arc<dyn UploadTransport>,
    config: UploadConfig,
}

impl TransferExecutor {
    pub fn new(transport: Arc<dyn UploadTransport>, config: UploadConfig) -> Self {
        Self { transport, config }
    }

    /// Run the transfer for one grant.
    ///
    /// On `Ok(())` the state is terminal: `Succeeded`, or `Cancelled` if the
    /// token fired. `GrantExpired` and `TransferFailed` come back as errors
    /// with the state left in progress, so the pipeline can re-plan with the
    /// same state and keep its progress.
    #[instrument(
        skip_all,
        fields(upload_id = %reporter.upload_id(), total_bytes = state.total_bytes)
    )]
    pub async fn execute(
        &self,
        grant: &SignedUrlGrant,
        source: &dyn UploadSource,
        state: &mut TransferState,
        reporter: &OutcomeReporter,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        if state.status == TransferStatus::Pending {
            state.begin()?;
        }

        let policy = &self.config.retry;
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(state);
            }
            if grant.is_expired() {
                warn!(bytes_sent = state.bytes_sent, "grant expired before attempt");
                return Err(UploadError::GrantExpired {
                    bytes_sent: state.bytes_sent,
                });
            }

            state.attempts += 1;
            debug!(attempt = state.attempts, "starting transfer attempt");

            match self.attempt(grant, source, state, reporter, cancel).await {
                Ok(response) => {
                    reporter.record_etag(response.etag);
                    state.succeed()?;
                    info!(
                        attempts = state.attempts,
                        bytes_sent = state.bytes_sent,
                        "transfer succeeded"
                    );
                    return Ok(());
                }
                Err(AttemptError::Cancelled) => return self.cancelled(state),
                Err(AttemptError::Expired) => {
                    warn!(bytes_sent = state.bytes_sent, "grant expired mid-transfer");
                    return Err(UploadError::GrantExpired {
                        bytes_sent: state.bytes_sent,
                    });
                }
                Err(AttemptError::Failed(err)) => {
                    if err.is_transient() && retries < policy.max_retries {
                        retries += 1;
                        let delay = policy.backoff(retries);

                        match grant.remaining() {
                            Some(left) if left > delay => {}
                            _ => {
                                warn!("grant would expire during backoff: {}", err);
                                return Err(UploadError::GrantExpired {
                                    bytes_sent: state.bytes_sent,
                                });
                            }
                        }

                        warn!(
                            attempt = state.attempts,
                            retry = retries,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, retrying: {}",
                            err
                        );

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return self.cancelled(state),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }

                    let reason = if err.is_transient() {
                        format!("giving up after {} retries: {}", retries, err)
                    } else {
                        err.to_string()
                    };
                    error!(attempts = state.attempts, "transfer failed: {}", reason);
                    return Err(UploadError::transfer_failed(
                        reason,
                        state.attempts,
                        state.bytes_sent,
                    ));
                }
            }
        }
    }

    fn cancelled(&self, state: &mut TransferState) -> UploadResult<()> {
        info!(bytes_sent = state.bytes_sent, "transfer cancelled");
        state.cancel()
    }

    async fn attempt(
        &self,
        grant: &SignedUrlGrant,
        source: &dyn UploadSource,
        state: &mut TransferState,
        reporter: &OutcomeReporter,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, AttemptError> {
        let total = state.total_bytes;

        let stream = source.open().await.map_err(|e| {
            AttemptError::Failed(TransportError::permanent(format!("cannot open source: {}", e)))
        })?;
        let mut chunks = Chunker::new(stream, self.config.chunk_size);

        let mut writer = self
            .transport
            .open(grant, total)
            .await
            .map_err(AttemptError::Failed)?;

        let mut sent: u64 = 0;
        loop {
            let chunk = match chunks.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    return Err(AttemptError::Failed(TransportError::permanent(format!(
                        "reading source failed: {}",
                        e
                    ))));
                }
            };

            let len = chunk.len() as u64;
            if sent + len > total {
                return Err(AttemptError::Failed(TransportError::permanent(format!(
                    "source produced more than the declared {} bytes",
                    total
                ))));
            }

            // chunk boundary
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            if grant.is_expired() {
                return Err(AttemptError::Expired);
            }

            // a started write runs to completion or timeout
            match tokio::time::timeout(self.config.chunk_timeout, writer.write_chunk(chunk)).await {
                Err(_) => {
                    return Err(AttemptError::Failed(TransportError::transient(format!(
                        "chunk write timed out after {:?}",
                        self.config.chunk_timeout
                    ))));
                }
                Ok(Err(e)) => return Err(self.classify_early(e, grant)),
                Ok(Ok(())) => {}
            }

            sent += len;
            let advanced = state
                .record_sent(sent)
                .map_err(|e| AttemptError::Failed(TransportError::permanent(e.to_string())))?;
            if advanced {
                reporter.progress(state);
            }
            debug!(sent, total, "chunk written");
        }

        if sent != total {
            return Err(AttemptError::Failed(TransportError::permanent(format!(
                "source ended after {} of {} bytes",
                sent, total
            ))));
        }
        // no boundary left: the body is complete, so wait for the answer
        let response = match tokio::time::timeout(self.config.chunk_timeout, writer.finish()).await {
            Err(_) => {
                return Err(AttemptError::Failed(TransportError::transient(
                    "timed out waiting for the upload response",
                )));
            }
            Ok(Err(e)) => return Err(self.classify_early(e, grant)),
            Ok(Ok(response)) => response,
        };

        match classify_status(response.status) {
            StatusClass::Success => Ok(response),
            _ => Err(self.classify_early(TransportError::Responded(response), grant)),
        }
    }

    /// An auth refusal after the grant ran out means the signature expired
    fn classify_early(&self, err: TransportError, grant: &SignedUrlGrant) -> AttemptError {
        match &err {
            TransportError::Responded(response)
                if matches!(response.status, 401 | 403) && grant.is_expired() =>
            {
                AttemptError::Expired
            }
            _ => AttemptError::Failed(err),
        }
    }
}
