use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::reporter::OutcomeReporter;
use crate::{
    AdmissionGate, EventSink, GrantIssuer, HttpGrantIssuer, HttpTransport, PipelinePhase,
    RequestPlanner, TransferExecutor, TransferState, TransferStatus, UploadConfig, UploadError,
    UploadId, UploadRequest, UploadResult, UploadSource, UploadTransport,
};

/// Runs upload pipelines: admission, planning, transfer and reporting.
///
/// Cheap to clone; clones share the admission gate, so every pipeline started
/// from the same uploader counts against the same concurrency limit.
#[derive(Clone)]
pub struct SignedUploader {
    planner: RequestPlanner,
    executor: TransferExecutor,
    gate: AdmissionGate,
    config: UploadConfig,
}

impl SignedUploader {
    pub fn new(
        issuer: Arc<dyn GrantIssuer>,
        transport: Arc<dyn UploadTransport>,
        config: UploadConfig,
    ) -> UploadResult<Self> {
        config.validate()?;
        Ok(Self {
            planner: RequestPlanner::new(issuer, config.clone()),
            executor: TransferExecutor::new(transport, config.clone()),
            gate: AdmissionGate::new(config.max_concurrent_transfers),
            config,
        })
    }

    /// Issuer endpoint and object storage both reached over HTTP with one
    /// shared client
    pub fn http<S: Into<String>>(issuer_endpoint: S, config: UploadConfig) -> UploadResult<Self> {
        let client = reqwest::Client::new();
        Self::new(
            Arc::new(HttpGrantIssuer::with_client(client.clone(), issuer_endpoint)),
            Arc::new(HttpTransport::with_client(client)),
            config,
        )
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Spawn one pipeline. Its events go to `sink`; `cancel` stops it at the
    /// next chunk boundary, backoff or wait.
    pub fn start_upload<S>(
        &self,
        request: UploadRequest,
        source: S,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> UploadHandle
    where
        S: UploadSource + 'static,
    {
        let id = UploadId::new();
        let (phase_tx, phase_rx) = watch::channel(PipelinePhase::Created);

        let uploader = self.clone();
        let task_id = id.clone();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let reporter = OutcomeReporter::new(task_id, request, sink);
            uploader
                .guarded(&reporter, &source, &task_cancel, &phase_tx)
                .await
        });

        info!(upload_id = %id, "upload started");

        UploadHandle {
            id,
            cancel,
            phase: phase_rx,
            join,
        }
    }

    /// Run one pipeline on the current task and wait for its outcome.
    ///
    /// Succeeded and cancelled uploads return their final state; failures
    /// return the error that ended the pipeline. The sink sees the terminal
    /// event either way.
    pub async fn upload(
        &self,
        request: UploadRequest,
        source: &dyn UploadSource,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> UploadResult<TransferState> {
        let (phase, _) = watch::channel(PipelinePhase::Created);
        let reporter = OutcomeReporter::new(UploadId::new(), request, sink);
        self.guarded(&reporter, source, cancel, &phase).await
    }

    /// Start a pipeline per item and wait for all of them. Each pipeline gets
    /// a child of `cancel`, so cancelling it stops the whole batch.
    pub async fn upload_all<S>(
        &self,
        items: Vec<(UploadRequest, S)>,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Vec<UploadResult<TransferState>>
    where
        S: UploadSource + 'static,
    {
        let handles: Vec<UploadHandle> = items
            .into_iter()
            .map(|(request, source)| {
                self.start_upload(request, source, sink.clone(), cancel.child_token())
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.join().await);
        }
        results
    }

    /// A panic anywhere in the pipeline still ends it with one failed event
    async fn guarded(
        &self,
        reporter: &OutcomeReporter,
        source: &dyn UploadSource,
        cancel: &CancellationToken,
        phase: &watch::Sender<PipelinePhase>,
    ) -> UploadResult<TransferState> {
        match AssertUnwindSafe(self.run(reporter, source, cancel, phase))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|msg| msg.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned());
                let reason = match message {
                    Some(msg) => format!("upload pipeline panicked: {}", msg),
                    None => "upload pipeline panicked".to_string(),
                };
                error!(upload_id = %reporter.upload_id(), "{}", reason);
                reporter.abort(reason.clone());
                phase.send_replace(PipelinePhase::Failed);
                Err(UploadError::Internal(reason))
            }
        }
    }

    #[instrument(
        skip_all,
        fields(
            upload_id = %reporter.upload_id(),
            file_name = %reporter.request().file_name,
            size_bytes = reporter.request().size_bytes
        )
    )]
    async fn run(
        &self,
        reporter: &OutcomeReporter,
        source: &dyn UploadSource,
        cancel: &CancellationToken,
        phase: &watch::Sender<PipelinePhase>,
    ) -> UploadResult<TransferState> {
        let request = reporter.request();
        let mut state = TransferState::new(request.size_bytes);

        if let Err(err) = self.planner.validate(request) {
            return finish_failed(state, reporter, phase, err);
        }

        let _admission = match self.gate.admit(cancel).await {
            Some(admission) => admission,
            None if cancel.is_cancelled() => return finish_cancelled(state, reporter, phase),
            None => {
                let err = UploadError::Internal("admission gate is closed".to_string());
                return finish_failed(state, reporter, phase, err);
            }
        };

        let mut replans = 0u32;
        loop {
            phase.send_replace(PipelinePhase::Planning);

            let planned = tokio::select! {
                biased;
                _ = cancel.cancelled() => return finish_cancelled(state, reporter, phase),
                planned = self.planner.plan(request) => planned,
            };
            let grant = match planned {
                Ok(grant) => grant,
                Err(err) => return finish_failed(state, reporter, phase, err),
            };

            phase.send_replace(PipelinePhase::Transferring);
            info!(replans, "transferring");

            match self
                .executor
                .execute(&grant, source, &mut state, reporter, cancel)
                .await
            {
                Ok(()) => {
                    reporter.report(&state);
                    let done = match state.status {
                        TransferStatus::Cancelled => PipelinePhase::Cancelled,
                        _ => PipelinePhase::Succeeded,
                    };
                    phase.send_replace(done);
                    info!(status = state.status.name(), bytes_sent = state.bytes_sent, "upload finished");
                    return Ok(state);
                }
                Err(UploadError::GrantExpired { bytes_sent }) if replans < self.config.max_replans => {
                    replans += 1;
                    warn!(replans, bytes_sent, "grant expired, requesting a fresh one");
                }
                Err(err) => return finish_failed(state, reporter, phase, err),
            }
        }
    }
}

fn finish_failed(
    mut state: TransferState,
    reporter: &OutcomeReporter,
    phase: &watch::Sender<PipelinePhase>,
    err: UploadError,
) -> UploadResult<TransferState> {
    if let Err(e) = state.fail(err.kind(), err.to_string()) {
        warn!("could not record failure: {}", e);
    }
    reporter.report(&state);
    phase.send_replace(PipelinePhase::Failed);
    warn!(kind = %err.kind(), bytes_sent = state.bytes_sent, "upload failed: {}", err);
    Err(err)
}

fn finish_cancelled(
    mut state: TransferState,
    reporter: &OutcomeReporter,
    phase: &watch::Sender<PipelinePhase>,
) -> UploadResult<TransferState> {
    state.cancel()?;
    reporter.report(&state);
    phase.send_replace(PipelinePhase::Cancelled);
    info!(bytes_sent = state.bytes_sent, "upload cancelled");
    Ok(state)
}

/// Handle to a running pipeline
pub struct UploadHandle {
    id: UploadId,
    cancel: CancellationToken,
    phase: watch::Receiver<PipelinePhase>,
    join: JoinHandle<UploadResult<TransferState>>,
}

impl UploadHandle {
    pub fn id(&self) -> &UploadId {
        &self.id
    }

    /// Ask the pipeline to stop; it emits a cancelled event unless it already
    /// finished
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> PipelinePhase {
        *self.phase.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the pipeline's outcome
    pub async fn join(self) -> UploadResult<TransferState> {
        self.join
            .await
            .map_err(|e| UploadError::Internal(format!("upload task failed: {}", e)))?
    }
}
