use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use dog_upload::memory::{Fault, MemoryIssuer, MemoryTransport, RecordingSink};
use dog_upload::{
    EventSink, FailureKind, FileSource, RetryPolicy, SignedUploader, TransferStatus, UploadConfig,
    UploadError, UploadEvent, UploadRequest,
};

const URL: &str = "https://storage.test/bucket/upload.bin";

/// Test factory functions
fn test_config() -> UploadConfig {
    UploadConfig::default().with_chunk_size(1024).with_retry(
        RetryPolicy::new()
            .with_max_retries(3)
            .with_base_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(10)),
    )
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn request(len: usize) -> UploadRequest {
    UploadRequest::new("upload.bin", len as u64, "application/octet-stream")
}

fn uploader(issuer: &MemoryIssuer, transport: &MemoryTransport) -> SignedUploader {
    SignedUploader::new(Arc::new(issuer.clone()), Arc::new(transport.clone()), test_config()).unwrap()
}

fn assert_progress_is_monotonic(events: &[UploadEvent], total: u64) {
    let mut last = 0;
    for event in events {
        if let UploadEvent::Progress { bytes_sent, total_bytes, .. } = event {
            assert_eq!(*total_bytes, total);
            assert!(*bytes_sent >= last, "progress went from {} to {}", last, bytes_sent);
            assert!(*bytes_sent <= total);
            last = *bytes_sent;
        }
    }
}

/// Cancels a token once the first progress event arrives
struct CancelOnProgress {
    inner: RecordingSink,
    token: CancellationToken,
}

impl EventSink for CancelOnProgress {
    fn emit(&self, event: UploadEvent) {
        if matches!(event, UploadEvent::Progress { .. }) {
            self.token.cancel();
        }
        self.inner.emit(event);
    }
}

/// C1. Zero-size files fail before any network call
#[tokio::test]
async fn test_zero_size_fails_before_network() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    let sink = RecordingSink::new();

    let err = uploader(&issuer, &transport)
        .upload(request(0), &Bytes::new(), Arc::new(sink.clone()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::InvalidRequest { .. }));
    assert_eq!(issuer.calls(), 0);
    assert_eq!(transport.opens(), 0);
    assert!(matches!(
        sink.events().as_slice(),
        [UploadEvent::Failed { kind: FailureKind::InvalidRequest, bytes_sent: 0, .. }]
    ));
}

/// C2. Success sends every byte and emits exactly one succeeded event
#[tokio::test]
async fn test_success_sends_all_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin");
    tokio::fs::write(&path, payload(10_000)).await.unwrap();

    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    let sink = RecordingSink::new();

    let request = UploadRequest::for_file(&path).await.unwrap();
    let state = uploader(&issuer, &transport)
        .upload(
            request,
            &FileSource::new(&path).with_read_buffer(700),
            Arc::new(sink.clone()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(state.status, TransferStatus::Succeeded);
    assert_eq!(state.bytes_sent, 10_000);
    assert_eq!(state.bytes_sent, state.total_bytes);
    assert_eq!(transport.object(URL).unwrap(), payload(10_000));

    let events = sink.events();
    assert_progress_is_monotonic(&events, 10_000);
    let terminal = sink.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], UploadEvent::Succeeded { bytes_sent: 10_000, .. }));
    assert!(events.last().unwrap().is_terminal());
}

/// C3. Cancellation stops the stream and emits exactly one cancelled event
#[tokio::test]
async fn test_cancellation_sends_no_more_chunks() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    let recorded = RecordingSink::new();
    let cancel = CancellationToken::new();
    let sink = CancelOnProgress {
        inner: recorded.clone(),
        token: cancel.clone(),
    };

    let state = uploader(&issuer, &transport)
        .upload(request(8 * 1024), &payload(8 * 1024), Arc::new(sink), &cancel)
        .await
        .unwrap();

    assert_eq!(state.status, TransferStatus::Cancelled);
    assert_eq!(transport.chunks_received(), 1);
    assert!(transport.object(URL).is_none());

    let terminal = recorded.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], UploadEvent::Cancelled { bytes_sent: 1024, .. }));
}

/// A cancel arriving after the last chunk went out keeps the stored object
#[tokio::test]
async fn test_cancel_after_last_chunk_reports_success() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    let recorded = RecordingSink::new();
    let cancel = CancellationToken::new();
    let sink = CancelOnProgress {
        inner: recorded.clone(),
        token: cancel.clone(),
    };

    let state = uploader(&issuer, &transport)
        .upload(request(512), &payload(512), Arc::new(sink), &cancel)
        .await
        .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(state.status, TransferStatus::Succeeded);
    assert_eq!(transport.object(URL).unwrap(), payload(512));

    let terminal = recorded.terminal_events();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], UploadEvent::Succeeded { bytes_sent: 512, .. }));
}

/// C4. Expiry mid-transfer triggers re-planning, never a silent success
#[tokio::test]
async fn test_grant_expiry_replans() {
    let issuer = MemoryIssuer::new(URL);
    issuer.next_ttl(chrono::Duration::milliseconds(120));
    let transport = MemoryTransport::new().with_chunk_delay(Duration::from_millis(30));
    let sink = RecordingSink::new();

    let state = uploader(&issuer, &transport)
        .upload(request(10 * 1024), &payload(10 * 1024), Arc::new(sink.clone()), &CancellationToken::new())
        .await
        .unwrap();

    assert!(issuer.calls() >= 2);
    assert_eq!(state.status, TransferStatus::Succeeded);
    assert_eq!(transport.object(URL).unwrap().len(), 10 * 1024);
    assert_progress_is_monotonic(&sink.events(), 10 * 1024);
    assert_eq!(sink.terminal_events().len(), 1);
}

/// C4b. A grant that keeps expiring ends in GrantExpired
#[tokio::test]
async fn test_grant_expiry_never_succeeds_silently() {
    let issuer = MemoryIssuer::new(URL).with_ttl(chrono::Duration::milliseconds(50));
    let transport = MemoryTransport::new().with_chunk_delay(Duration::from_millis(30));
    let sink = RecordingSink::new();

    let err = uploader(&issuer, &transport)
        .upload(request(10 * 1024), &payload(10 * 1024), Arc::new(sink.clone()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::GrantExpired { .. }));
    assert!(err.is_replannable());
    assert_eq!(issuer.calls(), 3);
    assert_eq!(transport.object_count(), 0);
    assert!(!sink.events().iter().any(|e| matches!(e, UploadEvent::Succeeded { .. })));
}

/// C5. Three transient failures, then the fourth attempt succeeds
#[tokio::test]
async fn test_fourth_attempt_succeeds_after_three_transient_errors() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    transport.fail_with(Fault::ResetAfter(3));
    transport.fail_with(Fault::Status(503));
    transport.fail_with(Fault::RefuseConnection);
    let sink = RecordingSink::new();

    let state = uploader(&issuer, &transport)
        .upload(request(4096), &payload(4096), Arc::new(sink.clone()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.attempts, 4);
    assert_eq!(state.bytes_sent, 4096);
    assert_eq!(transport.opens(), 4);
    assert_eq!(issuer.calls(), 1);
    assert_eq!(transport.object(URL).unwrap(), payload(4096));
    assert_progress_is_monotonic(&sink.events(), 4096);
}

/// C5b. A fourth transient failure exhausts the retries
#[tokio::test]
async fn test_fourth_transient_error_fails_the_pipeline() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    for _ in 0..4 {
        transport.fail_with(Fault::Status(502));
    }
    let sink = RecordingSink::new();

    let err = uploader(&issuer, &transport)
        .upload(request(2048), &payload(2048), Arc::new(sink.clone()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::TransferFailed { attempts: 4, .. }));
    assert_eq!(transport.opens(), 4);
    assert!(matches!(
        sink.terminal_events().as_slice(),
        [UploadEvent::Failed { kind: FailureKind::TransferFailed, bytes_sent: 2048, .. }]
    ));
}

/// C6. Progress never decreases across retries
#[tokio::test]
async fn test_progress_is_monotonic_across_retries() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    transport.fail_with(Fault::ResetAfter(5));
    transport.fail_with(Fault::ResetAfter(2));
    let sink = RecordingSink::new();

    uploader(&issuer, &transport)
        .upload(request(8 * 1024), &payload(8 * 1024), Arc::new(sink.clone()), &CancellationToken::new())
        .await
        .unwrap();

    let events = sink.events();
    assert_progress_is_monotonic(&events, 8 * 1024);
    let progress: Vec<u64> = events
        .iter()
        .filter(|e| !e.is_terminal())
        .map(|e| e.bytes_sent())
        .collect();
    assert_eq!(progress.first(), Some(&1024));
    assert_eq!(progress.last(), Some(&(8 * 1024)));
}

/// C7. The admission gate bounds concurrent transfers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new().with_chunk_delay(Duration::from_millis(5));
    let uploader = SignedUploader::new(
        Arc::new(issuer.clone()),
        Arc::new(transport.clone()),
        test_config().with_max_concurrent_transfers(3),
    )
    .unwrap();
    let sink = RecordingSink::new();

    let items: Vec<(UploadRequest, Bytes)> = (0..10)
        .map(|i| {
            (
                UploadRequest::new(format!("file-{}.bin", i), 3000, "application/octet-stream"),
                payload(3000),
            )
        })
        .collect();

    let results = uploader
        .upload_all(items, Arc::new(sink.clone()), &CancellationToken::new())
        .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(transport.peak_concurrency() <= 3);
    assert_eq!(issuer.calls(), 10);
    assert_eq!(sink.terminal_events().len(), 10);
}

/// C8. Cancelling one pipeline leaves the others alone
#[tokio::test]
async fn test_cancellation_is_per_pipeline() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new().with_chunk_delay(Duration::from_millis(10));
    let uploader = uploader(&issuer, &transport);

    let kept_sink = RecordingSink::new();
    let kept = uploader.start_upload(
        request(4096),
        payload(4096),
        Arc::new(kept_sink.clone()),
        CancellationToken::new(),
    );

    let stopped_sink = RecordingSink::new();
    let stopped = uploader.start_upload(
        request(4096),
        payload(4096),
        Arc::new(stopped_sink.clone()),
        CancellationToken::new(),
    );
    stopped.cancel();

    assert_eq!(stopped.join().await.unwrap().status, TransferStatus::Cancelled);
    assert_eq!(kept.join().await.unwrap().status, TransferStatus::Succeeded);
    assert!(matches!(
        stopped_sink.terminal_events().as_slice(),
        [UploadEvent::Cancelled { .. }]
    ));
    assert!(matches!(
        kept_sink.terminal_events().as_slice(),
        [UploadEvent::Succeeded { .. }]
    ));
}

/// C9. Events cross a JSON bridge with a type tag
#[tokio::test]
async fn test_events_serialize_for_host_bridge() {
    let issuer = MemoryIssuer::new(URL);
    let transport = MemoryTransport::new();
    let sink = RecordingSink::new();

    uploader(&issuer, &transport)
        .upload(request(10), &payload(10), Arc::new(sink.clone()), &CancellationToken::new())
        .await
        .unwrap();

    let json: Vec<serde_json::Value> = sink
        .events()
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();

    assert_eq!(json[0]["type"], "progress");
    assert_eq!(json[0]["total_bytes"], 10);
    let last = json.last().unwrap();
    assert_eq!(last["type"], "succeeded");
    assert_eq!(last["receipt"]["file_name"], "upload.bin");
    assert_eq!(last["receipt"]["size_bytes"], 10);
}
