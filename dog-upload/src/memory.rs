//! In-memory issuer, transport and sink.
//!
//! Used by the test suites and handy for wiring a UI against the event
//! protocol without any storage behind it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::{
    ChunkWriter, EventSink, GrantIssuer, HttpMethod, SignedUrlGrant, TransportError,
    TransportResponse, UploadError, UploadEvent, UploadRequest, UploadResult, UploadTransport,
};

struct IssuerState {
    url: String,
    ttl: RwLock<chrono::Duration>,
    next_ttls: Mutex<VecDeque<chrono::Duration>>,
    failures: Mutex<VecDeque<UploadError>>,
    requests: Mutex<Vec<UploadRequest>>,
    calls: AtomicUsize,
}

/// Issues PUT grants for a fixed url. Clones share state.
#[derive(Clone)]
pub struct MemoryIssuer {
    state: Arc<IssuerState>,
}

impl MemoryIssuer {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            state: Arc::new(IssuerState {
                url: url.into(),
                ttl: RwLock::new(chrono::Duration::minutes(15)),
                next_ttls: Mutex::new(VecDeque::new()),
                failures: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Lifetime of every grant handed out (negative means born expired)
    pub fn with_ttl(self, ttl: chrono::Duration) -> Self {
        *self.state.ttl.write() = ttl;
        self
    }

    /// Lifetime of the next grant only
    pub fn next_ttl(&self, ttl: chrono::Duration) {
        self.state.next_ttls.lock().push_back(ttl);
    }

    /// Answer the next call with `error` instead of a grant
    pub fn fail_next(&self, error: UploadError) {
        self.state.failures.lock().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<UploadRequest> {
        self.state.requests.lock().clone()
    }
}

#[async_trait]
impl GrantIssuer for MemoryIssuer {
    async fn issue(&self, request: &UploadRequest) -> UploadResult<SignedUrlGrant> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().push(request.clone());

        if let Some(error) = self.state.failures.lock().pop_front() {
            return Err(error);
        }

        let ttl = self
            .state
            .next_ttls
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.state.ttl.read());

        Ok(SignedUrlGrant::new(self.state.url.clone(), Utc::now() + ttl)
            .with_header("Content-Type", request.content_type.clone()))
    }
}

/// Failure injected into one upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// `open` fails as if the connection was refused
    RefuseConnection,
    /// Connection resets after this many chunks were accepted
    ResetAfter(usize),
    /// The whole body is accepted, then the endpoint answers this status
    Status(u16),
    /// Writes never complete
    Stall,
}

/// What one attempt asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub content_length: u64,
}

#[derive(Default)]
struct TransportState {
    faults: Mutex<VecDeque<Fault>>,
    objects: RwLock<HashMap<String, Bytes>>,
    requests: Mutex<Vec<RecordedRequest>>,
    opens: AtomicUsize,
    chunks: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Storage endpoint kept in memory. Faults are consumed one per attempt, in
/// the order they were queued; attempts without a fault succeed.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<TransportState>,
    chunk_delay: Option<Duration>,
    response_delay: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chunk write takes at least this long
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// The object is stored as soon as the body is complete, but the answer
    /// comes back this much later
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    pub fn fail_with(&self, fault: Fault) {
        self.state.faults.lock().push_back(fault);
    }

    /// Attempts started, refused ones included
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn chunks_received(&self) -> usize {
        self.state.chunks.load(Ordering::SeqCst)
    }

    /// Most attempts that were in flight at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Stored body for a url, if an upload to it completed
    pub fn object(&self, url: &str) -> Option<Bytes> {
        self.state.objects.read().get(url).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.objects.read().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }
}

#[async_trait]
impl UploadTransport for MemoryTransport {
    async fn open(
        &self,
        grant: &SignedUrlGrant,
        content_length: u64,
    ) -> Result<Box<dyn ChunkWriter>, TransportError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().push(RecordedRequest {
            method: grant.method,
            url: grant.url.clone(),
            headers: grant.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            content_length,
        });

        let fault = self.state.faults.lock().pop_front();
        if fault == Some(Fault::RefuseConnection) {
            return Err(TransportError::transient("connection refused"));
        }

        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(MemoryChunkWriter {
            state: self.state.clone(),
            url: grant.url.clone(),
            expected: content_length,
            body: BytesMut::new(),
            accepted: 0,
            fault,
            delay: self.chunk_delay,
            response_delay: self.response_delay,
        }))
    }
}

struct MemoryChunkWriter {
    state: Arc<TransportState>,
    url: String,
    expected: u64,
    body: BytesMut,
    accepted: usize,
    fault: Option<Fault>,
    delay: Option<Duration>,
    response_delay: Option<Duration>,
}

#[async_trait]
impl ChunkWriter for MemoryChunkWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.fault {
            Some(Fault::ResetAfter(n)) if self.accepted >= n => {
                return Err(TransportError::transient("connection reset by peer"));
            }
            Some(Fault::Stall) => std::future::pending::<()>().await,
            _ => {}
        }

        self.body.extend_from_slice(&chunk);
        self.accepted += 1;
        self.state.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<TransportResponse, TransportError> {
        if let Some(Fault::Status(status)) = self.fault {
            return Ok(TransportResponse::new(status));
        }
        if self.body.len() as u64 != self.expected {
            debug!(
                received = self.body.len(),
                expected = self.expected,
                "body length does not match content length"
            );
            return Ok(TransportResponse::new(400));
        }

        let body = std::mem::take(&mut self.body).freeze();
        let etag = format!("\"{:x}-{}\"", body.len(), self.state.opens.load(Ordering::SeqCst));
        self.state.objects.write().insert(self.url.clone(), body);
        if let Some(delay) = self.response_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(TransportResponse::new(200).with_etag(etag))
    }
}

impl Drop for MemoryChunkWriter {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps every event it receives, in order
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<UploadEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UploadEvent> {
        self.events.lock().clone()
    }

    pub fn terminal_events(&self) -> Vec<UploadEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.is_terminal())
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: UploadEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issuer_queues_failures_and_ttls() {
        let issuer = MemoryIssuer::new("https://storage.test/x");
        let request = UploadRequest::new("x.txt", 1, "text/plain");

        issuer.fail_next(UploadError::unreachable("down"));
        issuer.next_ttl(chrono::Duration::seconds(-1));

        assert!(issuer.issue(&request).await.is_err());
        assert!(issuer.issue(&request).await.unwrap().is_expired());
        let grant = issuer.issue(&request).await.unwrap();
        assert!(!grant.is_expired());
        assert_eq!(grant.header("content-type"), Some("text/plain"));
        assert_eq!(issuer.calls(), 3);
        assert_eq!(issuer.requests().len(), 3);
    }

    #[tokio::test]
    async fn transport_stores_complete_bodies_only() {
        let transport = MemoryTransport::new();
        let grant = SignedUrlGrant::new("mem://a", Utc::now() + chrono::Duration::minutes(1));

        let mut writer = transport.open(&grant, 4).await.unwrap();
        writer.write_chunk(Bytes::from_static(b"ab")).await.unwrap();
        let response = writer.finish().await.unwrap();
        assert_eq!(response.status, 400);
        assert!(transport.object("mem://a").is_none());

        let mut writer = transport.open(&grant, 4).await.unwrap();
        writer.write_chunk(Bytes::from_static(b"ab")).await.unwrap();
        writer.write_chunk(Bytes::from_static(b"cd")).await.unwrap();
        let response = writer.finish().await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.etag.is_some());
        assert_eq!(transport.object("mem://a").unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(transport.requests()[1].content_length, 4);
    }

    #[tokio::test]
    async fn faults_apply_to_one_attempt_each() {
        let transport = MemoryTransport::new();
        transport.fail_with(Fault::RefuseConnection);
        transport.fail_with(Fault::ResetAfter(0));
        let grant = SignedUrlGrant::new("mem://b", Utc::now() + chrono::Duration::minutes(1));

        assert!(transport.open(&grant, 1).await.is_err());

        let mut writer = transport.open(&grant, 1).await.unwrap();
        let err = writer.write_chunk(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(err.is_transient());
        drop(writer);

        let mut writer = transport.open(&grant, 1).await.unwrap();
        writer.write_chunk(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(writer.finish().await.unwrap().status, 200);
        assert_eq!(transport.opens(), 3);
        assert_eq!(transport.peak_concurrency(), 1);
    }
}
