use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::reporter::{classify_status, StatusClass};
use crate::{HttpMethod, SignedUrlGrant, DEFAULT_CONTENT_TYPE};

/// What the upload endpoint answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub etag: Option<String>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self { status, etag: None }
    }

    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Transfer outcome that decides retry behaviour
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection refused or reset, timeouts: worth another attempt
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Retrying will not help
    #[error("transport failure: {0}")]
    Permanent(String),

    /// The endpoint answered with a non-success status
    #[error("upload endpoint answered with status {}", .0.status)]
    Responded(TransportResponse),
}

impl TransportError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Permanent(_) => false,
            Self::Responded(response) => classify_status(response.status) == StatusClass::Transient,
        }
    }
}

/// Opens one upload request per attempt
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Start a request following the grant's method, url and headers.
    /// `content_length` is the exact number of bytes that will be written.
    async fn open(
        &self,
        grant: &SignedUrlGrant,
        content_length: u64,
    ) -> Result<Box<dyn ChunkWriter>, TransportError>;
}

/// Body of an in-flight upload request. Dropping it aborts the request.
#[async_trait]
pub trait ChunkWriter: Send {
    /// Hand one chunk to the request body; resolves once the transport has
    /// accepted it.
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError>;

    /// Close the body and wait for the endpoint's answer
    async fn finish(self: Box<Self>) -> Result<TransportResponse, TransportError>;
}

/// Uploads over HTTP with a streaming `reqwest` body
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn open(
        &self,
        grant: &SignedUrlGrant,
        content_length: u64,
    ) -> Result<Box<dyn ChunkWriter>, TransportError> {
        let method = match grant.method {
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
        };

        // capacity 1: at most one chunk waits while another is on the wire
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1);

        let mut request = self.client.request(method, &grant.url);
        for (k, v) in &grant.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        if grant.header(CONTENT_TYPE.as_str()).is_none() {
            request = request.header(CONTENT_TYPE, DEFAULT_CONTENT_TYPE);
        }
        // signed headers are sent as issued, never twice
        if grant.header(CONTENT_LENGTH.as_str()).is_none() {
            request = request.header(CONTENT_LENGTH, content_length);
        }
        let request = request.body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));

        debug!(method = %grant.method, content_length, "opening upload request");
        let response = tokio::spawn(async move { request.send().await });

        Ok(Box::new(HttpChunkWriter {
            tx: Some(tx),
            response: Some(response),
        }))
    }
}

struct HttpChunkWriter {
    tx: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    response: Option<JoinHandle<Result<reqwest::Response, reqwest::Error>>>,
}

impl HttpChunkWriter {
    async fn await_response(&mut self) -> Result<TransportResponse, TransportError> {
        let handle = self
            .response
            .take()
            .ok_or_else(|| TransportError::permanent("upload request already completed"))?;

        match handle.await {
            Ok(Ok(response)) => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                Ok(TransportResponse {
                    status: response.status().as_u16(),
                    etag,
                })
            }
            Ok(Err(e)) => Err(classify_reqwest(e)),
            Err(e) => Err(TransportError::permanent(format!("upload task failed: {}", e))),
        }
    }
}

#[async_trait]
impl ChunkWriter for HttpChunkWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::permanent("upload body already closed"))?;

        if tx.send(Ok(chunk)).await.is_ok() {
            return Ok(());
        }

        // body receiver is gone: the request finished before we were done
        self.tx = None;
        match self.await_response().await {
            Ok(response) => Err(TransportError::Responded(response)),
            Err(e) => Err(e),
        }
    }

    async fn finish(mut self: Box<Self>) -> Result<TransportResponse, TransportError> {
        self.tx = None;
        self.await_response().await
    }
}

impl Drop for HttpChunkWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.response.take() {
            handle.abort();
        }
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_builder() || err.is_redirect() || err.is_decode() {
        TransportError::permanent(err.to_string())
    } else {
        // connect, timeout, reset and body errors
        TransportError::transient(err.to_string())
    }
}
