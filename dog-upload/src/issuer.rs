use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{HttpMethod, SignedUrlGrant, UploadError, UploadRequest, UploadResult};

/// Trusted source of signed-URL grants
#[async_trait]
pub trait GrantIssuer: Send + Sync {
    /// Ask for a grant covering `request`.
    ///
    /// Network failures map to `IssuerUnreachable`, refusals and malformed
    /// answers to `IssuerRejected`.
    async fn issue(&self, request: &UploadRequest) -> UploadResult<SignedUrlGrant>;
}

/// Body posted to the issuer endpoint
#[derive(Debug, Serialize)]
struct IssueBody<'a> {
    file_name: &'a str,
    size_bytes: u64,
    content_type: &'a str,
}

/// Grant as answered by the issuer endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerResponse {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds from now, for issuers that don't send an absolute time
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl IssuerResponse {
    pub fn into_grant(self, now: DateTime<Utc>) -> UploadResult<SignedUrlGrant> {
        if self.url.trim().is_empty() {
            return Err(UploadError::rejected(None, "grant has an empty url"));
        }
        reqwest::Url::parse(&self.url)
            .map_err(|e| UploadError::rejected(None, format!("grant url is invalid: {}", e)))?;

        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .ok_or_else(|| UploadError::rejected(None, "grant expires_in is out of range"))?,
            (None, None) => {
                return Err(UploadError::rejected(None, "grant has no expiry"));
            }
        };

        Ok(SignedUrlGrant {
            url: self.url,
            method: self.method,
            headers: self.headers,
            expires_at,
        })
    }
}

/// Issuer reached over HTTP: POSTs the request as JSON and reads the grant
/// from the JSON answer.
#[derive(Debug, Clone)]
pub struct HttpGrantIssuer {
    client: reqwest::Client,
    endpoint: String,
    headers: BTreeMap<String, String>,
}

impl HttpGrantIssuer {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client<S: Into<String>>(client: reqwest::Client, endpoint: S) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Header sent with every issuer call
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_bearer_token<S: AsRef<str>>(self, token: S) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.with_header("Authorization", value)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GrantIssuer for HttpGrantIssuer {
    async fn issue(&self, request: &UploadRequest) -> UploadResult<SignedUrlGrant> {
        let body = IssueBody {
            file_name: &request.file_name,
            size_bytes: request.size_bytes,
            content_type: &request.content_type,
        };

        let mut call = self.client.post(&self.endpoint).json(&body);
        for (k, v) in &self.headers {
            call = call.header(k.as_str(), v.as_str());
        }

        let response = call
            .send()
            .await
            .map_err(|e| UploadError::unreachable(format!("{}: {}", self.endpoint, e)))?;

        let status = response.status();
        debug!(endpoint = %self.endpoint, status = status.as_u16(), "issuer answered");

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = match text.trim() {
                "" => status.canonical_reason().unwrap_or("request refused").to_string(),
                body => truncate(body, 512),
            };
            return Err(UploadError::rejected(Some(status.as_u16()), message));
        }

        let grant: IssuerResponse = response.json().await.map_err(|e| {
            UploadError::rejected(Some(status.as_u16()), format!("malformed grant: {}", e))
        })?;

        grant.into_grant(Utc::now())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Serves one pre-issued grant, for callers that already hold a signed URL
#[derive(Debug, Clone)]
pub struct FixedGrantIssuer {
    grant: SignedUrlGrant,
}

impl FixedGrantIssuer {
    pub fn new(grant: SignedUrlGrant) -> Self {
        Self { grant }
    }

    /// A PUT grant for `url` valid for `ttl`
    pub fn put_url<S: Into<String>>(url: S, ttl: std::time::Duration) -> UploadResult<Self> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| UploadError::invalid("grant ttl is out of range"))?;
        Ok(Self::new(SignedUrlGrant::new(url, expires_at)))
    }
}

#[async_trait]
impl GrantIssuer for FixedGrantIssuer {
    async fn issue(&self, _request: &UploadRequest) -> UploadResult<SignedUrlGrant> {
        Ok(self.grant.clone())
    }
}
