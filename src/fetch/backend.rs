//! Fetch backend trait and shared request/response types.
//!
//! The [`Fetcher`] trait is the only way the resolvers reach the outside
//! world. The production implementation is
//! [`HttpFetcher`](super::http_backend::HttpFetcher); tests use the
//! [`MockFetcher`](tests::MockFetcher) below, which records every request.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("blocked by CORS: {0}")]
    Cors(String),
    #[error("unsupported URL: {0}")]
    Unsupported(String),
}

/// How the request is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestMode {
    /// Plain image load, the way an `<img>` element requests its source.
    Image,
    /// Explicit fetch in CORS mode (fallback and text loads).
    Cors,
}

/// Whether ambient credentials (cookies) accompany the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Credentials {
    Include,
    Omit,
}

impl Credentials {
    /// Same-origin requests send credentials; cross-origin ones are anonymous.
    pub fn for_origin(cross_origin: bool) -> Self {
        if cross_origin {
            Credentials::Omit
        } else {
            Credentials::Include
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub mode: RequestMode,
    pub credentials: Credentials,
    /// Serialized origin of the requesting document, if known.
    pub origin: Option<String>,
    pub cross_origin: bool,
}

impl FetchRequest {
    pub fn new(url: Url, mode: RequestMode, cross_origin: bool) -> Self {
        Self {
            url,
            mode,
            credentials: Credentials::for_origin(cross_origin),
            origin: None,
            cross_origin,
        }
    }

    pub fn with_origin(mut self, origin: Option<&Url>) -> Self {
        self.origin = origin.map(|o| o.origin().ascii_serialization());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Body and content type of a fetched resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResource {
    pub bytes: Vec<u8>,
    /// `Content-Type` without parameters, lowercased.
    pub content_type: Option<String>,
}

impl FetchedResource {
    pub fn new(bytes: Vec<u8>, content_type: Option<&str>) -> Self {
        Self {
            bytes,
            content_type: content_type.map(normalize_mime),
        }
    }

    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

/// Strip parameters (`; charset=...`) and lowercase a MIME type.
pub fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Trait for fetch backends.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResource, FetchError>;
}
