//! Production fetch backend.
//!
//! ## Scheme mapping
//!
//! | Scheme | Handling |
//! |---|---|
//! | `http`, `https` | `reqwest` GET, body read fully |
//! | `file` | `tokio::fs::read`, content type sniffed |
//! | `data` | decoded in place, no I/O |
//!
//! ## Browser negotiation
//!
//! Outside a browser there is no ambient cookie jar and no CORS. The fetcher
//! reproduces both where they matter for snapshot fidelity:
//!
//! - a configured cookie header is attached only to requests whose
//!   credentials mode is [`Credentials::Include`] (same-origin requests);
//! - with `enforce_cors` on, a cross-origin request in [`RequestMode::Cors`]
//!   is rejected unless the response carries a matching
//!   `Access-Control-Allow-Origin`.

use super::backend::{
    Credentials, FetchError, FetchRequest, FetchedResource, Fetcher, RequestMode,
};
use super::data_url;
use crate::config::NetworkConfig;
use async_trait::async_trait;
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, COOKIE, HeaderMap, ORIGIN};

/// User-Agent sent with every HTTP request.
pub const DEFAULT_USER_AGENT: &str = concat!("snapframe/", env!("CARGO_PKG_VERSION"));

pub struct HttpFetcher {
    client: reqwest::Client,
    cookie: Option<String>,
    enforce_cors: bool,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::from_config(&NetworkConfig::default())
    }

    pub fn from_config(network: &NetworkConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            cookie: network.cookie.clone().filter(|c| !c.is_empty()),
            enforce_cors: network.enforce_cors,
        })
    }

    async fn fetch_http(&self, request: &FetchRequest) -> Result<FetchedResource, FetchError> {
        let mut builder = self.client.get(request.url.clone());
        if request.credentials == Credentials::Include
            && let Some(cookie) = &self.cookie
        {
            builder = builder.header(COOKIE, cookie);
        }
        if request.mode == RequestMode::Cors
            && let Some(origin) = &request.origin
        {
            builder = builder.header(ORIGIN, origin);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(format!("failed to fetch {}: {e}", request.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: request.url.to_string(),
            });
        }
        if self.enforce_cors {
            check_cors(request, response.headers())?;
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(format!("failed to read body of {}: {e}", request.url)))?;
        Ok(FetchedResource::new(bytes.to_vec(), content_type.as_deref()))
    }

    async fn fetch_file(&self, request: &FetchRequest) -> Result<FetchedResource, FetchError> {
        let path = request
            .url
            .to_file_path()
            .map_err(|()| FetchError::Unsupported(format!("invalid file URL {}", request.url)))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FetchError::Network(format!("failed to read {}: {e}", path.display())))?;
        let mime = data_url::sniff_image_mime(&bytes);
        Ok(FetchedResource::new(bytes, mime))
    }
}

/// Browser CORS check for a successful response.
fn check_cors(request: &FetchRequest, headers: &HeaderMap) -> Result<(), FetchError> {
    if request.mode != RequestMode::Cors || !request.cross_origin {
        return Ok(());
    }
    let allowed = headers
        .get(ACCESS_CONTROL_ALLOW_ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    let permitted = match (allowed, request.origin.as_deref()) {
        // A wildcard never satisfies a credentialed request.
        (Some("*"), _) => request.credentials == Credentials::Omit,
        (Some(value), Some(origin)) => value == origin,
        _ => false,
    };
    if permitted {
        Ok(())
    } else {
        Err(FetchError::Cors(format!(
            "{} has no matching Access-Control-Allow-Origin",
            request.url
        )))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResource, FetchError> {
        match request.url.scheme() {
            "http" | "https" => self.fetch_http(request).await,
            "file" => self.fetch_file(request).await,
            "data" => data_url::decode(request.url.as_str()),
            other => Err(FetchError::Unsupported(format!(
                "unsupported URL scheme {other}"
            ))),
        }
    }
}
