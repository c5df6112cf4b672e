//! Image resolution: turn an image reference into an embeddable `data:` URL.
//!
//! ## Resolution order
//!
//! | Step | Input | Result |
//! |---|---|---|
//! | 1 | reference already in the `Image` namespace | cached value, no I/O |
//! | 2 | `data:image/...` reference | the reference itself |
//! | 3 | path ends in `.svg` | fetched as text, `data:image/svg+xml;charset=utf-8,...` |
//! | 4 | anything else | fetched in image mode, decoded, re-encoded as PNG |
//! | 5 | 3 or 4 failed | CORS-mode fetch of the raw bytes, then the proxy |
//!
//! A raster load that exceeds the timeout fails with
//! [`ResolveError::Timeout`] and does not enter the fallback path: the
//! resource is unreachable, and a second attempt would double the wait.
//!
//! ## Origins
//!
//! Relative references resolve against `document_origin`. A reference whose
//! origin matches the document's is fetched with credentials; anything else
//! (including every reference when no document origin is known) is fetched
//! anonymously.
//!
//! Only successful results are cached. Two concurrent resolutions of the
//! same uncached reference both fetch; the first to finish writes the cache
//! and the second returns that stored value.

use crate::cache::{Namespace, ResourceCache};
use crate::config::{ConfigError, NetworkConfig};
use crate::fetch::data_url::{self, preview};
use crate::fetch::{
    Credentials, FetchError, FetchRequest, FetchedResource, Fetcher, RequestMode,
};
use image::ImageFormat;
use log::debug;
use std::future::Future;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default raster load timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("timed out after {timeout_ms} ms loading {reference}")]
    Timeout { reference: String, timeout_ms: u64 },
    #[error("could not decode {reference}: {reason}")]
    DecodeFailure { reference: String, reason: String },
    #[error("failed to fetch {reference}: {reason}")]
    NetworkFailure { reference: String, reason: String },
    #[error("cross-origin load of {reference} blocked: {detail}")]
    CorsBlocked { reference: String, detail: String },
}

impl ResolveError {
    /// The reference the error is about (shortened for data URLs).
    pub fn reference(&self) -> &str {
        match self {
            ResolveError::Timeout { reference, .. }
            | ResolveError::DecodeFailure { reference, .. }
            | ResolveError::NetworkFailure { reference, .. }
            | ResolveError::CorsBlocked { reference, .. } => reference,
        }
    }

    /// Short kind label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Timeout { .. } => "timeout",
            ResolveError::DecodeFailure { .. } => "decode",
            ResolveError::NetworkFailure { .. } => "network",
            ResolveError::CorsBlocked { .. } => "cors",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Proxy base; the percent-encoded absolute URL is appended to it.
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub document_origin: Option<Url>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout: DEFAULT_TIMEOUT,
            document_origin: None,
        }
    }
}

impl ResolveOptions {
    pub fn from_config(network: &NetworkConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            proxy: network.proxy.clone().filter(|p| !p.is_empty()),
            timeout: Duration::from_millis(network.timeout_ms),
            document_origin: network.origin_url()?,
        })
    }

    /// Resolve a reference against the document origin.
    pub fn absolute_url(&self, reference: &str) -> Result<Url, url::ParseError> {
        match Url::parse(reference) {
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.document_origin {
                Some(base) => base.join(reference),
                None => Err(url::ParseError::RelativeUrlWithoutBase),
            },
            other => other,
        }
    }

    /// Whether a request to `url` leaves the document's origin.
    pub fn is_cross_origin(&self, url: &Url) -> bool {
        self.document_origin
            .as_ref()
            .is_none_or(|doc| doc.origin() != url.origin())
    }
}

/// A located reference: absolute URL plus the cross-origin decision.
struct Target {
    url: Url,
    cross_origin: bool,
}

/// Resolves image references through a shared cache and a fetch backend.
#[derive(Clone, Copy)]
pub struct ImageResolver<'a> {
    cache: &'a ResourceCache,
    fetcher: &'a dyn Fetcher,
    options: &'a ResolveOptions,
}

impl<'a> ImageResolver<'a> {
    pub fn new(
        cache: &'a ResourceCache,
        fetcher: &'a dyn Fetcher,
        options: &'a ResolveOptions,
    ) -> Self {
        Self {
            cache,
            fetcher,
            options,
        }
    }

    pub fn cache(&self) -> &'a ResourceCache {
        self.cache
    }

    pub fn options(&self) -> &'a ResolveOptions {
        self.options
    }

    /// Resolve `source_ref` to a `data:` URL.
    pub async fn resolve(&self, source_ref: &str) -> Result<String, ResolveError> {
        if let Some(hit) = self.cache.get(Namespace::Image, source_ref) {
            return Ok(hit);
        }
        if data_url::is_image_data_url(source_ref) {
            return Ok(self
                .cache
                .insert_if_absent(Namespace::Image, source_ref, source_ref));
        }

        let target = self.locate(source_ref)?;
        let resolved = if is_svg_reference(&target.url) {
            match self.load_svg(source_ref, &target).await {
                Ok(data) => data,
                Err(err) => self.fallback(source_ref, &target, err).await?,
            }
        } else {
            match self.load_raster(source_ref, &target).await {
                Ok(data) => data,
                Err(err @ ResolveError::Timeout { .. }) => return Err(err),
                Err(err) => self.fallback(source_ref, &target, err).await?,
            }
        };

        Ok(self
            .cache
            .insert_if_absent(Namespace::Image, source_ref, resolved))
    }

    fn locate(&self, reference: &str) -> Result<Target, ResolveError> {
        let url = self
            .options
            .absolute_url(reference.trim())
            .map_err(|e| ResolveError::NetworkFailure {
                reference: preview(reference),
                reason: match e {
                    url::ParseError::RelativeUrlWithoutBase => {
                        "relative reference and no document origin".to_string()
                    }
                    other => format!("invalid URL: {other}"),
                },
            })?;
        let cross_origin = self.options.is_cross_origin(&url);
        Ok(Target { url, cross_origin })
    }

    fn request(&self, url: Url, mode: RequestMode, cross_origin: bool) -> FetchRequest {
        FetchRequest::new(url, mode, cross_origin).with_origin(self.options.document_origin.as_ref())
    }

    async fn within_timeout<T>(
        &self,
        reference: &str,
        work: impl Future<Output = Result<T, ResolveError>>,
    ) -> Result<T, ResolveError> {
        match tokio::time::timeout(self.options.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout {
                reference: preview(reference),
                timeout_ms: self.options.timeout.as_millis() as u64,
            }),
        }
    }

    /// Image-mode load, decode and PNG re-encode under the timeout.
    async fn load_raster(&self, reference: &str, target: &Target) -> Result<String, ResolveError> {
        let request = self.request(target.url.clone(), RequestMode::Image, target.cross_origin);
        self.within_timeout(reference, async {
            let fetched = self
                .fetcher
                .fetch(&request)
                .await
                .map_err(|e| fetch_failure(reference, e))?;
            let png = reencode_png(&fetched.bytes).map_err(|reason| ResolveError::DecodeFailure {
                reference: preview(reference),
                reason,
            })?;
            Ok(data_url::encode_base64(&png, "image/png"))
        })
        .await
    }

    async fn load_svg(&self, reference: &str, target: &Target) -> Result<String, ResolveError> {
        let request = self.request(target.url.clone(), RequestMode::Cors, target.cross_origin);
        let fetched = self
            .within_timeout(reference, async {
                self.fetcher
                    .fetch(&request)
                    .await
                    .map_err(|e| fetch_failure(reference, e))
            })
            .await?;
        let decode_failure = |reason: &str| ResolveError::DecodeFailure {
            reference: preview(reference),
            reason: reason.to_string(),
        };
        let text = String::from_utf8(fetched.bytes).map_err(|_| decode_failure("SVG is not UTF-8"))?;
        if !text.contains("<svg") {
            return Err(decode_failure("no <svg> element in document"));
        }
        Ok(data_url::encode_text(&text, "image/svg+xml"))
    }

    /// Direct CORS fetch, then the proxy when one is configured.
    async fn fallback(
        &self,
        reference: &str,
        target: &Target,
        cause: ResolveError,
    ) -> Result<String, ResolveError> {
        debug!("{cause}; retrying {} with a direct fetch", target.url);
        let direct = self
            .fetch_embedded(
                reference,
                self.request(target.url.clone(), RequestMode::Cors, target.cross_origin),
            )
            .await;
        let direct_err = match direct {
            Ok(data) => return Ok(data),
            Err(err) => err,
        };

        let Some(proxy) = &self.options.proxy else {
            return Err(direct_err);
        };
        let proxied = format!("{proxy}{}", urlencoding::encode(target.url.as_str()));
        debug!("{direct_err}; retrying through proxy {proxied}");
        let proxy_url = Url::parse(&proxied).map_err(|e| ResolveError::CorsBlocked {
            reference: preview(reference),
            detail: format!("direct fetch failed ({direct_err}); proxy URL is invalid: {e}"),
        })?;
        let request = self
            .request(proxy_url.clone(), RequestMode::Cors, self.options.is_cross_origin(&proxy_url))
            .with_credentials(Credentials::Omit);

        self.fetch_embedded(reference, request)
            .await
            .map_err(|proxy_err| ResolveError::CorsBlocked {
                reference: preview(reference),
                detail: format!(
                    "direct fetch failed ({direct_err}); proxy retry via {proxy} failed ({proxy_err})"
                ),
            })
    }

    /// Fetch raw bytes and embed them as-is, rejecting non-image payloads.
    async fn fetch_embedded(
        &self,
        reference: &str,
        request: FetchRequest,
    ) -> Result<String, ResolveError> {
        self.within_timeout(reference, async {
            let fetched = self
                .fetcher
                .fetch(&request)
                .await
                .map_err(|e| fetch_failure(reference, e))?;
            embed_fetched(reference, fetched)
        })
        .await
    }
}

fn fetch_failure(reference: &str, err: FetchError) -> ResolveError {
    match err {
        FetchError::Cors(detail) => ResolveError::CorsBlocked {
            reference: preview(reference),
            detail,
        },
        other => ResolveError::NetworkFailure {
            reference: preview(reference),
            reason: other.to_string(),
        },
    }
}

fn embed_fetched(reference: &str, fetched: FetchedResource) -> Result<String, ResolveError> {
    let mime = if fetched.is_image() {
        fetched.content_type.clone().unwrap_or_default()
    } else {
        match data_url::sniff_image_mime(&fetched.bytes) {
            Some(mime) => mime.to_string(),
            None => {
                return Err(ResolveError::DecodeFailure {
                    reference: preview(reference),
                    reason: format!(
                        "payload is not an image ({})",
                        fetched.content_type.as_deref().unwrap_or("no content type")
                    ),
                });
            }
        }
    };
    Ok(data_url::encode_base64(&fetched.bytes, &mime))
}

/// Decode any supported raster format and re-encode it as RGBA PNG.
fn reencode_png(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let decoded = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .to_rgba8()
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| format!("PNG encode failed: {e}"))?;
    Ok(out.into_inner())
}

/// `.svg` extension on the URL path, ignoring query and fragment.
pub fn is_svg_reference(url: &Url) -> bool {
    let path = url.path();
    path.len() >= 4
        && path
            .get(path.len() - 4..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(".svg"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::backend::tests::{MockFetcher, MockResponse};
    use crate::test_helpers::png_bytes;

    const SAME: &str = "https://app.test/pic.png";
    const CROSS: &str = "https://cdn.test/pic.png";
    const PROXY: &str = "https://proxy.test/?url=";

    fn options() -> ResolveOptions {
        ResolveOptions {
            document_origin: Some(Url::parse("https://app.test/page/").unwrap()),
            ..ResolveOptions::default()
        }
    }

    fn with_proxy() -> ResolveOptions {
        ResolveOptions {
            proxy: Some(PROXY.to_string()),
            ..options()
        }
    }

    fn proxied(url: &str) -> String {
        format!("{PROXY}{}", urlencoding::encode(url))
    }

    // =========================================================================
    // Cache and identity
    // =========================================================================

    #[tokio::test]
    async fn cache_hit_performs_no_io() {
        let cache = ResourceCache::new();
        cache.set(Namespace::Image, SAME, "data:image/png;base64,CACHED");
        let fetcher = MockFetcher::new();
        let opts = options();

        let resolver = ImageResolver::new(&cache, &fetcher, &opts);
        let first = resolver.resolve(SAME).await.unwrap();
        let second = resolver.resolve(SAME).await.unwrap();

        assert_eq!(first, "data:image/png;base64,CACHED");
        assert_eq!(second, first);
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn data_url_is_returned_unchanged() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new();
        let opts = options();
        let data = "data:image/gif;base64,R0lGODlhAQABAAAAACw=";

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(data)
            .await
            .unwrap();

        assert_eq!(out, data);
        assert_eq!(fetcher.request_count(), 0);
        assert!(cache.has(Namespace::Image, data));
    }

    #[tokio::test]
    async fn second_resolution_uses_cache() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new().serve(SAME, RequestMode::Image, png_bytes(3, 2), "image/png");
        let opts = options();
        let resolver = ImageResolver::new(&cache, &fetcher, &opts);

        let first = resolver.resolve(SAME).await.unwrap();
        let second = resolver.resolve(SAME).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolutions_converge() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new().serve(CROSS, RequestMode::Image, png_bytes(2, 2), "image/png");
        let opts = options();
        let resolver = ImageResolver::new(&cache, &fetcher, &opts);

        let (a, b) = tokio::join!(resolver.resolve(CROSS), resolver.resolve(CROSS));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(cache.len(Namespace::Image), 1);
        assert_eq!(cache.stats().stores, 1);
    }

    // =========================================================================
    // Raster path
    // =========================================================================

    #[tokio::test]
    async fn raster_is_reencoded_as_png() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new().serve(SAME, RequestMode::Image, png_bytes(4, 4), "image/png");
        let opts = options();

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(SAME)
            .await
            .unwrap();

        assert!(out.starts_with("data:image/png;base64,"));
        let decoded = data_url::decode(&out).unwrap();
        let img = image::load_from_memory(&decoded.bytes).unwrap();
        assert_eq!((img.width(), img.height()), (4, 4));
        assert_eq!(cache.get(Namespace::Image, SAME), Some(out));
    }

    #[tokio::test]
    async fn credentials_follow_origin_comparison() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new()
            .serve(SAME, RequestMode::Image, png_bytes(1, 1), "image/png")
            .serve(CROSS, RequestMode::Image, png_bytes(1, 1), "image/png");
        let opts = options();
        let resolver = ImageResolver::new(&cache, &fetcher, &opts);

        resolver.resolve(SAME).await.unwrap();
        resolver.resolve(CROSS).await.unwrap();

        let requests = fetcher.requests();
        assert_eq!(requests[0].credentials, Credentials::Include);
        assert!(!requests[0].cross_origin);
        assert_eq!(requests[1].credentials, Credentials::Omit);
        assert!(requests[1].cross_origin);
    }

    #[tokio::test]
    async fn relative_reference_resolves_against_origin() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new().serve(
            "https://app.test/page/img/a.png",
            RequestMode::Image,
            png_bytes(1, 1),
            "image/png",
        );
        let opts = options();

        ImageResolver::new(&cache, &fetcher, &opts)
            .resolve("img/a.png")
            .await
            .unwrap();

        // Cached under the raw reference, not the absolute URL
        assert!(cache.has(Namespace::Image, "img/a.png"));
    }

    #[tokio::test]
    async fn relative_reference_without_origin_fails() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new();
        let opts = ResolveOptions::default();

        let err = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve("img/a.png")
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::NetworkFailure { .. }));
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_load_times_out_and_is_not_cached() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new().route(CROSS, RequestMode::Image, MockResponse::Hang);
        let opts = with_proxy();

        let err = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ResolveError::Timeout {
                reference: CROSS.to_string(),
                timeout_ms: 5000
            }
        );
        assert!(!cache.has(Namespace::Image, CROSS));
        // No fallback after a timeout
        assert_eq!(fetcher.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_direct_fetch_still_escalates_to_proxy() {
        let cache = ResourceCache::new();
        let png = png_bytes(1, 1);
        let fetcher = MockFetcher::new()
            .fail(CROSS, RequestMode::Image, FetchError::Network("refused".into()))
            .route(CROSS, RequestMode::Cors, MockResponse::Hang)
            .serve(&proxied(CROSS), RequestMode::Cors, png.clone(), "image/png");
        let opts = with_proxy();

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap();

        assert_eq!(out, data_url::encode_base64(&png, "image/png"));
        assert_eq!(fetcher.request_count(), 3);
        assert_eq!(fetcher.requests()[2].url.as_str(), proxied(CROSS));
    }

    // =========================================================================
    // SVG path
    // =========================================================================

    #[tokio::test]
    async fn svg_is_kept_as_text() {
        let svg = "<svg xmlns=\"http://www.w3.org/2000/svg\"><rect/></svg>";
        let url = "https://app.test/icon.SVG?v=2";
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new().serve(url, RequestMode::Cors, svg.as_bytes().to_vec(), "image/svg+xml");
        let opts = options();

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(url)
            .await
            .unwrap();

        assert_eq!(out, data_url::encode_text(svg, "image/svg+xml"));
        assert_eq!(fetcher.requests()[0].mode, RequestMode::Cors);
    }

    #[tokio::test]
    async fn svg_failure_falls_through_to_proxy() {
        let url = "https://cdn.test/logo.svg";
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new()
            .fail(url, RequestMode::Cors, FetchError::Cors("no header".into()))
            .serve(&proxied(url), RequestMode::Cors, b"<svg/>".to_vec(), "image/svg+xml");
        let opts = with_proxy();

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(url)
            .await
            .unwrap();

        assert!(out.starts_with("data:image/svg+xml;base64,"));
    }

    #[test]
    fn svg_detection_ignores_query_and_fragment() {
        let svg = |s: &str| is_svg_reference(&Url::parse(s).unwrap());
        assert!(svg("https://a.test/x.svg"));
        assert!(svg("https://a.test/x.SVG?cache=1#frag"));
        assert!(!svg("https://a.test/x.png?format=.svg"));
        assert!(!svg("https://a.test/svg"));
    }

    // =========================================================================
    // Fallback escalation
    // =========================================================================

    #[tokio::test]
    async fn undecodable_load_falls_back_to_direct_fetch() {
        let cache = ResourceCache::new();
        let png = png_bytes(2, 2);
        let fetcher = MockFetcher::new()
            .serve(CROSS, RequestMode::Image, b"garbage".to_vec(), "image/png")
            .serve(CROSS, RequestMode::Cors, png.clone(), "image/png");
        let opts = options();

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap();

        assert_eq!(out, data_url::encode_base64(&png, "image/png"));
        let modes: Vec<_> = fetcher.requests().iter().map(|r| r.mode).collect();
        assert_eq!(modes, vec![RequestMode::Image, RequestMode::Cors]);
    }

    #[tokio::test]
    async fn direct_fetch_sniffs_missing_content_type() {
        let cache = ResourceCache::new();
        let png = png_bytes(1, 1);
        let fetcher = MockFetcher::new()
            .fail(CROSS, RequestMode::Image, FetchError::Network("reset".into()))
            .serve(CROSS, RequestMode::Cors, png.clone(), "application/octet-stream");
        let opts = options();

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap();

        assert_eq!(out, data_url::encode_base64(&png, "image/png"));
    }

    #[tokio::test]
    async fn direct_fetch_rejects_non_image_payload() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new()
            .fail(CROSS, RequestMode::Image, FetchError::Network("reset".into()))
            .serve(CROSS, RequestMode::Cors, b"<html>login</html>".to_vec(), "text/html");
        let opts = options();

        let err = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::DecodeFailure { .. }));
        assert!(err.to_string().contains("text/html"));
    }

    #[tokio::test]
    async fn proxy_used_after_direct_fetch_fails() {
        let cache = ResourceCache::new();
        let png = png_bytes(1, 1);
        let fetcher = MockFetcher::new()
            .fail(CROSS, RequestMode::Image, FetchError::Network("refused".into()))
            .fail(CROSS, RequestMode::Cors, FetchError::Cors("no header".into()))
            .serve(&proxied(CROSS), RequestMode::Cors, png.clone(), "image/png");
        let opts = with_proxy();

        let out = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap();

        assert_eq!(out, data_url::encode_base64(&png, "image/png"));
        let requests = fetcher.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].url.as_str(), proxied(CROSS));
        assert_eq!(requests[2].credentials, Credentials::Omit);
    }

    #[tokio::test]
    async fn exhausted_fallbacks_report_cors_and_proxy() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new()
            .fail(CROSS, RequestMode::Image, FetchError::Network("refused".into()))
            .fail(CROSS, RequestMode::Cors, FetchError::Cors("no header".into()))
            .fail(
                &proxied(CROSS),
                RequestMode::Cors,
                FetchError::Status {
                    status: 502,
                    url: proxied(CROSS),
                },
            );
        let opts = with_proxy();

        let err = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap_err();

        let ResolveError::CorsBlocked { detail, .. } = &err else {
            panic!("expected CorsBlocked, got {err:?}");
        };
        assert!(detail.contains("proxy retry"));
        assert!(detail.contains("502"));
        assert!(!cache.has(Namespace::Image, CROSS));
    }

    #[tokio::test]
    async fn without_proxy_direct_error_surfaces() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new()
            .fail(CROSS, RequestMode::Image, FetchError::Network("refused".into()))
            .fail(CROSS, RequestMode::Cors, FetchError::Cors("no header".into()));
        let opts = options();

        let err = ImageResolver::new(&cache, &fetcher, &opts)
            .resolve(CROSS)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "cors");
        assert_eq!(fetcher.request_count(), 2);
    }

    #[tokio::test]
    async fn failure_is_retried_on_next_call() {
        let cache = ResourceCache::new();
        let fetcher = MockFetcher::new();
        let opts = options();
        let resolver = ImageResolver::new(&cache, &fetcher, &opts);

        assert!(resolver.resolve(CROSS).await.is_err());
        assert!(resolver.resolve(CROSS).await.is_err());

        // Image + CORS attempt each time, nothing cached in between
        assert_eq!(fetcher.request_count(), 4);
        assert!(cache.is_empty());
    }

    // =========================================================================
    // Options
    // =========================================================================

    #[test]
    fn options_from_config() {
        let network = NetworkConfig {
            timeout_ms: 250,
            proxy: Some("https://p.test/?u=".into()),
            document_origin: Some("https://app.test/".into()),
            ..NetworkConfig::default()
        };
        let opts = ResolveOptions::from_config(&network).unwrap();
        assert_eq!(opts.timeout, Duration::from_millis(250));
        assert_eq!(opts.proxy.as_deref(), Some("https://p.test/?u="));
        assert!(!opts.is_cross_origin(&Url::parse("https://app.test/x.png").unwrap()));
        assert!(opts.is_cross_origin(&Url::parse("http://app.test/x.png").unwrap()));
    }

    #[test]
    fn no_origin_means_cross_origin() {
        let opts = ResolveOptions::default();
        assert!(opts.is_cross_origin(&Url::parse("https://app.test/x.png").unwrap()));
    }
}
