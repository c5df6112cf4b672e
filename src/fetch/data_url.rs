//! `data:` URL encoding, decoding and payload sniffing (RFC 2397).

use super::backend::{FetchError, FetchedResource};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const DATA_URL_PREFIX: &str = "data:";
const DEFAULT_MEDIA_TYPE: &str = "text/plain";

/// True for `data:image/...` references, case-insensitively.
pub fn is_image_data_url(reference: &str) -> bool {
    let trimmed = reference.trim_start();
    trimmed
        .get(..11)
        .is_some_and(|head| head.eq_ignore_ascii_case("data:image/"))
}

/// True for any `data:` reference.
pub fn is_data_url(reference: &str) -> bool {
    reference
        .trim_start()
        .get(..DATA_URL_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(DATA_URL_PREFIX))
}

/// Binary payload as `data:<mime>;base64,...`.
pub fn encode_base64(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Text payload as `data:<mime>;charset=utf-8,<percent-encoded>`.
///
/// Used for SVG documents, which stay vector and readable.
pub fn encode_text(text: &str, mime: &str) -> String {
    format!(
        "data:{mime};charset=utf-8,{}",
        urlencoding::encode(text)
    )
}

/// Decode a `data:` URL into bytes and content type.
pub fn decode(url: &str) -> Result<FetchedResource, FetchError> {
    let trimmed = url.trim();
    if !is_data_url(trimmed) {
        return Err(FetchError::Unsupported(format!(
            "not a data URL: {}",
            preview(trimmed)
        )));
    }
    let rest = &trimmed[DATA_URL_PREFIX.len()..];
    let (metadata, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::Unsupported("data URL without a comma".into()))?;

    let mut parts = metadata.split(';');
    let media_type = parts.next().map(str::trim).filter(|m| !m.is_empty());
    let is_base64 = parts.any(|p| p.trim().eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        let cleaned: Vec<u8> = payload
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(cleaned)
            .map_err(|e| FetchError::Unsupported(format!("invalid base64 payload: {e}")))?
    } else {
        urlencoding::decode_binary(payload.as_bytes()).into_owned()
    };

    Ok(FetchedResource::new(
        bytes,
        Some(media_type.unwrap_or(DEFAULT_MEDIA_TYPE)),
    ))
}

/// Identify an image payload from its leading bytes.
///
/// Raster formats come from `image::guess_format`; SVG is recognized by an
/// `<svg` root element near the start of the document.
pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if let Ok(format) = image::guess_format(bytes) {
        return Some(format.to_mime_type());
    }
    let head = &bytes[..bytes.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    if (text.starts_with("<svg") || text.starts_with("<?xml")) && text.contains("<svg") {
        return Some("image/svg+xml");
    }
    None
}

/// Shorten long references (usually data URLs) for messages.
pub fn preview(reference: &str) -> String {
    const MAX: usize = 64;
    match reference.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &reference[..idx]),
        None => reference.to_string(),
    }
}
