//! CSS `background-image` layers.
//!
//! A computed `background-image` value is a comma-separated list of layers.
//! [`split_background_image`] splits it; [`BackgroundResolver::resolve_entry`]
//! handles one layer at a time:
//!
//! - `url(...)` layers are normalized to an absolute, percent-encoded URL,
//!   looked up in the `Background` cache namespace and, on a miss, resolved
//!   through the [`ImageResolver`];
//! - gradients and `none` pass through untouched;
//! - anything else also passes through. CSS this module does not understand
//!   is never rewritten.

use crate::cache::Namespace;
use crate::fetch::data_url;
use crate::image_resolver::{ImageResolver, ResolveError};
use log::debug;

const GRADIENT_FUNCTIONS: &[&str] = &[
    "linear-gradient(",
    "radial-gradient(",
    "conic-gradient(",
    "repeating-linear-gradient(",
    "repeating-radial-gradient(",
    "repeating-conic-gradient(",
];

/// What the caller wants back from a resolved `url(...)` layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    /// Return the rewritten `url("data:...")` layer.
    Inline,
    /// Populate the cache only; the result is `None`.
    WarmOnly,
}

/// Classification of a single layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// `url(...)` with its unquoted payload.
    Url(String),
    Gradient,
    None,
    Other,
}

impl Layer {
    pub fn classify(entry: &str) -> Layer {
        if let Some(payload) = extract_url(entry) {
            return Layer::Url(payload);
        }
        let trimmed = entry.trim();
        if trimmed.eq_ignore_ascii_case("none") {
            Layer::None
        } else if is_gradient(trimmed) {
            Layer::Gradient
        } else {
            Layer::Other
        }
    }
}

pub fn is_gradient(entry: &str) -> bool {
    let lower = entry.trim_start().to_ascii_lowercase();
    GRADIENT_FUNCTIONS.iter().any(|f| lower.starts_with(f))
}

/// Payload of the first `url(...)` in `entry`, with quotes removed.
pub fn extract_url(entry: &str) -> Option<String> {
    let start = entry.to_ascii_lowercase().find("url(")? + 4;
    let rest = entry[start..].trim_start();
    let mut chars = rest.char_indices();
    let payload = match chars.next()? {
        (_, quote @ ('"' | '\'')) => {
            let mut escaped = false;
            let end = chars
                .find(|&(_, c)| {
                    let close = c == quote && !escaped;
                    escaped = c == '\\' && !escaped;
                    close
                })?
                .0;
            &rest[1..end]
        }
        _ => rest[..rest.find(')')?].trim_end(),
    };
    (!payload.is_empty()).then(|| payload.to_string())
}

/// Split a `background-image` value on top-level commas.
///
/// Commas nested inside parentheses or quotes do not split.
pub fn split_background_image(value: &str) -> Vec<String> {
    let mut layers = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut current = String::new();

    for c in value.chars() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                push_layer(&mut layers, &current);
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    push_layer(&mut layers, &current);
    layers
}

fn push_layer(layers: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        layers.push(trimmed.to_string());
    }
}

/// Resolves background layers, keyed in the `Background` namespace.
#[derive(Clone, Copy)]
pub struct BackgroundResolver<'a> {
    images: ImageResolver<'a>,
}

impl<'a> BackgroundResolver<'a> {
    pub fn new(images: ImageResolver<'a>) -> Self {
        Self { images }
    }

    /// Cache key for a `url(...)` payload: absolute and percent-encoded.
    pub fn normalize(&self, payload: &str) -> String {
        let trimmed = payload.trim();
        if data_url::is_data_url(trimmed) {
            return trimmed.to_string();
        }
        match self.images.options().absolute_url(trimmed) {
            Ok(url) => url.to_string(),
            Err(_) => trimmed.replace(' ', "%20"),
        }
    }

    /// Resolve one layer.
    ///
    /// `Ok(None)` only in [`EntryMode::WarmOnly`] for a `url(...)` layer.
    /// Non-`url` layers are returned unchanged in both modes.
    pub async fn resolve_entry(
        &self,
        entry: &str,
        mode: EntryMode,
    ) -> Result<Option<String>, ResolveError> {
        let payload = match Layer::classify(entry) {
            Layer::Url(payload) => payload,
            Layer::Other => {
                debug!("background layer left as-is: {}", data_url::preview(entry));
                return Ok(Some(entry.to_string()));
            }
            Layer::Gradient | Layer::None => return Ok(Some(entry.to_string())),
        };

        let key = self.normalize(&payload);
        let cache = self.images.cache();
        let data = match cache.get(Namespace::Background, &key) {
            Some(hit) => hit,
            None => {
                let resolved = self.images.resolve(&key).await?;
                cache.insert_if_absent(Namespace::Background, key, resolved)
            }
        };

        Ok(match mode {
            EntryMode::Inline => Some(format!("url(\"{data}\")")),
            EntryMode::WarmOnly => None,
        })
    }
}
