//! Collaborators of the capture pipeline.
//!
//! The pipeline owns ordering, caching and failure policy. The mechanical
//! steps around it sit behind traits so hosts can swap them:
//!
//! | Trait | Default | Job |
//! |---|---|---|
//! | [`Cloner`] | [`ScopedCloner`] | independent copy of the tree plus scoped class CSS |
//! | [`BaseCssGenerator`] | [`UserAgentBaseCss`] | base rules for a set of tag names |
//! | [`FontEmbedder`] | [`NoFonts`], [`FontFaceEmbedder`] | `@font-face` CSS with inlined sources |

use crate::capture::CaptureOptions;
use crate::fetch::{FetchRequest, Fetcher, RequestMode, data_url};
use crate::image_resolver::ResolveOptions;
use crate::tree::{Element, Node};
use async_trait::async_trait;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

/// Marks clone elements standing in for excluded originals.
pub const PLACEHOLDER_ATTR: &str = "data-snapframe-placeholder";

/// Computed properties the pipeline writes itself rather than scoping.
const PIPELINE_PROPERTIES: &[&str] = &["background-image"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error("clone failed: {0}")]
    Cloning(String),
    #[error("font embedding failed: {0}")]
    Font(String),
}

// =============================================================================
// Cloning
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedClone {
    pub clone: Element,
    /// Rules for the generated `sf-*` classes used in `clone`.
    pub class_css: String,
}

pub trait Cloner: Send + Sync {
    fn prepare_clone(
        &self,
        element: &Element,
        options: &CaptureOptions,
    ) -> Result<PreparedClone, CollabError>;
}

/// Deep copy that moves computed styles into content-addressed classes.
///
/// Elements matched by `exclude` or rejected by the filter become empty
/// placeholders of the same size. The root is never excluded.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopedCloner;

impl Cloner for ScopedCloner {
    fn prepare_clone(
        &self,
        element: &Element,
        options: &CaptureOptions,
    ) -> Result<PreparedClone, CollabError> {
        if element.tag.trim().is_empty() {
            return Err(CollabError::Cloning("element has no tag name".into()));
        }
        let mut rules = BTreeMap::new();
        let clone = clone_element(element, options, &mut rules, true);
        let class_css = rules
            .into_iter()
            .map(|(class, body)| format!(".{class}{{{body}}}"))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(PreparedClone { clone, class_css })
    }
}

fn clone_element(
    el: &Element,
    options: &CaptureOptions,
    rules: &mut BTreeMap<String, String>,
    is_root: bool,
) -> Element {
    if !is_root && is_excluded(el, options) {
        return placeholder(el);
    }

    let mut clone = Element {
        tag: el.tag.clone(),
        attrs: el.attrs.clone(),
        computed: el.computed.clone(),
        inline_style: el.inline_style.clone(),
        size: el.size,
        children: Vec::with_capacity(el.children.len()),
    };
    if let Some(class) = scoped_class(el, rules) {
        let classes = match el.attr("class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {class}", existing.trim()),
            _ => class,
        };
        clone.set_attr("class", classes);
    }
    for node in &el.children {
        clone.children.push(match node {
            Node::Element(child) => Node::Element(clone_element(child, options, rules, false)),
            text => text.clone(),
        });
    }
    clone
}

fn is_excluded(el: &Element, options: &CaptureOptions) -> bool {
    options
        .config
        .exclude
        .iter()
        .any(|selector| matches_selector(el, selector))
        || options.filter.as_ref().is_some_and(|keep| !keep(el))
}

/// `tag`, `.class` or `#id`.
pub fn matches_selector(el: &Element, selector: &str) -> bool {
    let selector = selector.trim();
    if let Some(class) = selector.strip_prefix('.') {
        el.classes().any(|c| c == class)
    } else if let Some(id) = selector.strip_prefix('#') {
        el.attr("id") == Some(id)
    } else {
        el.is(selector)
    }
}

fn placeholder(el: &Element) -> Element {
    let mut stub = Element::new("div").with_attr(PLACEHOLDER_ATTR, el.tag.to_ascii_lowercase());
    if let Some(size) = el.size {
        stub.size = Some(size);
        stub.set_style("width", format!("{}px", size.width));
        stub.set_style("height", format!("{}px", size.height));
    }
    stub
}

fn scoped_class(el: &Element, rules: &mut BTreeMap<String, String>) -> Option<String> {
    let body: String = el
        .computed
        .iter()
        .filter(|(prop, _)| !PIPELINE_PROPERTIES.contains(&prop.as_str()))
        .map(|(prop, value)| format!("{prop}:{value};"))
        .collect();
    if body.is_empty() {
        return None;
    }
    let digest = format!("{:x}", Sha256::digest(body.as_bytes()));
    let class = format!("sf-{}", &digest[..10]);
    rules.entry(class.clone()).or_insert(body);
    Some(class)
}

// =============================================================================
// Base CSS
// =============================================================================

pub trait BaseCssGenerator: Send + Sync {
    /// Base rules for `tags` (sorted, lowercase).
    fn generate(&self, tags: &[String]) -> String;
}

/// User-agent defaults for the tags present in a clone.
///
/// Inside a `<foreignObject>` the host's user-agent sheet may not apply, so
/// the snapshot carries the defaults it relies on.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserAgentBaseCss;

const UA_DEFAULTS: &[(&str, &str)] = &[
    ("a", "color:inherit;text-decoration:underline"),
    ("article", "display:block"),
    ("b", "font-weight:bold"),
    ("blockquote", "display:block;margin:1em 40px"),
    ("body", "display:block;margin:8px"),
    ("button", "display:inline-block"),
    ("div", "display:block"),
    ("em", "font-style:italic"),
    ("figure", "display:block;margin:1em 40px"),
    ("footer", "display:block"),
    ("h1", "display:block;font-size:2em;font-weight:bold;margin:0.67em 0"),
    ("h2", "display:block;font-size:1.5em;font-weight:bold;margin:0.83em 0"),
    ("h3", "display:block;font-size:1.17em;font-weight:bold;margin:1em 0"),
    ("header", "display:block"),
    ("img", "display:inline-block"),
    ("li", "display:list-item"),
    ("main", "display:block"),
    ("nav", "display:block"),
    ("ol", "display:block;list-style-type:decimal;margin:1em 0;padding-left:40px"),
    ("p", "display:block;margin:1em 0"),
    ("pre", "display:block;font-family:monospace;white-space:pre;margin:1em 0"),
    ("section", "display:block"),
    ("span", "display:inline"),
    ("strong", "font-weight:bold"),
    ("table", "display:table;border-collapse:separate;border-spacing:2px"),
    ("td", "display:table-cell;padding:1px"),
    ("th", "display:table-cell;font-weight:bold;padding:1px"),
    ("tr", "display:table-row"),
    ("ul", "display:block;list-style-type:disc;margin:1em 0;padding-left:40px"),
];

impl BaseCssGenerator for UserAgentBaseCss {
    fn generate(&self, tags: &[String]) -> String {
        tags.iter()
            .filter_map(|tag| {
                UA_DEFAULTS
                    .iter()
                    .find(|(name, _)| name == tag)
                    .map(|(name, decls)| format!("{name}{{{decls}}}"))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// =============================================================================
// Fonts
// =============================================================================

#[async_trait]
pub trait FontEmbedder: Send + Sync {
    /// Wait for pending font loads to settle.
    async fn ready(&self) {}

    /// `@font-face` CSS for the capture, or `None`.
    ///
    /// With `warm_only`, populate internal caches and return `None`.
    async fn embed(
        &self,
        options: &CaptureOptions,
        warm_only: bool,
    ) -> Result<Option<String>, CollabError>;
}

/// Embeds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFonts;

#[async_trait]
impl FontEmbedder for NoFonts {
    async fn embed(
        &self,
        _options: &CaptureOptions,
        _warm_only: bool,
    ) -> Result<Option<String>, CollabError> {
        Ok(None)
    }
}

/// Inlines the `[[fonts]]` faces of the config through a fetcher.
///
/// Sources are cached by absolute URL for the embedder's lifetime. A face
/// whose source cannot be fetched is left out with a warning.
/// [`FontEmbedder::ready`] resolves once no source fetch is in flight.
pub struct FontFaceEmbedder {
    fetcher: Arc<dyn Fetcher>,
    sources: Mutex<HashMap<String, String>>,
    in_flight: AtomicUsize,
    settled: Notify,
}

/// Counts one source fetch for as long as it lives.
struct InFlight<'a>(&'a FontFaceEmbedder);

impl<'a> InFlight<'a> {
    fn start(embedder: &'a FontFaceEmbedder) -> Self {
        embedder.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(embedder)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.settled.notify_waiters();
        }
    }
}

impl FontFaceEmbedder {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            sources: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            settled: Notify::new(),
        }
    }

    /// Source fetches currently running.
    pub fn pending_sources(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn cached_sources(&self) -> usize {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn source_data(&self, source: &str, resolve: &ResolveOptions) -> Option<String> {
        let url = match resolve.absolute_url(source.trim()) {
            Ok(url) => url,
            Err(e) => {
                warn!("font source {source} skipped: {e}");
                return None;
            }
        };
        let key = url.to_string();
        if let Some(hit) = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Some(hit.clone());
        }

        let _in_flight = InFlight::start(self);
        let cross_origin = resolve.is_cross_origin(&url);
        let request = FetchRequest::new(url, RequestMode::Cors, cross_origin)
            .with_origin(resolve.document_origin.as_ref());
        let fetched = match self.fetcher.fetch(&request).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("font source {key} skipped: {e}");
                return None;
            }
        };
        let mime = fetched
            .content_type
            .clone()
            .filter(|ct| ct.starts_with("font/") || ct.starts_with("application/font"))
            .unwrap_or_else(|| font_mime(&key).to_string());
        let data = data_url::encode_base64(&fetched.bytes, &mime);
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        Some(sources.entry(key).or_insert(data).clone())
    }
}

/// MIME type from a font file extension.
fn font_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    match path.rsplit('.').next() {
        Some("woff2") => "font/woff2",
        Some("woff") => "font/woff",
        Some("otf") => "font/otf",
        _ => "font/ttf",
    }
}

fn font_format(mime: &str) -> &'static str {
    match mime {
        "font/woff2" => "woff2",
        "font/woff" => "woff",
        "font/otf" => "opentype",
        _ => "truetype",
    }
}

#[async_trait]
impl FontEmbedder for FontFaceEmbedder {
    async fn ready(&self) {
        loop {
            let settled = self.settled.notified();
            if self.pending_sources() == 0 {
                return;
            }
            settled.await;
        }
    }

    async fn embed(
        &self,
        options: &CaptureOptions,
        warm_only: bool,
    ) -> Result<Option<String>, CollabError> {
        let faces = &options.config.fonts;
        if faces.is_empty() {
            return Ok(None);
        }
        let resolve = ResolveOptions::from_config(&options.config.network)
            .map_err(|e| CollabError::Font(e.to_string()))?;

        let sources = futures::future::join_all(
            faces
                .iter()
                .map(|face| self.source_data(&face.source, &resolve)),
        )
        .await;
        if warm_only {
            debug!("warmed {} font source(s)", self.cached_sources());
            return Ok(None);
        }

        let rules: Vec<String> = faces
            .iter()
            .zip(sources)
            .filter_map(|(face, data)| {
                let data = data?;
                let mime = data
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split(';').next())
                    .unwrap_or("font/ttf");
                let mut rule = format!(
                    "@font-face{{font-family:\"{}\";src:url(\"{data}\") format(\"{}\");",
                    face.family.replace('"', "\\\""),
                    font_format(mime)
                );
                if let Some(weight) = &face.weight {
                    rule.push_str(&format!("font-weight:{weight};"));
                }
                if let Some(style) = &face.style {
                    rule.push_str(&format!("font-style:{style};"));
                }
                rule.push('}');
                Some(rule)
            })
            .collect();

        Ok((!rules.is_empty()).then(|| rules.join("\n")))
    }
}
