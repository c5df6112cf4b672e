//! Capture orchestration: element tree in, self-contained SVG document out.
//!
//! ## Pipeline
//!
//! | # | Stage | Hooks |
//! |---|---|---|
//! | 1 | validate the root, build the effective plugin list | |
//! | 2 | reset the resource cache | |
//! | 3 | clone the tree and scope its styles, mount the staging guard | `before-clone`, `after-clone` |
//! | 4 | inline `<img>` sources and background layers, fonts, base CSS | `before-render`, `after-render` |
//! | 5 | size, wrap in `<svg><foreignObject>`, percent-encode | |
//! | 6 | release the staging guard | |
//! | 7 | | `after-export` |
//!
//! Stages run strictly in order. Inside stage 4 assets resolve concurrently;
//! each resolution ends as an [`AssetOutcome`]. A failed asset keeps its
//! original reference and is listed in the [`CaptureReport`]; it never aborts
//! the capture. Invalid input, hook failures, collaborator errors and
//! assembly errors do.
//!
//! The staging guard is released by `Drop`, so an error at any stage after
//! mounting still leaves [`StagingArea::active`] at zero.

use crate::background::{BackgroundResolver, EntryMode, Layer, split_background_image};
use crate::cache::{CacheStats, Namespace, ResourceCache};
use crate::collab::{
    BaseCssGenerator, Cloner, CollabError, FontEmbedder, FontFaceEmbedder, PLACEHOLDER_ATTR,
    ScopedCloner, UserAgentBaseCss,
};
use crate::config::{CaptureConfig, ConfigError};
use crate::fetch::Fetcher;
use crate::image_resolver::{ImageResolver, ResolveError, ResolveOptions};
use crate::plugin::{EffectivePlugin, HookKind, PluginError, PluginRegistry, PluginSpec, run_hook};
use crate::tree::{Element, Node, Size};
use futures::future::join_all;
use log::debug;
use maud::{PreEscaped, html};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Prefix of every produced document reference.
pub const SVG_DATA_PREFIX: &str = "data:image/svg+xml;charset=utf-8,";

/// Honour EXIF orientation of inlined rasters.
pub const ORIENTATION_FIX_CSS: &str = "img{image-orientation:from-image;}";

/// Links a clone element to its background layers until they are inlined.
const BACKGROUND_MARK: &str = "data-snapframe-bg";

const SVG_NS: &str = "http://www.w3.org/2000/svg";

/// Predicate deciding whether an element is kept in the clone.
pub type ElementFilter = Arc<dyn Fn(&Element) -> bool + Send + Sync>;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Collaborator(#[from] CollabError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("document assembly failed: {0}")]
    Assembly(String),
}

/// Per-call capture options.
#[derive(Clone, Default)]
pub struct CaptureOptions {
    pub config: CaptureConfig,
    pub plugins: Vec<PluginSpec>,
    pub filter: Option<ElementFilter>,
}

impl fmt::Debug for CaptureOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureOptions")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl CaptureOptions {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_plugin(mut self, spec: impl Into<PluginSpec>) -> Self {
        self.plugins.push(spec.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Fn(&Element) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

/// State threaded through the pipeline and handed to every hook.
pub struct CaptureContext<'a> {
    pub options: &'a CaptureOptions,
    /// The tree being captured.
    pub element: &'a Element,
    /// Present from `after-clone` on.
    pub clone: Option<Element>,
    pub class_css: String,
    pub base_css: String,
    pub font_css: String,
    /// Present in `after-export`.
    pub document: Option<String>,
    /// Free-form scratch space for plugins.
    pub state: serde_json::Map<String, serde_json::Value>,
    pub plugins: Vec<EffectivePlugin>,
}

impl<'a> CaptureContext<'a> {
    pub fn new(options: &'a CaptureOptions, element: &'a Element) -> Self {
        Self {
            options,
            element,
            clone: None,
            class_css: String::new(),
            base_css: String::new(),
            font_css: String::new(),
            document: None,
            state: serde_json::Map::new(),
            plugins: Vec::new(),
        }
    }
}

/// Result of one asset resolution inside a capture.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetOutcome {
    Inlined(String),
    LeftAsOriginal(ResolveError),
}

impl From<Result<String, ResolveError>> for AssetOutcome {
    fn from(result: Result<String, ResolveError>) -> Self {
        match result {
            Ok(data) => AssetOutcome::Inlined(data),
            Err(err) => AssetOutcome::LeftAsOriginal(err),
        }
    }
}

/// What happened to each asset reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureReport {
    pub inlined: Vec<String>,
    pub left_as_original: Vec<(String, ResolveError)>,
}

impl CaptureReport {
    fn record(&mut self, reference: String, outcome: &AssetOutcome) {
        match outcome {
            AssetOutcome::Inlined(_) => self.inlined.push(reference),
            AssetOutcome::LeftAsOriginal(err) => {
                debug!("left as original: {err}");
                self.left_as_original.push((reference, err.clone()));
            }
        }
    }

    pub fn total(&self) -> usize {
        self.inlined.len() + self.left_as_original.len()
    }
}

/// A finished capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// `data:image/svg+xml;charset=utf-8,...`
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub report: CaptureReport,
    pub stats: CacheStats,
}

impl Snapshot {
    /// The SVG document text.
    pub fn svg(&self) -> Result<String, CaptureError> {
        let encoded = self
            .url
            .strip_prefix(SVG_DATA_PREFIX)
            .ok_or_else(|| CaptureError::Assembly("not an SVG document reference".into()))?;
        urlencoding::decode(encoded)
            .map(|svg| svg.into_owned())
            .map_err(|e| CaptureError::Assembly(format!("document is not UTF-8: {e}")))
    }
}

// =============================================================================
// Staging
// =============================================================================

/// Tracks mounted staging containers.
#[derive(Debug, Default)]
pub struct StagingArea {
    mounted: AtomicUsize,
}

impl StagingArea {
    /// Number of containers currently mounted.
    pub fn active(&self) -> usize {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn mount(area: &Arc<StagingArea>) -> StagingGuard {
        area.mounted.fetch_add(1, Ordering::SeqCst);
        StagingGuard {
            area: Arc::clone(area),
        }
    }
}

/// Unmounts its container on drop.
#[derive(Debug)]
pub struct StagingGuard {
    area: Arc<StagingArea>,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        self.area.mounted.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Sizing
// =============================================================================

/// Output dimensions and the transform applied to the clone root.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetSize {
    pub width: f64,
    pub height: f64,
    pub view_box: Size,
    /// `scale(sx, sy)` for explicit width/height.
    pub transform: Option<(f64, f64)>,
}

/// `scale` wins; otherwise width/height scale the clone root, preserving
/// aspect when only one is given.
pub fn target_size(natural: Size, config: &CaptureConfig) -> TargetSize {
    if let Some(scale) = config.scale {
        return TargetSize {
            width: natural.width * scale,
            height: natural.height * scale,
            view_box: natural,
            transform: None,
        };
    }
    let (sx, sy) = match (config.width, config.height) {
        (Some(w), Some(h)) => (w / natural.width, h / natural.height),
        (Some(w), None) => (w / natural.width, w / natural.width),
        (None, Some(h)) => (h / natural.height, h / natural.height),
        (None, None) => {
            return TargetSize {
                width: natural.width,
                height: natural.height,
                view_box: natural,
                transform: None,
            };
        }
    };
    let (width, height) = (natural.width * sx, natural.height * sy);
    TargetSize {
        width,
        height,
        view_box: Size::new(width, height),
        transform: Some((sx, sy)),
    }
}

// =============================================================================
// Snapshotter
// =============================================================================

/// Owns the cache, the plugin registry and the collaborators of a capture
/// session.
pub struct Snapshotter {
    pub(crate) cache: Arc<ResourceCache>,
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) cloner: Arc<dyn Cloner>,
    pub(crate) base_css: Arc<dyn BaseCssGenerator>,
    pub(crate) fonts: Arc<dyn FontEmbedder>,
    staging: Arc<StagingArea>,
}

impl Snapshotter {
    /// Session with a fresh cache and registry and the default collaborators.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache: Arc::new(ResourceCache::new()),
            registry: Arc::new(PluginRegistry::new()),
            fonts: Arc::new(FontFaceEmbedder::new(Arc::clone(&fetcher))),
            fetcher,
            cloner: Arc::new(ScopedCloner),
            base_css: Arc::new(UserAgentBaseCss),
            staging: Arc::new(StagingArea::default()),
        }
    }

    /// Share a cache with other sessions. Captures reset it.
    pub fn with_cache(mut self, cache: Arc<ResourceCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cloner(mut self, cloner: Arc<dyn Cloner>) -> Self {
        self.cloner = cloner;
        self
    }

    pub fn with_base_css(mut self, generator: Arc<dyn BaseCssGenerator>) -> Self {
        self.base_css = generator;
        self
    }

    pub fn with_fonts(mut self, fonts: Arc<dyn FontEmbedder>) -> Self {
        self.fonts = fonts;
        self
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn staging(&self) -> &Arc<StagingArea> {
        &self.staging
    }

    /// Capture `root` into a [`Snapshot`].
    pub async fn capture(
        &self,
        root: &Node,
        options: &CaptureOptions,
    ) -> Result<Snapshot, CaptureError> {
        let element = root_element(root)?;
        options.config.validate()?;
        let resolve = ResolveOptions::from_config(&options.config.network)?;

        self.cache.reset_all();
        let mut ctx = CaptureContext::new(options, element);
        ctx.plugins = self.registry.effective(
            &options.plugins,
            options.config.ignore_global_plugins,
            options.config.debug,
        );

        run_hook(HookKind::BeforeClone, &mut ctx).await?;
        let mut prepared = self.cloner.prepare_clone(element, options)?;
        let background_jobs = mark_backgrounds(element, &mut prepared.clone);
        ctx.clone = Some(prepared.clone);
        ctx.class_css = prepared.class_css;
        let staging = StagingArea::mount(&self.staging);
        run_hook(HookKind::AfterClone, &mut ctx).await?;
        pause(options).await;

        run_hook(HookKind::BeforeRender, &mut ctx).await?;
        let report = self.render(&mut ctx, &resolve, &background_jobs).await?;
        run_hook(HookKind::AfterRender, &mut ctx).await?;
        pause(options).await;

        let (url, size) = assemble(&ctx)?;
        ctx.document = Some(url.clone());
        drop(staging);

        run_hook(HookKind::AfterExport, &mut ctx).await?;

        Ok(Snapshot {
            url: ctx.document.take().unwrap_or(url),
            width: size.width.round() as u32,
            height: size.height.round() as u32,
            report,
            stats: self.cache.stats(),
        })
    }

    async fn render(
        &self,
        ctx: &mut CaptureContext<'_>,
        resolve: &ResolveOptions,
        background_jobs: &[Vec<String>],
    ) -> Result<CaptureReport, CaptureError> {
        let images = ImageResolver::new(&self.cache, self.fetcher.as_ref(), resolve);
        let backgrounds = BackgroundResolver::new(images);
        let options = ctx.options;
        let mut report = CaptureReport::default();

        let clone = ctx
            .clone
            .as_mut()
            .ok_or_else(|| CaptureError::Assembly("clone was removed before render".into()))?;
        inline_images(clone, images, &mut report).await;
        inline_backgrounds(clone, background_jobs, backgrounds, &mut report).await;
        let tags: Vec<String> = clone.tag_names().into_iter().collect();

        if options.config.embed_fonts {
            ctx.font_css = self.fonts.embed(options, false).await?.unwrap_or_default();
        }
        if options.config.compress {
            ctx.base_css = self.base_style(&tags);
        }
        Ok(report)
    }

    /// Base CSS for a tag set, through the `BaseStyle` namespace.
    pub(crate) fn base_style(&self, tags: &[String]) -> String {
        let key = tags.join(",");
        match self.cache.get(Namespace::BaseStyle, &key) {
            Some(css) => css,
            None => {
                let css = self.base_css.generate(tags);
                self.cache.insert_if_absent(Namespace::BaseStyle, key, css)
            }
        }
    }
}

pub(crate) fn root_element(root: &Node) -> Result<&Element, CaptureError> {
    match root {
        Node::Element(el) if !el.tag.trim().is_empty() => Ok(el),
        Node::Element(_) => Err(CaptureError::InvalidInput("element has no tag name".into())),
        Node::Text { .. } => Err(CaptureError::InvalidInput(
            "capture root must be an element, not a text node".into(),
        )),
    }
}

async fn pause(options: &CaptureOptions) {
    if !options.config.fast {
        tokio::task::yield_now().await;
    }
}

/// `<img src>` elements of the clone that point somewhere.
pub(crate) fn image_sources(root: &Element) -> Vec<(Vec<usize>, String)> {
    root.find_paths(&|el: &Element| el.is("img"))
        .into_iter()
        .filter_map(|path| {
            let src = root.element_at(&path)?.attr("src")?.trim();
            (!src.is_empty()).then(|| (path, src.to_string()))
        })
        .collect()
}

async fn inline_images(clone: &mut Element, images: ImageResolver<'_>, report: &mut CaptureReport) {
    let jobs = image_sources(clone);
    let outcomes: Vec<AssetOutcome> = join_all(
        jobs.iter()
            .map(|(_, src)| async move { AssetOutcome::from(images.resolve(src).await) }),
    )
    .await;

    for ((path, src), outcome) in jobs.into_iter().zip(outcomes) {
        if let AssetOutcome::Inlined(data) = &outcome
            && let Some(img) = clone.element_at_mut(&path)
        {
            img.set_attr("src", data.clone());
            img.remove_attr("srcset");
        }
        report.record(src, &outcome);
    }
}

/// Background layers of `original` paired with clone paths, skipping
/// placeholders and elements without a background image.
fn background_layers(original: &Element, clone: &Element) -> Vec<(Vec<usize>, Vec<String>)> {
    let mut out = Vec::new();
    collect_backgrounds(original, clone, &mut Vec::new(), &mut out);
    out
}

fn collect_backgrounds(
    original: &Element,
    clone: &Element,
    path: &mut Vec<usize>,
    out: &mut Vec<(Vec<usize>, Vec<String>)>,
) {
    if clone.attr(PLACEHOLDER_ATTR).is_some() {
        return;
    }
    if let Some(value) = original.computed("background-image") {
        let layers = split_background_image(value);
        if layers.iter().any(|layer| Layer::classify(layer) != Layer::None) {
            out.push((path.clone(), layers));
        }
    }
    for (index, (orig_child, clone_child)) in original
        .child_elements()
        .zip(clone.child_elements())
        .enumerate()
    {
        path.push(index);
        collect_backgrounds(orig_child, clone_child, path, out);
        path.pop();
    }
}

/// Tag each clone element whose original carries background layers with
/// [`BACKGROUND_MARK`] and return the layers, indexed by mark value.
///
/// Runs before any plugin sees the clone, so hooks may restructure it and
/// the layers still land on the element they came from.
fn mark_backgrounds(original: &Element, clone: &mut Element) -> Vec<Vec<String>> {
    background_layers(original, clone)
        .into_iter()
        .enumerate()
        .map(|(index, (path, layers))| {
            if let Some(el) = clone.element_at_mut(&path) {
                el.set_attr(BACKGROUND_MARK, index.to_string());
            }
            layers
        })
        .collect()
}

/// Strip every [`BACKGROUND_MARK`] from the clone and pair the marked
/// elements' current paths with their layers.
fn take_marked(clone: &mut Element, layers: &[Vec<String>]) -> Vec<(Vec<usize>, Vec<String>)> {
    let mut jobs = Vec::new();
    for path in clone.find_paths(&|el: &Element| el.attr(BACKGROUND_MARK).is_some()) {
        let Some(mark) = clone
            .element_at_mut(&path)
            .and_then(|el| el.remove_attr(BACKGROUND_MARK))
        else {
            continue;
        };
        if let Some(job) = mark.parse::<usize>().ok().and_then(|i| layers.get(i)) {
            jobs.push((path, job.clone()));
        }
    }
    jobs
}

async fn inline_backgrounds(
    clone: &mut Element,
    marked: &[Vec<String>],
    backgrounds: BackgroundResolver<'_>,
    report: &mut CaptureReport,
) {
    let jobs = take_marked(clone, marked);
    let layers: Vec<(usize, &String)> = jobs
        .iter()
        .enumerate()
        .flat_map(|(job, (_, layers))| layers.iter().map(move |layer| (job, layer)))
        .collect();
    let results = join_all(
        layers
            .iter()
            .map(|(_, layer)| backgrounds.resolve_entry(layer, EntryMode::Inline)),
    )
    .await;

    let mut rewritten: Vec<Vec<String>> = vec![Vec::new(); jobs.len()];
    for ((job, layer), result) in layers.into_iter().zip(results) {
        let is_url = matches!(Layer::classify(layer), Layer::Url(_));
        let value = match result {
            Ok(Some(value)) => {
                if is_url {
                    report.record(layer.clone(), &AssetOutcome::Inlined(value.clone()));
                }
                value
            }
            Ok(None) => layer.clone(),
            Err(err) => {
                report.record(layer.clone(), &AssetOutcome::LeftAsOriginal(err));
                layer.clone()
            }
        };
        rewritten[job].push(value);
    }

    for ((path, _), values) in jobs.iter().zip(rewritten) {
        if let Some(el) = clone.element_at_mut(path) {
            el.set_style("background-image", values.join(", "));
        }
    }
}

/// Size, style and serialize the rendered clone into a document reference.
fn assemble(ctx: &CaptureContext<'_>) -> Result<(String, TargetSize), CaptureError> {
    let clone = ctx
        .clone
        .as_ref()
        .ok_or_else(|| CaptureError::Assembly("clone was removed before assembly".into()))?;
    let natural = ctx
        .element
        .size
        .or(clone.size)
        .ok_or_else(|| CaptureError::Assembly("root element has no size".into()))?;
    if !(natural.width > 0.0 && natural.height > 0.0) {
        return Err(CaptureError::Assembly(format!(
            "root element has an empty size ({}x{})",
            natural.width, natural.height
        )));
    }

    let target = target_size(natural, &ctx.options.config);
    let mut root = clone.clone();
    if let Some((sx, sy)) = target.transform {
        root.set_style("transform", format!("scale({sx}, {sy})"));
        root.set_style("transform-origin", "top left");
    }

    let css = [
        ctx.base_css.as_str(),
        ctx.font_css.as_str(),
        ORIENTATION_FIX_CSS,
        ctx.class_css.as_str(),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join("\n");

    let view_box = format!("0 0 {} {}", target.view_box.width, target.view_box.height);
    let markup = html! {
        svg xmlns=(SVG_NS) width=(target.width) height=(target.height) viewBox=(view_box) {
            style { (css) }
            foreignObject x="0" y="0" width="100%" height="100%" {
                (PreEscaped(root.to_xhtml()))
            }
        }
    };
    let svg = markup.into_string();
    Ok((format!("{SVG_DATA_PREFIX}{}", urlencoding::encode(&svg)), target))
}
