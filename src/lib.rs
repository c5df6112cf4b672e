//! # Snapframe
//!
//! Capture an element tree as a single, self-contained SVG snapshot. Every
//! image, background layer and (optionally) web font the tree references is
//! fetched once, inlined as a `data:` URL, and embedded next to the cloned
//! markup inside an SVG `<foreignObject>`. The result renders identically
//! wherever it is opened, with no network access.
//!
//! # Architecture: One Pipeline, Many Hooks
//!
//! A capture is a fixed sequence of stages run by [`capture::Snapshotter`]:
//!
//! ```text
//! 1. Clone      tree       →  clone + class CSS   (styles frozen into classes)
//! 2. Inline     clone      →  clone               (<img>, backgrounds → data: URLs)
//! 3. Fonts      options    →  @font-face CSS      (optional)
//! 4. Assemble   clone+CSS  →  SVG data URL        (sized, optionally scaled)
//! ```
//!
//! Plugins ([`plugin::Plugin`]) observe or rewrite the shared
//! [`capture::CaptureContext`] between stages. All network access funnels
//! through one [`fetch::Fetcher`], and every resolved resource lands in a
//! namespaced [`cache::ResourceCache`] so repeated references cost one fetch.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`capture`] | The pipeline: options, context, staging, assembly, [`capture::Snapshot`] |
//! | [`precache`] | Cache warming for a tree without producing a snapshot |
//! | [`image_resolver`] | One image reference → `data:` URL: CORS, proxy escalation, timeouts, fallback |
//! | [`background`] | `background-image` layer parsing and per-layer inlining |
//! | [`collab`] | Pluggable collaborators: cloner, base CSS, font embedder |
//! | [`plugin`] | Plugin trait, registry, per-capture option merging, hook dispatch |
//! | [`cache`] | Namespaced resource cache with hit/miss statistics |
//! | [`fetch`] | The `Fetcher` seam, the `reqwest` implementation, `data:` URL codec |
//! | [`tree`] | Element tree model, JSON loading, XHTML serialization |
//! | [`config`] | `snapframe.toml` loading, merging onto stock defaults, validation |
//! | [`output`] | CLI output formatting for capture and pre-cache summaries |
//!
//! # Design Decisions
//!
//! ## Failures Degrade, Never Abort
//!
//! An asset that cannot be fetched stays as its original reference and is
//! listed in [`capture::CaptureReport::left_as_original`]. Only invalid input
//! or config, plugin errors, collaborator failures and a root without a size
//! abort a capture. A snapshot with a missing background is more useful than
//! no snapshot.
//!
//! ## Proxy Escalation
//!
//! A resource that fails to load as an image is fetched again directly in
//! CORS mode. Only when that also fails and a proxy is configured is the
//! request repeated through it, with the absolute URL percent-encoded onto
//! the proxy base. Timeouts skip both retries.
//!
//! ## Maud For The Document
//!
//! The outer SVG is built with [Maud](https://maud.lambda.xyz/), so every
//! interpolated value (sizes, CSS, serialized markup) is escaped by the
//! macro rather than by hand.

pub mod background;
pub mod cache;
pub mod capture;
pub mod collab;
pub mod config;
pub mod fetch;
pub mod image_resolver;
pub mod output;
pub mod plugin;
pub mod precache;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_helpers;
