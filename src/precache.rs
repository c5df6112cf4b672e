//! Cache warming without a capture.
//!
//! [`Snapshotter::pre_cache`] walks a tree and resolves what a later
//! capture of it would need: per-tag base styles, `<img>` sources,
//! `url(...)` background layers and, with `embed_fonts`, font sources.
//! Everything runs through the same resolvers as a capture; failures are
//! logged and counted, never returned.
//!
//! A capture resets the cache it runs on, so warming pays off for consumers
//! that read the cache directly or share it between sessions
//! ([`Snapshotter::with_cache`]), and for the font embedder, whose source
//! cache survives captures.

use crate::background::{BackgroundResolver, EntryMode, Layer, split_background_image};
use crate::cache::Namespace;
use crate::capture::{CaptureError, CaptureOptions, Snapshotter, image_sources, root_element};
use crate::config::CaptureConfig;
use crate::image_resolver::{ImageResolver, ResolveOptions};
use crate::tree::{Element, Node};
use futures::future::join_all;
use log::{debug, warn};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct PreCacheOptions {
    pub config: CaptureConfig,
    /// Clear the cache and do nothing else.
    pub reset: bool,
    /// Skip the image and background scan.
    pub skip_inline: bool,
}

/// Counts from one pre-cache run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreCacheReport {
    pub reset: bool,
    pub base_styles: usize,
    pub images: usize,
    pub backgrounds: usize,
    pub failures: usize,
    pub fonts_warmed: bool,
}

impl Snapshotter {
    /// Warm the cache for `root`.
    pub async fn pre_cache(
        &self,
        root: &Node,
        options: &PreCacheOptions,
    ) -> Result<PreCacheReport, CaptureError> {
        if options.reset {
            self.cache.reset_all();
            return Ok(PreCacheReport {
                reset: true,
                ..PreCacheReport::default()
            });
        }
        let element = root_element(root)?;
        options.config.validate()?;
        let resolve = ResolveOptions::from_config(&options.config.network)?;

        self.fonts.ready().await;

        let tags = element.tag_names();
        for tag in &tags {
            self.base_style(std::slice::from_ref(tag));
        }
        let mut report = PreCacheReport {
            base_styles: tags.len(),
            ..PreCacheReport::default()
        };

        let (sources, layers) = if options.skip_inline {
            (Vec::new(), Vec::new())
        } else {
            (self.uncached_sources(element), url_layers(element))
        };

        let images = ImageResolver::new(&self.cache, self.fetcher.as_ref(), &resolve);
        let backgrounds = BackgroundResolver::new(images);
        let capture_options = CaptureOptions::new(options.config.clone());

        let (image_results, layer_results, fonts) = tokio::join!(
            join_all(sources.iter().map(|src| images.resolve(src))),
            join_all(
                layers
                    .iter()
                    .map(|layer| backgrounds.resolve_entry(layer, EntryMode::WarmOnly))
            ),
            async {
                if options.config.embed_fonts {
                    self.fonts.embed(&capture_options, true).await.map(|_| true)
                } else {
                    Ok(false)
                }
            }
        );

        for result in image_results {
            match result {
                Ok(_) => report.images += 1,
                Err(err) => {
                    debug!("pre-cache: {err}");
                    report.failures += 1;
                }
            }
        }
        for result in layer_results {
            match result {
                Ok(_) => report.backgrounds += 1,
                Err(err) => {
                    debug!("pre-cache: {err}");
                    report.failures += 1;
                }
            }
        }
        report.fonts_warmed = match fonts {
            Ok(warmed) => warmed,
            Err(err) => {
                warn!("pre-cache: {err}");
                false
            }
        };
        Ok(report)
    }

    fn uncached_sources(&self, root: &Element) -> Vec<String> {
        image_sources(root)
            .into_iter()
            .map(|(_, src)| src)
            .filter(|src| !self.cache.has(Namespace::Image, src))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Distinct `url(...)` layers in the subtree's computed backgrounds.
fn url_layers(root: &Element) -> Vec<String> {
    root.descendants()
        .into_iter()
        .filter_map(|el| el.computed("background-image"))
        .flat_map(split_background_image)
        .filter(|layer| matches!(Layer::classify(layer), Layer::Url(_)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::FontFaceEmbedder;
    use crate::config::FontFace;
    use crate::fetch::RequestMode;
    use crate::fetch::backend::tests::MockFetcher;
    use crate::test_helpers::{png_bytes, scenario_tree};
    use std::sync::Arc;

    fn options() -> PreCacheOptions {
        let mut config = CaptureConfig::default();
        config.network.document_origin = Some("https://app.test/".into());
        PreCacheOptions {
            config,
            ..PreCacheOptions::default()
        }
    }

    fn scenario_fetcher() -> MockFetcher {
        MockFetcher::new()
            .serve("https://app.test/pic.png", RequestMode::Image, png_bytes(2, 2), "image/png")
            .serve("https://cdn.test/bg.png", RequestMode::Image, png_bytes(3, 3), "image/png")
    }

    #[tokio::test]
    async fn reset_clears_and_does_nothing_else() {
        let fetcher = Arc::new(scenario_fetcher());
        let snap = Snapshotter::new(fetcher.clone());
        snap.cache().set(Namespace::Image, "k", "v");

        let report = snap
            .pre_cache(
                &scenario_tree(),
                &PreCacheOptions {
                    reset: true,
                    ..options()
                },
            )
            .await
            .unwrap();

        assert!(report.reset);
        assert!(snap.cache().is_empty());
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn reset_ignores_the_root() {
        let snap = Snapshotter::new(Arc::new(MockFetcher::new()));
        snap.cache().set(Namespace::BaseStyle, "div", "div{}");

        let report = snap
            .pre_cache(
                &Node::text("not an element"),
                &PreCacheOptions {
                    reset: true,
                    ..options()
                },
            )
            .await
            .unwrap();

        assert!(report.reset);
        assert!(snap.cache().is_empty());
    }

    #[tokio::test]
    async fn text_root_is_rejected_without_reset() {
        let snap = Snapshotter::new(Arc::new(MockFetcher::new()));
        let err = snap
            .pre_cache(&Node::text("x"), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn warms_images_backgrounds_and_base_styles() {
        let fetcher = Arc::new(scenario_fetcher());
        let snap = Snapshotter::new(fetcher.clone());

        let report = snap.pre_cache(&scenario_tree(), &options()).await.unwrap();

        assert_eq!(report.images, 1);
        assert_eq!(report.backgrounds, 1);
        assert_eq!(report.base_styles, 2);
        assert_eq!(report.failures, 0);
        let cache = snap.cache();
        assert!(cache.has(Namespace::Image, "https://app.test/pic.png"));
        assert!(cache.has(Namespace::Background, "https://cdn.test/bg.png"));
        assert!(cache.has(Namespace::BaseStyle, "div"));
        assert!(cache.has(Namespace::BaseStyle, "img"));
        assert_eq!(fetcher.request_count(), 2);
    }

    #[tokio::test]
    async fn cached_images_are_not_fetched_again() {
        let fetcher = Arc::new(scenario_fetcher());
        let snap = Snapshotter::new(fetcher.clone());
        snap.cache()
            .set(Namespace::Image, "https://app.test/pic.png", "data:image/png;base64,AA");

        let report = snap.pre_cache(&scenario_tree(), &options()).await.unwrap();

        assert_eq!(report.images, 0);
        assert_eq!(fetcher.requested_urls(), vec!["https://cdn.test/bg.png"]);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let snap = Snapshotter::new(Arc::new(MockFetcher::new()));

        let report = snap.pre_cache(&scenario_tree(), &options()).await.unwrap();

        assert_eq!(report.failures, 2);
        assert_eq!(snap.cache().len(Namespace::Image), 0);
    }

    #[tokio::test]
    async fn skip_inline_only_warms_styles() {
        let fetcher = Arc::new(scenario_fetcher());
        let snap = Snapshotter::new(fetcher.clone());

        let report = snap
            .pre_cache(
                &scenario_tree(),
                &PreCacheOptions {
                    skip_inline: true,
                    ..options()
                },
            )
            .await
            .unwrap();

        assert_eq!(report.base_styles, 2);
        assert_eq!(fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn fonts_are_warmed_when_requested() {
        let fetcher = Arc::new(scenario_fetcher().serve(
            "https://app.test/f.woff2",
            RequestMode::Cors,
            vec![0],
            "font/woff2",
        ));
        let fonts = Arc::new(FontFaceEmbedder::new(fetcher.clone()));
        let snap = Snapshotter::new(fetcher.clone()).with_fonts(fonts.clone());
        let mut opts = options();
        opts.skip_inline = true;
        opts.config.embed_fonts = true;
        opts.config.fonts.push(FontFace {
            family: "F".into(),
            source: "/f.woff2".into(),
            weight: None,
            style: None,
        });

        let report = snap.pre_cache(&scenario_tree(), &opts).await.unwrap();

        assert!(report.fonts_warmed);
        assert_eq!(fonts.cached_sources(), 1);
    }

    #[test]
    fn url_layers_are_distinct_and_skip_gradients() {
        let tree = Element::new("div")
            .with_computed("background-image", "url(a.png), linear-gradient(red, blue)")
            .with_child(Element::new("p").with_computed("background-image", "url(a.png)"));
        assert_eq!(url_layers(&tree), vec!["url(a.png)"]);
    }
}
