//! Shared test utilities for the snapframe test suite.
//!
//! Provides encoded image fixtures and a small captured tree that exercises
//! both asset paths (an `<img>` source and a `url(...)` background layer).
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let fetcher = MockFetcher::new()
//!     .serve("https://app.test/pic.png", RequestMode::Image, png_bytes(2, 2), "image/png")
//!     .serve("https://cdn.test/bg.png", RequestMode::Image, png_bytes(3, 3), "image/png");
//! let snapshot = snapshotter.capture(&scenario_tree(), &options).await.unwrap();
//! ```

use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

use crate::tree::{Element, Node};

// =========================================================================
// Image fixtures
// =========================================================================

/// Encode a solid `width` x `height` RGBA image as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 80, 40, 255]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

// =========================================================================
// Tree fixtures
// =========================================================================

/// A 100x50 card: a `div` with a remote background and one remote `<img>`.
///
/// The tag set is exactly `{div, img}`. The image lives on the document
/// origin `https://app.test/`; the background is cross-origin.
pub fn scenario_tree() -> Node {
    Node::Element(
        Element::new("div")
            .with_size(100.0, 50.0)
            .with_computed("background-image", "url(https://cdn.test/bg.png)")
            .with_child(
                Element::new("img")
                    .with_attr("src", "https://app.test/pic.png")
                    .with_size(40.0, 40.0),
            ),
    )
}
