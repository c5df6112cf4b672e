//! Element tree: the input of a capture and the shape of its clone.
//!
//! A tree is plain owned data. Each [`Element`] carries its attributes, the
//! **computed style** the host resolved for it (layout is not this crate's
//! business), an optional bounding [`Size`], and an `inline_style` map the
//! pipeline writes into (inlined backgrounds, scale transforms).
//!
//! Trees load from JSON (`serde`), and serialize to XHTML for embedding in
//! an SVG `<foreignObject>`.
//!
//! ```json
//! {
//!   "tag": "div",
//!   "size": { "width": 320, "height": 200 },
//!   "computed": { "background-image": "url(bg.png)" },
//!   "children": [
//!     { "tag": "img", "attrs": { "src": "https://example.com/pic.png" } },
//!     { "text": "Caption" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// Elements serialized as `<tag/>` because they never have content.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Element(Element),
    Text { text: String },
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text { text: text.into() }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(el) => Some(el),
            Node::Text { .. } => None,
        }
    }
}

impl From<Element> for Node {
    fn from(el: Element) -> Self {
        Node::Element(el)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    /// Computed style, as resolved by the host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub computed: BTreeMap<String, String>,
    /// Declarations written by the pipeline, serialized into `style`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inline_style: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_computed(mut self, prop: impl Into<String>, value: impl Into<String>) -> Self {
        self.computed.insert(prop.into(), value.into());
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.size = Some(Size::new(width, height));
        self
    }

    pub fn with_child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::text(text));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attrs.remove(name)
    }

    /// Computed style accessor.
    pub fn computed(&self, prop: &str) -> Option<&str> {
        self.computed.get(prop).map(String::as_str)
    }

    pub fn set_style(&mut self, prop: impl Into<String>, value: impl Into<String>) {
        self.inline_style.insert(prop.into(), value.into());
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag.eq_ignore_ascii_case(tag)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_ascii_whitespace()
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(Node::as_element)
    }

    /// The `index`-th element child (text nodes are not counted).
    pub fn child_element_mut(&mut self, index: usize) -> Option<&mut Element> {
        self.children
            .iter_mut()
            .filter_map(|node| match node {
                Node::Element(el) => Some(el),
                Node::Text { .. } => None,
            })
            .nth(index)
    }

    pub fn element_at(&self, path: &[usize]) -> Option<&Element> {
        let mut current = self;
        for &index in path {
            current = current.child_elements().nth(index)?;
        }
        Some(current)
    }

    /// Follow a path of element-child indices from this element.
    pub fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let mut current = self;
        for &index in path {
            current = current.child_element_mut(index)?;
        }
        Some(current)
    }

    /// Pre-order walk over this element and every element descendant.
    pub fn descendants(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(el) = stack.pop() {
            out.push(el);
            let children: Vec<&Element> = el.child_elements().collect();
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// Paths (see [`Element::element_at_mut`]) of every element matching
    /// `pred`, in document order.
    pub fn find_paths(&self, pred: &impl Fn(&Element) -> bool) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        collect_paths(self, pred, &mut path, &mut out);
        out
    }

    /// Sorted set of lowercased tag names in this subtree.
    pub fn tag_names(&self) -> BTreeSet<String> {
        self.descendants()
            .into_iter()
            .map(|el| el.tag.to_ascii_lowercase())
            .collect()
    }

    /// Serialize as the root of an XHTML fragment (carries the namespace).
    pub fn to_xhtml(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out, true);
        out
    }
}

fn collect_paths(
    el: &Element,
    pred: &impl Fn(&Element) -> bool,
    path: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    if pred(el) {
        out.push(path.clone());
    }
    for (index, child) in el.child_elements().enumerate() {
        path.push(index);
        collect_paths(child, pred, path, out);
        path.pop();
    }
}

fn write_element(el: &Element, out: &mut String, root: bool) {
    let tag = el.tag.to_ascii_lowercase();
    out.push('<');
    out.push_str(&tag);
    if root {
        out.push_str(&format!(" xmlns=\"{XHTML_NS}\""));
    }
    for (name, value) in &el.attrs {
        if name == "style" || (root && name == "xmlns") {
            continue;
        }
        push_attr(out, name, value);
    }
    let style = style_attr(el);
    if !style.is_empty() {
        push_attr(out, "style", &style);
    }

    if el.children.is_empty() && VOID_ELEMENTS.contains(&tag.as_str()) {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &el.children {
        match child {
            Node::Element(child) => write_element(child, out, false),
            Node::Text { text } => out.push_str(&escape(text, false)),
        }
    }
    out.push_str("</");
    out.push_str(&tag);
    out.push('>');
}

/// Authored `style` attribute followed by pipeline declarations, which win.
fn style_attr(el: &Element) -> String {
    let mut style = el
        .attr("style")
        .map(|s| s.trim().trim_end_matches(';').to_string())
        .unwrap_or_default();
    for (prop, value) in &el.inline_style {
        if !style.is_empty() {
            style.push(';');
        }
        style.push_str(prop);
        style.push(':');
        style.push_str(value);
    }
    style
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&escape(value, true));
    out.push('"');
}

fn escape(text: &str, attr: bool) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' if attr => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Load a tree from a JSON file.
pub fn load_tree(path: &Path) -> Result<Node, TreeError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
