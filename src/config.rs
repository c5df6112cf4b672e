//! Capture configuration.
//!
//! Handles loading, validating, and merging `snapframe.toml`. Stock defaults
//! are overridden by the user file, which in turn is overridden by CLI flags
//! or by options built in code.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! # scale = 2.0            # Uniform output scale (wins over width/height)
//! # width = 800            # Output width in px
//! # height = 600           # Output height in px
//! embed_fonts = false      # Inline @font-face sources listed under [[fonts]]
//! compress = true          # Share generated base CSS per tag set
//! fast = true              # Skip cooperative yields between stages
//! debug = false            # Log plugin and resolver diagnostics
//! ignore_global_plugins = false
//! exclude = []             # Selectors dropped from the clone: "tag", ".class", "#id"
//!
//! [network]
//! timeout_ms = 5000        # Raster load timeout
//! # proxy = "https://proxy.example/?url="   # Fallback proxy base
//! # document_origin = "https://example.com/" # Base URL of the captured document
//! # cookie = "session=..."                   # Sent with same-origin requests only
//! enforce_cors = false     # Emulate browser CORS checks on fallback fetches
//!
//! [[fonts]]
//! family = "Inter"
//! source = "https://example.com/inter.woff2"
//! weight = "400"
//! style = "normal"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Name of the config file looked up in the config directory.
pub const CONFIG_FILENAME: &str = "snapframe.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Capture configuration loaded from `snapframe.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Uniform output scale factor. When set, `width`/`height` are ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// Explicit output width in px.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    /// Explicit output height in px.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// Inline the faces listed in `fonts`.
    pub embed_fonts: bool,
    /// Generate shared base CSS per tag set.
    pub compress: bool,
    /// Skip cooperative yields between pipeline stages.
    pub fast: bool,
    /// Emit plugin and resolver diagnostics.
    pub debug: bool,
    /// Run only the plugins passed with the capture.
    pub ignore_global_plugins: bool,
    /// Simple selectors (`tag`, `.class`, `#id`) removed from the clone.
    pub exclude: Vec<String>,
    pub network: NetworkConfig,
    /// Font faces available for embedding.
    pub fonts: Vec<FontFace>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            scale: None,
            width: None,
            height: None,
            embed_fonts: false,
            compress: true,
            fast: true,
            debug: false,
            ignore_global_plugins: false,
            exclude: Vec::new(),
            network: NetworkConfig::default(),
            fonts: Vec::new(),
        }
    }
}

impl CaptureConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("scale", self.scale),
            ("width", self.width),
            ("height", self.height),
        ] {
            if let Some(v) = value
                && !(v.is_finite() && v > 0.0)
            {
                return Err(ConfigError::Validation(format!(
                    "{key} must be a positive number"
                )));
            }
        }
        if self.exclude.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "exclude entries must not be empty".into(),
            ));
        }
        for face in &self.fonts {
            if face.family.trim().is_empty() || face.source.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "fonts entries need a family and a source".into(),
                ));
            }
        }
        self.network.validate()
    }
}

/// Network behaviour of the resolvers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Raster load timeout in milliseconds.
    pub timeout_ms: u64,
    /// Proxy base URL; the percent-encoded reference is appended to it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Base URL of the captured document: resolves relative references and
    /// decides same-origin versus cross-origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_origin: Option<String>,
    /// Cookie header value sent with same-origin requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    /// Reject cross-origin CORS-mode responses lacking a matching
    /// `Access-Control-Allow-Origin`.
    pub enforce_cors: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            proxy: None,
            document_origin: None,
            cookie: None,
            enforce_cors: false,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "network.timeout_ms must be greater than 0".into(),
            ));
        }
        if let Some(proxy) = &self.proxy
            && Url::parse(proxy).is_err()
        {
            return Err(ConfigError::Validation(format!(
                "network.proxy is not an absolute URL: {proxy}"
            )));
        }
        self.origin_url()?;
        Ok(())
    }

    /// Parsed `document_origin`.
    pub fn origin_url(&self) -> Result<Option<Url>, ConfigError> {
        self.document_origin
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    ConfigError::Validation(format!(
                        "network.document_origin is not an absolute URL ({e}): {raw}"
                    ))
                })
            })
            .transpose()
    }
}

/// One `@font-face` available for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FontFace {
    pub family: String,
    /// URL of the font file (absolute, or relative to `document_origin`).
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(CaptureConfig::default())
        .unwrap_or_else(|_| toml::Value::Table(toml::map::Map::new()))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load `snapframe.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(dir: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<CaptureConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: CaptureConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `snapframe.toml` in the given directory, on top of the
/// stock defaults.
pub fn load_config(dir: &Path) -> Result<CaptureConfig, ConfigError> {
    let base = stock_defaults_value();
    let overlay = load_raw_config(dir)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `snapframe.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# snapframe configuration
# =======================
# All settings are optional. Values shown below are the defaults.
# Unknown keys will cause an error.

# Uniform output scale. When set, width and height are ignored.
# scale = 2.0

# Explicit output size in px. Giving only one keeps the aspect ratio;
# giving both stretches the snapshot independently on each axis.
# width = 800
# height = 600

# Inline the font faces listed under [[fonts]].
embed_fonts = false

# Generate shared base CSS per set of tag names (cached across captures).
compress = true

# Skip cooperative yields between pipeline stages.
fast = true

# Log plugin and resolver diagnostics.
debug = false

# Run only the plugins passed with a capture, not globally registered ones.
ignore_global_plugins = false

# Simple selectors removed from the clone: "tag", ".class" or "#id".
exclude = []

# ---------------------------------------------------------------------------
# Network
# ---------------------------------------------------------------------------
[network]
# Raster image load timeout in milliseconds.
timeout_ms = 5000

# Proxy base URL used when a direct fetch fails. The percent-encoded image
# URL is appended to it.
# proxy = "https://proxy.example.com/?url="

# Base URL of the captured document. Relative references resolve against it
# and it decides which requests are same-origin (sent with credentials).
# document_origin = "https://example.com/"

# Cookie header sent with same-origin requests only.
# cookie = "session=abc"

# Reject cross-origin fallback fetches whose response lacks a matching
# Access-Control-Allow-Origin header, like a browser would.
enforce_cors = false

# ---------------------------------------------------------------------------
# Fonts (used when embed_fonts = true)
# ---------------------------------------------------------------------------
# [[fonts]]
# family = "Inter"
# source = "https://example.com/fonts/inter.woff2"
# weight = "400"
# style = "normal"
"##
}
