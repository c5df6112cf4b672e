//! Plugins: named extensions invoked at fixed points of the capture pipeline.
//!
//! A plugin implements [`Plugin`], declaring which [`HookKind`]s it handles
//! and overriding the matching handler methods. Plugins reach a capture two
//! ways:
//!
//! - **globally**, registered once in a [`PluginRegistry`];
//! - **locally**, listed in the capture's options as [`PluginSpec`]s: either a
//!   bare name looked up in the registry, or an inline override whose options
//!   are merged over the registered plugin of the same name.
//!
//! ## Effective list
//!
//! ```text
//! effective = normalize(local specs) ++ globals not named locally
//! ```
//!
//! Globals are skipped entirely when `ignore_global_plugins` is set.
//!
//! ## Execution
//!
//! [`run_hook`] calls every handler for one hook kind in list order, awaiting
//! each before starting the next, so a plugin observes whatever the plugins
//! before it wrote into the [`CaptureContext`]. The first failing handler
//! stops the run and the error propagates to the caller.

use crate::capture::CaptureContext;
use async_trait::async_trait;
use log::{debug, warn};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Free-form plugin options.
pub type PluginOptions = serde_json::Map<String, serde_json::Value>;

/// Pipeline boundary a hook runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeClone,
    AfterClone,
    BeforeRender,
    AfterRender,
    AfterExport,
}

impl HookKind {
    pub const ALL: [HookKind; 5] = [
        HookKind::BeforeClone,
        HookKind::AfterClone,
        HookKind::BeforeRender,
        HookKind::AfterRender,
        HookKind::AfterExport,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HookKind::BeforeClone => "before-clone",
            HookKind::AfterClone => "after-clone",
            HookKind::BeforeRender => "before-render",
            HookKind::AfterRender => "after-render",
            HookKind::AfterExport => "after-export",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned by a plugin handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl From<String> for HookError {
    fn from(message: String) -> Self {
        HookError(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        HookError(message.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("invalid plugin: {0}")]
    InvalidPlugin(String),
    #[error("plugin {plugin} failed in {hook}: {message}")]
    HookFailure {
        plugin: String,
        hook: HookKind,
        message: String,
    },
}

/// A pipeline extension.
///
/// Only the handlers for kinds where [`Plugin::handles`] returns `true` are
/// called.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, kind: HookKind) -> bool;

    /// Options used when the plugin is registered without explicit ones.
    fn default_options(&self) -> PluginOptions {
        PluginOptions::new()
    }

    async fn before_clone(
        &self,
        _ctx: &mut CaptureContext<'_>,
        _options: &PluginOptions,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_clone(
        &self,
        _ctx: &mut CaptureContext<'_>,
        _options: &PluginOptions,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn before_render(
        &self,
        _ctx: &mut CaptureContext<'_>,
        _options: &PluginOptions,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_render(
        &self,
        _ctx: &mut CaptureContext<'_>,
        _options: &PluginOptions,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_export(
        &self,
        _ctx: &mut CaptureContext<'_>,
        _options: &PluginOptions,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// A plugin with its resolved options, ready to run.
#[derive(Clone)]
pub struct EffectivePlugin {
    pub name: String,
    pub options: PluginOptions,
    pub plugin: Arc<dyn Plugin>,
}

impl fmt::Debug for EffectivePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectivePlugin")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Inline plugin entry in capture options.
#[derive(Clone, Default)]
pub struct InlinePlugin {
    pub name: String,
    pub options: PluginOptions,
    /// Replaces the registered implementation when set.
    pub plugin: Option<Arc<dyn Plugin>>,
}

impl fmt::Debug for InlinePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlinePlugin")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("has_plugin", &self.plugin.is_some())
            .finish()
    }
}

/// Local plugin entry: a registry name or an inline override.
#[derive(Debug, Clone)]
pub enum PluginSpec {
    Named(String),
    Inline(InlinePlugin),
}

impl PluginSpec {
    pub fn named(name: impl Into<String>) -> Self {
        PluginSpec::Named(name.into())
    }

    pub fn inline(name: impl Into<String>, options: PluginOptions) -> Self {
        PluginSpec::Inline(InlinePlugin {
            name: name.into(),
            options,
            plugin: None,
        })
    }

    /// Inline entry carrying its own implementation.
    pub fn with_plugin(plugin: Arc<dyn Plugin>, options: PluginOptions) -> Self {
        PluginSpec::Inline(InlinePlugin {
            name: plugin.name().to_string(),
            options,
            plugin: Some(plugin),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            PluginSpec::Named(name) => name,
            PluginSpec::Inline(inline) => &inline.name,
        }
    }
}

impl From<&str> for PluginSpec {
    fn from(name: &str) -> Self {
        PluginSpec::named(name)
    }
}

/// Shallow key-wise merge; `overlay` wins.
pub fn merge_options(base: &PluginOptions, overlay: &PluginOptions) -> PluginOptions {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Global plugin registrations, in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<EffectivePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with the plugin's default options.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let options = plugin.default_options();
        self.register_with_options(plugin, options)
    }

    /// Register or replace a plugin. A replaced plugin keeps its position.
    pub fn register_with_options(
        &self,
        plugin: Arc<dyn Plugin>,
        options: PluginOptions,
    ) -> Result<(), PluginError> {
        let name = plugin.name().trim().to_string();
        if name.is_empty() {
            return Err(PluginError::InvalidPlugin(
                "plugin name must not be empty".into(),
            ));
        }
        let entry = EffectivePlugin {
            name: name.clone(),
            options,
            plugin,
        };

        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        match plugins.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                warn!("plugin {name} registered twice; replacing the earlier registration");
                *existing = entry;
            }
            None => plugins.push(entry),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<EffectivePlugin> {
        self.snapshot().into_iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|p| p.name).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn snapshot(&self) -> Vec<EffectivePlugin> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve local specs against the registry, in list order.
    ///
    /// Unknown names and unusable inline entries are skipped; with `debug`
    /// set, each skip is logged.
    pub fn normalize(&self, specs: &[PluginSpec], debug: bool) -> Vec<EffectivePlugin> {
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            match spec {
                PluginSpec::Named(name) => match self.get(name) {
                    Some(base) => out.push(base),
                    None if debug => debug!("unknown plugin {name:?} skipped"),
                    None => {}
                },
                PluginSpec::Inline(inline) => match self.resolve_inline(inline) {
                    Some(effective) => out.push(effective),
                    None if debug => {
                        debug!(
                            "inline plugin {:?} skipped: no registration and no implementation",
                            inline.name
                        );
                    }
                    None => {}
                },
            }
        }
        out
    }

    fn resolve_inline(&self, inline: &InlinePlugin) -> Option<EffectivePlugin> {
        let name = inline.name.trim();
        if name.is_empty() {
            return None;
        }
        match self.get(name) {
            Some(base) => Some(EffectivePlugin {
                name: base.name,
                options: merge_options(&base.options, &inline.options),
                plugin: inline.plugin.clone().unwrap_or(base.plugin),
            }),
            None => inline.plugin.clone().map(|plugin| EffectivePlugin {
                name: name.to_string(),
                options: merge_options(&plugin.default_options(), &inline.options),
                plugin,
            }),
        }
    }

    /// Normalized local plugins followed by the globals they do not name.
    pub fn effective(
        &self,
        specs: &[PluginSpec],
        ignore_global: bool,
        debug: bool,
    ) -> Vec<EffectivePlugin> {
        let mut list = self.normalize(specs, debug);
        if !ignore_global {
            let globals: Vec<EffectivePlugin> = self
                .snapshot()
                .into_iter()
                .filter(|g| !specs.iter().any(|s| s.name().trim() == g.name))
                .collect();
            list.extend(globals);
        }
        list
    }
}

async fn dispatch(
    kind: HookKind,
    plugin: &dyn Plugin,
    ctx: &mut CaptureContext<'_>,
    options: &PluginOptions,
) -> Result<(), HookError> {
    match kind {
        HookKind::BeforeClone => plugin.before_clone(ctx, options).await,
        HookKind::AfterClone => plugin.after_clone(ctx, options).await,
        HookKind::BeforeRender => plugin.before_render(ctx, options).await,
        HookKind::AfterRender => plugin.after_render(ctx, options).await,
        HookKind::AfterExport => plugin.after_export(ctx, options).await,
    }
}

/// Run every handler for `kind` in the context's plugin list, sequentially.
pub async fn run_hook(kind: HookKind, ctx: &mut CaptureContext<'_>) -> Result<(), PluginError> {
    let plugins = ctx.plugins.clone();
    for entry in plugins.iter().filter(|p| p.plugin.handles(kind)) {
        if ctx.options.config.debug {
            debug!("{kind}: {}", entry.name);
        }
        dispatch(kind, entry.plugin.as_ref(), ctx, &entry.options)
            .await
            .map_err(|e| PluginError::HookFailure {
                plugin: entry.name.clone(),
                hook: kind,
                message: e.0,
            })?;
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::capture::CaptureOptions;
    use crate::tree::Element;
    use serde_json::json;
    use std::sync::Mutex;

    /// Plugin that appends `"<name>:<hook>"` to a shared log and to
    /// `ctx.state["trail"]`, optionally failing on one hook kind.
    pub struct RecordingPlugin {
        pub name: String,
        pub kinds: Vec<HookKind>,
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_on: Option<HookKind>,
    }

    impl RecordingPlugin {
        pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                kinds: HookKind::ALL.to_vec(),
                log: Arc::clone(log),
                fail_on: None,
            }
        }

        pub fn only(mut self, kinds: &[HookKind]) -> Self {
            self.kinds = kinds.to_vec();
            self
        }

        pub fn failing_on(mut self, kind: HookKind) -> Self {
            self.fail_on = Some(kind);
            self
        }

        fn record(&self, kind: HookKind, ctx: &mut CaptureContext<'_>) -> Result<(), HookError> {
            let entry = format!("{}:{kind}", self.name);
            self.log.lock().unwrap().push(entry.clone());
            if self.fail_on == Some(kind) {
                return Err(HookError(format!("{} refused", self.name)));
            }
            let trail = ctx
                .state
                .entry("trail")
                .or_insert_with(|| json!([]));
            if let Some(items) = trail.as_array_mut() {
                items.push(json!(entry));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn handles(&self, kind: HookKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn before_clone(
            &self,
            ctx: &mut CaptureContext<'_>,
            _options: &PluginOptions,
        ) -> Result<(), HookError> {
            self.record(HookKind::BeforeClone, ctx)
        }

        async fn after_clone(
            &self,
            ctx: &mut CaptureContext<'_>,
            _options: &PluginOptions,
        ) -> Result<(), HookError> {
            self.record(HookKind::AfterClone, ctx)
        }

        async fn before_render(
            &self,
            ctx: &mut CaptureContext<'_>,
            _options: &PluginOptions,
        ) -> Result<(), HookError> {
            self.record(HookKind::BeforeRender, ctx)
        }

        async fn after_render(
            &self,
            ctx: &mut CaptureContext<'_>,
            _options: &PluginOptions,
        ) -> Result<(), HookError> {
            self.record(HookKind::AfterRender, ctx)
        }

        async fn after_export(
            &self,
            ctx: &mut CaptureContext<'_>,
            _options: &PluginOptions,
        ) -> Result<(), HookError> {
            self.record(HookKind::AfterExport, ctx)
        }
    }

    /// Plugin with fixed default options and no handlers.
    struct Configured {
        name: &'static str,
        defaults: PluginOptions,
    }

    #[async_trait]
    impl Plugin for Configured {
        fn name(&self) -> &str {
            self.name
        }

        fn handles(&self, _kind: HookKind) -> bool {
            false
        }

        fn default_options(&self) -> PluginOptions {
            self.defaults.clone()
        }
    }

    fn opts(value: serde_json::Value) -> PluginOptions {
        value.as_object().cloned().unwrap()
    }

    fn new_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    #[test]
    fn register_rejects_empty_name() {
        let registry = PluginRegistry::new();
        let log = new_log();
        let result = registry.register(Arc::new(RecordingPlugin::new("  ", &log)));
        assert!(matches!(result, Err(PluginError::InvalidPlugin(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistering_replaces_in_place() {
        let registry = PluginRegistry::new();
        let log = new_log();
        registry.register(Arc::new(RecordingPlugin::new("a", &log))).unwrap();
        registry.register(Arc::new(RecordingPlugin::new("b", &log))).unwrap();
        registry
            .register_with_options(Arc::new(RecordingPlugin::new("a", &log)), opts(json!({"v": 2})))
            .unwrap();

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().options, opts(json!({"v": 2})));
    }

    /// Collects warnings so tests can assert on them.
    struct WarningLog(Mutex<Vec<String>>);

    impl log::Log for WarningLog {
        fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record<'_>) {
            if self.enabled(record.metadata()) {
                self.0.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    static WARNINGS: WarningLog = WarningLog(Mutex::new(Vec::new()));

    fn warnings() -> &'static WarningLog {
        // Another test may have installed the logger already.
        if log::set_logger(&WARNINGS).is_ok() {
            log::set_max_level(log::LevelFilter::Warn);
        }
        &WARNINGS
    }

    #[test]
    fn reregistering_warns() {
        let warnings = warnings();
        let registry = PluginRegistry::new();
        let log = new_log();
        registry
            .register(Arc::new(RecordingPlugin::new("registered-twice", &log)))
            .unwrap();
        registry
            .register(Arc::new(RecordingPlugin::new("registered-twice", &log)))
            .unwrap();

        let messages = warnings.0.lock().unwrap();
        assert_eq!(
            messages
                .iter()
                .filter(|m| m.contains("plugin registered-twice registered twice"))
                .count(),
            1
        );
    }

    #[test]
    fn clear_empties_registry() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(RecordingPlugin::new("a", &new_log()))).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }

    // =========================================================================
    // normalize / effective
    // =========================================================================

    #[test]
    fn override_options_merge_onto_base() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(Configured {
                name: "x",
                defaults: opts(json!({"a": 1})),
            }))
            .unwrap();

        let effective = registry.normalize(&[PluginSpec::inline("x", opts(json!({"b": 2})))], false);

        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].options, opts(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn override_value_wins_per_key() {
        let base = opts(json!({"a": 1, "keep": true}));
        let overlay = opts(json!({"a": 5}));
        assert_eq!(merge_options(&base, &overlay), opts(json!({"a": 5, "keep": true})));
    }

    #[test]
    fn override_implementation_replaces_base() {
        let registry = PluginRegistry::new();
        let log = new_log();
        registry
            .register(Arc::new(RecordingPlugin::new("x", &log).only(&[HookKind::AfterRender])))
            .unwrap();

        let replacement: Arc<dyn Plugin> =
            Arc::new(RecordingPlugin::new("x", &log).only(&[HookKind::BeforeClone]));
        let effective = registry.normalize(&[PluginSpec::with_plugin(replacement, PluginOptions::new())], false);

        assert!(effective[0].plugin.handles(HookKind::BeforeClone));
        assert!(!effective[0].plugin.handles(HookKind::AfterRender));
    }

    #[test]
    fn unknown_and_unusable_specs_are_skipped() {
        let registry = PluginRegistry::new();
        let specs = vec![
            PluginSpec::named("missing"),
            PluginSpec::inline("no-impl", PluginOptions::new()),
            PluginSpec::inline("", PluginOptions::new()),
        ];
        assert!(registry.normalize(&specs, true).is_empty());
    }

    #[test]
    fn inline_plugin_without_registration_is_used_as_is() {
        let registry = PluginRegistry::new();
        let plugin: Arc<dyn Plugin> = Arc::new(Configured {
            name: "solo",
            defaults: opts(json!({"d": 0})),
        });
        let effective =
            registry.normalize(&[PluginSpec::with_plugin(plugin, opts(json!({"e": 1})))], false);
        assert_eq!(effective[0].name, "solo");
        assert_eq!(effective[0].options, opts(json!({"d": 0, "e": 1})));
    }

    #[test]
    fn effective_puts_locals_first_and_dedupes_globals() {
        let registry = PluginRegistry::new();
        let log = new_log();
        for name in ["g1", "shared", "g2"] {
            registry.register(Arc::new(RecordingPlugin::new(name, &log))).unwrap();
        }

        let specs = vec![PluginSpec::named("shared")];
        let names: Vec<String> = registry
            .effective(&specs, false, false)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["shared", "g1", "g2"]);

        let locals_only = registry.effective(&specs, true, false);
        assert_eq!(locals_only.len(), 1);
    }

    // =========================================================================
    // run_hook
    // =========================================================================

    #[tokio::test]
    async fn hooks_run_in_order_and_see_earlier_writes() {
        let log = new_log();
        let options = CaptureOptions::default();
        let root = Element::new("div");
        let mut ctx = CaptureContext::new(&options, &root);
        ctx.plugins = vec![
            EffectivePlugin {
                name: "a".into(),
                options: PluginOptions::new(),
                plugin: Arc::new(RecordingPlugin::new("a", &log)),
            },
            EffectivePlugin {
                name: "b".into(),
                options: PluginOptions::new(),
                plugin: Arc::new(RecordingPlugin::new("b", &log)),
            },
        ];

        run_hook(HookKind::AfterRender, &mut ctx).await.unwrap();

        assert_eq!(
            ctx.state["trail"],
            json!(["a:after-render", "b:after-render"])
        );
    }

    #[tokio::test]
    async fn only_handlers_for_the_kind_run() {
        let log = new_log();
        let options = CaptureOptions::default();
        let root = Element::new("div");
        let mut ctx = CaptureContext::new(&options, &root);
        ctx.plugins = vec![EffectivePlugin {
            name: "a".into(),
            options: PluginOptions::new(),
            plugin: Arc::new(RecordingPlugin::new("a", &log).only(&[HookKind::AfterExport])),
        }];

        run_hook(HookKind::BeforeClone, &mut ctx).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_hook_aborts_remaining_plugins() {
        let log = new_log();
        let options = CaptureOptions::default();
        let root = Element::new("div");
        let mut ctx = CaptureContext::new(&options, &root);
        ctx.plugins = vec![
            EffectivePlugin {
                name: "a".into(),
                options: PluginOptions::new(),
                plugin: Arc::new(RecordingPlugin::new("a", &log).failing_on(HookKind::BeforeRender)),
            },
            EffectivePlugin {
                name: "b".into(),
                options: PluginOptions::new(),
                plugin: Arc::new(RecordingPlugin::new("b", &log)),
            },
        ];

        let err = run_hook(HookKind::BeforeRender, &mut ctx).await.unwrap_err();

        assert_eq!(
            err,
            PluginError::HookFailure {
                plugin: "a".into(),
                hook: HookKind::BeforeRender,
                message: "a refused".into(),
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["a:before-render"]);
    }

    #[test]
    fn hook_names() {
        let names: Vec<&str> = HookKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec!["before-clone", "after-clone", "before-render", "after-render", "after-export"]
        );
    }
}
