//! Resource cache shared by every resolver in a capture session.
//!
//! Resolving an asset means network I/O plus, for rasters, a decode and a PNG
//! re-encode. The cache lets a session do that work once per asset: every
//! resolver checks it before touching the network and stores its result on
//! success.
//!
//! # Namespaces
//!
//! The cache holds three independent key spaces, selected with [`Namespace`]:
//!
//! | Namespace | Key | Value |
//! |---|---|---|
//! | `Image` | raw image reference as written in the tree | `data:` URL |
//! | `Background` | normalized (absolute, percent-encoded) URL | `data:` URL |
//! | `BaseStyle` | sorted, comma-joined tag-name set | generated CSS |
//!
//! Keys are **content-addressed** (URLs and tag sets, never tree identity), so
//! an entry stays valid for any tree that mentions the same asset.
//!
//! # Lifecycle
//!
//! Entries are written lazily on first successful resolution and never
//! overwritten: [`ResourceCache::insert_if_absent`] keeps the first value and
//! hands it back to later writers, so two concurrent resolutions of the same
//! key always observe one value. Failures are never stored.
//!
//! There is no eviction. [`ResourceCache::reset_all`] is the only way to
//! shrink the cache; the capture orchestrator calls it at the start of every
//! capture.
//!
//! # Sharing
//!
//! A cache is owned by whoever constructs the `Snapshotter` and is passed by
//! reference into every resolver. Sharing one `Arc<ResourceCache>` across
//! sessions is allowed, but those sessions are not isolated: a capture
//! starting in one session resets entries another session may still be
//! relying on. Serialize captures when isolation matters.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Key space of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Image,
    Background,
    BaseStyle,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Image, Namespace::Background, Namespace::BaseStyle];

    pub fn label(self) -> &'static str {
        match self {
            Namespace::Image => "image",
            Namespace::Background => "background",
            Namespace::BaseStyle => "base-style",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Process-wide-or-shared storage for resolved assets.
///
/// All methods take `&self`; each call is a single short critical section
/// and no lock is ever held across an `.await`.
#[derive(Debug, Default)]
pub struct ResourceCache {
    image: Mutex<HashMap<String, String>>,
    background: Mutex<HashMap<String, String>>,
    base_style: Mutex<HashMap<String, String>>,
    stats: Mutex<CacheStats>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, ns: Namespace) -> MutexGuard<'_, HashMap<String, String>> {
        let table = match ns {
            Namespace::Image => &self.image,
            Namespace::Background => &self.background,
            Namespace::BaseStyle => &self.base_style,
        };
        table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats_mut(&self) -> MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an entry, recording a hit or a miss.
    pub fn get(&self, ns: Namespace, key: &str) -> Option<String> {
        let value = self.table(ns).get(key).cloned();
        let mut stats = self.stats_mut();
        match value {
            Some(_) => stats.hit(),
            None => stats.miss(),
        }
        value
    }

    /// Membership test. Does not count towards hit/miss statistics.
    pub fn has(&self, ns: Namespace, key: &str) -> bool {
        self.table(ns).contains_key(key)
    }

    /// Store a value, replacing any previous entry under the same key.
    pub fn set(&self, ns: Namespace, key: impl Into<String>, value: impl Into<String>) {
        self.table(ns).insert(key.into(), value.into());
        self.stats_mut().store();
    }

    /// Store a value unless the key is already present.
    ///
    /// Returns the value held by the cache after the call: the caller's value
    /// when it won, the earlier writer's otherwise.
    pub fn insert_if_absent(
        &self,
        ns: Namespace,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> String {
        let mut table = self.table(ns);
        let mut stored = false;
        let current = table
            .entry(key.into())
            .or_insert_with(|| {
                stored = true;
                value.into()
            })
            .clone();
        drop(table);
        if stored {
            self.stats_mut().store();
        }
        current
    }

    pub fn len(&self, ns: Namespace) -> usize {
        self.table(ns).len()
    }

    pub fn is_empty(&self) -> bool {
        Namespace::ALL.iter().all(|ns| self.table(*ns).is_empty())
    }

    /// Clear every namespace and the statistics.
    pub fn reset_all(&self) {
        for ns in Namespace::ALL {
            self.table(ns).clear();
        }
        *self.stats_mut() = CacheStats::default();
    }

    /// Snapshot of the counters since the last reset.
    pub fn stats(&self) -> CacheStats {
        self.stats_mut().clone()
    }
}

/// Summary of cache activity since the last reset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
    pub stores: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn miss(&mut self) {
        self.misses += 1;
    }

    pub fn store(&mut self) {
        self.stores += 1;
    }

    pub fn lookups(&self) -> u32 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(
                f,
                "{} cached, {} resolved ({} lookups)",
                self.hits,
                self.stores,
                self.lookups()
            )
        } else {
            write!(f, "{} resolved", self.stores)
        }
    }
}
