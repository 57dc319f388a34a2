//! Key/value access to process environment settings.
//!
//! The host reads a handful of platform-provided variables on hot paths
//! (every health check reads the sandbox counter blob). `SystemEnvironment`
//! caches lookups; the cache is dropped explicitly via [`Environment::reset`]
//! when the host specializes out of standby mode, which is the only time the
//! platform rewrites these values.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

/// Well-known environment variable names.
pub mod names {
    /// JSON blob of sandbox resource counters and their limits.
    pub const APP_COUNTERS: &str = "WEBSITE_COUNTERS_APP";
    /// `1` while the host runs a placeholder (standby) configuration.
    pub const PLACEHOLDER_MODE: &str = "WEBSITE_PLACEHOLDER_MODE";
    /// `<subscription-id>+<resource-group>-<region>webspace`.
    pub const OWNER_NAME: &str = "WEBSITE_OWNER_NAME";
    pub const SITE_NAME: &str = "WEBSITE_SITE_NAME";
    pub const SLOT_NAME: &str = "WEBSITE_SLOT_NAME";
}

/// Read access to environment settings.
pub trait Environment: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    /// Drop any cached values so the next `get` observes the live source.
    fn reset(&self) {}

    /// True when the host is running a placeholder configuration.
    fn is_placeholder_mode(&self) -> bool {
        self.get(names::PLACEHOLDER_MODE).as_deref() == Some("1")
    }
}

/// The real process environment with a read-through cache.
///
/// Absent variables are cached too, so a missing counter blob costs one
/// `std::env::var` call rather than one per health check.
#[derive(Debug, Default)]
pub struct SystemEnvironment {
    cache: RwLock<HashMap<String, Option<String>>>,
}

impl SystemEnvironment {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Environment for SystemEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        if let Ok(cache) = self.cache.read()
            && let Some(value) = cache.get(name)
        {
            return value.clone();
        }

        let value = std::env::var(name).ok();
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(name.to_string(), value.clone());
        }
        value
    }

    fn reset(&self) {
        if let Ok(mut cache) = self.cache.write() {
            let dropped = cache.len();
            cache.clear();
            debug!(dropped, "environment cache reset");
        }
    }
}

/// In-memory environment, mutable through a shared reference.
#[derive(Debug, Default)]
pub struct StaticEnvironment {
    values: RwLock<HashMap<String, String>>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, value: &str) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(name);
        }
    }
}

impl Environment for StaticEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().ok()?.get(name).cloned()
    }
}
