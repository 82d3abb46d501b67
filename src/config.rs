//! Data-access settings.
//!
//! ```toml
//! [cache]
//! capacity = 500
//! time_to_live = "8h"
//!
//! [batch]
//! max_batch_size = 25
//! window = "0ms"
//! ```
//!
//! Every field is optional. Durations are humantime strings (`"90s"`,
//! `"8h"`, `"250ms"`); one that does not parse fails like any other bad
//! value, as [`ConfigError::Toml`] pointing at the field.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub cache: CacheConfig,
    pub batch: BatchConfig,
}

impl Settings {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum live entries. `0` is treated as `1`.
    pub capacity: usize,
    #[serde(deserialize_with = "duration")]
    pub time_to_live: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 500, time_to_live: Duration::from_secs(8 * 60 * 60) }
    }
}

impl CacheConfig {
    pub(crate) fn effective_capacity(&self) -> usize {
        self.capacity.max(1)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Keys per store call. `0` is treated as `1`.
    pub max_batch_size: usize,
    /// How long an open batch collects submissions before dispatch. Zero
    /// means a single scheduler yield: everything submitted by tasks that
    /// are already runnable joins the batch.
    #[serde(deserialize_with = "duration")]
    pub window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch_size: 25, window: Duration::ZERO }
    }
}

impl BatchConfig {
    pub(crate) fn effective_max(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}
