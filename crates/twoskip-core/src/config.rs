//! Open-time tunables for the engine.
//!
//! [`Config`] mirrors the compile-time constants from the reference
//! implementation (`MAXLEVEL`, `PROB`, `MINREWRITE`, `REWRITE_RATIO`) as
//! struct fields with the same defaults, plus the two open flags
//! (`CREATE`, `MBOXSORT`). A host application may override the tunables
//! from a TOML file or environment variables via [`Config::from_sources`]
//! without recompiling; `Config::default()` reproduces the reference
//! compile-time values exactly and is all the engine itself requires.

use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::comparator::ComparatorKind;
use crate::error::{Error, Result};

/// Format version written to every header.
pub const VERSION: u32 = 1;
/// Highest version this build can read.
pub const MAX_SUPPORTED_VERSION: u32 = 1;
/// Maximum skiplist level a record may carry (0..=31).
pub const MAXLEVEL: u8 = 31;
/// Probability used by the level generator: `P(level >= k) = PROB^(k-1)`.
pub const PROB: f64 = 0.5;
/// Minimum absolute growth (bytes) since the last checkpoint before another
/// checkpoint is considered.
pub const MINREWRITE: u64 = 16_384;
/// Minimum fraction of `current_size` that must be reclaimable before a
/// checkpoint is considered.
pub const REWRITE_RATIO: f64 = 0.2;

/// Open flags, analogous to `CYRUSDB_CREATE`
/// and `CYRUSDB_MBOXSORT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Create the file if it does not already exist.
    pub create: bool,
    /// Use the mailbox-aware comparator instead of raw lexicographic order.
    pub mboxsort: bool,
}

impl OpenFlags {
    /// Shorthand for `{ create: true, ..Default::default() }`.
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::default()
        }
    }

    pub(crate) fn comparator(self) -> ComparatorKind {
        if self.mboxsort {
            ComparatorKind::Mailbox
        } else {
            ComparatorKind::Raw
        }
    }
}

/// Tunable knobs governing checkpoint heuristics and level generation.
///
/// Serde-deserializable so it can be loaded from a TOML overlay with
/// [`Config::from_sources`]; every field defaults to the reference
/// implementation's compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// See [`MAXLEVEL`].
    pub maxlevel: u8,
    /// See [`PROB`].
    pub prob: f64,
    /// See [`MINREWRITE`]. Named `minrewrite_bytes` in TOML/env overlays.
    pub minrewrite_bytes: u64,
    /// See [`REWRITE_RATIO`].
    pub rewrite_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maxlevel: MAXLEVEL,
            prob: PROB,
            minrewrite_bytes: MINREWRITE,
            rewrite_ratio: REWRITE_RATIO,
        }
    }
}

impl Config {
    /// Loads configuration by layering an optional TOML file over the
    /// defaults, then an optional `TWOSKIP_`-prefixed environment overlay
    /// on top, following the `figment` merge-provider pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but fails to parse, or if
    /// an environment value can't be coerced to its field's type.
    pub fn from_sources(toml_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Self::default()));
        if let Some(path) = toml_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("TWOSKIP_"));
        figment
            .extract()
            .map_err(|e| Error::internal(toml_path.unwrap_or(Path::new("<env>")), e.to_string()))
    }
}
