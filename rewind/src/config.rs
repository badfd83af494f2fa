use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rewind_target::ByteOrder;
use serde::{Deserialize, Serialize};

use crate::{cache::CachingPolicy, Error};

/// Prefix of the environment variables that override configuration values.
pub const ENV_PREFIX: &str = "REWIND_";

/// Tunables of an address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnwindConfig {
    /// Whether procedure information is cached.
    pub caching_policy: CachingPolicy,
    /// Byte order used to decode captured memory.
    pub byte_order: ByteOrder,
    /// Upper bound on the frames a backtrace collects.
    pub max_frames: usize,
    /// Objects kept in reserve by the cache's memory pool. 0 derives a default.
    pub pool_reserve: usize,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        Self {
            caching_policy: CachingPolicy::Global,
            byte_order: ByteOrder::native(),
            max_frames: 256,
            pool_reserve: 0,
        }
    }
}

impl UnwindConfig {
    /// The defaults, overridden by `REWIND_*` environment variables.
    pub fn load() -> Result<Self, Error> {
        Self::extract(Self::figment())
    }

    /// The defaults, overridden by the TOML file at `path`, overridden by `REWIND_*` environment
    /// variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    fn extract(figment: Figment) -> Result<Self, Error> {
        let config: Self = figment.extract().map_err(Box::new)?;
        tracing::debug!("Unwinder configuration: {config:?}");
        Ok(config)
    }
}
