mod loader;
mod schema;

pub use loader::{load_config, parse_config};
pub use schema::*;

use anyhow::Result;
use std::path::{Path, PathBuf};

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        loader::load_config(path)
    }

    /// `~/.promptgate/config.yaml`, if a home directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".promptgate").join("config.yaml"))
    }

    /// Explicit path, else the per-user file, else `config/default.yaml`,
    /// else built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let candidates = Self::default_path()
            .into_iter()
            .chain(std::iter::once(PathBuf::from("config/default.yaml")));
        for candidate in candidates {
            if candidate.exists() {
                tracing::debug!("Loading config from {}", candidate.display());
                return Self::load(&candidate);
            }
        }

        tracing::debug!("No config file found, using defaults");
        loader::parse_config("{}")
    }
}
