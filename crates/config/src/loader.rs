use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::TetherConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["tether.toml", "tether.yaml", "tether.yml", "tether.json"];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

fn override_slot() -> MutexGuard<'static, Option<PathBuf>> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Set a custom config directory. When set, discovery only looks in this
/// directory. Each call replaces the previous override.
pub fn set_config_dir(path: PathBuf) {
    *override_slot() = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *override_slot() = None;
}

fn config_dir_override() -> Option<PathBuf> {
    override_slot().clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<TetherConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./tether.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/tether/tether.{toml,yaml,yml,json}` (user-global)
///
/// Returns `TetherConfig::default()` if no config file is found or the file
/// fails to parse.
pub fn discover_and_load() -> TetherConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return TetherConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            TetherConfig::default()
        },
    }
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Find the first config file in standard locations.
///
/// With a config dir override set, only that directory is searched.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }

    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|d| first_existing(&d)))
}

/// Returns the config directory: override, or `~/.config/tether/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("tether"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<TetherConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
