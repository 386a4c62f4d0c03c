use std::path::PathBuf;

pub const APP_NAME: &str = "tether";

/// Filename of the primary config under `<config-root>/tether/`.
pub const CONFIG_FILENAME: &str = "config.json";

/// Legacy filenames searched in the working directory when the primary
/// config is absent.
pub const LEGACY_CONFIG_FILENAMES: &[&str] = &["tether.json", ".tether.json"];

/// Base config directory: `$XDG_CONFIG_HOME`, then the platform default.
pub fn config_root() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Base data directory: `$XDG_DATA_HOME`, then the platform default.
pub fn data_root() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::data_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `<config-root>/tether/config.json`, also the target of field writes.
pub fn global_config_path() -> PathBuf {
    config_root().join(APP_NAME).join(CONFIG_FILENAME)
}
