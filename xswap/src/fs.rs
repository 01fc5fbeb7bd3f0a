use crate::config::{File, Settings};
use anyhow::Context;
use std::path::{Path, PathBuf};

// Linux: /home/<user>/.config/xswap/
// OSX: /Users/<user>/Library/Preferences/xswap/
fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "xswap")
        .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    config_dir()
        .map(|dir| Path::join(&dir, "config.toml"))
        .context("Could not generate default configuration path")
}

/// The settings as a config file that reads back to the same settings.
pub fn dump_config(settings: Settings) -> anyhow::Result<String> {
    let file = File::from(settings);

    Ok(toml::to_string(&file)?)
}
