pub mod file;
pub mod settings;

use anyhow::{anyhow, Context};
use std::path::PathBuf;

pub use self::{file::File, settings::Settings};

pub fn read_config<T>(config_file: &Option<PathBuf>, default_config_path: T) -> anyhow::Result<File>
where
    T: FnOnce() -> anyhow::Result<PathBuf>,
{
    let path = config_file
        .as_ref()
        .map(|path| {
            tracing::info!("Using config file {}", path.display());
            path
        })
        .map_or_else(
            || {
                let default_path = default_config_path()?;

                if default_path.exists() {
                    tracing::info!(
                        "Using config file at default path: {}",
                        default_path.display()
                    );
                    Ok(default_path)
                } else {
                    tracing::info!("No config file at default path {}", default_path.display());
                    Err(anyhow!("no config file"))
                }
            },
            |path| Ok(path.to_path_buf()),
        )
        .ok();

    match path {
        Some(path) => File::read(&path)
            .with_context(|| format!("failed to read config file {}", path.display())),
        None => Ok(File::default()),
    }
}
