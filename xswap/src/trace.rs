use tracing::{info, level_filters::LevelFilter, subscriber};
use tracing_subscriber::FmtSubscriber;

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(level: LevelFilter) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    subscriber::set_global_default(subscriber)?;
    info!("Initialized tracing with level: {}", level);

    Ok(())
}
