//! Checks an xswap configuration and shows the settings it resolves to.
//! Swaps themselves run inside an embedding application, which brings the
//! chain monitors and the signer.

#![warn(unused_extern_crates, missing_debug_implementations, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Context;
use std::path::PathBuf;
use structopt::StructOpt;
use xswap::{
    config::{read_config, Settings},
    fs, trace,
};

#[derive(StructOpt, Debug)]
struct Options {
    /// Path to configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config_file: Option<PathBuf>,

    /// Dump the current configuration and exit
    #[structopt(long = "dump-config")]
    dump_config: bool,
}

fn main() -> anyhow::Result<()> {
    let options = Options::from_args();

    let file = read_config(&options.config_file, fs::default_config_path)?;
    let settings = Settings::from_config_file_and_defaults(file)
        .context("could not initialize configuration")?;

    if options.dump_config {
        // Not logged, so the output can be saved as a config file.
        println!("{}", fs::dump_config(settings)?);
        return Ok(());
    }

    trace::init_tracing(settings.logging.level).context("failed to initialize tracing")?;
    tracing::info!(
        chains = settings.chains.len(),
        confirmations = settings.default_confirmations,
        hash_algorithm = %settings.swap.hash_algorithm,
        "configuration is valid"
    );
    tracing::debug!("{:?}", settings);

    Ok(())
}
