use crate::{ledger::ChainId, HashAlgorithm};
use ::config as config_rs;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, ffi::OsStr, path::Path};
use tracing::level_filters::LevelFilter;

/// This struct aims to represent the configuration file as it appears on disk.
///
/// Most importantly, optional elements of the configuration file are
/// represented as `Option`s` here. This allows us to create a dedicated step
/// for filling in default values for absent configuration options.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct File {
    /// Confirmations required on chains without a `[chains.<id>]` entry.
    pub default_confirmations: Option<u32>,
    pub logging: Option<Logging>,
    pub swap: Option<Swap>,
    pub fees: Option<Fees>,
    pub broadcast: Option<Broadcast>,
    pub chains: Option<BTreeMap<ChainId, Chain>>,
}

impl File {
    pub fn read<D>(config_file: D) -> Result<Self, config_rs::ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        config_rs::Config::builder()
            .add_source(config_rs::File::from(config_file))
            .build()?
            .try_deserialize()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Logging {
    pub level: Option<Level>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LevelFilter> for Level {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::TRACE => Level::Trace,
            LevelFilter::DEBUG => Level::Debug,
            LevelFilter::INFO => Level::Info,
            LevelFilter::WARN => Level::Warn,
            // Logging cannot be switched off.
            _ => Level::Error,
        }
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Swap {
    pub safety_margin_blocks: Option<u64>,
    pub safety_margin_secs: Option<u64>,
    pub participant_lock_blocks: Option<u64>,
    pub participant_lock_secs: Option<u64>,
    pub offer_validity_secs: Option<u64>,
    pub hash_algorithm: Option<HashAlgorithm>,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Fees {
    /// Base units per 1000 bytes.
    pub fee_rate: Option<u64>,
    pub minimum_fee: Option<u64>,
    /// Added to the fee rate on every rebroadcast.
    pub fee_bump_percent: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Broadcast {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Chain {
    pub confirmations: Option<u32>,
    pub fee_rate: Option<u64>,
}
