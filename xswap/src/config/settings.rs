use crate::{
    config::{file, File},
    expiries::LocktimePolicy,
    ledger::ChainId,
    retry::RetryPolicy,
    transaction_builder::{DEFAULT_FEE_RATE, DEFAULT_MINIMUM_FEE},
    HashAlgorithm,
};
use anyhow::{bail, Result};
use std::{collections::BTreeMap, time::Duration};
use tracing::level_filters::LevelFilter;

pub const DEFAULT_CONFIRMATIONS: u32 = 3;
pub const DEFAULT_OFFER_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FEE_BUMP_PERCENT: u64 = 25;

/// This structs represents the settings as they are used throughout the code.
///
/// An optional setting (represented in this struct as an `Option`) has
/// semantic meaning in the application. In other words, it is not just
/// optional for the user to provide, the application also doesn't care
/// whether it is there or not.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub logging: Logging,
    pub swap: Swap,
    pub fees: Fees,
    pub broadcast: RetryPolicy,
    pub default_confirmations: u32,
    pub chains: BTreeMap<ChainId, Chain>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Logging {
    pub level: LevelFilter,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Swap {
    pub locktimes: LocktimePolicy,
    pub offer_validity: Duration,
    pub hash_algorithm: HashAlgorithm,
    pub poll_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fees {
    pub fee_rate: u64,
    pub minimum_fee: u64,
    pub fee_bump_percent: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Chain {
    pub confirmations: u32,
    pub fee_rate: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            logging: Logging {
                level: LevelFilter::INFO,
            },
            swap: Swap {
                locktimes: LocktimePolicy::default(),
                offer_validity: DEFAULT_OFFER_VALIDITY,
                hash_algorithm: HashAlgorithm::Sha256,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
            fees: Fees {
                fee_rate: DEFAULT_FEE_RATE,
                minimum_fee: DEFAULT_MINIMUM_FEE,
                fee_bump_percent: DEFAULT_FEE_BUMP_PERCENT,
            },
            broadcast: RetryPolicy::default(),
            default_confirmations: DEFAULT_CONFIRMATIONS,
            chains: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn from_config_file_and_defaults(config_file: File) -> Result<Self> {
        let File {
            logging,
            swap,
            fees,
            broadcast,
            default_confirmations,
            chains,
        } = config_file;
        let defaults = Settings::default();

        let logging = logging.unwrap_or_default();
        let swap = swap.unwrap_or_default();
        let fees = fees.unwrap_or_default();
        let broadcast = broadcast.unwrap_or_default();
        let default_confirmations = default_confirmations.unwrap_or(defaults.default_confirmations);

        let locktimes = LocktimePolicy {
            safety_margin_blocks: swap
                .safety_margin_blocks
                .unwrap_or(defaults.swap.locktimes.safety_margin_blocks),
            safety_margin_secs: swap
                .safety_margin_secs
                .unwrap_or(defaults.swap.locktimes.safety_margin_secs),
            participant_lock_blocks: swap
                .participant_lock_blocks
                .unwrap_or(defaults.swap.locktimes.participant_lock_blocks),
            participant_lock_secs: swap
                .participant_lock_secs
                .unwrap_or(defaults.swap.locktimes.participant_lock_secs),
        };

        let settings = Settings {
            logging: Logging {
                level: logging
                    .level
                    .map_or(defaults.logging.level, LevelFilter::from),
            },
            swap: Swap {
                locktimes,
                offer_validity: swap
                    .offer_validity_secs
                    .map_or(defaults.swap.offer_validity, Duration::from_secs),
                hash_algorithm: swap.hash_algorithm.unwrap_or(defaults.swap.hash_algorithm),
                poll_interval: swap
                    .poll_interval_secs
                    .map_or(defaults.swap.poll_interval, Duration::from_secs),
            },
            fees: Fees {
                fee_rate: fees.fee_rate.unwrap_or(defaults.fees.fee_rate),
                minimum_fee: fees.minimum_fee.unwrap_or(defaults.fees.minimum_fee),
                fee_bump_percent: fees
                    .fee_bump_percent
                    .unwrap_or(defaults.fees.fee_bump_percent),
            },
            broadcast: RetryPolicy {
                max_attempts: broadcast
                    .max_attempts
                    .unwrap_or(defaults.broadcast.max_attempts),
                initial_backoff: broadcast
                    .initial_backoff_ms
                    .map_or(defaults.broadcast.initial_backoff, Duration::from_millis),
                max_backoff: broadcast
                    .max_backoff_secs
                    .map_or(defaults.broadcast.max_backoff, Duration::from_secs),
            },
            default_confirmations,
            chains: chains
                .unwrap_or_default()
                .into_iter()
                .map(|(id, chain)| (id, Chain::from_file(chain, default_confirmations)))
                .collect(),
        };
        settings.validate()?;

        Ok(settings)
    }

    pub fn confirmations(&self, chain: &ChainId) -> u32 {
        self.chains
            .get(chain)
            .map_or(self.default_confirmations, |chain| chain.confirmations)
    }

    pub fn fee_rate(&self, chain: &ChainId) -> u64 {
        self.chains
            .get(chain)
            .and_then(|chain| chain.fee_rate)
            .unwrap_or(self.fees.fee_rate)
    }

    fn validate(&self) -> Result<()> {
        let locktimes = &self.swap.locktimes;
        if locktimes.safety_margin_blocks == 0 || locktimes.safety_margin_secs == 0 {
            bail!("safety margins must be greater than zero");
        }
        if locktimes.participant_lock_blocks == 0 || locktimes.participant_lock_secs == 0 {
            bail!("participant lock durations must be greater than zero");
        }
        if self.swap.poll_interval.as_secs() == 0 {
            bail!("poll interval must be at least one second");
        }
        if self.fees.fee_rate == 0 {
            bail!("fee rate must be greater than zero");
        }
        if self.broadcast.max_attempts == 0 {
            bail!("at least one broadcast attempt is required");
        }
        if let Some((id, _)) = self
            .chains
            .iter()
            .find(|(_, chain)| chain.confirmations == 0)
        {
            bail!("chain {} requires at least one confirmation", id);
        }
        if self.default_confirmations == 0 {
            bail!("default_confirmations must be at least one");
        }

        Ok(())
    }
}

impl From<Settings> for File {
    fn from(settings: Settings) -> Self {
        let Settings {
            logging: Logging { level },
            swap,
            fees,
            broadcast,
            default_confirmations,
            chains,
        } = settings;

        File {
            logging: Some(file::Logging {
                level: Some(level.into()),
            }),
            swap: Some(file::Swap {
                safety_margin_blocks: Some(swap.locktimes.safety_margin_blocks),
                safety_margin_secs: Some(swap.locktimes.safety_margin_secs),
                participant_lock_blocks: Some(swap.locktimes.participant_lock_blocks),
                participant_lock_secs: Some(swap.locktimes.participant_lock_secs),
                offer_validity_secs: Some(swap.offer_validity.as_secs()),
                hash_algorithm: Some(swap.hash_algorithm),
                poll_interval_secs: Some(swap.poll_interval.as_secs()),
            }),
            fees: Some(file::Fees {
                fee_rate: Some(fees.fee_rate),
                minimum_fee: Some(fees.minimum_fee),
                fee_bump_percent: Some(fees.fee_bump_percent),
            }),
            broadcast: Some(file::Broadcast {
                max_attempts: Some(broadcast.max_attempts),
                initial_backoff_ms: u64::try_from(broadcast.initial_backoff.as_millis()).ok(),
                max_backoff_secs: Some(broadcast.max_backoff.as_secs()),
            }),
            default_confirmations: Some(default_confirmations),
            chains: Some(
                chains
                    .into_iter()
                    .map(|(id, chain)| {
                        (id, file::Chain {
                            confirmations: Some(chain.confirmations),
                            fee_rate: chain.fee_rate,
                        })
                    })
                    .collect(),
            ),
        }
    }
}

impl Chain {
    fn from_file(chain: file::Chain, default_confirmations: u32) -> Self {
        Chain {
            confirmations: chain.confirmations.unwrap_or(default_confirmations),
            fee_rate: chain.fee_rate,
        }
    }
}
