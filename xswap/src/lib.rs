#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::print_stdout,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod driver;
mod error;
pub mod expiries;
pub mod fs;
pub mod htlc;
pub mod htlc_manager;
pub mod identity;
pub mod ledger;
pub mod monitor;
mod retry;
mod secret;
pub mod signer;
pub mod swap;
mod timestamp;
pub mod trace;
pub mod transaction;
pub mod transaction_builder;
pub mod witness;

pub use self::{
    coordinator::{Coordinator, Locktimes, OfferRequest, Snapshot},
    driver::Driver,
    error::Error,
    htlc::{HashAlgorithm, HtlcParams, Locktime, LocktimeKind, PaymentHash},
    htlc_manager::{HtlcInfo, HtlcManager, HtlcState},
    identity::PublicKey,
    ledger::ChainId,
    monitor::{BlockchainMonitor, BroadcastError, ChainEvent, ChainTip, HtlcTransaction},
    retry::RetryPolicy,
    secret::{FromErr, Secret},
    signer::Signer,
    swap::{Payout, Role, SwapEvent, SwapEventKind, SwapId, SwapInfo, SwapOffer, SwapState},
    timestamp::Timestamp,
    transaction::{Address, OutPoint, Script, Transaction, Txid},
    transaction_builder::{TransactionBuilder, Utxo},
};

/// The two legs of a swap, named after the party that funds them.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    #[strum(serialize = "initiator")]
    Initiator,
    #[strum(serialize = "participant")]
    Participant,
}

impl Leg {
    pub fn other(self) -> Leg {
        match self {
            Leg::Initiator => Leg::Participant,
            Leg::Participant => Leg::Initiator,
        }
    }
}
