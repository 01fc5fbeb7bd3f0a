//! The per-chain boundary: everything the swap protocol needs to know about,
//! and do on, a blockchain.

use crate::{
    htlc::{HtlcParams, PaymentHash},
    ledger::ChainId,
    transaction::{OutPoint, Script, Transaction, Txid},
};
use async_trait::async_trait;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxStatus {
    NotFound,
    /// In the mempool.
    Pending,
    /// Mined, below the confirmation threshold.
    Confirming,
    Confirmed,
    Spent,
    Failed,
}

/// An HTLC funding output as seen on chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HtlcTransaction {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub script: Script,
    pub confirmations: u32,
    /// Zero while unconfirmed.
    pub block_height: u64,
    pub status: TxStatus,
}

/// The height and median time of a chain's best block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    pub median_time: u64,
}

/// Something a monitor observed for one of the watched HTLCs.
#[derive(Clone, Debug, PartialEq, strum_macros::Display)]
pub enum ChainEvent {
    HtlcDetected(HtlcTransaction),
    /// Emitted whenever the confirmation count of a funding output changes.
    HtlcConfirmed(HtlcTransaction),
    HtlcClaimed {
        htlc: HtlcTransaction,
        /// The spending transaction, whose witness reveals the preimage.
        transaction: Transaction,
        /// The preimage as reported by the monitor.
        preimage: Vec<u8>,
        height: u64,
    },
    HtlcRefunded {
        htlc: HtlcTransaction,
        transaction: Transaction,
        height: u64,
    },
}

impl ChainEvent {
    pub fn htlc(&self) -> &HtlcTransaction {
        match self {
            ChainEvent::HtlcDetected(htlc) | ChainEvent::HtlcConfirmed(htlc) => htlc,
            ChainEvent::HtlcClaimed { htlc, .. } | ChainEvent::HtlcRefunded { htlc, .. } => htlc,
        }
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum BroadcastError {
    /// The transaction's locktime has not been reached yet.
    #[error("transaction is not final yet")]
    NotFinal,
    #[error("transaction was rejected: {0}")]
    Rejected(String),
    #[error("node is unavailable: {0}")]
    Unavailable(String),
}

impl BroadcastError {
    /// A non-final transaction is resubmitted once the chain catches up, not
    /// retried right away.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BroadcastError::NotFinal)
    }
}

/// Access to one blockchain.
///
/// Events for watched HTLCs are delivered through the streams handed out by
/// [`BlockchainMonitor::subscribe`]. Implementations must emit
/// `HtlcConfirmed` every time the confirmation count of a watched funding
/// output changes and must only emit `HtlcClaimed`/`HtlcRefunded` for
/// confirmed spends.
#[async_trait]
pub trait BlockchainMonitor: Send + Sync + 'static {
    fn chain(&self) -> &ChainId;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    fn is_active(&self) -> bool;

    async fn chain_tip(&self) -> anyhow::Result<ChainTip>;

    /// Starts reporting funding outputs paying to the HTLC described by
    /// `params`, and their spends.
    async fn watch_for_htlc(&self, params: &HtlcParams) -> anyhow::Result<()>;

    async fn stop_watching_htlc(&self, payment_hash: &PaymentHash) -> anyhow::Result<()>;

    async fn htlc_transaction(&self, outpoint: &OutPoint) -> anyhow::Result<Option<HtlcTransaction>>;

    async fn confirmations(&self, txid: &Txid) -> anyhow::Result<u32>;

    /// Resolves once a transaction spending `outpoint` through the preimage
    /// branch is seen, with the preimage it revealed.
    async fn watch_for_preimage(&self, outpoint: &OutPoint) -> anyhow::Result<Vec<u8>>;

    async fn is_htlc_spent(&self, outpoint: &OutPoint) -> anyhow::Result<bool>;

    async fn broadcast_transaction(&self, raw_hex: &str) -> Result<Txid, BroadcastError>;

    fn subscribe(&self) -> mpsc::Receiver<ChainEvent>;
}
