use crate::{
    htlc_manager::HtlcState, ledger::ChainId, monitor::BroadcastError, swap::SwapState,
    transaction::{OutPoint, Txid},
    SwapId,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid HTLC parameters: {0}")]
    InvalidParameters(String),
    #[error("script does not match the HTLC template")]
    MalformedScript,
    #[error("preimage does not hash to the payment hash")]
    PreimageMismatch,
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("broadcast failed: {0}")]
    BroadcastFailure(#[from] BroadcastError),
    #[error("swap {swap_id} is stuck: {reason}")]
    SwapStuck { swap_id: SwapId, reason: String },
    #[error("invalid swap offer: {0}")]
    InvalidOffer(String),
    #[error("unknown swap {0}")]
    UnknownSwap(SwapId),
    #[error("unknown HTLC {0}")]
    UnknownHtlc(OutPoint),
    #[error("HTLC {0} is already tracked")]
    DuplicateHtlc(OutPoint),
    #[error("HTLC cannot transition from {from} to {to}")]
    InvalidTransition { from: HtlcState, to: HtlcState },
    #[error("swap {swap_id} cannot {action} in state {state}")]
    InvalidSwapState {
        swap_id: SwapId,
        state: SwapState,
        action: &'static str,
    },
    #[error("no blockchain monitor registered for chain {0}")]
    UnknownChain(ChainId),
    #[error("signer returned transaction {actual} instead of {expected}")]
    TransactionMismatch { expected: Txid, actual: Txid },
    #[error("signer failed: {0:#}")]
    Signer(anyhow::Error),
    #[error("blockchain monitor failed: {0:#}")]
    Monitor(anyhow::Error),
    #[error("failed to decode transaction: {0}")]
    Decode(String),
}

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BroadcastFailure(e) => e.is_transient(),
            Error::Signer(_) | Error::Monitor(_) => true,
            _ => false,
        }
    }
}
