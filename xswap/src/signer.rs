use crate::{ledger::ChainId, transaction::Transaction, witness::UnsignedTransaction};
use async_trait::async_trait;

/// Holds the keys. Receives unsigned transactions with their signing inputs
/// and returns them fully signed.
///
/// Implementations typically sign every [`UnsignedTransaction::signature_hash`]
/// with the key of the input's signing key and call
/// [`UnsignedTransaction::finalize`].
#[async_trait]
pub trait Signer: Send + Sync + 'static {
    async fn sign(&self, chain: &ChainId, unsigned: UnsignedTransaction) -> anyhow::Result<Transaction>;
}
