//! Lifecycle tracking of every HTLC the node knows about.

use crate::{
    htlc::HtlcParams, ledger::ChainId, secret::Secret, transaction::{OutPoint, Txid}, Error,
};
use serde::{Deserialize, Serialize};
use std::collections::{hash_map::Entry, HashMap};
use tokio::sync::RwLock;

/// Represents states that an HTLC can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HtlcState {
    /// A funding output was seen but has not reached the confirmation
    /// threshold.
    Pending,
    Funded,
    /// Spent through the preimage branch.
    Claimed,
    /// Spent through the timeout branch.
    Refunded,
    /// The locktime passed while the HTLC was still unspent.
    Expired,
}

impl HtlcState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HtlcState::Claimed | HtlcState::Refunded)
    }

    pub fn can_transition_to(self, next: HtlcState) -> bool {
        use HtlcState::*;

        matches!(
            (self, next),
            (Pending, Funded)
                | (Pending, Expired)
                | (Funded, Claimed)
                | (Funded, Refunded)
                | (Funded, Expired)
                | (Expired, Claimed)
                | (Expired, Refunded)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HtlcInfo {
    pub outpoint: OutPoint,
    pub chain: ChainId,
    pub params: HtlcParams,
    pub amount: u64,
    pub state: HtlcState,
    pub creation_height: u64,
    /// Zero while unsettled.
    pub settlement_height: u64,
    pub settlement_transaction: Option<Txid>,
    pub preimage: Option<Secret>,
}

impl HtlcInfo {
    pub fn pending(
        outpoint: OutPoint,
        chain: ChainId,
        params: HtlcParams,
        amount: u64,
        creation_height: u64,
    ) -> Self {
        HtlcInfo {
            outpoint,
            chain,
            params,
            amount,
            state: HtlcState::Pending,
            creation_height,
            settlement_height: 0,
            settlement_transaction: None,
            preimage: None,
        }
    }

    pub fn is_expired_at(&self, height: u64, time: u64) -> bool {
        matches!(self.state, HtlcState::Pending | HtlcState::Funded)
            && self.params.locktime().is_reached(height, time)
    }

    fn transition_to_funded(&mut self, block_height: u64) {
        self.state = HtlcState::Funded;
        if block_height > 0 {
            self.creation_height = block_height;
        }
    }

    fn transition_to_claimed(&mut self, transaction: Txid, height: u64, preimage: Secret) {
        self.state = HtlcState::Claimed;
        self.settlement_transaction = Some(transaction);
        self.settlement_height = height;
        self.preimage = Some(preimage);
    }

    fn transition_to_refunded(&mut self, transaction: Txid, height: u64) {
        self.state = HtlcState::Refunded;
        self.settlement_transaction = Some(transaction);
        self.settlement_height = height;
    }

    fn transition_to_expired(&mut self) {
        self.state = HtlcState::Expired;
    }
}

/// A state change together with the data the new state carries.
#[derive(Clone, Copy, Debug, PartialEq, strum_macros::Display)]
pub enum Transition {
    Funded {
        block_height: u64,
    },
    Claimed {
        transaction: Txid,
        height: u64,
        preimage: Secret,
    },
    Refunded {
        transaction: Txid,
        height: u64,
    },
    Expired,
}

impl Transition {
    pub fn target(&self) -> HtlcState {
        match self {
            Transition::Funded { .. } => HtlcState::Funded,
            Transition::Claimed { .. } => HtlcState::Claimed,
            Transition::Refunded { .. } => HtlcState::Refunded,
            Transition::Expired => HtlcState::Expired,
        }
    }
}

/// Index of known HTLCs keyed by their funding outpoint.
///
/// Reads run concurrently, every write holds the lock exclusively.
#[derive(Debug, Default)]
pub struct HtlcManager {
    htlcs: RwLock<HashMap<OutPoint, HtlcInfo>>,
}

impl HtlcManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-seeds the index, e.g. from persisted records after a restart.
    pub fn with_htlcs(htlcs: impl IntoIterator<Item = HtlcInfo>) -> Self {
        let htlcs = htlcs
            .into_iter()
            .map(|info| (info.outpoint, info))
            .collect();

        HtlcManager {
            htlcs: RwLock::new(htlcs),
        }
    }

    pub async fn add_htlc(&self, info: HtlcInfo) -> Result<(), Error> {
        if info.state != HtlcState::Pending {
            return Err(Error::InvalidTransition {
                from: HtlcState::Pending,
                to: info.state,
            });
        }

        let mut htlcs = self.htlcs.write().await;
        match htlcs.entry(info.outpoint) {
            Entry::Occupied(_) => Err(Error::DuplicateHtlc(info.outpoint)),
            Entry::Vacant(entry) => {
                tracing::debug!(outpoint = %info.outpoint, chain = %info.chain, "tracking new htlc");
                entry.insert(info);
                Ok(())
            }
        }
    }

    pub async fn update_state(
        &self,
        outpoint: &OutPoint,
        transition: Transition,
    ) -> Result<HtlcInfo, Error> {
        let mut htlcs = self.htlcs.write().await;
        let info = htlcs
            .get_mut(outpoint)
            .ok_or(Error::UnknownHtlc(*outpoint))?;

        let from = info.state;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        match transition {
            Transition::Funded { block_height } => info.transition_to_funded(block_height),
            Transition::Claimed {
                transaction,
                height,
                preimage,
            } => info.transition_to_claimed(transaction, height, preimage),
            Transition::Refunded {
                transaction,
                height,
            } => info.transition_to_refunded(transaction, height),
            Transition::Expired => info.transition_to_expired(),
        }
        tracing::debug!(%outpoint, %from, %to, "htlc changed state");

        Ok(info.clone())
    }

    pub async fn get(&self, outpoint: &OutPoint) -> Result<HtlcInfo, Error> {
        self.htlcs
            .read()
            .await
            .get(outpoint)
            .cloned()
            .ok_or(Error::UnknownHtlc(*outpoint))
    }

    pub async fn all(&self) -> Vec<HtlcInfo> {
        self.htlcs.read().await.values().cloned().collect()
    }

    pub async fn by_state(&self, state: HtlcState) -> Vec<HtlcInfo> {
        self.htlcs
            .read()
            .await
            .values()
            .filter(|info| info.state == state)
            .cloned()
            .collect()
    }

    /// Pending or funded HTLCs whose locktime is at or below the given chain
    /// height (block-height locktimes) or median time (timestamp locktimes).
    pub async fn expired(&self, current_height: u64, current_time: u64) -> Vec<HtlcInfo> {
        self.htlcs
            .read()
            .await
            .values()
            .filter(|info| info.is_expired_at(current_height, current_time))
            .cloned()
            .collect()
    }

    /// Like [`HtlcManager::expired`] but restricted to one chain, whose tip
    /// the height and time belong to.
    pub async fn expired_on(
        &self,
        chain: &ChainId,
        current_height: u64,
        current_time: u64,
    ) -> Vec<HtlcInfo> {
        self.htlcs
            .read()
            .await
            .values()
            .filter(|info| info.chain == *chain)
            .filter(|info| info.is_expired_at(current_height, current_time))
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.htlcs.read().await.len()
    }

    pub async fn count_by_state(&self, state: HtlcState) -> usize {
        self.htlcs
            .read()
            .await
            .values()
            .filter(|info| info.state == state)
            .count()
    }

    /// Only settled HTLCs can be removed.
    pub async fn remove(&self, outpoint: &OutPoint) -> Result<HtlcInfo, Error> {
        let mut htlcs = self.htlcs.write().await;
        match htlcs.entry(*outpoint) {
            Entry::Vacant(_) => Err(Error::UnknownHtlc(*outpoint)),
            Entry::Occupied(entry) if !entry.get().state.is_terminal() => {
                Err(Error::InvalidTransition {
                    from: entry.get().state,
                    to: entry.get().state,
                })
            }
            Entry::Occupied(entry) => Ok(entry.remove()),
        }
    }
}
