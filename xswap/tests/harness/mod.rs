#![allow(dead_code)]

mod mock_chain;

pub use self::mock_chain::MockChain;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::channel::mpsc;
use std::{future::Future, sync::Arc, time::Duration};
use bitcoin::hashes::Hash;
use xswap::{
    config::Settings, witness::UnsignedTransaction, Address, BlockchainMonitor, ChainEvent,
    ChainId, Coordinator, Error, HtlcManager, HtlcState, Leg, Locktime, Locktimes, OfferRequest,
    OutPoint, Payout, PublicKey, RetryPolicy, Script, Signer, SwapEvent, SwapEventKind, SwapId,
    SwapState, Transaction, Txid, Utxo,
};

pub const INITIATOR_KEY: u8 = 2;
pub const PARTICIPANT_KEY: u8 = 3;
pub const INITIATOR_AMOUNT: u64 = 100_000;
pub const PARTICIPANT_AMOUNT: u64 = 4_000_000;
pub const WALLET_BALANCE: u64 = 10_000_000;

/// Signs with a fake signature: a DER marker byte followed by the digest.
#[derive(Debug, Default)]
pub struct MockSigner;

#[async_trait]
impl Signer for MockSigner {
    async fn sign(&self, _: &ChainId, unsigned: UnsignedTransaction) -> anyhow::Result<Transaction> {
        let signatures = (0..unsigned.inputs.len())
            .map(|index| {
                let digest = unsigned
                    .signature_hash(index)
                    .ok_or_else(|| anyhow!("no input {}", index))?;
                let mut signature = vec![0x30];
                signature.extend_from_slice(&digest);
                Ok(signature)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(unsigned.finalize(signatures)?)
    }
}

/// Returns a different transaction than the one it was asked to sign.
#[derive(Debug, Default)]
pub struct TamperingSigner;

#[async_trait]
impl Signer for TamperingSigner {
    async fn sign(&self, chain: &ChainId, unsigned: UnsignedTransaction) -> anyhow::Result<Transaction> {
        let mut transaction = MockSigner.sign(chain, unsigned).await?;
        transaction.output[0].value -= 1;

        Ok(transaction)
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.broadcast = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    };
    settings.swap.poll_interval = Duration::from_millis(20);

    settings
}

pub fn key(byte: u8) -> PublicKey {
    PublicKey::from_slice(&[byte; 33]).unwrap()
}

pub fn address(byte: u8) -> Address {
    Address::from_script_pubkey(Script::from(vec![0x00, 0x14, byte]))
}

pub fn utxo(owner: &PublicKey, value: u64) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(Txid::from_inner(rand::random()), 0),
        value,
        script_pubkey: address(0xaa).script_pubkey().clone(),
        owner: owner.clone(),
    }
}

pub fn coordinator(
    settings: Settings,
    chains: &[Arc<MockChain>],
    signer: Arc<dyn Signer>,
) -> (Arc<Coordinator>, mpsc::UnboundedReceiver<SwapEvent>) {
    let monitors = chains
        .iter()
        .map(|chain| chain.clone() as Arc<dyn BlockchainMonitor>)
        .collect();
    let (coordinator, events) =
        Coordinator::new(settings, Arc::new(HtlcManager::new()), monitors, signer);

    (Arc::new(coordinator), events)
}

/// One party of a swap, with its chain event subscriptions delivered by
/// hand through [`Node::sync`].
#[derive(Debug)]
pub struct Node {
    pub coordinator: Arc<Coordinator>,
    pub events: mpsc::UnboundedReceiver<SwapEvent>,
    pub key_byte: u8,
    receivers: Vec<(ChainId, mpsc::Receiver<ChainEvent>)>,
}

impl Node {
    pub fn new(chains: &[Arc<MockChain>], key_byte: u8) -> Self {
        Self::with(settings(), chains, key_byte, Arc::new(MockSigner))
    }

    pub fn with(
        settings: Settings,
        chains: &[Arc<MockChain>],
        key_byte: u8,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let (coordinator, events) = coordinator(settings, chains, signer);
        Self::from_coordinator(coordinator, events, chains, key_byte)
    }

    pub fn from_coordinator(
        coordinator: Arc<Coordinator>,
        events: mpsc::UnboundedReceiver<SwapEvent>,
        chains: &[Arc<MockChain>],
        key_byte: u8,
    ) -> Self {
        let receivers = chains
            .iter()
            .map(|chain| (chain.id(), chain.subscribe()))
            .collect();

        Node {
            coordinator,
            events,
            key_byte,
            receivers,
        }
    }

    pub fn pubkey(&self) -> PublicKey {
        key(self.key_byte)
    }

    pub fn payout(&self) -> Payout {
        Payout {
            claim_address: address(self.key_byte + 0x10),
            refund_address: address(self.key_byte + 0x20),
        }
    }

    /// Hands every pending chain event to the coordinator.
    pub async fn sync(&mut self) -> Result<(), Error> {
        for (chain, receiver) in &mut self.receivers {
            while let Ok(Some(event)) = receiver.try_next() {
                self.coordinator.handle_chain_event(chain, event).await?;
            }
        }

        Ok(())
    }

    /// Like [`Node::sync`], but drops the events of `offline` unseen.
    pub async fn sync_except(&mut self, offline: &ChainId) -> Result<(), Error> {
        for (chain, receiver) in &mut self.receivers {
            while let Ok(Some(event)) = receiver.try_next() {
                if chain == offline {
                    continue;
                }
                self.coordinator.handle_chain_event(chain, event).await?;
            }
        }

        Ok(())
    }

    pub fn swap_events(&mut self) -> Vec<SwapEventKind> {
        let mut kinds = Vec::new();
        while let Ok(Some(event)) = self.events.try_next() {
            kinds.push(event.kind);
        }

        kinds
    }

    pub async fn fund(&self, swap_id: SwapId) -> Result<Txid, Error> {
        self.coordinator
            .fund(
                swap_id,
                vec![utxo(&self.pubkey(), WALLET_BALANCE)],
                address(self.key_byte + 0x30),
            )
            .await
    }

    pub async fn state(&self, swap_id: SwapId) -> SwapState {
        self.coordinator.swap(swap_id).await.unwrap().state
    }

    pub async fn htlc_state(&self, swap_id: SwapId, leg: Leg) -> Option<HtlcState> {
        let swap = self.coordinator.swap(swap_id).await.ok()?;
        let outpoint = swap.leg(leg).htlc?;

        self.coordinator
            .htlcs()
            .get(&outpoint)
            .await
            .ok()
            .map(|info| info.state)
    }
}

/// Runs the offer exchange and starts the swap on both sides.
pub async fn negotiate(
    initiator: &Node,
    participant: &Node,
    initiator_chain: &MockChain,
    participant_chain: &MockChain,
    participant_locktime: Locktime,
    initiator_locktime: Locktime,
) -> SwapId {
    let offer = initiator
        .coordinator
        .create_offer(OfferRequest {
            initiator_chain: initiator_chain.id(),
            participant_chain: participant_chain.id(),
            initiator_amount: INITIATOR_AMOUNT,
            participant_amount: PARTICIPANT_AMOUNT,
            initiator_pubkey: initiator.pubkey(),
            payout: initiator.payout(),
            locktimes: Locktimes::Explicit {
                participant: participant_locktime,
                initiator: initiator_locktime,
            },
        })
        .await
        .unwrap();
    let accepted = participant
        .coordinator
        .accept_offer(offer, participant.pubkey(), participant.payout())
        .await
        .unwrap();
    initiator
        .coordinator
        .confirm_acceptance(accepted.swap_id, participant.pubkey())
        .await
        .unwrap();

    initiator.coordinator.start(accepted.swap_id).await.unwrap();
    participant.coordinator.start(accepted.swap_id).await.unwrap();

    accepted.swap_id
}

/// Both legs funded and confirmed, as seen by both nodes.
pub async fn funded_swap(
    initiator: &mut Node,
    participant: &mut Node,
    bitcoin: &MockChain,
    litecoin: &MockChain,
) -> SwapId {
    funded_swap_with(
        initiator,
        participant,
        bitcoin,
        litecoin,
        Locktime::BlockHeight(100),
        Locktime::BlockHeight(200),
    )
    .await
}

pub async fn funded_swap_with(
    initiator: &mut Node,
    participant: &mut Node,
    bitcoin: &MockChain,
    litecoin: &MockChain,
    participant_locktime: Locktime,
    initiator_locktime: Locktime,
) -> SwapId {
    let swap_id = negotiate(
        initiator,
        participant,
        bitcoin,
        litecoin,
        participant_locktime,
        initiator_locktime,
    )
    .await;

    initiator.fund(swap_id).await.unwrap();
    bitcoin.mine(3);
    initiator.sync().await.unwrap();
    participant.sync().await.unwrap();

    participant.fund(swap_id).await.unwrap();
    litecoin.mine(3);

    swap_id
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(result.is_ok(), "condition did not hold in time");
}
