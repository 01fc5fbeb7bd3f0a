//! The swap protocol: offers, funding, the claim race and the refund
//! fallback, for both roles.

use crate::{
    config::Settings,
    htlc::{self, HtlcParams, Locktime, LocktimeKind, PaymentHash},
    htlc_manager::{HtlcInfo, HtlcManager, HtlcState, Transition},
    identity::PublicKey,
    ledger::ChainId,
    monitor::{BlockchainMonitor, BroadcastError, ChainEvent, ChainTip, HtlcTransaction},
    retry::retry,
    secret::Secret,
    signer::Signer,
    swap::{Payout, Role, SwapEvent, SwapEventKind, SwapId, SwapInfo, SwapOffer, SwapState},
    timestamp::Timestamp,
    transaction::{self, Address, OutPoint, Transaction, Txid},
    transaction_builder::{TransactionBuilder, Utxo},
    witness::UnsignedTransaction,
    Error, Leg,
};
use futures::{channel::mpsc, future};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing_futures::Instrument;

/// How the locktimes of a new offer are chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locktimes {
    /// Counted from the current chain tips using the configured durations.
    Propose(LocktimeKind),
    Explicit {
        participant: Locktime,
        initiator: Locktime,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OfferRequest {
    pub initiator_chain: ChainId,
    pub participant_chain: ChainId,
    pub initiator_amount: u64,
    pub participant_amount: u64,
    pub initiator_pubkey: PublicKey,
    pub payout: Payout,
    pub locktimes: Locktimes,
}

/// Everything needed to resume after a restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub swaps: Vec<SwapInfo>,
    pub htlcs: Vec<HtlcInfo>,
}

/// Maps what the monitors report back to the swap and leg it belongs to.
#[derive(Debug, Default)]
struct Routes {
    by_payment_hash: HashMap<(ChainId, PaymentHash), (SwapId, Leg)>,
    by_outpoint: HashMap<(ChainId, OutPoint), (SwapId, Leg)>,
    payment_hashes: HashMap<PaymentHash, SwapId>,
}

/// Fee rate of the n-th broadcast attempt, 1-based.
pub fn bumped_fee_rate(fee_rate: u64, bump_percent: u64, attempt: u32) -> u64 {
    let bump = bump_percent.saturating_mul(u64::from(attempt.saturating_sub(1)));

    fee_rate.saturating_mul(bump.saturating_add(100)) / 100
}

pub struct Coordinator {
    settings: Settings,
    builder: TransactionBuilder,
    htlcs: Arc<HtlcManager>,
    monitors: HashMap<ChainId, Arc<dyn BlockchainMonitor>>,
    signer: Arc<dyn Signer>,
    swaps: RwLock<HashMap<SwapId, Arc<Mutex<SwapInfo>>>>,
    routes: RwLock<Routes>,
    events: mpsc::UnboundedSender<SwapEvent>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("chains", &self.monitors.keys().collect::<Vec<_>>())
            .field("htlcs", &self.htlcs)
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        settings: Settings,
        htlcs: Arc<HtlcManager>,
        monitors: Vec<Arc<dyn BlockchainMonitor>>,
        signer: Arc<dyn Signer>,
    ) -> (Self, mpsc::UnboundedReceiver<SwapEvent>) {
        let (events, receiver) = mpsc::unbounded();
        let monitors = monitors
            .into_iter()
            .map(|monitor| (monitor.chain().clone(), monitor))
            .collect();

        let coordinator = Coordinator {
            builder: TransactionBuilder::new(settings.fees.minimum_fee),
            settings,
            htlcs,
            monitors,
            signer,
            swaps: RwLock::new(HashMap::new()),
            routes: RwLock::new(Routes::default()),
            events,
        };

        (coordinator, receiver)
    }

    /// Rebuilds a coordinator from a [`Snapshot`] and resumes watching the
    /// HTLCs of all active swaps.
    pub async fn from_snapshot(
        settings: Settings,
        snapshot: Snapshot,
        monitors: Vec<Arc<dyn BlockchainMonitor>>,
        signer: Arc<dyn Signer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SwapEvent>), Error> {
        let htlcs = Arc::new(HtlcManager::with_htlcs(snapshot.htlcs));
        let (coordinator, events) = Coordinator::new(settings, htlcs, monitors, signer);

        for swap in snapshot.swaps {
            let id = swap.id();
            let active = swap.state.is_active();
            let legs = [
                (Leg::Initiator, swap.initiator_leg.htlc),
                (Leg::Participant, swap.participant_leg.htlc),
            ];
            let offer = swap.offer.clone();
            coordinator.insert(swap).await?;

            if !active {
                continue;
            }
            for (leg, outpoint) in legs {
                coordinator
                    .watch(id, leg, offer.chain(leg), &offer.htlc_params(leg)?)
                    .await?;
                if let Some(outpoint) = outpoint {
                    coordinator
                        .routes
                        .write()
                        .await
                        .by_outpoint
                        .insert((offer.chain(leg).clone(), outpoint), (id, leg));
                }
            }
            tracing::info!(swap_id = %id, "resumed swap");
        }

        Ok((coordinator, events))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn htlcs(&self) -> &Arc<HtlcManager> {
        &self.htlcs
    }

    pub fn monitors(&self) -> Vec<Arc<dyn BlockchainMonitor>> {
        self.monitors.values().cloned().collect()
    }

    /// Creates an offer as the initiator. The secret is generated here and
    /// never leaves the coordinator until it is revealed on chain.
    pub async fn create_offer(&self, request: OfferRequest) -> Result<SwapOffer, Error> {
        let OfferRequest {
            initiator_chain,
            participant_chain,
            initiator_amount,
            participant_amount,
            initiator_pubkey,
            payout,
            locktimes,
        } = request;

        let participant_tip = self.chain_tip(&participant_chain).await?;
        let initiator_tip = self.chain_tip(&initiator_chain).await?;
        let (participant_locktime, initiator_locktime) = match locktimes {
            Locktimes::Propose(kind) => {
                self.settings
                    .swap
                    .locktimes
                    .propose(kind, participant_tip, initiator_tip)
            }
            Locktimes::Explicit {
                participant,
                initiator,
            } => (participant, initiator),
        };

        let secret = Secret::random();
        let hash_algorithm = self.settings.swap.hash_algorithm;
        let mut offer = SwapOffer {
            swap_id: SwapId::from([0u8; 32]),
            initiator_chain,
            participant_chain,
            initiator_amount,
            participant_amount,
            initiator_pubkey,
            participant_pubkey: None,
            payment_hash: htlc::hash_preimage(secret.as_bytes(), hash_algorithm),
            hash_algorithm,
            participant_locktime,
            initiator_locktime,
            offer_expires_at: Timestamp::now().plus(self.settings.swap.offer_validity),
        };
        offer.swap_id = offer.compute_id();
        self.check_terms(&offer, participant_tip, initiator_tip)?;

        let swap = SwapInfo::new(offer.clone(), Role::Initiator, Some(secret), payout);
        self.insert(swap.clone()).await?;
        tracing::info!(swap_id = %offer.swap_id, "created offer");
        self.emit(&swap, SwapEventKind::OfferCreated);

        Ok(offer)
    }

    /// Accepts an offer as the participant. Returns the offer completed with
    /// our public key, to be sent back to the initiator.
    pub async fn accept_offer(
        &self,
        offer: SwapOffer,
        participant_pubkey: PublicKey,
        payout: Payout,
    ) -> Result<SwapOffer, Error> {
        if offer.offer_expires_at <= Timestamp::now() {
            return Err(Error::InvalidOffer(format!(
                "offer expired at {}",
                offer.offer_expires_at
            )));
        }

        let participant_tip = self.chain_tip(&offer.participant_chain).await?;
        let initiator_tip = self.chain_tip(&offer.initiator_chain).await?;
        self.check_terms(&offer, participant_tip, initiator_tip)?;

        let offer = SwapOffer {
            participant_pubkey: Some(participant_pubkey),
            ..offer
        };
        let swap = SwapInfo::new(offer.clone(), Role::Participant, None, payout);
        self.insert(swap.clone()).await?;
        tracing::info!(swap_id = %offer.swap_id, "accepted offer");
        self.emit(&swap, SwapEventKind::OfferAccepted);

        Ok(offer)
    }

    /// Records the participant's key on the initiator's side.
    pub async fn confirm_acceptance(
        &self,
        swap_id: SwapId,
        participant_pubkey: PublicKey,
    ) -> Result<(), Error> {
        let swap = self.swap_handle(&swap_id).await?;
        let mut swap = swap.lock().await;

        if swap.role != Role::Initiator || swap.state != SwapState::Offered {
            return Err(Error::InvalidSwapState {
                swap_id,
                state: swap.state,
                action: "confirm acceptance",
            });
        }
        if swap.offer.offer_expires_at <= Timestamp::now() {
            return Err(Error::InvalidOffer(format!(
                "offer expired at {}",
                swap.offer.offer_expires_at
            )));
        }

        swap.offer.participant_pubkey = Some(participant_pubkey);
        swap.updated_at = Timestamp::now();
        tracing::info!(%swap_id, "participant accepted offer");
        self.emit(&swap, SwapEventKind::OfferAccepted);

        Ok(())
    }

    pub async fn cancel(&self, swap_id: SwapId) -> Result<(), Error> {
        let swap = self.swap_handle(&swap_id).await?;
        let mut swap = swap.lock().await;

        if !swap.state.can_transition_to(SwapState::Cancelled) {
            return Err(Error::InvalidSwapState {
                swap_id,
                state: swap.state,
                action: "cancel",
            });
        }

        swap.state = SwapState::Cancelled;
        swap.updated_at = Timestamp::now();
        tracing::info!(%swap_id, "cancelled swap");
        self.emit(&swap, SwapEventKind::Cancelled);

        Ok(())
    }

    /// Starts watching both legs; the swap moves to `Funding`.
    pub async fn start(&self, swap_id: SwapId) -> Result<(), Error> {
        let swap = self.swap_handle(&swap_id).await?;
        let mut swap = swap.lock().await;

        if swap.state != SwapState::Offered {
            return Err(Error::InvalidSwapState {
                swap_id,
                state: swap.state,
                action: "start",
            });
        }

        for leg in [Leg::Initiator, Leg::Participant] {
            let params = swap.offer.htlc_params(leg)?;
            self.watch(swap_id, leg, swap.offer.chain(leg), &params)
                .await?;
        }

        swap.state = SwapState::Funding;
        swap.updated_at = Timestamp::now();
        tracing::info!(%swap_id, role = %swap.role, "started swap");
        self.emit(&swap, SwapEventKind::Started);

        Ok(())
    }

    /// Builds the unsigned funding transaction of our leg without
    /// broadcasting it, e.g. to preview the fee.
    pub async fn build_funding(
        &self,
        swap_id: SwapId,
        inputs: &[Utxo],
        change_address: &Address,
    ) -> Result<UnsignedTransaction, Error> {
        let swap = self.swap(swap_id).await?;
        let leg = swap.role.funds();
        let params = swap.offer.htlc_params(leg)?;

        self.builder.build_funding(
            inputs,
            &params,
            swap.offer.amount(leg),
            change_address,
            self.settings.fee_rate(swap.offer.chain(leg)),
        )
    }

    /// Locks our side of the swap in its HTLC.
    ///
    /// The participant only funds once the initiator leg is funded, and
    /// nobody funds a leg whose locktime has already passed.
    pub async fn fund(
        &self,
        swap_id: SwapId,
        inputs: Vec<Utxo>,
        change_address: Address,
    ) -> Result<Txid, Error> {
        let swap = self.swap_handle(&swap_id).await?;

        async {
            let mut swap = swap.lock().await;
            let leg = swap.role.funds();

            if swap.state != SwapState::Funding {
                return Err(Error::InvalidSwapState {
                    swap_id,
                    state: swap.state,
                    action: "fund",
                });
            }
            if swap.leg(leg).funding_transaction.is_some() {
                return Err(Error::InvalidSwapState {
                    swap_id,
                    state: swap.state,
                    action: "fund twice",
                });
            }
            if swap.role == Role::Participant
                && self.leg_state(&swap, Leg::Initiator).await != Some(HtlcState::Funded)
            {
                return Err(Error::InvalidSwapState {
                    swap_id,
                    state: swap.state,
                    action: "fund before the initiator leg is funded",
                });
            }

            let chain = swap.offer.chain(leg).clone();
            let locktime = swap.offer.locktime(leg);
            let tip = self.chain_tip(&chain).await?;
            if locktime.is_reached(tip.height, tip.median_time) {
                return Err(Error::InvalidSwapState {
                    swap_id,
                    state: swap.state,
                    action: "fund after its locktime",
                });
            }

            let params = swap.offer.htlc_params(leg)?;
            let amount = swap.offer.amount(leg);
            let result = self
                .broadcast(&chain, |fee_rate| {
                    self.builder
                        .build_funding(&inputs, &params, amount, &change_address, fee_rate)
                })
                .await;

            match self.settle_broadcast(&mut swap, "funding", result)? {
                Some(txid) => {
                    swap.leg_mut(leg).funding_transaction = Some(txid);
                    swap.updated_at = Timestamp::now();
                    tracing::info!(%txid, "funded {} leg", leg);
                    Ok(txid)
                }
                None => Err(Error::BroadcastFailure(BroadcastError::NotFinal)),
            }
        }
        .instrument(tracing::info_span!("swap", swap_id = %swap_id))
        .await
    }

    /// The swap and leg an event of `chain` belongs to, if any.
    pub async fn route(&self, chain: &ChainId, htlc: &HtlcTransaction) -> Option<(SwapId, Leg)> {
        let routes = self.routes.read().await;

        if let Some(route) = routes.by_outpoint.get(&(chain.clone(), htlc.outpoint)) {
            return Some(*route);
        }

        let params = htlc::extract_parameters(&htlc.script).ok()?;
        routes
            .by_payment_hash
            .get(&(chain.clone(), params.payment_hash().clone()))
            .copied()
    }

    /// Applies what a monitor observed and takes the actions it enables.
    /// Events that would move a swap backwards are ignored.
    pub async fn handle_chain_event(&self, chain: &ChainId, event: ChainEvent) -> Result<(), Error> {
        let (swap_id, leg) = match self.route(chain, event.htlc()).await {
            Some(route) => route,
            None => {
                tracing::trace!(%chain, outpoint = %event.htlc().outpoint, "ignoring {} for unknown htlc", event);
                return Ok(());
            }
        };
        let swap = self.swap_handle(&swap_id).await?;

        async {
            let mut swap = swap.lock().await;
            if !swap.state.is_active() {
                tracing::debug!(state = %swap.state, "ignoring {} for inactive swap", event);
                return Ok(());
            }

            self.apply_event(&mut swap, leg, event).await?;
            self.advance(&mut swap).await
        }
        .instrument(tracing::info_span!("swap", swap_id = %swap_id))
        .await
    }

    /// Ticks every swap, concurrently. Failing swaps do not stop the
    /// others; the first error is returned.
    pub async fn tick(&self) -> Result<(), Error> {
        let swap_ids = self.swaps.read().await.keys().copied().collect::<Vec<_>>();

        future::join_all(swap_ids.into_iter().map(|swap_id| self.tick_swap(swap_id)))
            .await
            .into_iter()
            .collect()
    }

    /// Polls what events cannot tell: confirmations of pending HTLCs and
    /// expiry against the chain tips. Then drives the swap, which refunds our
    /// expired leg.
    ///
    /// A pending HTLC whose funding was reorganized away simply stays
    /// pending until it is confirmed again.
    pub async fn tick_swap(&self, swap_id: SwapId) -> Result<(), Error> {
        let swap = self.swap_handle(&swap_id).await?;

        let result = async {
            let mut swap = swap.lock().await;
            if !swap.state.is_active() {
                return Ok(());
            }

            for leg in [Leg::Initiator, Leg::Participant] {
                self.poll_confirmations(&mut swap, leg).await?;
            }
            for leg in [Leg::Initiator, Leg::Participant] {
                self.expire(&mut swap, leg).await?;
            }
            self.advance(&mut swap).await
        }
        .instrument(tracing::info_span!("swap", swap_id = %swap_id))
        .await;

        if let Err(e) = &result {
            tracing::warn!(%swap_id, "failed to drive swap: {}", e);
        }

        result
    }

    /// Swaps with HTLCs on chain, the ones [`Coordinator::tick_swap`] has
    /// work for. Does not wait: a swap busy elsewhere counts as active.
    pub async fn active_swaps(&self) -> Vec<SwapId> {
        let swaps = self.swaps.read().await;

        swaps
            .iter()
            .filter(|(_, swap)| swap.try_lock().map_or(true, |swap| swap.state.is_active()))
            .map(|(swap_id, _)| *swap_id)
            .collect()
    }

    pub async fn swap(&self, swap_id: SwapId) -> Result<SwapInfo, Error> {
        let swap = self.swap_handle(&swap_id).await?;
        let swap = swap.lock().await;

        Ok(swap.clone())
    }

    pub async fn swaps(&self) -> Vec<SwapInfo> {
        let handles = self.swaps.read().await.values().cloned().collect::<Vec<_>>();

        let mut swaps = Vec::with_capacity(handles.len());
        for swap in handles {
            swaps.push(swap.lock().await.clone());
        }
        swaps
    }

    pub async fn swaps_by_state(&self, state: SwapState) -> Vec<SwapInfo> {
        self.swaps()
            .await
            .into_iter()
            .filter(|swap| swap.state == state)
            .collect()
    }

    pub async fn swap_count(&self) -> usize {
        self.swaps.read().await.len()
    }

    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            swaps: self.swaps().await,
            htlcs: self.htlcs.all().await,
        }
    }

    fn monitor(&self, chain: &ChainId) -> Result<&Arc<dyn BlockchainMonitor>, Error> {
        self.monitors
            .get(chain)
            .ok_or_else(|| Error::UnknownChain(chain.clone()))
    }

    async fn chain_tip(&self, chain: &ChainId) -> Result<ChainTip, Error> {
        self.monitor(chain)?
            .chain_tip()
            .await
            .map_err(Error::Monitor)
    }

    async fn swap_handle(&self, swap_id: &SwapId) -> Result<Arc<Mutex<SwapInfo>>, Error> {
        self.swaps
            .read()
            .await
            .get(swap_id)
            .cloned()
            .ok_or(Error::UnknownSwap(*swap_id))
    }

    async fn insert(&self, swap: SwapInfo) -> Result<(), Error> {
        let swap_id = swap.id();
        let mut swaps = self.swaps.write().await;
        if swaps.contains_key(&swap_id) {
            return Err(Error::InvalidOffer(format!("swap {} already exists", swap_id)));
        }

        let mut routes = self.routes.write().await;
        if let Some(other) = routes.payment_hashes.get(&swap.offer.payment_hash) {
            return Err(Error::InvalidOffer(format!(
                "payment hash is already used by swap {}",
                other
            )));
        }
        routes
            .payment_hashes
            .insert(swap.offer.payment_hash.clone(), swap_id);
        swaps.insert(swap_id, Arc::new(Mutex::new(swap)));

        Ok(())
    }

    fn check_terms(
        &self,
        offer: &SwapOffer,
        participant_tip: ChainTip,
        initiator_tip: ChainTip,
    ) -> Result<(), Error> {
        offer.validate(&self.settings.swap.locktimes)?;

        for (locktime, tip, chain) in [
            (offer.participant_locktime, participant_tip, &offer.participant_chain),
            (offer.initiator_locktime, initiator_tip, &offer.initiator_chain),
        ] {
            if locktime.is_reached(tip.height, tip.median_time) {
                return Err(Error::InvalidOffer(format!(
                    "locktime {} has already passed on {}",
                    locktime, chain
                )));
            }
        }

        Ok(())
    }

    async fn watch(
        &self,
        swap_id: SwapId,
        leg: Leg,
        chain: &ChainId,
        params: &HtlcParams,
    ) -> Result<(), Error> {
        self.monitor(chain)?
            .watch_for_htlc(params)
            .await
            .map_err(Error::Monitor)?;
        self.routes.write().await.by_payment_hash.insert(
            (chain.clone(), params.payment_hash().clone()),
            (swap_id, leg),
        );

        Ok(())
    }

    async fn leg_state(&self, swap: &SwapInfo, leg: Leg) -> Option<HtlcState> {
        let outpoint = swap.leg(leg).htlc?;

        self.htlcs.get(&outpoint).await.ok().map(|info| info.state)
    }

    fn emit(&self, swap: &SwapInfo, kind: SwapEventKind) {
        let event = SwapEvent {
            swap_id: swap.id(),
            state: swap.state,
            kind,
        };

        // Nobody listening is fine.
        let _ = self.events.unbounded_send(event);
    }

    fn mark_stuck(&self, swap: &mut SwapInfo, reason: String) -> Error {
        tracing::error!(swap_id = %swap.id(), "swap needs attention: {}", reason);

        swap.stuck = Some(reason.clone());
        swap.updated_at = Timestamp::now();
        self.emit(swap, SwapEventKind::Stuck(reason.clone()));

        Error::SwapStuck {
            swap_id: swap.id(),
            reason,
        }
    }

    async fn apply_event(&self, swap: &mut SwapInfo, leg: Leg, event: ChainEvent) -> Result<(), Error> {
        match event {
            ChainEvent::HtlcDetected(htlc) | ChainEvent::HtlcConfirmed(htlc) => {
                if let Some(info) = self.track(swap, leg, &htlc).await? {
                    self.promote(swap, leg, &info, htlc.confirmations, htlc.block_height)
                        .await?;
                }
            }
            ChainEvent::HtlcClaimed {
                htlc,
                transaction,
                preimage,
                height,
            } => {
                let info = match self.track(swap, leg, &htlc).await? {
                    Some(info) if !info.state.is_terminal() => info,
                    _ => return Ok(()),
                };
                let secret = self.revealed_secret(swap, &info.params, &transaction, &preimage)?;
                if info.state == HtlcState::Pending {
                    self.mark_funded(swap, leg, &info, htlc.block_height).await?;
                }

                self.htlcs
                    .update_state(&info.outpoint, Transition::Claimed {
                        transaction: transaction.txid(),
                        height,
                        preimage: secret,
                    })
                    .await?;
                tracing::info!(txid = %transaction.txid(), "{} leg was claimed", leg);

                if swap.secret.is_none() {
                    swap.secret = Some(secret);
                    tracing::info!("learned the preimage from the {} leg", leg);
                    self.emit(swap, SwapEventKind::PreimageRevealed);
                }
            }
            ChainEvent::HtlcRefunded {
                htlc,
                transaction,
                height,
            } => {
                let info = match self.track(swap, leg, &htlc).await? {
                    Some(info) if !info.state.is_terminal() => info,
                    _ => return Ok(()),
                };
                if info.state == HtlcState::Pending {
                    self.mark_funded(swap, leg, &info, htlc.block_height).await?;
                }

                self.htlcs
                    .update_state(&info.outpoint, Transition::Refunded {
                        transaction: transaction.txid(),
                        height,
                    })
                    .await?;
                tracing::info!(txid = %transaction.txid(), "{} leg was refunded", leg);
            }
        }

        swap.updated_at = Timestamp::now();
        Ok(())
    }

    /// Registers the funding output of `leg` on first sight. Returns `None`
    /// for outputs that do not fund the agreed HTLC.
    async fn track(
        &self,
        swap: &mut SwapInfo,
        leg: Leg,
        htlc: &HtlcTransaction,
    ) -> Result<Option<HtlcInfo>, Error> {
        let params = swap.offer.htlc_params(leg)?;
        if htlc.script != params.locking_script() {
            tracing::warn!(outpoint = %htlc.outpoint, "output does not pay to the agreed {} leg htlc", leg);
            return Ok(None);
        }

        if let Some(known) = swap.leg(leg).htlc {
            if known != htlc.outpoint {
                tracing::warn!(outpoint = %htlc.outpoint, "ignoring additional funding of the {} leg", leg);
                return Ok(None);
            }
            return self.htlcs.get(&known).await.map(Some);
        }

        let expected = swap.offer.amount(leg);
        if htlc.amount < expected {
            tracing::warn!(
                outpoint = %htlc.outpoint,
                "{} leg funded with {} instead of {}, ignoring",
                leg,
                htlc.amount,
                expected
            );
            self.emit(swap, SwapEventKind::IncorrectlyFunded(leg));
            return Ok(None);
        }

        let chain = swap.offer.chain(leg).clone();
        let info = HtlcInfo::pending(
            htlc.outpoint,
            chain.clone(),
            params,
            htlc.amount,
            htlc.block_height,
        );
        match self.htlcs.add_htlc(info).await {
            Ok(()) | Err(Error::DuplicateHtlc(_)) => {}
            Err(e) => return Err(e),
        }

        swap.leg_mut(leg).htlc = Some(htlc.outpoint);
        self.routes
            .write()
            .await
            .by_outpoint
            .insert((chain, htlc.outpoint), (swap.id(), leg));
        tracing::info!(outpoint = %htlc.outpoint, "detected {} leg htlc", leg);
        self.emit(swap, SwapEventKind::HtlcDetected(leg));

        self.htlcs.get(&htlc.outpoint).await.map(Some)
    }

    async fn promote(
        &self,
        swap: &mut SwapInfo,
        leg: Leg,
        info: &HtlcInfo,
        confirmations: u32,
        block_height: u64,
    ) -> Result<(), Error> {
        if info.state != HtlcState::Pending {
            return Ok(());
        }

        let required = self.settings.confirmations(&info.chain);
        if confirmations < required {
            tracing::debug!("{} leg htlc has {}/{} confirmations", leg, confirmations, required);
            return Ok(());
        }

        self.mark_funded(swap, leg, info, block_height).await
    }

    async fn mark_funded(
        &self,
        swap: &mut SwapInfo,
        leg: Leg,
        info: &HtlcInfo,
        block_height: u64,
    ) -> Result<(), Error> {
        self.htlcs
            .update_state(&info.outpoint, Transition::Funded { block_height })
            .await?;
        tracing::info!(outpoint = %info.outpoint, "{} leg htlc is funded", leg);
        self.emit(swap, SwapEventKind::HtlcFunded(leg));

        Ok(())
    }

    /// The preimage revealed by a claim. What the transaction witness shows
    /// wins over what the monitor reports.
    fn revealed_secret(
        &self,
        swap: &mut SwapInfo,
        params: &HtlcParams,
        transaction: &Transaction,
        reported: &[u8],
    ) -> Result<Secret, Error> {
        let preimage = htlc::extract_preimage(transaction, params).or_else(|| {
            if htlc::verify_preimage(reported, params.payment_hash(), params.hash_algorithm()) {
                tracing::warn!(txid = %transaction.txid(), "using the preimage reported by the monitor");
                Some(reported.to_vec())
            } else {
                None
            }
        });

        match preimage.map(|preimage| Secret::from_slice(&preimage)) {
            Some(Ok(secret)) => Ok(secret),
            _ => Err(self.mark_stuck(
                swap,
                format!("claim {} does not reveal a usable preimage", transaction.txid()),
            )),
        }
    }

    async fn poll_confirmations(&self, swap: &mut SwapInfo, leg: Leg) -> Result<(), Error> {
        let info = match swap.leg(leg).htlc {
            Some(outpoint) => self.htlcs.get(&outpoint).await?,
            None => return Ok(()),
        };
        if info.state != HtlcState::Pending {
            return Ok(());
        }

        let confirmations = match self
            .monitor(&info.chain)?
            .confirmations(&info.outpoint.txid)
            .await
        {
            Ok(confirmations) => confirmations,
            Err(e) => {
                tracing::warn!("failed to fetch confirmations of {}: {:#}", info.outpoint, e);
                return Ok(());
            }
        };
        let height = info.creation_height;

        self.promote(swap, leg, &info, confirmations, height).await
    }

    async fn expire(&self, swap: &mut SwapInfo, leg: Leg) -> Result<(), Error> {
        let info = match swap.leg(leg).htlc {
            Some(outpoint) => self.htlcs.get(&outpoint).await?,
            None => return Ok(()),
        };
        if !matches!(info.state, HtlcState::Pending | HtlcState::Funded) {
            return Ok(());
        }

        let tip = match self.chain_tip(&info.chain).await {
            Ok(tip) => tip,
            Err(e) => {
                tracing::warn!("failed to fetch chain tip of {}: {}", info.chain, e);
                return Ok(());
            }
        };
        if !info.is_expired_at(tip.height, tip.median_time) {
            return Ok(());
        }

        self.htlcs
            .update_state(&info.outpoint, Transition::Expired)
            .await?;
        swap.updated_at = Timestamp::now();
        tracing::info!(locktime = %info.params.locktime(), "{} leg htlc expired", leg);

        Ok(())
    }

    /// Moves the swap to the state the HTLCs imply and takes whatever
    /// action that state calls for.
    async fn advance(&self, swap: &mut SwapInfo) -> Result<(), Error> {
        self.sync_state(swap).await;
        self.claim(swap).await?;
        self.refund(swap).await?;
        self.sync_state(swap).await;

        Ok(())
    }

    async fn sync_state(&self, swap: &mut SwapInfo) {
        if !swap.state.is_active() {
            return;
        }

        let target = SwapState::implied_by(
            self.leg_state(swap, Leg::Initiator).await,
            self.leg_state(swap, Leg::Participant).await,
            swap.leg(swap.role.claims()).claim_transaction.is_some(),
        );
        while let Some(next) = swap.state.step_towards(target) {
            tracing::info!(from = %swap.state, to = %next, "swap changed state");
            swap.state = next;
            swap.updated_at = Timestamp::now();

            match next {
                SwapState::Completed => self.emit(swap, SwapEventKind::Completed),
                SwapState::Refunded => self.emit(swap, SwapEventKind::Refunded),
                _ => {}
            }
        }
    }

    /// The initiator claims the participant leg once both legs are funded
    /// and the participant leg has not expired, revealing the preimage. The
    /// participant claims the initiator leg as soon as it learned the
    /// preimage.
    async fn claim(&self, swap: &mut SwapInfo) -> Result<(), Error> {
        let leg = swap.role.claims();
        if swap.leg(leg).claim_transaction.is_some() {
            return Ok(());
        }
        let (secret, outpoint) = match (swap.secret, swap.leg(leg).htlc) {
            (Some(secret), Some(outpoint)) => (secret, outpoint),
            _ => return Ok(()),
        };
        let info = self.htlcs.get(&outpoint).await?;

        match (swap.role, info.state) {
            (Role::Initiator, HtlcState::Funded) => {
                if self.leg_state(swap, Leg::Initiator).await != Some(HtlcState::Funded) {
                    return Ok(());
                }
                let tip = self.chain_tip(&info.chain).await?;
                if info.params.locktime().is_reached(tip.height, tip.median_time) {
                    tracing::info!("participant leg expired, not claiming");
                    return Ok(());
                }
            }
            (Role::Participant, HtlcState::Funded) | (Role::Participant, HtlcState::Expired) => {}
            _ => return Ok(()),
        }

        let script = info.params.locking_script();
        let claim_address = swap.payout.claim_address.clone();
        let result = self
            .broadcast(&info.chain, |fee_rate| {
                self.builder.build_claim(
                    outpoint,
                    info.amount,
                    &script,
                    secret.as_bytes(),
                    &claim_address,
                    fee_rate,
                )
            })
            .await;

        if let Some(txid) = self.settle_broadcast(swap, "claim", result)? {
            swap.leg_mut(leg).claim_transaction = Some(txid);
            swap.updated_at = Timestamp::now();
            tracing::info!(%txid, "claimed {} leg", leg);
            self.emit(swap, SwapEventKind::ClaimBroadcast(leg, txid));
        }

        Ok(())
    }

    /// Refunds our own leg once it is marked expired.
    async fn refund(&self, swap: &mut SwapInfo) -> Result<(), Error> {
        let leg = swap.role.funds();
        if swap.leg(leg).refund_transaction.is_some() {
            return Ok(());
        }
        let outpoint = match swap.leg(leg).htlc {
            Some(outpoint) => outpoint,
            None => return Ok(()),
        };
        let info = self.htlcs.get(&outpoint).await?;
        if info.state != HtlcState::Expired {
            return Ok(());
        }

        let script = info.params.locking_script();
        let refund_address = swap.payout.refund_address.clone();
        let result = self
            .broadcast(&info.chain, |fee_rate| {
                self.builder.build_refund(
                    outpoint,
                    info.amount,
                    &script,
                    &refund_address,
                    info.params.locktime(),
                    fee_rate,
                )
            })
            .await;

        if let Some(txid) = self.settle_broadcast(swap, "refund", result)? {
            swap.leg_mut(leg).refund_transaction = Some(txid);
            swap.updated_at = Timestamp::now();
            tracing::info!(%txid, "refunded {} leg", leg);
            self.emit(swap, SwapEventKind::RefundBroadcast(leg, txid));
        }

        Ok(())
    }

    /// Builds, signs and broadcasts with retries. Every attempt rebuilds the
    /// transaction with a bumped fee rate.
    async fn broadcast<F>(&self, chain: &ChainId, build: F) -> Result<Txid, Error>
    where
        F: Fn(u64) -> Result<UnsignedTransaction, Error>,
    {
        let monitor = self.monitor(chain)?;
        let fee_rate = self.settings.fee_rate(chain);
        let bump_percent = self.settings.fees.fee_bump_percent;

        retry(&self.settings.broadcast, |attempt| {
            let fee_rate = bumped_fee_rate(fee_rate, bump_percent, attempt);
            let unsigned = build(fee_rate);

            async move {
                let unsigned = unsigned?;
                let expected = unsigned.txid();
                let signed = self
                    .signer
                    .sign(chain, unsigned)
                    .await
                    .map_err(Error::Signer)?;
                if signed.txid() != expected {
                    return Err(Error::TransactionMismatch {
                        expected,
                        actual: signed.txid(),
                    });
                }

                let txid = monitor.broadcast_transaction(&transaction::to_hex(&signed)).await?;
                tracing::debug!(%txid, fee_rate, attempt, "broadcast transaction");

                Ok(txid)
            }
        })
        .await
    }

    /// `None` if the transaction is not final yet. An exhausted retry budget
    /// marks the swap stuck.
    fn settle_broadcast(
        &self,
        swap: &mut SwapInfo,
        action: &str,
        result: Result<Txid, Error>,
    ) -> Result<Option<Txid>, Error> {
        match result {
            Ok(txid) => {
                if swap.stuck.take().is_some() {
                    tracing::info!("swap recovered");
                }
                Ok(Some(txid))
            }
            Err(Error::BroadcastFailure(BroadcastError::NotFinal)) => {
                tracing::debug!("{} transaction is not final yet", action);
                Ok(None)
            }
            Err(e) if e.is_transient() => Err(self.mark_stuck(
                swap,
                format!("{} transaction could not be broadcast: {}", action, e),
            )),
            Err(e) => Err(e),
        }
    }
}
