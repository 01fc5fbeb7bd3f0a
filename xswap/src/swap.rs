use crate::{
    expiries::LocktimePolicy,
    htlc::{HashAlgorithm, HtlcParams, Locktime, LocktimeKind, PaymentHash},
    htlc_manager::HtlcState,
    identity::PublicKey,
    ledger::ChainId,
    secret::Secret,
    timestamp::Timestamp,
    transaction::{Address, OutPoint, Txid},
    Error, Leg,
};
use bitcoin::{
    consensus::encode::serialize,
    hashes::{sha256, Hash},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Identifies a swap on both sides: it commits to every term of the offer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwapId(#[serde(with = "hex::serde")] [u8; 32]);

impl From<[u8; 32]> for SwapId {
    fn from(bytes: [u8; 32]) -> Self {
        SwapId(bytes)
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapId({})", self)
    }
}

impl FromStr for SwapId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;

        Ok(SwapId(bytes))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Initiator,
    Participant,
}

impl Role {
    /// The leg this role locks its own funds in.
    pub fn funds(self) -> Leg {
        match self {
            Role::Initiator => Leg::Initiator,
            Role::Participant => Leg::Participant,
        }
    }

    /// The leg this role receives funds from.
    pub fn claims(self) -> Leg {
        self.funds().other()
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SwapState {
    Offered,
    Funding,
    BothFunded,
    Claiming,
    Completed,
    Refunding,
    Refunded,
    Cancelled,
}

impl SwapState {
    const HAPPY_PATH: [SwapState; 5] = [
        SwapState::Offered,
        SwapState::Funding,
        SwapState::BothFunded,
        SwapState::Claiming,
        SwapState::Completed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapState::Completed | SwapState::Refunded | SwapState::Cancelled
        )
    }

    /// Whether the swap has HTLCs on chain that need watching.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SwapState::Funding | SwapState::BothFunded | SwapState::Claiming | SwapState::Refunding
        )
    }

    pub fn can_transition_to(self, next: SwapState) -> bool {
        use SwapState::*;

        matches!(
            (self, next),
            (Offered, Funding)
                | (Offered, Cancelled)
                | (Funding, BothFunded)
                | (BothFunded, Claiming)
                | (Claiming, Completed)
                | (Funding, Refunding)
                | (BothFunded, Refunding)
                | (Claiming, Refunding)
                | (Refunding, Refunded)
                | (Refunding, Completed)
        )
    }

    /// The next state on the way from `self` to `target`, `None` if `target`
    /// is not ahead of `self`.
    pub fn step_towards(self, target: SwapState) -> Option<SwapState> {
        if self.can_transition_to(target) {
            return Some(target);
        }

        let position = |state| Self::HAPPY_PATH.iter().position(|s| *s == state);
        match (position(self), position(target), target) {
            (Some(current), Some(target), _) if current < target => {
                Some(Self::HAPPY_PATH[current + 1])
            }
            (Some(_), _, SwapState::Refunded) if self.can_transition_to(SwapState::Refunding) => {
                Some(SwapState::Refunding)
            }
            _ => None,
        }
    }

    /// The swap state implied by the states of the two HTLCs.
    ///
    /// `None` means no HTLC was seen for that leg yet. `claim_broadcast`
    /// tells whether we already tried to claim.
    pub fn implied_by(
        initiator: Option<HtlcState>,
        participant: Option<HtlcState>,
        claim_broadcast: bool,
    ) -> SwapState {
        use HtlcState::*;

        let legs = [initiator, participant];
        if legs.iter().all(|leg| *leg == Some(Claimed)) {
            return SwapState::Completed;
        }
        if legs.iter().any(|leg| matches!(leg, Some(Refunded) | Some(Expired))) {
            let settled = legs
                .iter()
                .all(|leg| matches!(leg, None | Some(Claimed) | Some(Refunded)));
            return if settled {
                SwapState::Refunded
            } else {
                SwapState::Refunding
            };
        }
        if claim_broadcast || legs.iter().any(|leg| *leg == Some(Claimed)) {
            return SwapState::Claiming;
        }
        if legs.iter().all(|leg| *leg == Some(Funded)) {
            return SwapState::BothFunded;
        }

        SwapState::Funding
    }
}

/// The terms both parties agree on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOffer {
    pub swap_id: SwapId,
    pub initiator_chain: ChainId,
    pub participant_chain: ChainId,
    pub initiator_amount: u64,
    pub participant_amount: u64,
    pub initiator_pubkey: PublicKey,
    /// Set once the participant accepted.
    pub participant_pubkey: Option<PublicKey>,
    pub payment_hash: PaymentHash,
    pub hash_algorithm: HashAlgorithm,
    pub participant_locktime: Locktime,
    pub initiator_locktime: Locktime,
    pub offer_expires_at: Timestamp,
}

impl SwapOffer {
    /// Hash of all terms except the participant's key, which is only known
    /// after acceptance.
    pub fn compute_id(&self) -> SwapId {
        let mut terms = Vec::new();
        terms.extend(serialize(&self.initiator_chain.as_str().as_bytes().to_vec()));
        terms.extend(serialize(&self.participant_chain.as_str().as_bytes().to_vec()));
        terms.extend(serialize(&self.initiator_amount));
        terms.extend(serialize(&self.participant_amount));
        terms.extend(serialize(&self.initiator_pubkey.as_bytes().to_vec()));
        terms.extend(serialize(&self.payment_hash.as_bytes().to_vec()));
        terms.extend(serialize(&self.hash_algorithm.to_string().into_bytes()));
        terms.extend(serialize(&self.participant_locktime.kind().to_string().into_bytes()));
        terms.extend(serialize(&self.participant_locktime.value()));
        terms.extend(serialize(&self.initiator_locktime.value()));
        terms.extend(serialize(&self.offer_expires_at.as_secs()));

        SwapId(sha256::Hash::hash(&terms).into_inner())
    }

    pub fn locktime_kind(&self) -> LocktimeKind {
        self.participant_locktime.kind()
    }

    /// Checks the terms themselves; whether the offer is still valid at a
    /// given time or chain height is up to the caller.
    pub fn validate(&self, policy: &LocktimePolicy) -> Result<(), Error> {
        if self.initiator_amount == 0 || self.participant_amount == 0 {
            return Err(Error::InvalidOffer("amounts must not be zero".into()));
        }
        if self.initiator_chain == self.participant_chain {
            return Err(Error::InvalidOffer(format!(
                "both legs are on chain {}",
                self.initiator_chain
            )));
        }
        if self.payment_hash.as_bytes().len() != self.hash_algorithm.output_len() {
            return Err(Error::InvalidOffer(format!(
                "payment hash is not a {} digest",
                self.hash_algorithm
            )));
        }
        if self.compute_id() != self.swap_id {
            return Err(Error::InvalidOffer(
                "swap id does not commit to the offered terms".into(),
            ));
        }
        policy.validate(self.participant_locktime, self.initiator_locktime)?;

        Ok(())
    }

    pub fn chain(&self, leg: Leg) -> &ChainId {
        match leg {
            Leg::Initiator => &self.initiator_chain,
            Leg::Participant => &self.participant_chain,
        }
    }

    pub fn amount(&self, leg: Leg) -> u64 {
        match leg {
            Leg::Initiator => self.initiator_amount,
            Leg::Participant => self.participant_amount,
        }
    }

    pub fn locktime(&self, leg: Leg) -> Locktime {
        match leg {
            Leg::Initiator => self.initiator_locktime,
            Leg::Participant => self.participant_locktime,
        }
    }

    /// The initiator leg pays the participant and refunds the initiator, the
    /// participant leg the other way around.
    pub fn htlc_params(&self, leg: Leg) -> Result<HtlcParams, Error> {
        let participant_pubkey = self
            .participant_pubkey
            .clone()
            .ok_or_else(|| Error::InvalidOffer("offer has not been accepted yet".into()))?;
        let initiator_pubkey = self.initiator_pubkey.clone();

        let (recipient, refund) = match leg {
            Leg::Initiator => (participant_pubkey, initiator_pubkey),
            Leg::Participant => (initiator_pubkey, participant_pubkey),
        };

        HtlcParams::new(
            recipient,
            refund,
            self.payment_hash.clone(),
            self.locktime(leg),
            self.hash_algorithm,
        )
    }
}

/// What we know about one leg of a swap beyond the HTLC registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegInfo {
    /// The funding output, once seen on chain.
    pub htlc: Option<OutPoint>,
    /// Transactions we broadcast for this leg.
    pub funding_transaction: Option<Txid>,
    pub claim_transaction: Option<Txid>,
    pub refund_transaction: Option<Txid>,
}

/// Where our claim and refund transactions pay to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// On the chain of the leg we claim.
    pub claim_address: Address,
    /// On the chain of the leg we fund.
    pub refund_address: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub offer: SwapOffer,
    pub role: Role,
    pub state: SwapState,
    /// Generated by the initiator, learned from chain by the participant.
    pub secret: Option<Secret>,
    pub payout: Payout,
    pub initiator_leg: LegInfo,
    pub participant_leg: LegInfo,
    /// Why the swap needs operator attention, if it does.
    pub stuck: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SwapInfo {
    pub fn new(offer: SwapOffer, role: Role, secret: Option<Secret>, payout: Payout) -> Self {
        let now = Timestamp::now();

        SwapInfo {
            offer,
            role,
            state: SwapState::Offered,
            secret,
            payout,
            initiator_leg: LegInfo::default(),
            participant_leg: LegInfo::default(),
            stuck: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> SwapId {
        self.offer.swap_id
    }

    pub fn leg(&self, leg: Leg) -> &LegInfo {
        match leg {
            Leg::Initiator => &self.initiator_leg,
            Leg::Participant => &self.participant_leg,
        }
    }

    pub fn leg_mut(&mut self, leg: Leg) -> &mut LegInfo {
        match leg {
            Leg::Initiator => &mut self.initiator_leg,
            Leg::Participant => &mut self.participant_leg,
        }
    }
}

/// Published by the coordinator whenever something noteworthy happens to a
/// swap.
#[derive(Clone, Debug, PartialEq)]
pub struct SwapEvent {
    pub swap_id: SwapId,
    pub state: SwapState,
    pub kind: SwapEventKind,
}

#[derive(Clone, Debug, PartialEq, strum_macros::Display)]
pub enum SwapEventKind {
    OfferCreated,
    OfferAccepted,
    Started,
    HtlcDetected(Leg),
    /// The funding output reached the confirmation threshold.
    HtlcFunded(Leg),
    /// A funding output paying less than agreed was ignored.
    IncorrectlyFunded(Leg),
    PreimageRevealed,
    ClaimBroadcast(Leg, Txid),
    RefundBroadcast(Leg, Txid),
    Completed,
    Refunded,
    Cancelled,
    /// Needs operator attention.
    Stuck(String),
}
