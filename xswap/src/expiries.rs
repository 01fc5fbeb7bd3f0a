//! Locktimes of the two legs.
//!
//! Atomicity relies on asymmetric timeouts: the participant leg must time out
//! strictly before the initiator leg. The initiator claims the participant
//! leg before its locktime, revealing the preimage; the gap until the
//! initiator leg times out is the window the participant has to use that
//! preimage. The gap has to be at least the safety margin.

use crate::{
    htlc::{Locktime, LocktimeKind},
    monitor::ChainTip,
    Error,
};

/// Half a day worth of 10 minute blocks.
pub const DEFAULT_SAFETY_MARGIN_BLOCKS: u64 = 72;
pub const DEFAULT_SAFETY_MARGIN_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PARTICIPANT_LOCK_BLOCKS: u64 = 144;
pub const DEFAULT_PARTICIPANT_LOCK_SECS: u64 = 48 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocktimePolicy {
    pub safety_margin_blocks: u64,
    pub safety_margin_secs: u64,
    /// How far ahead of the participant chain's tip the participant leg
    /// times out.
    pub participant_lock_blocks: u64,
    pub participant_lock_secs: u64,
}

impl Default for LocktimePolicy {
    fn default() -> Self {
        LocktimePolicy {
            safety_margin_blocks: DEFAULT_SAFETY_MARGIN_BLOCKS,
            safety_margin_secs: DEFAULT_SAFETY_MARGIN_SECS,
            participant_lock_blocks: DEFAULT_PARTICIPANT_LOCK_BLOCKS,
            participant_lock_secs: DEFAULT_PARTICIPANT_LOCK_SECS,
        }
    }
}

impl LocktimePolicy {
    pub fn safety_margin(&self, kind: LocktimeKind) -> u64 {
        match kind {
            LocktimeKind::BlockHeight => self.safety_margin_blocks,
            LocktimeKind::Timestamp => self.safety_margin_secs,
        }
    }

    fn participant_lock(&self, kind: LocktimeKind) -> u64 {
        match kind {
            LocktimeKind::BlockHeight => self.participant_lock_blocks,
            LocktimeKind::Timestamp => self.participant_lock_secs,
        }
    }

    /// Locktimes for a new offer, counted from the current tips of the two
    /// chains. Returns `(participant_locktime, initiator_locktime)`.
    pub fn propose(
        &self,
        kind: LocktimeKind,
        participant_tip: ChainTip,
        initiator_tip: ChainTip,
    ) -> (Locktime, Locktime) {
        let now = |tip: ChainTip| match kind {
            LocktimeKind::BlockHeight => tip.height,
            LocktimeKind::Timestamp => tip.median_time,
        };
        let lock = self.participant_lock(kind);
        let margin = self.safety_margin(kind);

        let participant = now(participant_tip).saturating_add(lock);
        let initiator = now(initiator_tip)
            .saturating_add(lock)
            .saturating_add(margin)
            .max(participant.saturating_add(margin));

        (
            Locktime::new(kind, participant),
            Locktime::new(kind, initiator),
        )
    }

    /// Checks the ordering rule: the participant leg times out strictly
    /// before the initiator leg, separated by at least the safety margin.
    pub fn validate(&self, participant: Locktime, initiator: Locktime) -> Result<(), Error> {
        if participant.kind() != initiator.kind() {
            return Err(Error::InvalidOffer(format!(
                "participant locktime is a {} but initiator locktime is a {}",
                participant.kind(),
                initiator.kind()
            )));
        }
        if participant.value() >= initiator.value() {
            return Err(Error::InvalidOffer(format!(
                "participant locktime {} must be earlier than initiator locktime {}",
                participant, initiator
            )));
        }

        let margin = self.safety_margin(participant.kind());
        let gap = initiator.value() - participant.value();
        if gap < margin {
            return Err(Error::InvalidOffer(format!(
                "locktimes are {} apart, the safety margin is {}",
                gap, margin
            )));
        }

        Ok(())
    }
}
