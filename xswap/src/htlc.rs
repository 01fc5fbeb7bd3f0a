//! Construction and verification of the hash time-locked contract.
//!
//! The locking script has two spending paths:
//!
//! ```text
//! OP_IF
//!     <hash-op> <payment_hash> OP_EQUALVERIFY <recipient_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP <refund_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! The locktime is pushed as 8 little-endian bytes. Whether it is a block
//! height or a timestamp follows the consensus threshold, which means the
//! locktime kind survives a round-trip through the script.
//!
//! Bitcoin has no SHA3 opcode; `0xc0` (an `OP_RETURN_192` there) stands in for
//! `OP_SHA3_256` on the chains that support it.

use crate::{
    identity::PublicKey,
    transaction::{Script, Transaction},
    Error,
};
use bitcoin::{
    blockdata::{
        opcodes::{
            all::{
                OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_IF,
                OP_RIPEMD160, OP_SHA256,
            },
            All as Opcode,
        },
        script::{Builder, Instruction},
    },
    hashes::{ripemd160, sha256, Hash},
    Witness,
};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Locktime values below this are block heights, values at or above are Unix
/// timestamps.
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// The largest locktime a transaction can carry.
pub const MAX_LOCKTIME: u64 = u32::MAX as u64;

pub const OP_SHA3_256: u8 = 0xc0;

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
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HashAlgorithm {
    Sha3_256,
    Sha256,
    Ripemd160,
}

impl HashAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha3_256 | HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Ripemd160 => 20,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha3_256 => Sha3_256::digest(data).to_vec(),
            HashAlgorithm::Sha256 => sha256::Hash::hash(data).into_inner().to_vec(),
            HashAlgorithm::Ripemd160 => ripemd160::Hash::hash(data).into_inner().to_vec(),
        }
    }

    fn opcode(self) -> Opcode {
        match self {
            HashAlgorithm::Sha3_256 => Opcode::from(OP_SHA3_256),
            HashAlgorithm::Sha256 => OP_SHA256,
            HashAlgorithm::Ripemd160 => OP_RIPEMD160,
        }
    }

    fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            OP_SHA256 => Some(HashAlgorithm::Sha256),
            OP_RIPEMD160 => Some(HashAlgorithm::Ripemd160),
            opcode if opcode.to_u8() == OP_SHA3_256 => Some(HashAlgorithm::Sha3_256),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentHash(#[serde(with = "hex::serde")] Vec<u8>);

impl PaymentHash {
    pub fn new(bytes: Vec<u8>) -> Self {
        PaymentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", self)
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LocktimeKind {
    BlockHeight,
    Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locktime {
    BlockHeight(u64),
    Timestamp(u64),
}

impl Locktime {
    pub fn new(kind: LocktimeKind, value: u64) -> Self {
        match kind {
            LocktimeKind::BlockHeight => Locktime::BlockHeight(value),
            LocktimeKind::Timestamp => Locktime::Timestamp(value),
        }
    }

    /// Interprets a raw locktime the way consensus does.
    pub fn from_consensus(value: u64) -> Self {
        if value < LOCKTIME_THRESHOLD {
            Locktime::BlockHeight(value)
        } else {
            Locktime::Timestamp(value)
        }
    }

    pub fn value(self) -> u64 {
        match self {
            Locktime::BlockHeight(value) | Locktime::Timestamp(value) => value,
        }
    }

    pub fn kind(self) -> LocktimeKind {
        match self {
            Locktime::BlockHeight(_) => LocktimeKind::BlockHeight,
            Locktime::Timestamp(_) => LocktimeKind::Timestamp,
        }
    }

    pub fn is_block_height(self) -> bool {
        self.kind() == LocktimeKind::BlockHeight
    }

    /// Whether a chain at `height` with median time `time` has reached this
    /// locktime.
    pub fn is_reached(self, height: u64, time: u64) -> bool {
        match self {
            Locktime::BlockHeight(locktime) => locktime <= height,
            Locktime::Timestamp(locktime) => locktime <= time,
        }
    }
}

impl fmt::Display for Locktime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locktime::BlockHeight(height) => write!(f, "block {}", height),
            Locktime::Timestamp(time) => write!(f, "time {}", time),
        }
    }
}

/// The parameters fully describing one HTLC.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawHtlcParams", into = "RawHtlcParams")]
pub struct HtlcParams {
    recipient: PublicKey,
    refund: PublicKey,
    payment_hash: PaymentHash,
    locktime: Locktime,
    hash_algorithm: HashAlgorithm,
}

impl HtlcParams {
    pub fn new(
        recipient: PublicKey,
        refund: PublicKey,
        payment_hash: PaymentHash,
        locktime: Locktime,
        hash_algorithm: HashAlgorithm,
    ) -> Result<Self, Error> {
        let expected_len = hash_algorithm.output_len();
        if payment_hash.as_bytes().len() != expected_len {
            return Err(Error::InvalidParameters(format!(
                "{} payment hash must be {} bytes, got {}",
                hash_algorithm,
                expected_len,
                payment_hash.as_bytes().len()
            )));
        }
        if locktime.value() == 0 {
            return Err(Error::InvalidParameters("locktime must not be zero".into()));
        }
        if locktime.value() > MAX_LOCKTIME {
            return Err(Error::InvalidParameters(format!(
                "locktime {} does not fit into a transaction",
                locktime.value()
            )));
        }
        if Locktime::from_consensus(locktime.value()) != locktime {
            return Err(Error::InvalidParameters(format!(
                "locktime {} is not a valid {}",
                locktime.value(),
                locktime.kind()
            )));
        }

        Ok(HtlcParams {
            recipient,
            refund,
            payment_hash,
            locktime,
            hash_algorithm,
        })
    }

    pub fn recipient(&self) -> &PublicKey {
        &self.recipient
    }

    pub fn refund(&self) -> &PublicKey {
        &self.refund
    }

    pub fn payment_hash(&self) -> &PaymentHash {
        &self.payment_hash
    }

    pub fn locktime(&self) -> Locktime {
        self.locktime
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub fn locking_script(&self) -> Script {
        build_locking_script(self)
    }
}

#[derive(Serialize, Deserialize)]
struct RawHtlcParams {
    recipient: PublicKey,
    refund: PublicKey,
    payment_hash: PaymentHash,
    locktime: Locktime,
    hash_algorithm: HashAlgorithm,
}

impl TryFrom<RawHtlcParams> for HtlcParams {
    type Error = Error;

    fn try_from(raw: RawHtlcParams) -> Result<Self, Self::Error> {
        HtlcParams::new(
            raw.recipient,
            raw.refund,
            raw.payment_hash,
            raw.locktime,
            raw.hash_algorithm,
        )
    }
}

impl From<HtlcParams> for RawHtlcParams {
    fn from(params: HtlcParams) -> Self {
        RawHtlcParams {
            recipient: params.recipient,
            refund: params.refund,
            payment_hash: params.payment_hash,
            locktime: params.locktime,
            hash_algorithm: params.hash_algorithm,
        }
    }
}

pub fn build_locking_script(params: &HtlcParams) -> Script {
    Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(params.hash_algorithm.opcode())
        .push_slice(params.payment_hash.as_bytes())
        .push_opcode(OP_EQUALVERIFY)
        .push_slice(params.recipient.as_bytes())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_slice(&params.locktime.value().to_le_bytes())
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_slice(params.refund.as_bytes())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

pub fn is_htlc_script(script: &Script) -> bool {
    extract_parameters(script).is_ok()
}

/// Recovers the parameters from a locking script.
///
/// Pushes must be minimal, and only scripts byte-for-byte identical to what
/// [`build_locking_script`] produces for the recovered parameters are
/// accepted.
pub fn extract_parameters(script: &Script) -> Result<HtlcParams, Error> {
    use Instruction::{Op, PushBytes as Push};

    let instructions = script
        .instructions_minimal()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| Error::MalformedScript)?;

    let params = match instructions.as_slice() {
        [Op(OP_IF), Op(hash_op), Push(payment_hash), Op(OP_EQUALVERIFY), Push(recipient), Op(OP_CHECKSIG), Op(OP_ELSE), Push(locktime), Op(OP_CLTV), Op(OP_DROP), Push(refund), Op(OP_CHECKSIG), Op(OP_ENDIF)] =>
        {
            let hash_algorithm = HashAlgorithm::from_opcode(*hash_op).ok_or(Error::MalformedScript)?;
            let locktime = <[u8; 8]>::try_from(*locktime).map_err(|_| Error::MalformedScript)?;
            let recipient = PublicKey::from_slice(recipient).map_err(|_| Error::MalformedScript)?;
            let refund = PublicKey::from_slice(refund).map_err(|_| Error::MalformedScript)?;

            HtlcParams::new(
                recipient,
                refund,
                PaymentHash::new(payment_hash.to_vec()),
                Locktime::from_consensus(u64::from_le_bytes(locktime)),
                hash_algorithm,
            )
            .map_err(|_| Error::MalformedScript)?
        }
        _ => return Err(Error::MalformedScript),
    };

    if build_locking_script(&params) != *script {
        return Err(Error::MalformedScript);
    }

    Ok(params)
}

pub fn hash_preimage(preimage: &[u8], algorithm: HashAlgorithm) -> PaymentHash {
    PaymentHash(algorithm.hash(preimage))
}

/// Compares in constant time so the check does not leak how much of a guessed
/// preimage was right.
pub fn verify_preimage(preimage: &[u8], payment_hash: &PaymentHash, algorithm: HashAlgorithm) -> bool {
    let computed = algorithm.hash(preimage);

    computed.as_slice().ct_eq(payment_hash.as_bytes()).into()
}

/// Witness stack spending the preimage branch.
pub fn claim_witness(signature: Vec<u8>, preimage: Vec<u8>, script: &Script) -> Witness {
    Witness::from_vec(vec![signature, preimage, vec![1], script.to_bytes()])
}

/// Witness stack spending the timeout branch.
pub fn refund_witness(signature: Vec<u8>, script: &Script) -> Witness {
    Witness::from_vec(vec![signature, vec![], script.to_bytes()])
}

/// Finds the preimage revealed by a transaction spending an HTLC.
///
/// Every witness item of every input is checked against the payment hash, so
/// this works regardless of where in the witness the spender put it.
pub fn extract_preimage(transaction: &Transaction, params: &HtlcParams) -> Option<Vec<u8>> {
    transaction
        .input
        .iter()
        .flat_map(|input| input.witness.iter())
        .find(|item| verify_preimage(item, params.payment_hash(), params.hash_algorithm()))
        .map(<[u8]>::to_vec)
}
