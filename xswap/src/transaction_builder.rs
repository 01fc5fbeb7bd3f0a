use crate::{
    htlc::{self, HtlcParams, Locktime},
    identity::PublicKey,
    transaction::{
        Address, OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, VERSION,
    },
    witness::{SigningInput, UnsignedTransaction, Witness},
    Error,
};
use serde::{Deserialize, Serialize};

/// Fee rates are denominated in base units per 1000 bytes.
pub const DEFAULT_FEE_RATE: u64 = 2_000;
pub const DEFAULT_MINIMUM_FEE: u64 = 1_000;

/// An unspent output of the wallet, controlled by `owner`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Script,
    pub owner: PublicKey,
}

#[derive(Clone, Copy, Debug)]
pub struct TransactionBuilder {
    minimum_fee: u64,
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        TransactionBuilder {
            minimum_fee: DEFAULT_MINIMUM_FEE,
        }
    }
}

impl TransactionBuilder {
    pub fn new(minimum_fee: u64) -> Self {
        TransactionBuilder { minimum_fee }
    }

    pub fn calculate_fee(&self, size: u64, fee_rate: u64) -> u64 {
        let fee = size.saturating_mul(fee_rate) / 1000;

        fee.max(self.minimum_fee)
    }

    /// The fee is priced on the size with a change output, whether or not
    /// one ends up being needed.
    pub fn build_funding(
        &self,
        inputs: &[Utxo],
        params: &HtlcParams,
        amount: u64,
        change_address: &Address,
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, Error> {
        if amount == 0 {
            return Err(Error::InvalidParameters("HTLC amount must not be zero".into()));
        }

        let available = inputs
            .iter()
            .try_fold(0u64, |total, utxo| total.checked_add(utxo.value))
            .ok_or_else(|| Error::InvalidParameters("input values overflow".into()))?;

        let mut unsigned = UnsignedTransaction {
            transaction: Transaction {
                version: VERSION,
                lock_time: PackedLockTime(0),
                input: inputs
                    .iter()
                    .map(|utxo| unsigned_input(utxo.outpoint, Sequence::MAX))
                    .collect(),
                output: vec![
                    TxOut {
                        value: amount,
                        script_pubkey: params.locking_script(),
                    },
                    TxOut {
                        value: 0,
                        script_pubkey: change_address.script_pubkey().clone(),
                    },
                ],
            },
            inputs: inputs
                .iter()
                .map(|utxo| SigningInput {
                    value: utxo.value,
                    prev_script: utxo.script_pubkey.clone(),
                    witness: vec![
                        Witness::Signature(utxo.owner.clone()),
                        Witness::PublicKey(utxo.owner.clone()),
                    ],
                })
                .collect(),
            fee: 0,
        };

        let fee = self.calculate_fee(unsigned.estimated_size(), fee_rate);
        let required = amount.saturating_add(fee);
        if inputs.is_empty() || available < required {
            return Err(Error::InsufficientFunds {
                required,
                available,
            });
        }

        let change = available - required;
        if change > 0 {
            unsigned.transaction.output[1].value = change;
        } else {
            unsigned.transaction.output.truncate(1);
        }
        unsigned.fee = fee;

        Ok(unsigned)
    }

    /// Spends the HTLC through the preimage branch.
    ///
    /// The preimage is checked first: a mismatch never produces a
    /// transaction.
    pub fn build_claim(
        &self,
        htlc_outpoint: OutPoint,
        amount: u64,
        script: &Script,
        preimage: &[u8],
        recipient_address: &Address,
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, Error> {
        let params = htlc::extract_parameters(script)?;
        if !htlc::verify_preimage(preimage, params.payment_hash(), params.hash_algorithm()) {
            return Err(Error::PreimageMismatch);
        }

        let unsigned = UnsignedTransaction {
            transaction: Transaction {
                version: VERSION,
                lock_time: PackedLockTime(0),
                input: vec![unsigned_input(htlc_outpoint, Sequence::MAX)],
                output: vec![TxOut {
                    value: 0,
                    script_pubkey: recipient_address.script_pubkey().clone(),
                }],
            },
            inputs: vec![SigningInput {
                value: amount,
                prev_script: script.clone(),
                witness: vec![
                    Witness::Signature(params.recipient().clone()),
                    Witness::Data(preimage.to_vec()),
                    Witness::Bool(true),
                    Witness::PrevScript,
                ],
            }],
            fee: 0,
        };

        self.pay_out(unsigned, amount, fee_rate)
    }

    /// Spends the HTLC through the timeout branch. `locktime` becomes the
    /// transaction's locktime and must not be earlier than the HTLC's.
    pub fn build_refund(
        &self,
        htlc_outpoint: OutPoint,
        amount: u64,
        script: &Script,
        refund_address: &Address,
        locktime: Locktime,
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, Error> {
        let params = htlc::extract_parameters(script)?;
        let htlc_locktime = params.locktime();
        if locktime.kind() != htlc_locktime.kind() {
            return Err(Error::InvalidParameters(format!(
                "refund locktime is a {} but the HTLC locktime is a {}",
                locktime.kind(),
                htlc_locktime.kind()
            )));
        }
        if locktime.value() < htlc_locktime.value() {
            return Err(Error::InvalidParameters(format!(
                "refund locktime {} is earlier than HTLC locktime {}",
                locktime, htlc_locktime
            )));
        }
        let lock_time = u32::try_from(locktime.value()).map_err(|_| {
            Error::InvalidParameters(format!("refund locktime {} is out of range", locktime))
        })?;

        let unsigned = UnsignedTransaction {
            transaction: Transaction {
                version: VERSION,
                lock_time: PackedLockTime(lock_time),
                input: vec![unsigned_input(htlc_outpoint, Sequence::ENABLE_LOCKTIME_NO_RBF)],
                output: vec![TxOut {
                    value: 0,
                    script_pubkey: refund_address.script_pubkey().clone(),
                }],
            },
            inputs: vec![SigningInput {
                value: amount,
                prev_script: script.clone(),
                witness: vec![
                    Witness::Signature(params.refund().clone()),
                    Witness::Bool(false),
                    Witness::PrevScript,
                ],
            }],
            fee: 0,
        };

        self.pay_out(unsigned, amount, fee_rate)
    }

    /// Sends everything but the fee to the single output.
    fn pay_out(
        &self,
        mut unsigned: UnsignedTransaction,
        amount: u64,
        fee_rate: u64,
    ) -> Result<UnsignedTransaction, Error> {
        let fee = self.calculate_fee(unsigned.estimated_size(), fee_rate);
        if fee >= amount {
            return Err(Error::InsufficientFunds {
                required: fee.saturating_add(1),
                available: amount,
            });
        }

        unsigned.transaction.output[0].value = amount - fee;
        unsigned.fee = fee;

        Ok(unsigned)
    }
}

fn unsigned_input(previous_output: OutPoint, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output,
        script_sig: Script::new(),
        sequence,
        witness: bitcoin::Witness::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        htlc::{hash_preimage, HashAlgorithm},
        transaction::{total_output_value, Txid},
        witness::MAX_SIGNATURE_LEN,
    };
    use bitcoin::{consensus::encode::serialize, hashes::Hash};
    use proptest::prelude::*;
    use spectral::prelude::*;

    const PREIMAGE: &[u8; 32] = b"hello world, you are beautiful!!";

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_slice(&[byte; 33]).unwrap()
    }

    fn params() -> HtlcParams {
        params_with_keys(key(2), key(3))
    }

    fn params_with_keys(recipient: PublicKey, refund: PublicKey) -> HtlcParams {
        HtlcParams::new(
            recipient,
            refund,
            hash_preimage(PREIMAGE, HashAlgorithm::Sha256),
            Locktime::BlockHeight(100),
            HashAlgorithm::Sha256,
        )
        .unwrap()
    }

    fn address(byte: u8) -> Address {
        Address::from_script_pubkey(Script::from(vec![0x00, 0x14, byte]))
    }

    fn utxo(value: u64) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(Txid::from_inner([9; 32]), 0),
            value,
            script_pubkey: address(1).script_pubkey().clone(),
            owner: key(4),
        }
    }

    fn htlc_outpoint() -> OutPoint {
        OutPoint::new(Txid::from_inner([5; 32]), 0)
    }

    #[test]
    fn fee_is_size_times_rate_with_a_floor() {
        let builder = TransactionBuilder::default();

        assert_that(&builder.calculate_fee(250, 10_000)).is_equal_to(2_500);
        assert_that(&builder.calculate_fee(250, 1_000)).is_equal_to(DEFAULT_MINIMUM_FEE);
    }

    #[test]
    fn funding_pays_amount_to_the_htlc_and_returns_change() {
        let builder = TransactionBuilder::default();

        let unsigned = builder
            .build_funding(&[utxo(1_000_000)], &params(), 600_000, &address(7), DEFAULT_FEE_RATE)
            .unwrap();

        let outputs = &unsigned.transaction.output;
        assert_that(&outputs.len()).is_equal_to(2);
        assert_that(&outputs[0].value).is_equal_to(600_000);
        assert_that(&outputs[0].script_pubkey).is_equal_to(params().locking_script());
        assert_that(&outputs[1].value).is_equal_to(1_000_000 - 600_000 - unsigned.fee);
        assert_that(&total_output_value(&unsigned.transaction)).is_equal_to(1_000_000 - unsigned.fee);
        assert_that(&unsigned.inputs[0].signing_key()).is_equal_to(Some(&key(4)));
    }

    #[test]
    fn funding_without_leftover_has_no_change_output() {
        let builder = TransactionBuilder::default();
        let fee = builder
            .build_funding(&[utxo(1_000_000)], &params(), 500_000, &address(7), DEFAULT_FEE_RATE)
            .unwrap()
            .fee;

        let unsigned = builder
            .build_funding(&[utxo(500_000 + fee)], &params(), 500_000, &address(7), DEFAULT_FEE_RATE)
            .unwrap();

        assert_that(&unsigned.transaction.output.len()).is_equal_to(1);
        assert_that(&unsigned.fee).is_equal_to(fee);
    }

    #[test]
    fn funding_with_too_little_input_fails() {
        let builder = TransactionBuilder::default();

        let result =
            builder.build_funding(&[utxo(500_000)], &params(), 500_000, &address(7), DEFAULT_FEE_RATE);

        assert!(matches!(
            result,
            Err(Error::InsufficientFunds {
                available: 500_000,
                ..
            })
        ));
    }

    #[test]
    fn funding_with_no_inputs_fails() {
        let result = TransactionBuilder::default().build_funding(
            &[],
            &params(),
            1,
            &address(7),
            DEFAULT_FEE_RATE,
        );

        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
    }

    #[test]
    fn claim_uses_the_preimage_branch() {
        let builder = TransactionBuilder::default();
        let script = params().locking_script();

        let unsigned = builder
            .build_claim(htlc_outpoint(), 100_000, &script, PREIMAGE, &address(8), DEFAULT_FEE_RATE)
            .unwrap();

        let transaction = &unsigned.transaction;
        assert_that(&transaction.input[0].previous_output).is_equal_to(htlc_outpoint());
        assert_that(&transaction.lock_time).is_equal_to(PackedLockTime(0));
        assert_that(&transaction.output[0].value).is_equal_to(100_000 - unsigned.fee);
        assert_that(&unsigned.inputs[0].signing_key()).is_equal_to(Some(&key(2)));
        assert_that(&unsigned.inputs[0].witness[1]).is_equal_to(Witness::Data(PREIMAGE.to_vec()));
    }

    #[test]
    fn claim_with_wrong_preimage_fails() {
        let script = params().locking_script();

        let result = TransactionBuilder::default().build_claim(
            htlc_outpoint(),
            100_000,
            &script,
            b"hello world, you are beautiful!?",
            &address(8),
            DEFAULT_FEE_RATE,
        );

        assert!(matches!(result, Err(Error::PreimageMismatch)));
    }

    #[test]
    fn claim_of_dust_fails() {
        let script = params().locking_script();

        let result = TransactionBuilder::default().build_claim(
            htlc_outpoint(),
            DEFAULT_MINIMUM_FEE,
            &script,
            PREIMAGE,
            &address(8),
            DEFAULT_FEE_RATE,
        );

        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
    }

    #[test]
    fn claim_of_foreign_script_is_malformed() {
        let result = TransactionBuilder::default().build_claim(
            htlc_outpoint(),
            100_000,
            &Script::from(vec![0x51]),
            PREIMAGE,
            &address(8),
            DEFAULT_FEE_RATE,
        );

        assert!(matches!(result, Err(Error::MalformedScript)));
    }

    #[test]
    fn refund_enables_locktime() {
        let script = params().locking_script();

        let unsigned = TransactionBuilder::default()
            .build_refund(
                htlc_outpoint(),
                100_000,
                &script,
                &address(9),
                Locktime::BlockHeight(101),
                DEFAULT_FEE_RATE,
            )
            .unwrap();

        let transaction = &unsigned.transaction;
        assert_that(&transaction.lock_time).is_equal_to(PackedLockTime(101));
        assert_that(&transaction.input[0].sequence).is_equal_to(Sequence::ENABLE_LOCKTIME_NO_RBF);
        assert_that(&unsigned.inputs[0].signing_key()).is_equal_to(Some(&key(3)));
    }

    #[test]
    fn refund_before_htlc_locktime_fails() {
        let script = params().locking_script();

        let result = TransactionBuilder::default().build_refund(
            htlc_outpoint(),
            100_000,
            &script,
            &address(9),
            Locktime::BlockHeight(99),
            DEFAULT_FEE_RATE,
        );

        assert!(matches!(result, Err(Error::InvalidParameters(_))));
    }

    #[test]
    fn refund_with_timestamp_for_height_htlc_fails() {
        let script = params().locking_script();

        let result = TransactionBuilder::default().build_refund(
            htlc_outpoint(),
            100_000,
            &script,
            &address(9),
            Locktime::Timestamp(1_700_000_000),
            DEFAULT_FEE_RATE,
        );

        assert!(matches!(result, Err(Error::InvalidParameters(_))));
    }

    #[test]
    fn built_claim_matches_its_size_estimate() {
        let script = params().locking_script();
        let unsigned = TransactionBuilder::default()
            .build_claim(htlc_outpoint(), 100_000, &script, PREIMAGE, &address(8), DEFAULT_FEE_RATE)
            .unwrap();
        let estimate = unsigned.estimated_size();

        let signed = unsigned.finalize(vec![vec![0x30; 72]]).unwrap();

        let actual = serialize(&signed).len() as u64;
        assert_that(&actual).is_less_than_or_equal_to(estimate);
        assert_that(&(estimate - actual)).is_less_than_or_equal_to(1);
    }

    #[test]
    fn fees_grow_with_the_locking_script() {
        let builder = TransactionBuilder::new(0);
        let small = params();
        let large = params_with_keys(
            PublicKey::from_slice(&[2; 300]).unwrap(),
            PublicKey::from_slice(&[3; 300]).unwrap(),
        );
        let extra = (large.locking_script().len() - small.locking_script().len()) as u64;

        let refund = |params: &HtlcParams| {
            builder
                .build_refund(
                    htlc_outpoint(),
                    100_000,
                    &params.locking_script(),
                    &address(9),
                    Locktime::BlockHeight(100),
                    DEFAULT_FEE_RATE,
                )
                .unwrap()
        };
        let small_refund = refund(&small);
        let large_refund = refund(&large);

        let signed = large_refund
            .clone()
            .finalize(vec![vec![0x30; MAX_SIGNATURE_LEN]])
            .unwrap();
        assert_that(&large_refund.estimated_size()).is_equal_to(serialize(&signed).len() as u64);
        assert_that(&large_refund.fee).is_greater_than_or_equal_to(
            small_refund.fee + extra * DEFAULT_FEE_RATE / 1000,
        );

        let funding = |params: &HtlcParams| {
            builder
                .build_funding(&[utxo(1_000_000)], params, 500_000, &address(7), DEFAULT_FEE_RATE)
                .unwrap()
                .fee
        };
        assert_that(&funding(&large)).is_greater_than_or_equal_to(
            funding(&small) + extra * DEFAULT_FEE_RATE / 1000,
        );
    }

    proptest! {
        #[test]
        fn claim_never_costs_less_than_refund(
            recipient in crate::htlc::arbitrary::public_key(),
            refund in crate::htlc::arbitrary::public_key(),
        ) {
            let builder = TransactionBuilder::new(0);
            let script = params_with_keys(recipient, refund).locking_script();

            let claim = builder
                .build_claim(htlc_outpoint(), u64::MAX, &script, PREIMAGE, &address(8), DEFAULT_FEE_RATE)
                .unwrap();
            let refund = builder
                .build_refund(
                    htlc_outpoint(),
                    u64::MAX,
                    &script,
                    &address(8),
                    Locktime::BlockHeight(100),
                    DEFAULT_FEE_RATE,
                )
                .unwrap();

            prop_assert!(claim.fee >= refund.fee);
        }

        #[test]
        fn any_wrong_preimage_is_rejected(preimage in any::<[u8; 32]>()) {
            prop_assume!(&preimage != PREIMAGE);
            let script = params().locking_script();

            let result = TransactionBuilder::default().build_claim(
                htlc_outpoint(),
                100_000,
                &script,
                &preimage,
                &address(8),
                DEFAULT_FEE_RATE,
            );

            prop_assert!(matches!(result, Err(Error::PreimageMismatch)));
        }
    }
}
