//! Transactions are Bitcoin transactions. What lives here is the little the
//! swap needs on top: wallet addresses and the raw hex encoding the monitors
//! speak.

pub use bitcoin::{OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid};

use crate::Error;
use bitcoin::consensus::encode::{deserialize, serialize_hex};
use serde::{Deserialize, Serialize};

pub const VERSION: i32 = 2;

/// Where a transaction output pays to, already decoded into its locking
/// script by the wallet.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Script);

impl Address {
    pub fn from_script_pubkey(script: Script) -> Self {
        Address(script)
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.0
    }
}

pub fn to_hex(transaction: &Transaction) -> String {
    serialize_hex(transaction)
}

pub fn from_hex(raw: &str) -> Result<Transaction, Error> {
    let bytes = hex::decode(raw).map_err(|e| Error::Decode(e.to_string()))?;

    deserialize(&bytes).map_err(|e| Error::Decode(e.to_string()))
}

pub fn total_output_value(transaction: &Transaction) -> u64 {
    transaction.output.iter().map(|output| output.value).sum()
}

/// Position of the first output paying to `script_pubkey`.
pub fn output_index(transaction: &Transaction, script_pubkey: &Script) -> Option<u32> {
    transaction
        .output
        .iter()
        .position(|output| output.script_pubkey == *script_pubkey)
        .and_then(|index| u32::try_from(index).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{hashes::Hash, Witness};
    use spectral::prelude::*;

    fn transaction() -> Transaction {
        Transaction {
            version: VERSION,
            lock_time: PackedLockTime(201),
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_inner([7u8; 32]), 1),
                script_sig: Script::new(),
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: Witness::from_vec(vec![vec![0x30; 71], vec![], vec![0x63, 0x68]]),
            }],
            output: vec![
                TxOut {
                    value: 100_000,
                    script_pubkey: Script::from(vec![0x00, 0x14, 0xaa]),
                },
                TxOut {
                    value: 5_000,
                    script_pubkey: Script::new(),
                },
            ],
        }
    }

    #[test]
    fn raw_hex_decodes_to_the_same_transaction() {
        let transaction = transaction();

        let decoded = from_hex(&to_hex(&transaction)).unwrap();

        assert_that(&decoded).is_equal_to(&transaction);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let raw = format!("{}00", to_hex(&transaction()));

        assert!(matches!(from_hex(&raw), Err(Error::Decode(_))));
    }

    #[test]
    fn invalid_hex_is_rejected() {
        assert!(matches!(from_hex("not hex"), Err(Error::Decode(_))));
    }

    #[test]
    fn outputs_are_found_by_script() {
        let transaction = transaction();

        assert_that(&output_index(&transaction, &Script::new())).is_equal_to(Some(1));
        assert_that(&output_index(&transaction, &Script::from(vec![0x51]))).is_none();
        assert_that(&total_output_value(&transaction)).is_equal_to(105_000);
    }
}
