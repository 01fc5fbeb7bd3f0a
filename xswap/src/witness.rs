//! Unsigned transactions and the witness templates the signer fills in.

use crate::{
    identity::PublicKey,
    transaction::{Script, Transaction, Txid},
    Error,
};
use bitcoin::{
    consensus::encode::serialize, hashes::Hash, util::sighash::SighashCache, EcdsaSighashType,
};
use serde::{Deserialize, Serialize};

/// Longest DER encoded signature, sighash flag included.
pub const MAX_SIGNATURE_LEN: usize = 73;

/// One item of an input's witness stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Witness {
    Data(Vec<u8>),
    /// A signature by the secret key belonging to this public key.
    Signature(PublicKey),
    PublicKey(PublicKey),
    Bool(bool),
    PrevScript,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInput {
    pub value: u64,
    pub prev_script: Script,
    pub witness: Vec<Witness>,
}

impl SigningInput {
    pub fn signing_key(&self) -> Option<&PublicKey> {
        self.witness.iter().find_map(|item| match item {
            Witness::Signature(key) => Some(key),
            _ => None,
        })
    }

    fn witness_stack(&self, signature: Vec<u8>) -> bitcoin::Witness {
        let mut signature = Some(signature);

        let items = self
            .witness
            .iter()
            .map(|item| match item {
                Witness::Data(data) => data.clone(),
                Witness::Signature(_) => signature.take().unwrap_or_default(),
                Witness::PublicKey(key) => key.as_bytes().to_vec(),
                Witness::Bool(true) => vec![1],
                Witness::Bool(false) => vec![],
                Witness::PrevScript => self.prev_script.to_bytes(),
            })
            .collect();

        bitcoin::Witness::from_vec(items)
    }
}

/// A transaction lacking signatures, together with what is needed to produce
/// them. `inputs[i]` describes `transaction.input[i]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub transaction: Transaction,
    pub inputs: Vec<SigningInput>,
    pub fee: u64,
}

impl UnsignedTransaction {
    pub fn txid(&self) -> Txid {
        self.transaction.txid()
    }

    /// Serialized size of the transaction once signed, assuming every
    /// signature has the maximum length.
    pub fn estimated_size(&self) -> u64 {
        let mut transaction = self.transaction.clone();
        for (input, signing_input) in transaction.input.iter_mut().zip(&self.inputs) {
            input.witness = signing_input.witness_stack(vec![0; MAX_SIGNATURE_LEN]);
        }

        serialize(&transaction).len() as u64
    }

    /// The BIP143 digest the signature of input `index` commits to, with
    /// `SIGHASH_ALL`.
    pub fn signature_hash(&self, index: usize) -> Option<[u8; 32]> {
        let input = self.inputs.get(index)?;

        SighashCache::new(&self.transaction)
            .segwit_signature_hash(index, &input.prev_script, input.value, EcdsaSighashType::All)
            .ok()
            .map(|sighash| sighash.into_inner())
    }

    /// Assembles the witnesses from one signature per input.
    pub fn finalize(self, signatures: Vec<Vec<u8>>) -> Result<Transaction, Error> {
        if signatures.len() != self.inputs.len() {
            return Err(Error::InvalidParameters(format!(
                "expected {} signatures, got {}",
                self.inputs.len(),
                signatures.len()
            )));
        }

        let mut transaction = self.transaction;
        for ((input, signing_input), signature) in transaction
            .input
            .iter_mut()
            .zip(&self.inputs)
            .zip(signatures)
        {
            input.witness = signing_input.witness_stack(signature);
        }

        Ok(transaction)
    }
}
