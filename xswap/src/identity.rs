use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// An already-derived public key of one of the swap parties.
///
/// Keys are opaque to the swap protocol: they end up inside the locking
/// script and are handed to the signer, nothing else. Their length is bounded
/// by what a single script push can carry. A single byte would not survive
/// minimal push encoding.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub const MIN_LENGTH: usize = 2;
    pub const MAX_LENGTH: usize = u16::MAX as usize;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidPublicKey> {
        match bytes.len() {
            0 => Err(InvalidPublicKey::Empty),
            len if len < Self::MIN_LENGTH => Err(InvalidPublicKey::TooShort(len)),
            len if len > Self::MAX_LENGTH => Err(InvalidPublicKey::TooLong(len)),
            _ => Ok(PublicKey(bytes.to_vec())),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq)]
pub enum InvalidPublicKey {
    #[error("public key is empty")]
    Empty,
    #[error("public key of {0} bytes is too short")]
    TooShort(usize),
    #[error("public key of {0} bytes does not fit into a script push")]
    TooLong(usize),
    #[error("public key is not valid hex")]
    NotHex,
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for PublicKey {
    type Err = InvalidPublicKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| InvalidPublicKey::NotHex)?;
        PublicKey::from_slice(&bytes)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = InvalidPublicKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_string()
    }
}
