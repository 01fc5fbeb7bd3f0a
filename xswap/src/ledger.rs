use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Identifies the blockchain a leg of a swap lives on, e.g. `bitcoin` or
/// `litecoin-testnet`.
///
/// Chain ids are lowercase and restricted to `[a-z0-9-]` so they can be used
/// as keys in the configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq)]
#[error("chain ids must be non-empty and only contain lowercase ascii letters, digits or '-'")]
pub struct InvalidChainId;

impl ChainId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidChainId> {
        let id = id.into();

        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(InvalidChainId);
        }

        Ok(ChainId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChainId {
    type Err = InvalidChainId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainId::new(s)
    }
}

impl TryFrom<String> for ChainId {
    type Error = InvalidChainId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChainId::new(value)
    }
}

impl From<ChainId> for String {
    fn from(id: ChainId) -> Self {
        id.0
    }
}
