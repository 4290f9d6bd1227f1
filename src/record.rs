//! Initialization record and its persisted encoding.
//!
//! The record is written once, when the leader is initialized, as a flat
//! secret payload:
//!
//! ```text
//! root-token        -> <root token>
//! root-unseal-key-1 -> <share 1>
//! root-unseal-key-2 -> <share 2>
//! ...
//! ```
//!
//! Decoding is strict. Enumeration order of the payload is irrelevant; shares
//! come back sorted by their 1-based index, and the set of indices must be
//! exactly `1..=S`. A malformed payload is rejected rather than repaired, so
//! no share is ever fabricated or silently dropped.

use std::collections::BTreeMap;
use std::fmt;

use snafu::Snafu;

use crate::constants::ROOT_TOKEN_KEY;
use crate::constants::UNSEAL_KEY_PREFIX;
use crate::vault::InitResponse;

/// One unseal key share. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyShare(String);

impl KeyShare {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw share, for submission to Vault.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyShare(<redacted>)")
    }
}

/// Errors decoding or constructing an [`InitializationRecord`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum RecordError {
    #[snafu(display("record has no non-empty '{ROOT_TOKEN_KEY}' entry"))]
    MissingRootToken,

    #[snafu(display("record key '{key}' does not end in a positive share index"))]
    InvalidShareKey { key: String },

    #[snafu(display("share index {index} appears more than once"))]
    DuplicateShareIndex { index: u32 },

    #[snafu(display("share {index} is missing from the record"))]
    MissingShare { index: u32 },

    #[snafu(display("share {index} is empty"))]
    EmptyShare { index: u32 },

    #[snafu(display("record holds {found} shares, configuration expects {expected}"))]
    ShareCountMismatch { expected: u8, found: usize },
}

/// Root token plus the ordered key shares returned by `sys/init`.
///
/// Invariant: `shares().len()` equals the configured share count. Instances
/// are only built from a fresh init response or by decoding a persisted
/// record, and are immutable afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct InitializationRecord {
    root_token: String,
    shares: Vec<KeyShare>,
}

impl fmt::Debug for InitializationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializationRecord")
            .field("root_token", &"<redacted>")
            .field("shares", &self.shares.len())
            .finish()
    }
}

impl InitializationRecord {
    /// Build a record from a fresh `sys/init` response.
    pub fn from_init_response(response: InitResponse, expected_shares: u8) -> Result<Self, RecordError> {
        if response.root_token.is_empty() {
            return Err(RecordError::MissingRootToken);
        }
        if response.keys.len() != usize::from(expected_shares) {
            return Err(RecordError::ShareCountMismatch {
                expected: expected_shares,
                found: response.keys.len(),
            });
        }
        let mut shares = Vec::with_capacity(response.keys.len());
        for (position, key) in response.keys.into_iter().enumerate() {
            if key.is_empty() {
                return Err(RecordError::EmptyShare {
                    index: share_index(position),
                });
            }
            shares.push(KeyShare::new(key));
        }
        Ok(Self {
            root_token: response.root_token,
            shares,
        })
    }

    pub fn root_token(&self) -> &str {
        &self.root_token
    }

    /// Shares in persisted (1-based index) order.
    pub fn shares(&self) -> &[KeyShare] {
        &self.shares
    }

    /// Encode as a flat secret payload.
    pub fn to_secret_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert(ROOT_TOKEN_KEY.to_string(), self.root_token.clone());
        for (position, share) in self.shares.iter().enumerate() {
            data.insert(share_key(share_index(position)), share.expose().to_string());
        }
        data
    }

    /// Decode a flat secret payload, validating it against `expected_shares`.
    ///
    /// Keys that are neither the root token nor share-like are ignored.
    pub fn from_secret_data(data: &BTreeMap<String, String>, expected_shares: u8) -> Result<Self, RecordError> {
        let root_token = data
            .get(ROOT_TOKEN_KEY)
            .filter(|token| !token.is_empty())
            .ok_or(RecordError::MissingRootToken)?
            .clone();

        let mut indexed: BTreeMap<u32, &String> = BTreeMap::new();
        for (key, value) in data {
            let Some(index) = parse_share_key(key)? else {
                continue;
            };
            if indexed.insert(index, value).is_some() {
                return Err(RecordError::DuplicateShareIndex { index });
            }
        }

        if indexed.len() != usize::from(expected_shares) {
            return Err(RecordError::ShareCountMismatch {
                expected: expected_shares,
                found: indexed.len(),
            });
        }

        let mut shares = Vec::with_capacity(indexed.len());
        for (position, (index, value)) in indexed.into_iter().enumerate() {
            let expected_index = share_index(position);
            if index != expected_index {
                return Err(RecordError::MissingShare { index: expected_index });
            }
            if value.is_empty() {
                return Err(RecordError::EmptyShare { index });
            }
            shares.push(KeyShare::new(value.clone()));
        }

        Ok(Self { root_token, shares })
    }
}

/// Secret key for the share with 1-based `index`.
pub fn share_key(index: u32) -> String {
    format!("{UNSEAL_KEY_PREFIX}{index}")
}

/// 1-based share index for a 0-based position.
fn share_index(position: usize) -> u32 {
    u32::try_from(position).unwrap_or(u32::MAX).saturating_add(1)
}

/// Parse a payload key: `Ok(None)` for non-share keys, `Ok(Some(index))` for
/// `root-unseal-key-<index>`, and an error for share-like keys with a bad
/// suffix.
fn parse_share_key(key: &str) -> Result<Option<u32>, RecordError> {
    let Some(suffix) = key.strip_prefix(UNSEAL_KEY_PREFIX) else {
        return Ok(None);
    };
    match suffix.parse::<u32>() {
        Ok(index) if index > 0 && !suffix.starts_with('+') => Ok(Some(index)),
        _ => Err(RecordError::InvalidShareKey { key: key.to_string() }),
    }
}
