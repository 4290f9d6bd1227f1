//! Pure validation functions for cluster configuration.
//!
//! Follows the "Functional Core, Imperative Shell" pattern: every function is
//! deterministic and side-effect free, so `ClusterConfiguration::validate()`
//! is just a sequence of these checks.
//!
//! # Tiger Style
//!
//! - Fail-fast semantics: Return first error encountered
//! - Explicit bounds: All limits documented and enforced
//! - Clear error messages: Context for operators to diagnose issues

use std::collections::HashSet;
use std::time::Duration;

use snafu::Snafu;

use crate::constants::MAX_SECRET_SHARES;

/// Validation errors for configuration fields.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ValidationError {
    #[snafu(display("secret_shares must be between 1 and {MAX_SECRET_SHARES}, got {shares}"))]
    SharesOutOfRange { shares: u8 },

    #[snafu(display("secret_threshold must be between 1 and secret_shares ({shares}), got {threshold}"))]
    ThresholdOutOfRange { shares: u8, threshold: u8 },

    #[snafu(display("{field} cannot be empty"))]
    EmptyField { field: &'static str },

    #[snafu(display("node '{name}' is listed more than once"))]
    DuplicateNode { name: String },

    #[snafu(display("{field} must be greater than 0"))]
    ZeroDuration { field: &'static str },

    #[snafu(display("{field} must be greater than 0"))]
    ZeroCount { field: &'static str },

    #[snafu(display("raft leader API address '{addr}' must start with http:// or https://"))]
    LeaderAddrScheme { addr: String },
}

/// Validate the share count and unseal threshold: `1 <= T <= S`.
#[inline]
pub fn validate_shares(shares: u8, threshold: u8) -> Result<(), ValidationError> {
    if shares == 0 {
        return Err(ValidationError::SharesOutOfRange { shares });
    }
    if threshold == 0 || threshold > shares {
        return Err(ValidationError::ThresholdOutOfRange { shares, threshold });
    }
    Ok(())
}

/// Validate that a required string field is non-empty.
#[inline]
pub fn validate_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

/// Validate that the leader and followers are distinct, non-empty names.
pub fn validate_topology(leader: &str, followers: &[String]) -> Result<(), ValidationError> {
    validate_non_empty("leader", leader)?;

    let mut seen = HashSet::with_capacity(followers.len() + 1);
    seen.insert(leader);
    for follower in followers {
        validate_non_empty("followers", follower)?;
        if !seen.insert(follower.as_str()) {
            return Err(ValidationError::DuplicateNode { name: follower.clone() });
        }
    }
    Ok(())
}

/// Validate that a timing value is non-zero.
#[inline]
pub fn validate_duration(field: &'static str, value: Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::ZeroDuration { field });
    }
    Ok(())
}

/// Validate that a retry/poll count is non-zero.
#[inline]
pub fn validate_count(field: &'static str, value: u32) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::ZeroCount { field });
    }
    Ok(())
}

/// Validate an explicit raft leader API address override.
pub fn validate_leader_addr(addr: &str) -> Result<(), ValidationError> {
    if !(addr.starts_with("http://") || addr.starts_with("https://")) {
        return Err(ValidationError::LeaderAddrScheme { addr: addr.to_string() });
    }
    Ok(())
}
