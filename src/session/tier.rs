// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Security tiers.
//!
//! A tier bundles idle/absolute timeouts, the MFA requirement, binding
//! strictness, and token-rotation behavior. Timeouts tighten as the tier
//! rises; crisis/emergency flows stay on `Basic` so auth friction can
//! never stand between a person in crisis and help.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Idle timeouts per tier, in minutes.
const BASIC_IDLE_MINUTES: i64 = 30;
const ELEVATED_IDLE_MINUTES: i64 = 15;
const MAXIMUM_IDLE_MINUTES: i64 = 10;

/// Absolute session lifetimes per tier, in hours.
const BASIC_ABSOLUTE_HOURS: i64 = 24;
const ELEVATED_ABSOLUTE_HOURS: i64 = 8;
const MAXIMUM_ABSOLUTE_HOURS: i64 = 4;

/// Named security posture for a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityTier {
    Basic,
    Elevated,
    Maximum,
}

impl SecurityTier {
    /// Inactivity window before a session is terminated.
    pub fn idle_timeout(&self) -> Duration {
        match self {
            SecurityTier::Basic => Duration::minutes(BASIC_IDLE_MINUTES),
            SecurityTier::Elevated => Duration::minutes(ELEVATED_IDLE_MINUTES),
            SecurityTier::Maximum => Duration::minutes(MAXIMUM_IDLE_MINUTES),
        }
    }

    /// Hard lifetime regardless of activity.
    pub fn absolute_timeout(&self) -> Duration {
        match self {
            SecurityTier::Basic => Duration::hours(BASIC_ABSOLUTE_HOURS),
            SecurityTier::Elevated => Duration::hours(ELEVATED_ABSOLUTE_HOURS),
            SecurityTier::Maximum => Duration::hours(MAXIMUM_ABSOLUTE_HOURS),
        }
    }

    /// Whether the session is invalid until multi-factor verification.
    pub fn requires_mfa(&self) -> bool {
        matches!(self, SecurityTier::Elevated | SecurityTier::Maximum)
    }

    /// Whether validation compares the request's origin address.
    pub fn binds_origin(&self) -> bool {
        matches!(self, SecurityTier::Maximum)
    }

    /// Whether validation compares the client signature.
    pub fn binds_client_signature(&self) -> bool {
        matches!(self, SecurityTier::Elevated | SecurityTier::Maximum)
    }

    /// Whether renewal rotates the token pair.
    pub fn rotates_tokens(&self) -> bool {
        matches!(self, SecurityTier::Elevated | SecurityTier::Maximum)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityTier::Basic => "basic",
            SecurityTier::Elevated => "elevated",
            SecurityTier::Maximum => "maximum",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_tighten_with_tier() {
        assert!(SecurityTier::Basic.idle_timeout() > SecurityTier::Elevated.idle_timeout());
        assert!(SecurityTier::Elevated.idle_timeout() > SecurityTier::Maximum.idle_timeout());
        assert!(
            SecurityTier::Basic.absolute_timeout() > SecurityTier::Maximum.absolute_timeout()
        );
    }

    #[test]
    fn idle_thresholds_match_policy() {
        assert_eq!(SecurityTier::Basic.idle_timeout(), Duration::minutes(30));
        assert_eq!(SecurityTier::Elevated.idle_timeout(), Duration::minutes(15));
        assert_eq!(SecurityTier::Maximum.idle_timeout(), Duration::minutes(10));
    }

    #[test]
    fn basic_never_requires_mfa() {
        assert!(!SecurityTier::Basic.requires_mfa());
        assert!(SecurityTier::Elevated.requires_mfa());
        assert!(SecurityTier::Maximum.requires_mfa());
    }

    #[test]
    fn only_maximum_binds_origin() {
        assert!(!SecurityTier::Basic.binds_origin());
        assert!(!SecurityTier::Elevated.binds_origin());
        assert!(SecurityTier::Maximum.binds_origin());
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(SecurityTier::Basic < SecurityTier::Elevated);
        assert!(SecurityTier::Elevated < SecurityTier::Maximum);
    }
}
