// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Time-multiplexing policies.
//!
//! A policy has precedence over the policies below it in the declaration
//! order: a permanent domain must never be disturbed by a time-triggered one,
//! a time-triggered domain never by an event-triggered one, and so on. The
//! scheduler enforces this together with admission control; the policies
//! themselves carry no fixed priorities.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    types::{
        TimeNs,
        INFINITY,
    },
};
use ::libc::EINVAL;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Specification of the time-multiplexing policy for a domain.
///
/// Represented as a closed sum so that the time-update paths of the
/// dispatcher can pattern-match instead of going through dynamic dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// No policy assigned yet. Domains carry this between creation and their
    /// first successful adjustment; it never passes validation.
    NotSet,
    /// The domain holds its hardware threads permanently and is not subject
    /// to time multiplexing.
    Permanent {
        /// Start time (in ns) for the domain.
        from_ns: TimeNs,
    },
    /// The domain is activated periodically, in a time-triggered manner.
    TimeTriggered {
        /// Start time (in ns) for the series of activations.
        from_ns: TimeNs,
        /// Activation period (in ns).
        period_ns: TimeNs,
        /// Active time (in ns) within each period.
        active_ns: TimeNs,
        /// Whether the domain may consume slices yielded by other domains.
        space_filling: bool,
    },
    /// The domain is activated by the arrival of designated events, with the
    /// same bandwidth bounds as a time-triggered domain.
    EventTriggered {
        from_ns: TimeNs,
        period_ns: TimeNs,
        active_ns: TimeNs,
        space_filling: bool,
    },
    /// The domain shares the pool-wide best-effort reservation with the
    /// other best-effort domains of its cohort.
    BestEffort {
        from_ns: TimeNs,
        /// Relative weight among best-effort domains. Presently advisory.
        weight: u16,
        space_filling: bool,
    },
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Policy {
    /// Validates the policy parameters against the scheduling grain.
    pub fn validate(&self, grain_ns: TimeNs) -> Result<(), Fail> {
        match *self {
            Policy::NotSet => Err(Fail::new(EINVAL, "time-multiplexing policy not set")),
            Policy::Permanent { .. } => Ok(()),
            Policy::TimeTriggered {
                period_ns, active_ns, ..
            }
            | Policy::EventTriggered {
                period_ns, active_ns, ..
            } => Self::validate_bandwidth(period_ns, active_ns, grain_ns),
            Policy::BestEffort { weight, .. } => {
                if weight == 0 {
                    return Err(Fail::new(EINVAL, "best-effort weight must be positive"));
                }
                Ok(())
            },
        }
    }

    /// Checks the period/active-time bounds shared by the time-triggered and
    /// event-triggered policies.
    fn validate_bandwidth(period_ns: TimeNs, active_ns: TimeNs, grain_ns: TimeNs) -> Result<(), Fail> {
        if active_ns < grain_ns {
            return Err(Fail::new(EINVAL, "active time below the scheduling grain"));
        }
        if period_ns >= INFINITY || active_ns >= INFINITY {
            return Err(Fail::new(EINVAL, "multiplexing parameters must be finite"));
        }
        if active_ns >= period_ns {
            return Err(Fail::new(EINVAL, "active time must be smaller than the period"));
        }
        Ok(())
    }

    /// Whether the domain may consume slices yielded by other domains.
    pub fn space_filling(&self) -> bool {
        match *self {
            Policy::NotSet | Policy::Permanent { .. } => false,
            Policy::TimeTriggered { space_filling, .. }
            | Policy::EventTriggered { space_filling, .. }
            | Policy::BestEffort { space_filling, .. } => space_filling,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Policy::Permanent { .. })
    }

    /// Short name for log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Policy::NotSet => "not-set",
            Policy::Permanent { .. } => "permanent",
            Policy::TimeTriggered { .. } => "time-triggered",
            Policy::EventTriggered { .. } => "event-triggered",
            Policy::BestEffort { .. } => "best-effort",
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Policy;
    use crate::runtime::types::{
        ms_to_ns,
        TimeNs,
        INFINITY,
    };
    use ::anyhow::Result;

    const GRAIN: TimeNs = 1_000_000;

    #[test]
    fn not_set_is_rejected() -> Result<()> {
        crate::ensure_eq!(Policy::NotSet.validate(GRAIN).is_err(), true);
        Ok(())
    }

    #[test]
    fn permanent_is_always_permitted() -> Result<()> {
        crate::ensure_eq!(Policy::Permanent { from_ns: 0 }.validate(GRAIN).is_ok(), true);
        Ok(())
    }

    #[test]
    fn bandwidth_bounds_are_enforced() -> Result<()> {
        let good: Policy = Policy::TimeTriggered {
            from_ns: 0,
            period_ns: ms_to_ns(100),
            active_ns: ms_to_ns(50),
            space_filling: false,
        };
        crate::ensure_eq!(good.validate(GRAIN).is_ok(), true);

        // Active time of exactly one grain is the lower boundary.
        let boundary: Policy = Policy::EventTriggered {
            from_ns: 0,
            period_ns: ms_to_ns(100),
            active_ns: GRAIN,
            space_filling: false,
        };
        crate::ensure_eq!(boundary.validate(GRAIN).is_ok(), true);

        let sub_grain: Policy = Policy::TimeTriggered {
            from_ns: 0,
            period_ns: ms_to_ns(100),
            active_ns: GRAIN - 1,
            space_filling: false,
        };
        crate::ensure_eq!(sub_grain.validate(GRAIN).is_err(), true);

        let saturated: Policy = Policy::TimeTriggered {
            from_ns: 0,
            period_ns: ms_to_ns(100),
            active_ns: ms_to_ns(100),
            space_filling: false,
        };
        crate::ensure_eq!(saturated.validate(GRAIN).is_err(), true);

        let unbounded: Policy = Policy::EventTriggered {
            from_ns: 0,
            period_ns: INFINITY,
            active_ns: ms_to_ns(1),
            space_filling: false,
        };
        crate::ensure_eq!(unbounded.validate(GRAIN).is_err(), true);
        Ok(())
    }

    #[test]
    fn best_effort_requires_positive_weight() -> Result<()> {
        let zero: Policy = Policy::BestEffort {
            from_ns: 0,
            weight: 0,
            space_filling: true,
        };
        crate::ensure_eq!(zero.validate(GRAIN).is_err(), true);
        let one: Policy = Policy::BestEffort {
            from_ns: 0,
            weight: 1,
            space_filling: true,
        };
        crate::ensure_eq!(one.validate(GRAIN).is_ok(), true);
        Ok(())
    }
}
