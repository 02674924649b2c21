// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Boot-time parameters of the gang scheduler.
//!
//! Parameters arrive from the host's boot command line; here they are read
//! from environment variables of the same names. Out-of-range values are not
//! errors: they are corrected to sane defaults with a warning, so that a
//! mistyped boot line degrades instead of wedging the pool.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    types::{
        ms_to_ns,
        us_to_ns,
        TimeNs,
    },
};
use ::libc::EINVAL;
use ::std::env;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Reserved CPU utilization (in percent) for best-effort domains.
pub const SCHED_GANG_CPU_RSRV_4_BE_DOMS: &str = "SCHED_GANG_CPU_RSRV_4_BE_DOMS";

/// Basic activation period (in ns) for best-effort domains.
pub const SCHED_GANG_PERIOD_4_BE_DOMS: &str = "SCHED_GANG_PERIOD_4_BE_DOMS";

/// Upper bound (in ns) on the time a global adjustment may take.
pub const SCHED_GANG_ADJ_TIME_UPPER_BOUND: &str = "SCHED_GANG_ADJ_TIME_UPPER_BOUND";

/// Finest scheduling grain (in us); mirrors the host's rate-limit parameter.
pub const SCHED_RATELIMIT_US: &str = "SCHED_RATELIMIT_US";

/// Default finest scheduling grain in microseconds.
const DEFAULT_RATELIMIT_US: i64 = 1000;

/// Default CPU reservation for best-effort domains, in percent.
const DEFAULT_CPU_RESERV_4_BE_DOMS: u8 = 10;

/// Default and minimum-factor period for best-effort domains.
const DEFAULT_PERIOD_4_BE_DOMS: TimeNs = ms_to_ns(100);

/// Bounds and default for the global-adjustment time upper bound.
const MIN_ADJ_TIME_UPPER_BOUND: TimeNs = ms_to_ns(10);
const MAX_ADJ_TIME_UPPER_BOUND: TimeNs = ms_to_ns(500);
const DEFAULT_ADJ_TIME_UPPER_BOUND: TimeNs = ms_to_ns(100);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Validated scheduling parameters, fixed for the lifetime of a pool.
#[derive(Clone, Copy, Debug)]
pub struct SchedParams {
    /// Finest scheduling grain in nanoseconds. All slice boundaries are
    /// floored to multiples of this value.
    pub grain_ns: TimeNs,
    /// Reserved CPU utilization for best-effort domains, in percent.
    pub be_reserve_percent: u8,
    /// Activation period for best-effort domains, in nanoseconds.
    pub be_period_ns: TimeNs,
    /// Derived slice length for best-effort domains, in nanoseconds.
    pub be_quantum_ns: TimeNs,
    /// Upper bound on the duration of a global adjustment, in nanoseconds.
    pub adj_upper_bound_ns: TimeNs,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedParams {
    /// Builds scheduling parameters from raw boot values, correcting
    /// out-of-range ones.
    pub fn new(
        ratelimit_us: i64,
        be_reserve_percent: u8,
        be_period_ns: TimeNs,
        adj_upper_bound_ns: TimeNs,
    ) -> Result<Self, Fail> {
        let grain_ns: TimeNs = us_to_ns(ratelimit_us);
        if grain_ns <= 0 {
            return Err(Fail::new(EINVAL, "scheduling grain must be positive"));
        }

        let be_reserve_percent: u8 = if be_reserve_percent > 100 {
            warn!(
                "{} = {} outside of valid range [0, 100]; resetting to default {}",
                SCHED_GANG_CPU_RSRV_4_BE_DOMS, be_reserve_percent, DEFAULT_CPU_RESERV_4_BE_DOMS
            );
            DEFAULT_CPU_RESERV_4_BE_DOMS
        } else {
            be_reserve_percent
        };

        // Best-effort periods below one hundred grains produce quanta too
        // short to dispatch.
        let min_be_period: TimeNs = 100 * grain_ns;
        let be_period_ns: TimeNs = if be_period_ns < min_be_period {
            warn!(
                "{} = {} below minimum {}; resetting to the minimum",
                SCHED_GANG_PERIOD_4_BE_DOMS, be_period_ns, min_be_period
            );
            min_be_period
        } else {
            be_period_ns
        };

        let be_quantum_ns: TimeNs = (be_period_ns * be_reserve_percent as TimeNs) / 100;
        if be_quantum_ns < grain_ns {
            let cause: &str = "derived best-effort quantum is below the scheduling grain";
            error!("new(): {} (quantum={}, grain={})", cause, be_quantum_ns, grain_ns);
            return Err(Fail::new(EINVAL, cause));
        }

        let mut adj_upper_bound_ns: TimeNs = if adj_upper_bound_ns > MAX_ADJ_TIME_UPPER_BOUND {
            warn!(
                "{} = {} above maximum {}; clamping",
                SCHED_GANG_ADJ_TIME_UPPER_BOUND, adj_upper_bound_ns, MAX_ADJ_TIME_UPPER_BOUND
            );
            MAX_ADJ_TIME_UPPER_BOUND
        } else if adj_upper_bound_ns < MIN_ADJ_TIME_UPPER_BOUND {
            warn!(
                "{} = {} below minimum {}; resetting to default {}",
                SCHED_GANG_ADJ_TIME_UPPER_BOUND, adj_upper_bound_ns, MIN_ADJ_TIME_UPPER_BOUND, DEFAULT_ADJ_TIME_UPPER_BOUND
            );
            DEFAULT_ADJ_TIME_UPPER_BOUND
        } else {
            adj_upper_bound_ns
        };

        // Each barrier wait is granted half of the upper bound; an upper
        // bound whose half rounds below one millisecond cannot be waited on.
        if adj_upper_bound_ns / ms_to_ns(1) / 2 < 1 {
            warn!(
                "{} too small to derive a barrier timeout; forcing to 2 ms",
                SCHED_GANG_ADJ_TIME_UPPER_BOUND
            );
            adj_upper_bound_ns = ms_to_ns(2);
        }

        debug!(
            "new(): grain = {} ns, be period = {} ns, be quantum = {} ns, be reservation = {} %, adjustment bound = {} ns",
            grain_ns, be_period_ns, be_quantum_ns, be_reserve_percent, adj_upper_bound_ns
        );

        Ok(Self {
            grain_ns,
            be_reserve_percent,
            be_period_ns,
            be_quantum_ns,
            adj_upper_bound_ns,
        })
    }

    /// Builds scheduling parameters from the environment, falling back to
    /// defaults for unset or unparsable variables.
    pub fn from_env() -> Result<Self, Fail> {
        Self::new(
            env_or(SCHED_RATELIMIT_US, DEFAULT_RATELIMIT_US),
            env_or(SCHED_GANG_CPU_RSRV_4_BE_DOMS, DEFAULT_CPU_RESERV_4_BE_DOMS as i64).clamp(0, u8::MAX as i64) as u8,
            env_or(SCHED_GANG_PERIOD_4_BE_DOMS, DEFAULT_PERIOD_4_BE_DOMS),
            env_or(SCHED_GANG_ADJ_TIME_UPPER_BOUND, DEFAULT_ADJ_TIME_UPPER_BOUND),
        )
    }

    /// Milliseconds granted to each of the two coordinator waits.
    pub fn barrier_timeout_ms(&self) -> i64 {
        self.adj_upper_bound_ns / ms_to_ns(1) / 2
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reads an integer environment variable, falling back to a default.
fn env_or(name: &str, default: i64) -> i64 {
    match env::var(name) {
        Ok(value) => value.parse::<i64>().unwrap_or_else(|_| {
            warn!("env_or(): ignoring unparsable {} = {:?}", name, value);
            default
        }),
        Err(_) => default,
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SchedParams {
    fn default() -> Self {
        Self::new(
            DEFAULT_RATELIMIT_US,
            DEFAULT_CPU_RESERV_4_BE_DOMS,
            DEFAULT_PERIOD_4_BE_DOMS,
            DEFAULT_ADJ_TIME_UPPER_BOUND,
        )
        .expect("default scheduling parameters are valid")
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
