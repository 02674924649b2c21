// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Gang scheduler for a hypervisor CPU pool.
//!
//! Every domain owns a fixed subset of the pool's hardware threads (pCPUs),
//! one per virtual CPU. The scheduler guarantees that, at any instant, either
//! all of a domain's vCPUs run simultaneously on their assigned pCPUs or none
//! does. Four time-multiplexing policies are supported (permanent,
//! time-triggered, event-triggered, and best-effort), and resource
//! redistribution is committed atomically across the whole pool by a
//! two-barrier adjustment protocol.

mod collections;

pub mod runtime;

pub mod scheduler;

#[macro_use]
extern crate log;

pub use crate::{
    runtime::fail::Fail,
    scheduler::{
        adjust::{
            AdjustCommand,
            AdjustRequest,
            DomainEntry,
        },
        dispatch::TaskSlice,
        domain::{
            DomainId,
            VcpuId,
        },
        mask::CpuMask,
        policy::Policy,
        pool::{
            GangPool,
            HostPlatform,
        },
    },
};

/// Ensures that two expressions are equal, bailing out of the calling test
/// with a diagnostic otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs != rhs {
            anyhow::bail!(
                "ensure_eq!({}, {}) failed: {:?} != {:?}",
                stringify!($lhs),
                stringify!($rhs),
                lhs,
                rhs
            );
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the calling
/// test with a diagnostic otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($lhs:expr, $rhs:expr) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs == rhs {
            anyhow::bail!(
                "ensure_neq!({}, {}) failed: both are {:?}",
                stringify!($lhs),
                stringify!($rhs),
                lhs
            );
        }
    }};
}
