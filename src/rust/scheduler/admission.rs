// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Schedulability test for a proposed resource assignment.
//!
//! For every hardware thread, the utilizations of the domains assigned to it
//! must sum to at most one: a permanent domain consumes the whole thread,
//! periodic domains consume their bandwidth fraction, and the best-effort
//! domains collectively consume the pool-wide reservation. A demand-bound
//! formulation would be tighter for offset-heavy task sets, but the simple
//! utilization bound matches what the dispatcher actually guarantees.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        limits::MAX_PCPUS,
        params::SchedParams,
    },
    scheduler::{
        domain::{
            DomainId,
            DomainRecord,
        },
        mask::CpuMask,
        policy::Policy,
    },
};
use ::libc::EINVAL;
use ::std::fmt::Write;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Decides whether the given domain records are schedulable on the pool.
/// Returns `EINVAL` with a report naming the overloaded hardware threads and
/// the domains on them otherwise.
pub(crate) fn check(domains: &[DomainRecord], params: &SchedParams, pool_mask: &CpuMask) -> Result<(), Fail> {
    if params.be_reserve_percent == 100 {
        // The whole pool is reserved for best-effort work; any assignment of
        // best-effort domains fits by definition.
        return Ok(());
    }
    if params.be_reserve_percent > 50 {
        warn!(
            "check(): cpu reservation for best-effort domains is {} %; it seems too high",
            params.be_reserve_percent
        );
    }

    let be_util: f64 = params.be_reserve_percent as f64 / 100.0;

    let mut total_util: Vec<f64> = vec![0.0; MAX_PCPUS];
    let mut be_considered: Vec<bool> = vec![false; MAX_PCPUS];
    let mut permanent_on_cpu: Vec<bool> = vec![false; MAX_PCPUS];
    let mut domains_on_cpu: Vec<Vec<DomainId>> = vec![Vec::new(); MAX_PCPUS];

    for record in domains.iter() {
        let utilization: f64 = match record.policy {
            Policy::NotSet => continue,
            Policy::Permanent { .. } => 1.0,
            Policy::TimeTriggered {
                period_ns, active_ns, ..
            }
            | Policy::EventTriggered {
                period_ns, active_ns, ..
            } => active_ns as f64 / period_ns as f64,
            Policy::BestEffort { .. } => be_util,
        };
        debug_assert!(utilization > 0.0 && utilization <= 1.0);

        for cpu in record.cpumask.iter() {
            domains_on_cpu[cpu].push(record.domid);
            match record.policy {
                Policy::Permanent { .. } => {
                    permanent_on_cpu[cpu] = true;
                    total_util[cpu] += utilization;
                },
                Policy::BestEffort { .. } => {
                    // The reservation is shared: charge it once per thread no
                    // matter how many best-effort domains land there.
                    if !be_considered[cpu] {
                        be_considered[cpu] = true;
                        total_util[cpu] += utilization;
                    }
                },
                _ => total_util[cpu] += utilization,
            }
        }
    }

    let mut report: String = String::new();
    for cpu in pool_mask.iter() {
        if permanent_on_cpu[cpu] && domains_on_cpu[cpu].len() > 1 {
            let _ = writeln!(
                report,
                "    cpu {} hosts a permanent domain next to others: {:?}",
                cpu, domains_on_cpu[cpu]
            );
        } else if total_util[cpu] > 1.0 {
            let _ = writeln!(
                report,
                "    test failed on cpu {} (utilization {:.3}) with domains: {:?}",
                cpu, total_util[cpu], domains_on_cpu[cpu]
            );
        }
    }

    if report.is_empty() {
        debug!("check(): schedulability test passed");
        Ok(())
    } else {
        warn!("check(): schedulability test failed\n{}", report);
        Err(Fail::new(EINVAL, &format!("assignment is not schedulable:\n{}", report)))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
