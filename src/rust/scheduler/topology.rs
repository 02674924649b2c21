// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Hardware-thread cohorts.
//!
//! A domain cohort is a group of domains in which a domain overlaps with at
//! least one other domain on one or more hardware threads; a hardware-thread
//! cohort comprises the threads allocated to such a group. Local schedulers
//! residing on the threads of a cohort must maintain an identical view of
//! that portion of the system, which is exactly what makes gang dispatch
//! possible without cross-thread communication.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::limits::MAX_PCPUS,
    scheduler::{
        domain::{
            DomainId,
            DomainRecord,
        },
        mask::CpuMask,
        policy::Policy,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The derived partition of the pool into cohorts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    /// Hardware threads of each cohort. Cohorts never overlap.
    pub cohort_masks: Vec<CpuMask>,
    /// Cohort membership of each hardware thread.
    pub cpu_to_cohort: Vec<Option<usize>>,
    /// Number of best-effort domains in each cohort.
    pub be_doms_in_cohort: Vec<u32>,
}

/// An immutable snapshot of the pool: placed domain records plus the derived
/// topology. Published as a whole by the adjustment protocol and cached by
/// every local scheduler, so dispatch never takes a lock to read it.
#[derive(Debug)]
pub struct PoolState {
    /// Domain records in ascending domain-id order.
    pub domains: Vec<DomainRecord>,
    pub topology: Topology,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Topology {
    /// A topology with no cohorts; every thread idles.
    pub fn empty() -> Self {
        Self {
            cohort_masks: Vec::new(),
            cpu_to_cohort: vec![None; MAX_PCPUS],
            be_doms_in_cohort: Vec::new(),
        }
    }

    pub fn num_cohorts(&self) -> usize {
        self.cohort_masks.len()
    }

    pub fn cohort_of(&self, cpu: usize) -> Option<usize> {
        *self.cpu_to_cohort.get(cpu)?
    }
}

impl PoolState {
    pub fn empty() -> Self {
        Self {
            domains: Vec::new(),
            topology: Topology::empty(),
        }
    }

    /// Looks up a domain record by id.
    pub fn domain(&self, domid: DomainId) -> Option<&DomainRecord> {
        let index: usize = self.domains.binary_search_by_key(&domid, |d| d.domid).ok()?;
        Some(&self.domains[index])
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Establishes the cohorts for the given domain records and stamps each
/// record with the cohort it belongs to.
///
/// Records must be sorted by ascending domain id; construction order is part
/// of the derived state, so it has to be deterministic. Domains that have not
/// been assigned resources yet (empty mask) are left out of the partition.
pub fn build(domains: &mut [DomainRecord]) -> Topology {
    debug_assert!(domains.windows(2).all(|w| w[0].domid < w[1].domid));

    let mut cohort_masks: Vec<CpuMask> = Vec::new();

    for record in domains.iter() {
        if record.cpumask.is_empty() {
            continue;
        }
        match cohort_masks.iter_mut().find(|cohort| cohort.intersects(&record.cpumask)) {
            Some(cohort) => cohort.union_with(&record.cpumask),
            None => cohort_masks.push(record.cpumask),
        }
    }

    // Expanding a cohort above may have made it overlap one of its
    // neighbours; merge until the masks are pairwise disjoint.
    let mut i: usize = 0;
    'merge: while i < cohort_masks.len() {
        for j in (i + 1)..cohort_masks.len() {
            if cohort_masks[i].intersects(&cohort_masks[j]) {
                let absorbed: CpuMask = cohort_masks.remove(j);
                cohort_masks[i].union_with(&absorbed);
                i = 0;
                continue 'merge;
            }
        }
        i += 1;
    }

    let mut cpu_to_cohort: Vec<Option<usize>> = vec![None; MAX_PCPUS];
    for (cohort, mask) in cohort_masks.iter().enumerate() {
        for cpu in mask.iter() {
            cpu_to_cohort[cpu] = Some(cohort);
        }
    }

    for record in domains.iter_mut() {
        if record.cpumask.is_empty() {
            record.cohort = None;
            continue;
        }
        match cohort_masks.iter().position(|cohort| record.cpumask.is_subset_of(cohort)) {
            Some(cohort) => record.cohort = Some(cohort),
            None => panic!("domain {} is contained in no cohort", record.domid),
        }
    }

    let mut be_doms_in_cohort: Vec<u32> = vec![0; cohort_masks.len()];
    for record in domains.iter() {
        if let (Policy::BestEffort { .. }, Some(cohort)) = (&record.policy, record.cohort) {
            be_doms_in_cohort[cohort] += 1;
        }
    }

    let topology: Topology = Topology {
        cohort_masks,
        cpu_to_cohort,
        be_doms_in_cohort,
    };

    debug!("build(): {} cohorts", topology.num_cohorts());
    for (cohort, mask) in topology.cohort_masks.iter().enumerate() {
        debug!(
            "build(): cohort {}: {:?}, best-effort domains = {}",
            cohort, mask, topology.be_doms_in_cohort[cohort]
        );
    }
    for record in domains.iter() {
        trace!(
            "build(): domain {}: {:?}, policy = {}, cohort = {:?}",
            record.domid,
            record.cpumask,
            record.policy.name(),
            record.cohort
        );
    }

    topology
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
