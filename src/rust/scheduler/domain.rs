// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::types::TimeNs,
    scheduler::{
        mask::CpuMask,
        policy::Policy,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Domain identifier. Positive; the control domain (id 0) is never managed
/// by this scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub i32);

/// Virtual CPU identifier: a domain and the vCPU's index within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId {
    pub domid: DomainId,
    pub index: u16,
}

/// Per-domain scheduling record: the hardware threads pre-allocated to the
/// domain and its time-multiplexing specification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainRecord {
    pub domid: DomainId,
    /// Hardware threads assigned to this domain, one per vCPU.
    pub cpumask: CpuMask,
    /// Number of vCPUs; equals the mask weight after placement.
    pub num_vcpus: u16,
    /// Time-multiplexing specification.
    pub policy: Policy,
    /// Cohort this domain is a member of, once placed.
    pub cohort: Option<usize>,
}

/// Coarse execution state of a vCPU, as tracked for runstate accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Runstate {
    Running = 0,
    Runnable = 1,
    Blocked = 2,
    Offline = 3,
}

/// Host-side bookkeeping for one vCPU.
#[derive(Clone, Debug)]
pub struct VcpuState {
    /// Whether the vCPU is blocked waiting for an event.
    pub blocked: bool,
    pub runstate: Runstate,
    /// When the current runstate was entered.
    pub state_entry_time: TimeNs,
    /// Cumulative time spent in each runstate.
    pub time_in_state: [TimeNs; 4],
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl DomainId {
    /// Key range covering every vCPU of this domain in an ordered map.
    pub fn vcpu_range(&self) -> std::ops::RangeInclusive<VcpuId> {
        let first: VcpuId = VcpuId { domid: *self, index: 0 };
        let last: VcpuId = VcpuId {
            domid: *self,
            index: u16::MAX,
        };
        first..=last
    }
}

impl DomainRecord {
    /// Creates the record for a freshly initialized domain. The domain takes
    /// part in scheduling only after an adjustment assigns it a mask and a
    /// policy.
    pub fn new(domid: DomainId, num_vcpus: u16) -> Self {
        Self {
            domid,
            cpumask: CpuMask::empty(),
            num_vcpus,
            policy: Policy::NotSet,
            cohort: None,
        }
    }

    /// The vCPU pinned to the given hardware thread, if the thread belongs to
    /// this domain. vCPUs are pinned to the mask's threads in ascending
    /// order: vCPU 0 to the lowest thread, and so on.
    pub fn vcpu_on(&self, cpu: usize) -> Option<VcpuId> {
        let index: usize = self.cpumask.iter().position(|c| c == cpu)?;
        Some(VcpuId {
            domid: self.domid,
            index: index as u16,
        })
    }
}

impl VcpuState {
    pub fn new(now: TimeNs) -> Self {
        Self {
            blocked: false,
            runstate: Runstate::Offline,
            state_entry_time: now,
            time_in_state: [0; 4],
        }
    }

    /// Moves the vCPU to a new runstate, charging the elapsed time to the
    /// state being left.
    pub fn set_runstate(&mut self, runstate: Runstate, now: TimeNs) {
        let delta: TimeNs = now - self.state_entry_time;
        if delta > 0 {
            self.time_in_state[self.runstate as usize] += delta;
            self.state_entry_time = now;
        }
        self.runstate = runstate;
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
