// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::types::{
        TimeNs,
        INFINITY,
    },
    scheduler::domain::{
        DomainId,
        VcpuId,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// A single vCPU of the domain is yielding its slice.
pub const FLAG_SINGLE_VCPU_YIELD: u32 = 1 << 0;

/// The vCPU has been put to sleep. Defined for parity with the wire ABI;
/// nothing sets it, as sleep handling flows through global adjustment.
pub const FLAG_IS_SLEEPING: u32 = 1 << 1;

/// The vCPU just woke up and came out of the waiting-for-event set.
pub const FLAG_WAS_WAITING_FOR_EVENT: u32 = 1 << 2;

/// The ticket's vCPU is blocked in the host. Space-filling substitution only
/// considers tickets with this flag.
pub const FLAG_VCPU_BLOCKED: u32 = 1 << 3;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Index of a ticket within its local scheduler's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TicketId(pub usize);

/// The collection currently holding a ticket. A ticket is in exactly one
/// location at any time; moving it without going through the owning
/// collection is a bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locus {
    /// In no collection; only legal transiently, between a removal and the
    /// following insertion.
    Detached,
    /// In the EDF runnable queue.
    RunnableQueue,
    /// In the activation queue.
    ActivationQueue,
    /// In the waiting-for-event set.
    WaitingSet,
    /// Referenced from the current-ticket slots of the local scheduler.
    Dispatched,
}

/// Scheduling ticket for a domain's virtual CPU: a queue node plus the
/// per-activation time bookkeeping.
#[derive(Debug)]
pub struct Ticket {
    /// The vCPU this ticket stands for. `None` when the domain belongs to
    /// this pCPU's cohort without owning the pCPU itself.
    pub vcpu: Option<VcpuId>,
    /// The domain the vCPU belongs to.
    pub domid: DomainId,
    /// Earliest start time of the next activation (absolute ns).
    pub earliest_start_time: TimeNs,
    /// Absolute deadline of the activation (ns).
    pub deadline: TimeNs,
    /// Remaining active time within the current activation (ns).
    pub remaining_time: TimeNs,
    /// When the domain was last dispatched (absolute ns); time spent active
    /// is charged against `remaining_time` from this reference point.
    pub activated_at: TimeNs,
    /// Status and transition flags.
    flags: u32,
    /// Ticket scheduled on behalf of this one after a single-vCPU yield.
    pub on_my_behalf: Option<TicketId>,
    /// The collection currently holding this ticket.
    pub locus: Locus,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Ticket {
    /// Creates a ticket with default time values: it never starts, never
    /// expires, and holds no budget until the first adjustment assigns one.
    pub fn new(vcpu: Option<VcpuId>, domid: DomainId) -> Self {
        Self {
            vcpu,
            domid,
            earliest_start_time: INFINITY,
            deadline: INFINITY,
            remaining_time: 0,
            activated_at: INFINITY,
            flags: 0,
            on_my_behalf: None,
            locus: Locus::Detached,
        }
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Locus,
        Ticket,
        FLAG_SINGLE_VCPU_YIELD,
        FLAG_VCPU_BLOCKED,
    };
    use crate::{
        runtime::types::INFINITY,
        scheduler::domain::DomainId,
    };
    use ::anyhow::Result;

    #[test]
    fn new_ticket_is_detached_with_default_times() -> Result<()> {
        let ticket: Ticket = Ticket::new(None, DomainId(7));
        crate::ensure_eq!(ticket.locus, Locus::Detached);
        crate::ensure_eq!(ticket.earliest_start_time, INFINITY);
        crate::ensure_eq!(ticket.deadline, INFINITY);
        crate::ensure_eq!(ticket.remaining_time, 0);
        crate::ensure_eq!(ticket.activated_at, INFINITY);
        Ok(())
    }

    #[test]
    fn flags_are_independent() -> Result<()> {
        let mut ticket: Ticket = Ticket::new(None, DomainId(7));
        ticket.set_flag(FLAG_SINGLE_VCPU_YIELD);
        ticket.set_flag(FLAG_VCPU_BLOCKED);
        ticket.clear_flag(FLAG_SINGLE_VCPU_YIELD);
        crate::ensure_eq!(ticket.has_flag(FLAG_SINGLE_VCPU_YIELD), false);
        crate::ensure_eq!(ticket.has_flag(FLAG_VCPU_BLOCKED), true);
        Ok(())
    }
}
