// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The per-pCPU local scheduler.
//!
//! Each hardware thread owns one `LocalScheduler`: an EDF runnable queue, an
//! activation queue, the waiting-for-event set, and a cohort-wide view of the
//! currently dispatched tickets. Hardware threads of the same cohort feed
//! their schedulers identical inputs, so the views never diverge and the
//! gang property holds without any cross-thread communication on the
//! dispatch path.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::arena::FixedArena,
    runtime::{
        fail::Fail,
        limits::{
            MAX_DOMAINS,
            MAX_PCPUS,
        },
        params::SchedParams,
        types::{
            floor_to_grain,
            us_to_ns,
            TimeNs,
            INFINITY,
        },
    },
    scheduler::{
        domain::{
            DomainId,
            VcpuId,
        },
        mask::CpuMask,
        policy::Policy,
        queue::{
            QueueOrder,
            TicketQueue,
        },
        ticket::{
            Locus,
            Ticket,
            TicketId,
            FLAG_SINGLE_VCPU_YIELD,
            FLAG_VCPU_BLOCKED,
            FLAG_WAS_WAITING_FOR_EVENT,
        },
        topology::PoolState,
    },
};
use ::libc::{
    EEXIST,
    ENOMEM,
};
use ::std::{
    collections::HashMap,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Margin below which the remaining time of an activation is considered
/// effectively exhausted.
pub const MARGIN: TimeNs = us_to_ns(10);

/// The most negative difference tolerated between the current time and a
/// ticket's dispatch time. Remaining time may dip slightly below zero, but a
/// difference below this bound means the clock went backwards.
pub const MIN_NEGATIVE_DIFF: TimeNs = -us_to_ns(10);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduling state of one hardware thread.
pub struct LocalScheduler {
    /// The hardware thread this scheduler runs on.
    pub(crate) cpu: usize,
    pub(crate) params: SchedParams,
    /// Cached pool snapshot; replaced wholesale during global adjustment.
    pub(crate) state: Arc<PoolState>,
    /// Storage for all tickets known to this scheduler.
    pub(crate) arena: FixedArena<Ticket>,
    /// Runnable tickets, ordered by absolute deadline.
    pub(crate) runnable: TicketQueue,
    /// Not-yet-runnable tickets, ordered by earliest start time.
    pub(crate) activation: TicketQueue,
    /// Tickets of event-triggered domains awaiting their trigger.
    pub(crate) waiting: HashMap<DomainId, TicketId>,
    /// The currently dispatched ticket of every hardware thread in this
    /// scheduler's cohort. Slots outside the cohort stay empty.
    pub(crate) current: Vec<Option<TicketId>>,
    /// Ticket whose vCPU was handed to the host by the previous dispatch.
    pub(crate) prev_running: Option<TicketId>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LocalScheduler {
    pub fn new(cpu: usize, params: SchedParams) -> Self {
        Self {
            cpu,
            params,
            state: Arc::new(PoolState::empty()),
            arena: FixedArena::new(MAX_DOMAINS),
            runnable: TicketQueue::new(QueueOrder::Deadline),
            activation: TicketQueue::new(QueueOrder::EarliestStart),
            waiting: HashMap::new(),
            current: vec![None; MAX_PCPUS],
            prev_running: None,
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn params(&self) -> &SchedParams {
        &self.params
    }

    /// The domain currently dispatched on the given hardware thread,
    /// according to this scheduler's view of its cohort.
    pub fn current_domain(&self, cpu: usize) -> Option<DomainId> {
        let tid: TicketId = (*self.current.get(cpu)?)?;
        Some(self.arena.get(tid.0)?.domid)
    }

    /// Registers a vCPU with this scheduler. The fresh ticket parks in the
    /// waiting-for-event set until an adjustment assigns the domain a
    /// schedule.
    pub fn insert_vcpu(&mut self, vcpu: VcpuId) -> Result<(), Fail> {
        if self.waiting.contains_key(&vcpu.domid)
            || self.runnable.search_domain(vcpu.domid).is_some()
            || self.activation.search_domain(vcpu.domid).is_some()
        {
            return Err(Fail::new(EEXIST, "domain already has a ticket on this cpu"));
        }
        let ticket: Ticket = Ticket::new(Some(vcpu), vcpu.domid);
        let index: usize = match self.arena.insert(ticket) {
            Some(index) => index,
            None => return Err(Fail::new(ENOMEM, "ticket arena exhausted")),
        };
        let tid: TicketId = TicketId(index);
        self.arena.get_mut(index).expect("just allocated").locus = Locus::WaitingSet;
        self.waiting.insert(vcpu.domid, tid);
        trace!("insert_vcpu(): cpu={}, domain={}, ticket={:?}", self.cpu, vcpu.domid, tid);
        Ok(())
    }

    /// Unregisters a domain's vCPU, excising its ticket from whichever
    /// collection holds it. A ticket in no collection is a bug.
    pub fn remove_vcpu(&mut self, domid: DomainId) {
        let tid: TicketId = if let Some(tid) = self.waiting.remove(&domid) {
            self.arena.get_mut(tid.0).expect("waiting ticket is live").locus = Locus::Detached;
            tid
        } else if let Some(tid) = self.runnable.search_domain(domid) {
            self.runnable.remove(&mut self.arena, tid);
            tid
        } else if let Some(tid) = self.activation.search_domain(domid) {
            self.activation.remove(&mut self.arena, tid);
            tid
        } else {
            panic!("ticket of domain {} found in no collection on cpu {}", domid, self.cpu);
        };
        self.arena.remove(tid.0).expect("removed ticket is live");
        trace!("remove_vcpu(): cpu={}, domain={}, ticket={:?}", self.cpu, domid, tid);
    }

    /// Finds the ticket of a domain in any location, including dispatched.
    fn find_ticket(&self, domid: DomainId) -> Option<TicketId> {
        self.arena
            .iter()
            .find(|(_, ticket)| ticket.domid == domid)
            .map(|(index, _)| TicketId(index))
    }

    /// Notes that a single vCPU of the given domain is yielding its slice.
    pub fn yield_vcpu(&mut self, domid: DomainId) {
        match self.find_ticket(domid) {
            Some(tid) => {
                self.arena
                    .get_mut(tid.0)
                    .expect("found ticket is live")
                    .set_flag(FLAG_SINGLE_VCPU_YIELD);
            },
            None => warn!("yield_vcpu(): cpu={}, no ticket for domain {}", self.cpu, domid),
        }
    }

    /// Mirrors the host's blocked bit of a domain's vCPU into its ticket.
    pub fn set_vcpu_blocked(&mut self, domid: DomainId, blocked: bool) {
        match self.find_ticket(domid) {
            Some(tid) => {
                let ticket: &mut Ticket = self.arena.get_mut(tid.0).expect("found ticket is live");
                if blocked {
                    ticket.set_flag(FLAG_VCPU_BLOCKED);
                } else {
                    ticket.clear_flag(FLAG_VCPU_BLOCKED);
                }
            },
            None => warn!("set_vcpu_blocked(): cpu={}, no ticket for domain {}", self.cpu, domid),
        }
    }

    /// Charges elapsed time to every currently dispatched ticket, parks them
    /// in the activation queue, then moves tickets whose start time has
    /// arrived into the runnable queue. Returns the earliest start time of
    /// the remaining activation-queue head.
    pub fn advance(&mut self, now: TimeNs) -> TimeNs {
        let state: Arc<PoolState> = self.state.clone();

        // Every hardware thread of the domain's mask points at the same
        // ticket; charge it once.
        let mut checked: CpuMask = CpuMask::empty();
        for cpu in 0..MAX_PCPUS {
            if checked.test(cpu) {
                continue;
            }
            if let Some(tid) = self.current[cpu] {
                let domid: DomainId = self.arena.get(tid.0).expect("dispatched ticket is live").domid;
                let record = state.domain(domid).expect("dispatched domain is in the pool state");
                checked.union_with(&record.cpumask);
                self.update_times_in_ticket(tid, &record.policy, record.cohort, now);
                self.arena.get_mut(tid.0).expect("dispatched ticket is live").on_my_behalf = None;
            }
        }
        self.current.fill(None);

        // Promote every ticket whose activation time has passed.
        while let Some(tid) = self.activation.peek_min() {
            let ticket: &Ticket = self.arena.get(tid.0).expect("queued ticket is live");
            if ticket.earliest_start_time > now {
                break;
            }
            self.activation.remove(&mut self.arena, tid);
            let ticket: &mut Ticket = self.arena.get_mut(tid.0).expect("queued ticket is live");
            if ticket.has_flag(FLAG_WAS_WAITING_FOR_EVENT) {
                // The vCPU just woke up and came out of the waiting set.
                ticket.clear_flag(FLAG_WAS_WAITING_FOR_EVENT);
            }
            self.runnable.insert(&mut self.arena, tid);
        }

        match self.activation.peek_min() {
            Some(tid) => {
                self.arena
                    .get(tid.0)
                    .expect("queued ticket is live")
                    .earliest_start_time
            },
            None => INFINITY,
        }
    }

    /// Updates the time bookkeeping of a ticket that just finished being
    /// dispatched and parks it in the activation queue.
    fn update_times_in_ticket(&mut self, tid: TicketId, policy: &Policy, cohort: Option<usize>, now: TimeNs) {
        let grain: TimeNs = self.params.grain_ns;
        let be_period: TimeNs = self.params.be_period_ns;
        let be_quantum: TimeNs = self.params.be_quantum_ns;
        let be_doms: TimeNs = match cohort {
            Some(k) => self.state.topology.be_doms_in_cohort.get(k).copied().unwrap_or(0) as TimeNs,
            None => 0,
        };

        let ticket: &mut Ticket = self.arena.get_mut(tid.0).expect("dispatched ticket is live");
        assert!(ticket.locus == Locus::Dispatched);
        ticket.locus = Locus::Detached;

        if let Policy::Permanent { .. } = policy {
            // A permanent domain's ticket carries no budget to replenish.
            self.activation.insert(&mut self.arena, tid);
            return;
        }

        let mut diff: TimeNs = now - ticket.activated_at;
        if diff < MIN_NEGATIVE_DIFF {
            panic!(
                "domain {}: now ({} ns) precedes dispatch time ({} ns) by more than {} ns",
                ticket.domid, now, ticket.activated_at, -MIN_NEGATIVE_DIFF
            );
        }
        if diff < 0 {
            diff = 0;
        }
        ticket.remaining_time -= diff;

        if ticket.remaining_time < MARGIN {
            match *policy {
                Policy::TimeTriggered {
                    period_ns, active_ns, ..
                } => {
                    ticket.earliest_start_time += period_ns;
                    ticket.deadline += period_ns;
                    ticket.remaining_time = active_ns;
                },
                Policy::EventTriggered {
                    period_ns, active_ns, ..
                } => {
                    ticket.earliest_start_time = floor_to_grain(now, grain);
                    ticket.deadline += period_ns;
                    ticket.remaining_time = active_ns;
                },
                Policy::BestEffort { .. } => {
                    ticket.earliest_start_time = floor_to_grain(now, grain);
                    ticket.deadline += be_doms * be_period;
                    ticket.remaining_time = be_quantum;
                },
                Policy::Permanent { .. } | Policy::NotSet => {
                    panic!("domain {} dispatched with policy {}", ticket.domid, policy.name())
                },
            }
        }

        self.activation.insert(&mut self.arena, tid);
    }

    /// Discards all tickets and empties every collection.
    pub(crate) fn reset(&mut self) {
        self.runnable.clear();
        self.activation.clear();
        self.waiting.clear();
        self.arena.clear();
        self.current.fill(None);
        self.prev_running = None;
    }

    /// Rebuilds this scheduler from a freshly published pool snapshot.
    ///
    /// All prior tickets are discarded and new ones are created for every
    /// domain of this thread's cohort, with activation times referenced to
    /// the expected end of the global adjustment. Simple, at the cost of
    /// losing the time-usage bookkeeping accumulated so far.
    pub(crate) fn rebuild(&mut self, state: &Arc<PoolState>, now: TimeNs) {
        let grain: TimeNs = self.params.grain_ns;

        // The expected time at which the global adjustment will be done and
        // scheduling activities will resume.
        let will_resume_at: TimeNs = ((now + self.params.adj_upper_bound_ns) / grain + 1) * grain;

        self.reset();
        self.state = state.clone();

        let my_cohort: Option<usize> = match state.topology.cohort_of(self.cpu) {
            Some(cohort) => Some(cohort),
            None => {
                trace!("rebuild(): cpu={} belongs to no cohort", self.cpu);
                return;
            },
        };

        let mut be_counter: TimeNs = 0;
        let mut permanent_dom: Option<DomainId> = None;
        let mut muxed_dom: Option<DomainId> = None;

        for record in state.domains.iter() {
            if record.cohort != my_cohort {
                // The domain is not in this cohort, so the local scheduler
                // does not need to know about it.
                continue;
            }

            if record.policy.is_permanent() {
                permanent_dom = Some(record.domid);
            } else {
                muxed_dom = Some(record.domid);
            }
            if let (Some(permanent), Some(muxed)) = (permanent_dom, muxed_dom) {
                panic!(
                    "permanent domain {} shares cohort {:?} with domain {}",
                    permanent, my_cohort, muxed
                );
            }

            let vcpu: Option<VcpuId> = record.vcpu_on(self.cpu);
            debug_assert_eq!(record.cpumask.test(self.cpu), vcpu.is_some());

            let mut ticket: Ticket = Ticket::new(vcpu, record.domid);
            match record.policy {
                Policy::Permanent { from_ns } => {
                    ticket.remaining_time = INFINITY;
                    ticket.earliest_start_time = from_ns.max(will_resume_at);
                    ticket.deadline = INFINITY;
                },
                Policy::TimeTriggered {
                    from_ns,
                    period_ns,
                    active_ns,
                    ..
                }
                | Policy::EventTriggered {
                    from_ns,
                    period_ns,
                    active_ns,
                    ..
                } => {
                    ticket.remaining_time = active_ns;
                    ticket.earliest_start_time = align_activation(will_resume_at, from_ns, period_ns);
                    ticket.deadline = ticket.earliest_start_time + period_ns;
                },
                Policy::BestEffort { from_ns, .. } => {
                    // Every thread of the cohort walks the same record array,
                    // so the k-th best-effort domain gets the same staggered
                    // deadline everywhere.
                    ticket.remaining_time = self.params.be_quantum_ns;
                    ticket.earliest_start_time =
                        align_activation(will_resume_at, from_ns, self.params.be_period_ns);
                    be_counter += 1;
                    ticket.deadline = ticket.earliest_start_time + be_counter * self.params.be_period_ns;
                },
                Policy::NotSet => panic!("domain {} placed in a cohort without a policy", record.domid),
            }

            let tid: TicketId = TicketId(self.arena.insert(ticket).expect("arena sized for all domains"));
            trace!(
                "rebuild(): cpu={}, domain={}, policy={}, est={}, deadline={}",
                self.cpu,
                record.domid,
                record.policy.name(),
                self.arena.get(tid.0).expect("just allocated").earliest_start_time,
                self.arena.get(tid.0).expect("just allocated").deadline
            );
            self.activation.insert(&mut self.arena, tid);
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the first activation boundary at or after `start`: the smallest
/// value `v >= start` with `v = from + k * period` for an integral `k >= 0`.
pub(crate) fn align_activation(start: TimeNs, from: TimeNs, period: TimeNs) -> TimeNs {
    if from < start {
        let diff: TimeNs = start - from;
        let k: TimeNs = if diff % period != 0 { diff / period + 1 } else { diff / period };
        from + k * period
    } else {
        from
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        align_activation,
        LocalScheduler,
        MARGIN,
    };
    use crate::{
        runtime::{
            params::SchedParams,
            types::{
                ms_to_ns,
                TimeNs,
                INFINITY,
            },
        },
        scheduler::{
            domain::{
                DomainId,
                DomainRecord,
                VcpuId,
            },
            mask::CpuMask,
            policy::Policy,
            ticket::Locus,
            topology::{
                self,
                PoolState,
            },
        },
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    fn vcpu(domid: i32, index: u16) -> VcpuId {
        VcpuId {
            domid: DomainId(domid),
            index,
        }
    }

    pub(crate) fn make_state(specs: Vec<(i32, Vec<usize>, Policy)>) -> Arc<PoolState> {
        let mut domains: Vec<DomainRecord> = specs
            .into_iter()
            .map(|(domid, cpus, policy)| {
                let cpumask: CpuMask = cpus.into_iter().collect();
                DomainRecord {
                    domid: DomainId(domid),
                    num_vcpus: cpumask.weight() as u16,
                    cpumask,
                    policy,
                    cohort: None,
                }
            })
            .collect();
        domains.sort_by_key(|d| d.domid);
        let topology = topology::build(&mut domains);
        Arc::new(PoolState { domains, topology })
    }

    pub(crate) fn time_triggered(period_ms: i64, active_ms: i64) -> Policy {
        Policy::TimeTriggered {
            from_ns: 0,
            period_ns: ms_to_ns(period_ms),
            active_ns: ms_to_ns(active_ms),
            space_filling: false,
        }
    }

    #[test]
    fn inserted_vcpu_parks_in_waiting_set() -> Result<()> {
        let mut sched: LocalScheduler = LocalScheduler::new(0, SchedParams::default());
        sched.insert_vcpu(vcpu(1, 0))?;
        crate::ensure_eq!(sched.waiting.contains_key(&DomainId(1)), true);
        crate::ensure_eq!(sched.insert_vcpu(vcpu(1, 0)).is_err(), true);
        sched.remove_vcpu(DomainId(1));
        crate::ensure_eq!(sched.arena.is_empty(), true);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "found in no collection")]
    fn removing_unknown_vcpu_is_fatal() {
        let mut sched: LocalScheduler = LocalScheduler::new(0, SchedParams::default());
        sched.remove_vcpu(DomainId(9));
    }

    #[test]
    fn rebuild_initializes_tickets_per_policy() -> Result<()> {
        let params: SchedParams = SchedParams::default();
        let state: Arc<PoolState> = make_state(vec![
            (1, vec![0, 1], time_triggered(100, 50)),
            (2, vec![0, 1], Policy::BestEffort {
                from_ns: 0,
                weight: 1,
                space_filling: false,
            }),
            (3, vec![0, 1], Policy::BestEffort {
                from_ns: 0,
                weight: 1,
                space_filling: false,
            }),
        ]);

        let mut sched: LocalScheduler = LocalScheduler::new(0, params);
        sched.rebuild(&state, 0);

        // now + upper bound, rounded up one grain past the boundary.
        let will_resume_at: TimeNs = ms_to_ns(100) + 1_000_000;

        let tt = sched.activation.search_domain(DomainId(1)).expect("placed");
        let tt = sched.arena.get(tt.0).expect("live");
        crate::ensure_eq!(tt.earliest_start_time, align_activation(will_resume_at, 0, ms_to_ns(100)));
        crate::ensure_eq!(tt.deadline, tt.earliest_start_time + ms_to_ns(100));
        crate::ensure_eq!(tt.remaining_time, ms_to_ns(50));
        crate::ensure_eq!(tt.vcpu, Some(vcpu(1, 0)));

        // Best-effort deadlines stagger by position within the cohort.
        let be1 = sched.activation.search_domain(DomainId(2)).expect("placed");
        let be1 = sched.arena.get(be1.0).expect("live");
        let be2 = sched.activation.search_domain(DomainId(3)).expect("placed");
        let be2 = sched.arena.get(be2.0).expect("live");
        crate::ensure_eq!(be1.deadline, be1.earliest_start_time + params.be_period_ns);
        crate::ensure_eq!(be2.deadline, be2.earliest_start_time + 2 * params.be_period_ns);
        crate::ensure_eq!(be1.remaining_time, params.be_quantum_ns);
        Ok(())
    }

    #[test]
    fn rebuild_covers_cohort_threads_the_domain_does_not_own() -> Result<()> {
        // Domain 2 shares the cohort with domain 1 but owns only cpu 1, so
        // cpu 0's scheduler tracks it through a vCPU-less ticket.
        let state: Arc<PoolState> = make_state(vec![
            (1, vec![0, 1], time_triggered(200, 10)),
            (2, vec![1], time_triggered(300, 10)),
        ]);
        let mut sched: LocalScheduler = LocalScheduler::new(0, SchedParams::default());
        sched.rebuild(&state, 0);

        let tid = sched.activation.search_domain(DomainId(2)).expect("placed");
        crate::ensure_eq!(sched.arena.get(tid.0).expect("live").vcpu, None);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "shares cohort")]
    fn rebuild_rejects_permanent_domain_with_company() {
        let state: Arc<PoolState> = make_state(vec![
            (1, vec![0], Policy::Permanent { from_ns: 0 }),
            (2, vec![0], time_triggered(100, 50)),
        ]);
        let mut sched: LocalScheduler = LocalScheduler::new(0, SchedParams::default());
        sched.rebuild(&state, 0);
    }

    #[test]
    fn advance_promotes_due_tickets_in_order() -> Result<()> {
        let state: Arc<PoolState> = make_state(vec![
            (1, vec![0], time_triggered(100, 10)),
            (2, vec![0], time_triggered(400, 10)),
        ]);
        let mut sched: LocalScheduler = LocalScheduler::new(0, SchedParams::default());
        sched.rebuild(&state, 0);

        // Before any activation time arrives, nothing is runnable.
        let earliest: TimeNs = sched.advance(ms_to_ns(10));
        crate::ensure_eq!(sched.runnable.is_empty(), true);
        crate::ensure_neq!(earliest, INFINITY);

        // Past both activation times, both tickets are runnable and the
        // activation queue drains.
        let earliest: TimeNs = sched.advance(ms_to_ns(500));
        crate::ensure_eq!(sched.runnable.len(), 2);
        crate::ensure_eq!(earliest, INFINITY);
        Ok(())
    }

    #[test]
    fn exhausted_time_triggered_ticket_shifts_by_one_period() -> Result<()> {
        let params: SchedParams = SchedParams::default();
        let state: Arc<PoolState> = make_state(vec![(1, vec![0], time_triggered(100, 50))]);
        let mut sched: LocalScheduler = LocalScheduler::new(0, params);
        sched.rebuild(&state, 0);

        let tid = sched.activation.search_domain(DomainId(1)).expect("placed");
        let (est, deadline): (TimeNs, TimeNs) = {
            let t = sched.arena.get(tid.0).expect("live");
            (t.earliest_start_time, t.deadline)
        };

        // Pretend the dispatcher ran the domain for its full active time.
        sched.activation.remove(&mut sched.arena, tid);
        {
            let ticket = sched.arena.get_mut(tid.0).expect("live");
            ticket.locus = Locus::Dispatched;
            ticket.activated_at = est;
        }
        sched.current[0] = Some(tid);

        let now: TimeNs = est + ms_to_ns(50);
        sched.advance(now);

        let ticket = sched.arena.get(tid.0).expect("live");
        crate::ensure_eq!(ticket.earliest_start_time, est + ms_to_ns(100));
        crate::ensure_eq!(ticket.deadline, deadline + ms_to_ns(100));
        crate::ensure_eq!(ticket.remaining_time, ms_to_ns(50));
        crate::ensure_eq!(ticket.locus, Locus::ActivationQueue);
        Ok(())
    }

    #[test]
    fn partially_used_slice_keeps_its_deadline() -> Result<()> {
        let state: Arc<PoolState> = make_state(vec![(1, vec![0], time_triggered(100, 50))]);
        let mut sched: LocalScheduler = LocalScheduler::new(0, SchedParams::default());
        sched.rebuild(&state, 0);

        let tid = sched.activation.search_domain(DomainId(1)).expect("placed");
        let (est, deadline): (TimeNs, TimeNs) = {
            let t = sched.arena.get(tid.0).expect("live");
            (t.earliest_start_time, t.deadline)
        };

        sched.activation.remove(&mut sched.arena, tid);
        {
            let ticket = sched.arena.get_mut(tid.0).expect("live");
            ticket.locus = Locus::Dispatched;
            ticket.activated_at = est;
        }
        sched.current[0] = Some(tid);

        // Only 20 of 50 ms consumed: remaining time shrinks, deadline stays.
        sched.advance(est + ms_to_ns(20));
        let ticket = sched.arena.get(tid.0).expect("live");
        crate::ensure_eq!(ticket.remaining_time, ms_to_ns(30));
        crate::ensure_eq!(ticket.deadline, deadline);
        crate::ensure_eq!(ticket.remaining_time >= MARGIN, true);
        Ok(())
    }

    #[test]
    fn align_activation_honors_phase() -> Result<()> {
        // Already aligned.
        crate::ensure_eq!(align_activation(1000, 1000, 100), 1000);
        // from in the past: next boundary with the same phase.
        crate::ensure_eq!(align_activation(1050, 1000, 100), 1100);
        crate::ensure_eq!(align_activation(1100, 1000, 100), 1100);
        // from in the future wins outright.
        crate::ensure_eq!(align_activation(1000, 5000, 100), 5000);
        Ok(())
    }
}
