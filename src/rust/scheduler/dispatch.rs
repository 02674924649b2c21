// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The per-tick dispatch decision.
//!
//! On every scheduling event the host asks the local scheduler which vCPU to
//! run next and for how long. The dispatcher walks the EDF runnable queue in
//! deadline order, granting whole domains at a time: a domain is dispatched
//! only if none of its hardware threads has been claimed by an
//! earlier-deadline domain. Since every thread of a cohort walks an identical
//! queue, all of them arrive at the same assignment without talking to each
//! other, which is what makes the slice a gang.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::types::{
        floor_to_grain,
        ms_to_ns,
        TimeNs,
        INFINITY,
    },
    scheduler::{
        domain::VcpuId,
        local::{
            LocalScheduler,
            MARGIN,
        },
        mask::CpuMask,
        ticket::{
            Locus,
            Ticket,
            TicketId,
            FLAG_SINGLE_VCPU_YIELD,
            FLAG_VCPU_BLOCKED,
        },
        topology::PoolState,
    },
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// The outcome of a dispatch decision: which vCPU to run (idle when `None`)
/// and for how long (until further notice when `None`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskSlice {
    pub vcpu: Option<VcpuId>,
    pub slice_ns: Option<TimeNs>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskSlice {
    fn idle_unbounded() -> Self {
        Self {
            vcpu: None,
            slice_ns: None,
        }
    }
}

impl LocalScheduler {
    /// Determines which vCPU to run next on this hardware thread.
    pub fn do_schedule(&mut self, now: TimeNs, tasklet_work_scheduled: bool) -> TaskSlice {
        let state: Arc<PoolState> = self.state.clone();

        if state.topology.num_cohorts() == 0 {
            // No domains in the gang-scheduled pool.
            self.prev_running = None;
            return TaskSlice::idle_unbounded();
        }

        let earliest_actv: TimeNs = self.advance(now);

        if tasklet_work_scheduled {
            // This thread owes the host a tasklet run; give the slice to idle.
            trace!("do_schedule(): cpu={}, yielding slice to tasklet work", self.cpu);
            self.prev_running = None;
            return TaskSlice::idle_unbounded();
        }

        let my_cohort: Option<usize> = state.topology.cohort_of(self.cpu);

        let mut assigned_cpus: CpuMask = CpuMask::empty();
        let mut end_of_slice: TimeNs = INFINITY;
        let mut num_runnable_domains: usize = 0;
        let mut permanent_dispatched: bool = false;

        while let Some(tid) = self.runnable.pop_min(&mut self.arena) {
            let ticket: &Ticket = self.arena.get(tid.0).expect("queued ticket is live");
            let record = state.domain(ticket.domid).expect("runnable domain is in the pool state");
            num_runnable_domains += 1;

            if !assigned_cpus.intersects(&record.cpumask) {
                // Grant the domain all of its hardware threads at once.
                assigned_cpus.union_with(&record.cpumask);
                for cpu in record.cpumask.iter() {
                    assert!(
                        self.current[cpu].is_none(),
                        "current-ticket slot of cpu {} already taken",
                        cpu
                    );
                    self.current[cpu] = Some(tid);
                }

                let ticket: &mut Ticket = self.arena.get_mut(tid.0).expect("queued ticket is live");
                ticket.locus = Locus::Dispatched;
                ticket.activated_at = now;

                if record.policy.is_permanent() {
                    permanent_dispatched = true;
                    if ticket.remaining_time != INFINITY {
                        panic!("permanent domain {} with finite remaining time", ticket.domid);
                    }
                } else {
                    if ticket.remaining_time == INFINITY {
                        panic!("multiplexed domain {} with infinite remaining time", ticket.domid);
                    }
                    if ticket.remaining_time < MARGIN {
                        panic!(
                            "multiplexed domain {} dispatched with remaining time {} ns below the margin",
                            ticket.domid, ticket.remaining_time
                        );
                    }
                    end_of_slice = end_of_slice.min(now + ticket.remaining_time);
                }
            } else {
                // The domain overlaps an already granted one; it has to wait
                // for the time its budget would have to start in order to
                // still meet its deadline.
                let mut tval: TimeNs = ticket.deadline - ticket.remaining_time;
                assert!(tval > 0);
                if tval <= now {
                    warn!(
                        "do_schedule(): cpu={}, latest start {} of domain {} is not in the future",
                        self.cpu, tval, ticket.domid
                    );
                    tval = now + ms_to_ns(1);
                }
                end_of_slice = end_of_slice.min(tval);
                self.activation.insert(&mut self.arena, tid);
            }

            if let Some(cohort) = my_cohort {
                if assigned_cpus == state.topology.cohort_masks[cohort] {
                    // Every thread of the cohort has a ticket; done.
                    break;
                }
            }
        }

        if permanent_dispatched && num_runnable_domains > 1 {
            panic!("permanent domain is not alone in its cohort");
        }

        let chosen: Option<TicketId> = self.current[self.cpu];

        let mut end_of_slice: TimeNs = end_of_slice.min(earliest_actv);
        if end_of_slice < INFINITY {
            end_of_slice = floor_to_grain(end_of_slice, self.params.grain_ns);
        }

        // Handle a single-vCPU yield of the vCPU that is on this thread now:
        // if that vCPU's domain would keep the thread, look for a
        // space-filling substitute, or fall back to idle.
        let mut substitute: Option<TicketId> = None;
        let mut yield_to_idle: bool = false;
        if let Some(prev) = self.prev_running.filter(|prev| self.arena.contains(prev.0)) {
            let (prev_domid, yielding) = {
                let ticket: &Ticket = self.arena.get(prev.0).expect("checked above");
                (ticket.domid, ticket.has_flag(FLAG_SINGLE_VCPU_YIELD))
            };
            let permanent: bool = state
                .domain(prev_domid)
                .map(|record| record.policy.is_permanent())
                .unwrap_or(false);

            if chosen == Some(prev) && yielding && !permanent {
                debug!(
                    "do_schedule(): cpu={}, vcpu of domain {} yielded, getting substitute",
                    self.cpu, prev_domid
                );
                substitute = self.find_substitute();
                self.arena.get_mut(prev.0).expect("checked above").on_my_behalf = substitute;
                yield_to_idle = substitute.is_none();
            }

            // Clear the yield mark before scheduling out.
            self.arena
                .get_mut(prev.0)
                .expect("checked above")
                .clear_flag(FLAG_SINGLE_VCPU_YIELD);
        }

        let running: Option<TicketId> = match (substitute, yield_to_idle) {
            (Some(sub), _) => Some(sub),
            (None, true) => None,
            (None, false) => chosen,
        };

        let vcpu: Option<VcpuId> = running.map(|tid| {
            self.arena
                .get(tid.0)
                .expect("selected ticket is live")
                .vcpu
                .expect("ticket selected for this thread carries a vcpu")
        });
        self.prev_running = running;

        let slice_ns: Option<TimeNs> = if end_of_slice < INFINITY {
            Some((end_of_slice - now).max(0))
        } else {
            None
        };

        trace!(
            "do_schedule(): cpu={}, vcpu={:?}, slice={:?}",
            self.cpu,
            vcpu,
            slice_ns
        );
        TaskSlice { vcpu, slice_ns }
    }

    /// Picks a substitute from the runnable and activation queues: the first
    /// space-filling ticket whose vCPU on this thread is blocked in the host.
    fn find_substitute(&self) -> Option<TicketId> {
        let state: &Arc<PoolState> = &self.state;
        self.runnable
            .iter()
            .chain(self.activation.iter())
            .find(|tid| {
                let ticket: &Ticket = self.arena.get(tid.0).expect("queued ticket is live");
                let space_filling: bool = state
                    .domain(ticket.domid)
                    .map(|record| record.policy.space_filling())
                    .unwrap_or(false);
                space_filling && ticket.has_flag(FLAG_VCPU_BLOCKED) && ticket.vcpu.is_some()
            })
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::TaskSlice;
    use crate::{
        runtime::{
            params::SchedParams,
            types::{
                ms_to_ns,
                TimeNs,
            },
        },
        scheduler::{
            domain::DomainId,
            local::{
                tests::{
                    make_state,
                    time_triggered,
                },
                LocalScheduler,
            },
            policy::Policy,
            topology::PoolState,
        },
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    fn scheduler_for(cpu: usize, state: &Arc<PoolState>) -> LocalScheduler {
        let mut sched: LocalScheduler = LocalScheduler::new(cpu, SchedParams::default());
        sched.rebuild(state, 0);
        sched
    }

    /// After a rebuild at time zero with the default 100 ms adjustment
    /// bound, activations start at this time at the earliest.
    fn resume_time() -> TimeNs {
        ms_to_ns(100) + 1_000_000
    }

    /// First activation boundary of a `from = 0, period = 100 ms` domain
    /// after the resume time: the next whole period.
    fn first_activation() -> TimeNs {
        ms_to_ns(200)
    }

    #[test]
    fn empty_pool_idles_forever() -> Result<()> {
        let mut sched: LocalScheduler = LocalScheduler::new(0, SchedParams::default());
        let slice: TaskSlice = sched.do_schedule(0, false);
        crate::ensure_eq!(slice.vcpu, None);
        crate::ensure_eq!(slice.slice_ns, None);
        Ok(())
    }

    #[test]
    fn single_domain_gets_its_active_time() -> Result<()> {
        let state = make_state(vec![(1, vec![0, 1], time_triggered(100, 50))]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);

        let now: TimeNs = first_activation();
        let slice: TaskSlice = sched.do_schedule(now, false);
        let vcpu = slice.vcpu.expect("domain 1 runs");
        crate::ensure_eq!(vcpu.domid, DomainId(1));
        crate::ensure_eq!(slice.slice_ns, Some(ms_to_ns(50)));

        // Both threads of the mask observe the same dispatch.
        crate::ensure_eq!(sched.current_domain(0), Some(DomainId(1)));
        crate::ensure_eq!(sched.current_domain(1), Some(DomainId(1)));
        Ok(())
    }

    #[test]
    fn cohort_threads_agree_on_the_assignment() -> Result<()> {
        let state = make_state(vec![
            (1, vec![0, 1], time_triggered(100, 30)),
            (2, vec![0, 1], time_triggered(100, 40)),
        ]);
        let now: TimeNs = first_activation();

        let mut on_zero: LocalScheduler = scheduler_for(0, &state);
        let mut on_one: LocalScheduler = scheduler_for(1, &state);
        let slice_zero: TaskSlice = on_zero.do_schedule(now, false);
        let slice_one: TaskSlice = on_one.do_schedule(now, false);

        // Same domain everywhere, thread-local vcpus.
        let vcpu_zero = slice_zero.vcpu.expect("a domain runs");
        let vcpu_one = slice_one.vcpu.expect("a domain runs");
        crate::ensure_eq!(vcpu_zero.domid, vcpu_one.domid);
        crate::ensure_neq!(vcpu_zero.index, vcpu_one.index);
        crate::ensure_eq!(slice_zero.slice_ns, slice_one.slice_ns);
        Ok(())
    }

    #[test]
    fn earlier_deadline_wins_and_bounds_the_slice() -> Result<()> {
        // Domain 1 has the shorter period and thus the earlier deadline; the
        // slice must not exceed the point where domain 2 would have to start.
        let state = make_state(vec![
            (1, vec![0], time_triggered(100, 20)),
            (2, vec![0], time_triggered(200, 50)),
        ]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);

        let now: TimeNs = first_activation();
        let slice: TaskSlice = sched.do_schedule(now, false);
        crate::ensure_eq!(slice.vcpu.expect("a domain runs").domid, DomainId(1));

        // Domain 1 runs for its full active time: 20 ms does not collide
        // with domain 2's latest start.
        crate::ensure_eq!(slice.slice_ns, Some(ms_to_ns(20)));
        Ok(())
    }

    #[test]
    fn tasklet_work_yields_to_idle() -> Result<()> {
        let state = make_state(vec![(1, vec![0], time_triggered(100, 50))]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);
        let slice: TaskSlice = sched.do_schedule(first_activation(), true);
        crate::ensure_eq!(slice.vcpu, None);
        Ok(())
    }

    #[test]
    fn permanent_domain_runs_unbounded() -> Result<()> {
        let state = make_state(vec![(1, vec![0, 1], Policy::Permanent { from_ns: 0 })]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);
        let slice: TaskSlice = sched.do_schedule(resume_time(), false);
        crate::ensure_eq!(slice.vcpu.expect("permanent domain runs").domid, DomainId(1));
        crate::ensure_eq!(slice.slice_ns, None);
        Ok(())
    }

    #[test]
    fn yielded_slice_goes_to_blocked_space_filler() -> Result<()> {
        let space_filling_be: Policy = Policy::BestEffort {
            from_ns: 0,
            weight: 1,
            space_filling: true,
        };
        let state = make_state(vec![
            (1, vec![0], time_triggered(100, 50)),
            (2, vec![0], space_filling_be),
        ]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);

        // First dispatch runs domain 1.
        let now: TimeNs = first_activation();
        let first: TaskSlice = sched.do_schedule(now, false);
        crate::ensure_eq!(first.vcpu.expect("a domain runs").domid, DomainId(1));

        // Domain 1's only vCPU yields; domain 2's vCPU is blocked in the
        // host, which makes it a substitution candidate.
        sched.yield_vcpu(DomainId(1));
        sched.set_vcpu_blocked(DomainId(2), true);

        let second: TaskSlice = sched.do_schedule(now + 1_000_000, false);
        crate::ensure_eq!(second.vcpu.expect("substitute runs").domid, DomainId(2));
        // The gang view still shows domain 1 on the thread.
        crate::ensure_eq!(sched.current_domain(0), Some(DomainId(1)));
        Ok(())
    }

    #[test]
    fn yielded_slice_without_substitute_idles() -> Result<()> {
        let state = make_state(vec![(1, vec![0], time_triggered(100, 50))]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);

        let now: TimeNs = first_activation();
        let first: TaskSlice = sched.do_schedule(now, false);
        crate::ensure_eq!(first.vcpu.is_some(), true);

        sched.yield_vcpu(DomainId(1));
        let second: TaskSlice = sched.do_schedule(now + 1_000_000, false);
        crate::ensure_eq!(second.vcpu, None);

        // The yield mark is consumed: the next dispatch runs the domain.
        let third: TaskSlice = sched.do_schedule(now + 2_000_000, false);
        crate::ensure_eq!(third.vcpu.expect("domain runs again").domid, DomainId(1));
        Ok(())
    }

    #[test]
    fn unblocked_candidates_are_not_substituted() -> Result<()> {
        let space_filling_be: Policy = Policy::BestEffort {
            from_ns: 0,
            weight: 1,
            space_filling: true,
        };
        let state = make_state(vec![
            (1, vec![0], time_triggered(100, 50)),
            (2, vec![0], space_filling_be),
        ]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);

        let now: TimeNs = first_activation();
        sched.do_schedule(now, false);
        sched.yield_vcpu(DomainId(1));

        // Domain 2's vCPU is runnable, not blocked: no substitution.
        let second: TaskSlice = sched.do_schedule(now + 1_000_000, false);
        crate::ensure_eq!(second.vcpu, None);
        Ok(())
    }

    #[test]
    fn blocked_flag_is_only_half_the_bargain() -> Result<()> {
        // A blocked vCPU whose policy does not allow space filling stays out.
        let plain_be: Policy = Policy::BestEffort {
            from_ns: 0,
            weight: 1,
            space_filling: false,
        };
        let state = make_state(vec![
            (1, vec![0], time_triggered(100, 50)),
            (2, vec![0], plain_be),
        ]);
        let mut sched: LocalScheduler = scheduler_for(0, &state);

        let now: TimeNs = first_activation();
        sched.do_schedule(now, false);
        sched.yield_vcpu(DomainId(1));
        sched.set_vcpu_blocked(DomainId(2), true);

        let second: TaskSlice = sched.do_schedule(now + 1_000_000, false);
        crate::ensure_eq!(second.vcpu, None);
        Ok(())
    }
}
