// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Global adjustment of CPUs and time-multiplexing parameters.
//!
//! Resource redistribution must be atomic across the whole pool: a local
//! scheduler working from the old topology while its cohort neighbour works
//! from the new one would break the gang property. The adjustment therefore
//! pauses every hardware thread of the pool behind a pair of barriers,
//! publishes the new topology from a single designated thread between them,
//! rebuilds every local scheduler after the second, and only then lets the
//! pool resume.
//!
//! The coordinator runs outside the managed pool (on the control domain's
//! CPU) and never holds a scheduler lock while it waits.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        limits::MAX_DOMAINS,
        types::TimeNs,
    },
    scheduler::{
        admission,
        domain::{
            DomainId,
            DomainRecord,
            Runstate,
            VcpuState,
        },
        mask::CpuMask,
        policy::Policy,
        pool::{
            GangPool,
            PcpuCell,
        },
        topology::{
            self,
            PoolState,
            Topology,
        },
    },
};
use ::libc::{
    EBUSY,
    EINVAL,
    EPERM,
};
use ::std::{
    sync::{
        atomic::Ordering,
        Arc,
    },
    thread,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Back-off between reads of the paused counter while spinning on a barrier.
const BARRIER_SPIN_DELAY: Duration = Duration::from_micros(20);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Adjustment command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustCommand {
    /// Set CPU masks and policies for the listed domains.
    Put,
    /// Read back the current masks and policies of all pool domains.
    Get,
}

/// One domain's desired (or reported) resource assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainEntry {
    pub domid: DomainId,
    pub cpumap: CpuMask,
    pub policy: Policy,
}

/// An adjustment request, as delivered by the control plane.
#[derive(Clone, Debug)]
pub struct AdjustRequest {
    pub command: AdjustCommand,
    pub pool_id: u32,
    pub entries: Vec<DomainEntry>,
}

/// Everything a paused hardware thread needs to adjust itself.
struct AdjustOp {
    pool: Arc<GangPool>,
    /// The state to publish and rebuild from.
    state: Arc<PoolState>,
    /// Coordinator's clock reading when the adjustment began.
    now: TimeNs,
    /// The thread that publishes the new state between the barriers;
    /// conventionally the lowest of the pool.
    designated_cpu: usize,
    num_involved_cpus: usize,
}

/// Clears the single-flight flag when the adjustment ends, even on an error
/// path.
struct InFlightGuard<'a> {
    pool: &'a GangPool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Entry point for adjustment requests.
pub(crate) fn adjust_global(pool: &Arc<GangPool>, request: &AdjustRequest) -> Result<Option<Vec<DomainEntry>>, Fail> {
    // The adjustment stalls every hardware thread of the pool, so it must be
    // driven from outside of it.
    if pool.pool_mask().test(pool.host().current_cpu()) {
        return Err(Fail::new(EPERM, "adjustment must be invoked from outside the managed pool"));
    }
    if request.pool_id != pool.pool_id() {
        return Err(Fail::new(EINVAL, "request addresses a different pool"));
    }

    if pool
        .adjust_in_flight()
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        warn!("adjust_global(): concurrent adjustments are not allowed");
        return Err(Fail::new(EBUSY, "another adjustment is in progress"));
    }
    let _guard: InFlightGuard = InFlightGuard { pool: pool.as_ref() };

    match request.command {
        AdjustCommand::Put => put(pool, &request.entries).map(|_| None),
        AdjustCommand::Get => get(pool).map(Some),
    }
}

/// Validates and applies a new resource assignment.
fn put(pool: &Arc<GangPool>, entries: &[DomainEntry]) -> Result<(), Fail> {
    if entries.is_empty() || entries.len() > MAX_DOMAINS {
        return Err(Fail::new(EINVAL, "invalid number of domain entries"));
    }

    for (i, entry) in entries.iter().enumerate() {
        for other in entries.iter().skip(i + 1) {
            if entry.domid == other.domid {
                warn!("put(): duplicate entries for domain {}", entry.domid);
                return Err(Fail::new(EINVAL, "duplicate domain entries"));
            }
        }
    }

    let pool_mask: CpuMask = *pool.pool_mask();
    let new_state: Arc<PoolState> = {
        let domains = pool.domains().lock().expect("domain table lock poisoned");

        for entry in entries.iter() {
            if entry.domid.0 <= 0 {
                return Err(Fail::new(EINVAL, "domain id must be positive"));
            }
            let record: &DomainRecord = match domains.get(&entry.domid) {
                Some(record) => record,
                None => {
                    warn!("put(): domain {} does not exist in this pool", entry.domid);
                    return Err(Fail::new(EINVAL, "no such domain in this pool"));
                },
            };
            if record.num_vcpus as usize > pool_mask.weight() {
                return Err(Fail::new(EINVAL, "domain has more vcpus than the pool has cpus"));
            }
            if !entry.cpumap.is_subset_of(&pool_mask) {
                return Err(Fail::new(EINVAL, "desired cpus are not a subset of the pool"));
            }
            if entry.cpumap.weight() != record.num_vcpus as usize {
                warn!(
                    "put(): domain {} has {} vcpus but was assigned {} cpus",
                    entry.domid,
                    record.num_vcpus,
                    entry.cpumap.weight()
                );
                return Err(Fail::new(EINVAL, "assigned cpus must match the vcpu count"));
            }
            entry.policy.validate(pool.params().grain_ns)?;
        }

        // Snapshot the current records and overlay the requested changes;
        // domains not named by the request keep their assignment.
        let mut snapshot: Vec<DomainRecord> = domains.values().cloned().collect();
        for entry in entries.iter() {
            let record: &mut DomainRecord = snapshot
                .iter_mut()
                .find(|record| record.domid == entry.domid)
                .expect("entry was validated against the table");
            record.cpumask = entry.cpumap;
            record.policy = entry.policy;
        }

        let new_topology: Topology = topology::build(&mut snapshot);
        admission::check(&snapshot, pool.params(), &pool_mask)?;

        Arc::new(PoolState {
            domains: snapshot,
            topology: new_topology,
        })
        // The domain table lock drops here; the designated thread re-takes it
        // between the barriers to commit the snapshot.
    };

    commit(pool, new_state, entries);
    Ok(())
}

/// Pauses the pool, publishes the new state, rebuilds every local scheduler,
/// and resumes. Past this point the adjustment is best-effort to completion:
/// a thread missing a barrier is logged, never rolled back.
fn commit(pool: &Arc<GangPool>, new_state: Arc<PoolState>, entries: &[DomainEntry]) {
    let pool_mask: CpuMask = *pool.pool_mask();
    let num_involved_cpus: usize = pool_mask.weight();
    let timeout_ms: i64 = pool.params().barrier_timeout_ms();

    // Clear the flags used for synchronization.
    for cpu in pool_mask.iter() {
        let cell: &PcpuCell = pool.cell(cpu).expect("pool cpu has a cell");
        cell.ack.store(false, Ordering::Release);
        cell.paused.store(true, Ordering::Release);
    }
    pool.paused_count().store(0, Ordering::Release);

    let op: Arc<AdjustOp> = Arc::new(AdjustOp {
        pool: pool.clone(),
        state: new_state,
        now: pool.host().now(),
        designated_cpu: pool_mask.first().expect("pool mask is not empty"),
        num_involved_cpus,
    });

    // Issue the cross-CPU call; do not wait.
    let routine: Arc<dyn Fn(usize) + Send + Sync> = Arc::new(move |cpu: usize| adjust_and_pause_this_cpu(&op, cpu));
    pool.host().call_on_cpus(&pool_mask, routine);

    // Wait for every involved thread to finish its adjustment and enter the
    // pause loop. The counter is incremented twice per thread, once at each
    // barrier.
    let mut remaining_ms: i64 = timeout_ms;
    while pool.paused_count().load(Ordering::Acquire) < 2 * num_involved_cpus && remaining_ms > 0 {
        thread::sleep(Duration::from_millis(1));
        remaining_ms -= 1;
    }
    if pool.paused_count().load(Ordering::Acquire) < 2 * num_involved_cpus {
        warn!("commit(): not all cpus in the pool have completed adjustment and paused");
        log_missing_cpus(pool, &pool_mask, false);
    }

    // Unpause the domains involved in the adjustment as well as their vCPUs.
    {
        let now: TimeNs = pool.host().now();
        let mut vcpus = pool.vcpus().lock().expect("vcpu table lock poisoned");
        for entry in entries.iter() {
            for (_, state) in vcpus.range_mut(entry.domid.vcpu_range()) {
                unblock_vcpu(state, now);
            }
        }
    }

    // Restart the paused threads.
    pool.host().raise_schedule_softirq(&pool_mask);
    for cpu in pool_mask.iter() {
        let cell: &PcpuCell = pool.cell(cpu).expect("pool cpu has a cell");
        cell.paused.store(false, Ordering::Release);
    }

    // Make sure all of them resumed.
    let mut remaining_ms: i64 = timeout_ms;
    while pool.paused_count().load(Ordering::Acquire) > 0 && remaining_ms > 0 {
        thread::sleep(Duration::from_millis(1));
        remaining_ms -= 1;
    }
    if pool.paused_count().load(Ordering::Acquire) > 0 {
        warn!("commit(): not all cpus in the pool have resumed execution");
        log_missing_cpus(pool, &pool_mask, true);
    }
}

/// Adjusts the local scheduler of one paused hardware thread. Runs on that
/// thread, from the host's cross-CPU call context (interrupts off).
fn adjust_and_pause_this_cpu(op: &AdjustOp, cpu: usize) {
    let pool: &Arc<GangPool> = &op.pool;
    let cell: &PcpuCell = pool.cell(cpu).expect("adjustment only targets pool cpus");

    cell.ack.store(true, Ordering::Release);

    // BARRIER 1: wait until all the involved threads reach this point.
    pool.paused_count().fetch_add(1, Ordering::AcqRel);
    while pool.paused_count().load(Ordering::Acquire) < op.num_involved_cpus {
        thread::sleep(BARRIER_SPIN_DELAY);
    }

    // With every dispatcher stopped it is now safe to touch the globally
    // visible state. Exactly one thread does.
    if cpu == op.designated_cpu {
        debug!("adjust_and_pause_this_cpu(): cpu={} publishing the new topology", cpu);
        *pool.state().write().expect("pool state lock poisoned") = op.state.clone();

        // Commit the snapshot records: new masks, policies, cohorts, and
        // with them the vCPU-to-CPU placement.
        let mut domains = pool.domains().lock().expect("domain table lock poisoned");
        for record in op.state.domains.iter() {
            domains.insert(record.domid, record.clone());
        }
    }

    // BARRIER 2: wait until the new state is published.
    pool.paused_count().fetch_add(1, Ordering::AcqRel);
    while pool.paused_count().load(Ordering::Acquire) < 2 * op.num_involved_cpus {
        thread::sleep(BARRIER_SPIN_DELAY);
    }

    {
        let mut local = cell.local.lock().expect("local scheduler lock poisoned");
        local.rebuild(&op.state, op.now);
    }

    // Pause until the coordinator lets this thread go.
    while cell.paused.load(Ordering::Acquire) {
        thread::sleep(BARRIER_SPIN_DELAY);
    }

    // The counter was incremented twice, once at each barrier.
    pool.paused_count().fetch_sub(2, Ordering::AcqRel);
    cell.ack.store(false, Ordering::Release);
}

/// Reads back the current resource assignment of every domain in the pool.
fn get(pool: &Arc<GangPool>) -> Result<Vec<DomainEntry>, Fail> {
    let domains = pool.domains().lock().expect("domain table lock poisoned");
    Ok(domains
        .values()
        .map(|record| DomainEntry {
            domid: record.domid,
            cpumap: record.cpumask,
            policy: record.policy,
        })
        .collect())
}

/// Marks a vCPU runnable again after its domain took part in an adjustment.
fn unblock_vcpu(state: &mut VcpuState, now: TimeNs) {
    state.blocked = false;
    if matches!(state.runstate, Runstate::Blocked | Runstate::Offline) {
        state.set_runstate(Runstate::Runnable, now);
    }
}

/// Logs the pool threads that missed a coordinator wait. `expect_ack` picks
/// which side of the handshake was missed.
fn log_missing_cpus(pool: &GangPool, pool_mask: &CpuMask, expect_ack: bool) {
    let missing: Vec<usize> = pool_mask
        .iter()
        .filter(|&cpu| {
            let cell: &PcpuCell = pool.cell(cpu).expect("pool cpu has a cell");
            cell.ack.load(Ordering::Acquire) == expect_ack
        })
        .collect();
    warn!("log_missing_cpus(): missing cpus: {:?}", missing);
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.pool.adjust_in_flight().store(false, Ordering::Release);
    }
}
