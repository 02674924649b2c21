// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The gang-scheduled CPU pool.
//!
//! `GangPool` owns everything shared across hardware threads: the
//! authoritative domain table, the published topology snapshot, and the
//! per-thread scheduler cells with their adjustment flags. The host drives it
//! through four surfaces: domain and vCPU lifecycle calls, the per-tick
//! `do_schedule`, guest scheduling hints (yield, block), and the adjustment
//! requests of the control plane.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        limits::MAX_PCPUS,
        params::SchedParams,
        types::TimeNs,
    },
    scheduler::{
        adjust::{
            self,
            AdjustRequest,
            DomainEntry,
        },
        dispatch::TaskSlice,
        domain::{
            DomainId,
            DomainRecord,
            Runstate,
            VcpuId,
            VcpuState,
        },
        local::LocalScheduler,
        mask::CpuMask,
        topology::PoolState,
    },
};
use ::libc::{
    EEXIST,
    EINVAL,
    ESRCH,
};
use ::std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
        },
        Arc,
        Mutex,
        RwLock,
        Weak,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Services the host kernel provides to the scheduler: a clock, knowledge of
/// the executing hardware thread, asynchronous cross-CPU calls, and the
/// schedule softirq.
pub trait HostPlatform: Send + Sync + 'static {
    /// The hardware thread the caller is executing on.
    fn current_cpu(&self) -> usize;

    /// The current system time, in nanoseconds.
    fn now(&self) -> TimeNs;

    /// Runs `routine(cpu)` on every hardware thread of the mask, on that
    /// thread and with interrupts disabled. Does not wait for completion.
    fn call_on_cpus(&self, cpus: &CpuMask, routine: Arc<dyn Fn(usize) + Send + Sync>);

    /// Requests a scheduling pass on every hardware thread of the mask.
    fn raise_schedule_softirq(&self, cpus: &CpuMask);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-hardware-thread shared cell: the local scheduler behind its scheduler
/// lock, plus the flags the adjustment protocol synchronizes on.
pub(crate) struct PcpuCell {
    pub(crate) local: Mutex<LocalScheduler>,
    /// Set while the thread is inside the adjust-and-pause routine.
    pub(crate) ack: AtomicBool,
    /// Holds the thread in its pause loop until the coordinator clears it.
    pub(crate) paused: AtomicBool,
}

/// A pool of hardware threads multiplexed among gang-scheduled domains.
pub struct GangPool {
    /// Handle back to the owning `Arc`, so that the adjustment protocol can
    /// hand pool references to the paused threads.
    self_ref: Weak<GangPool>,
    pool_id: u32,
    pool_mask: CpuMask,
    params: SchedParams,
    host: Arc<dyn HostPlatform>,
    /// Authoritative domain records; mutated only by the adjustment protocol
    /// and the domain lifecycle calls.
    domains: Mutex<BTreeMap<DomainId, DomainRecord>>,
    /// Runstate bookkeeping for the pool's vCPUs.
    vcpus: Mutex<BTreeMap<VcpuId, VcpuState>>,
    /// The published snapshot. Written by the designated thread between the
    /// adjustment barriers; every local scheduler keeps its own `Arc` so the
    /// dispatch path never touches this lock.
    state: RwLock<Arc<PoolState>>,
    /// One cell per hardware thread of the pool, indexed by CPU id.
    pcpus: Vec<Option<PcpuCell>>,
    /// Single-flight guard for adjustments.
    adjust_in_flight: AtomicBool,
    /// Counts threads through the two adjustment barriers.
    paused_count: AtomicUsize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl GangPool {
    /// Creates a pool over the given hardware threads.
    pub fn new(
        pool_id: u32,
        pool_mask: CpuMask,
        params: SchedParams,
        host: Arc<dyn HostPlatform>,
    ) -> Result<Arc<Self>, Fail> {
        if pool_mask.is_empty() {
            return Err(Fail::new(EINVAL, "pool mask must not be empty"));
        }

        let mut pcpus: Vec<Option<PcpuCell>> = Vec::with_capacity(MAX_PCPUS);
        for cpu in 0..MAX_PCPUS {
            pcpus.push(if pool_mask.test(cpu) {
                Some(PcpuCell {
                    local: Mutex::new(LocalScheduler::new(cpu, params)),
                    ack: AtomicBool::new(false),
                    paused: AtomicBool::new(false),
                })
            } else {
                None
            });
        }

        info!("new(): pool {} over {:?}", pool_id, pool_mask);
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            pool_id,
            pool_mask,
            params,
            host,
            domains: Mutex::new(BTreeMap::new()),
            vcpus: Mutex::new(BTreeMap::new()),
            state: RwLock::new(Arc::new(PoolState::empty())),
            pcpus,
            adjust_in_flight: AtomicBool::new(false),
            paused_count: AtomicUsize::new(0),
        }))
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub fn pool_mask(&self) -> &CpuMask {
        &self.pool_mask
    }

    pub fn params(&self) -> &SchedParams {
        &self.params
    }

    pub(crate) fn host(&self) -> &Arc<dyn HostPlatform> {
        &self.host
    }

    pub(crate) fn domains(&self) -> &Mutex<BTreeMap<DomainId, DomainRecord>> {
        &self.domains
    }

    pub(crate) fn vcpus(&self) -> &Mutex<BTreeMap<VcpuId, VcpuState>> {
        &self.vcpus
    }

    pub(crate) fn state(&self) -> &RwLock<Arc<PoolState>> {
        &self.state
    }

    pub(crate) fn adjust_in_flight(&self) -> &AtomicBool {
        &self.adjust_in_flight
    }

    pub(crate) fn paused_count(&self) -> &AtomicUsize {
        &self.paused_count
    }

    pub(crate) fn cell(&self, cpu: usize) -> Result<&PcpuCell, Fail> {
        match self.pcpus.get(cpu).and_then(|cell| cell.as_ref()) {
            Some(cell) => Ok(cell),
            None => Err(Fail::new(EINVAL, "hardware thread does not belong to this pool")),
        }
    }

    /// The currently published pool snapshot.
    pub fn state_snapshot(&self) -> Arc<PoolState> {
        self.state.read().expect("pool state lock poisoned").clone()
    }

    /// Registers a domain with the pool. It takes part in scheduling only
    /// after an adjustment assigns it hardware threads and a policy.
    pub fn add_domain(&self, domid: DomainId, num_vcpus: u16) -> Result<(), Fail> {
        if domid.0 <= 0 {
            return Err(Fail::new(EINVAL, "domain id must be positive"));
        }
        if num_vcpus == 0 || num_vcpus as usize > self.pool_mask.weight() {
            return Err(Fail::new(EINVAL, "vcpu count must fit the pool"));
        }
        let mut domains = self.domains.lock().expect("domain table lock poisoned");
        if domains.contains_key(&domid) {
            return Err(Fail::new(EEXIST, "domain already exists in this pool"));
        }
        domains.insert(domid, DomainRecord::new(domid, num_vcpus));
        debug!("add_domain(): domain={}, vcpus={}", domid, num_vcpus);
        Ok(())
    }

    /// Tears a domain down, dropping its record and vCPU bookkeeping. The
    /// host removes the domain's vCPUs from their local schedulers first.
    pub fn remove_domain(&self, domid: DomainId) -> Result<(), Fail> {
        let mut domains = self.domains.lock().expect("domain table lock poisoned");
        if domains.remove(&domid).is_none() {
            return Err(Fail::new(ESRCH, "no such domain in this pool"));
        }
        let mut vcpus = self.vcpus.lock().expect("vcpu table lock poisoned");
        let stale: Vec<VcpuId> = vcpus.range(domid.vcpu_range()).map(|(vcpu, _)| *vcpu).collect();
        for vcpu in stale {
            vcpus.remove(&vcpu);
        }
        debug!("remove_domain(): domain={}", domid);
        Ok(())
    }

    /// Registers a vCPU on the given hardware thread. Its ticket parks in
    /// the waiting-for-event set of that thread's scheduler.
    pub fn insert_vcpu(&self, vcpu: VcpuId, cpu: usize) -> Result<(), Fail> {
        {
            let domains = self.domains.lock().expect("domain table lock poisoned");
            let record: &DomainRecord = domains
                .get(&vcpu.domid)
                .ok_or_else(|| Fail::new(ESRCH, "no such domain in this pool"))?;
            if vcpu.index >= record.num_vcpus {
                return Err(Fail::new(EINVAL, "vcpu index out of range for its domain"));
            }
        }
        let cell: &PcpuCell = self.cell(cpu)?;
        cell.local
            .lock()
            .expect("local scheduler lock poisoned")
            .insert_vcpu(vcpu)?;
        self.vcpus
            .lock()
            .expect("vcpu table lock poisoned")
            .insert(vcpu, VcpuState::new(self.host.now()));
        Ok(())
    }

    /// Unregisters a vCPU from the given hardware thread.
    pub fn remove_vcpu(&self, vcpu: VcpuId, cpu: usize) -> Result<(), Fail> {
        let cell: &PcpuCell = self.cell(cpu)?;
        cell.local
            .lock()
            .expect("local scheduler lock poisoned")
            .remove_vcpu(vcpu.domid);
        self.vcpus.lock().expect("vcpu table lock poisoned").remove(&vcpu);
        Ok(())
    }

    /// Runs the dispatcher of the given hardware thread. Called by the host
    /// on every scheduling event, under that thread's scheduler lock.
    pub fn do_schedule(&self, cpu: usize, now: TimeNs, tasklet_work_scheduled: bool) -> Result<TaskSlice, Fail> {
        let cell: &PcpuCell = self.cell(cpu)?;
        Ok(cell
            .local
            .lock()
            .expect("local scheduler lock poisoned")
            .do_schedule(now, tasklet_work_scheduled))
    }

    /// Notes that a single vCPU of a domain yields its current slice. The
    /// next dispatch on that thread hands the slice to a space-filling
    /// substitute, or to idle.
    pub fn yield_vcpu(&self, cpu: usize, domid: DomainId) -> Result<(), Fail> {
        let cell: &PcpuCell = self.cell(cpu)?;
        cell.local
            .lock()
            .expect("local scheduler lock poisoned")
            .yield_vcpu(domid);
        Ok(())
    }

    /// Mirrors the host's blocked state of a vCPU into the scheduler.
    pub fn set_vcpu_blocked(&self, vcpu: VcpuId, cpu: usize, blocked: bool) -> Result<(), Fail> {
        let cell: &PcpuCell = self.cell(cpu)?;
        cell.local
            .lock()
            .expect("local scheduler lock poisoned")
            .set_vcpu_blocked(vcpu.domid, blocked);

        let now: TimeNs = self.host.now();
        let mut vcpus = self.vcpus.lock().expect("vcpu table lock poisoned");
        if let Some(state) = vcpus.get_mut(&vcpu) {
            state.blocked = blocked;
            if blocked {
                state.set_runstate(Runstate::Blocked, now);
            } else if state.runstate == Runstate::Blocked {
                state.set_runstate(Runstate::Runnable, now);
            }
        }
        Ok(())
    }

    /// The gang view of one hardware thread's scheduler: which domain it
    /// believes is currently dispatched on `cpu`.
    pub fn view_current_domain(&self, viewer_cpu: usize, cpu: usize) -> Result<Option<DomainId>, Fail> {
        let cell: &PcpuCell = self.cell(viewer_cpu)?;
        let local = cell.local.lock().expect("local scheduler lock poisoned");
        Ok(local.current_domain(cpu))
    }

    /// Handles an adjustment request from the control plane. `Put` returns
    /// `None`; `Get` returns the current per-domain assignments.
    pub fn adjust_global(&self, request: &AdjustRequest) -> Result<Option<Vec<DomainEntry>>, Fail> {
        let this: Arc<GangPool> = self.self_ref.upgrade().expect("pool is owned by an Arc");
        adjust::adjust_global(&this, request)
    }
}
