// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::gang_sched::{
    runtime::{
        params::SchedParams,
        types::TimeNs,
    },
    AdjustCommand,
    AdjustRequest,
    CpuMask,
    DomainEntry,
    DomainId,
    GangPool,
    HostPlatform,
    Policy,
};
use ::std::{
    sync::{
        atomic::{
            AtomicI64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread,
};

//==============================================================================
// Constants
//==============================================================================

/// The hardware thread the control plane pretends to run on. Outside every
/// pool the tests build.
pub const CONTROL_CPU: usize = 100;

pub const TEST_POOL_ID: u32 = 1;

//==============================================================================
// Structures
//==============================================================================

/// A host platform for tests: a settable virtual clock, a configurable
/// calling thread, cross-CPU calls backed by plain threads, and a record of
/// softirq raises.
pub struct TestHost {
    clock_ns: AtomicI64,
    current_cpu: AtomicUsize,
    pub softirq_raises: Mutex<Vec<CpuMask>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clock_ns: AtomicI64::new(0),
            current_cpu: AtomicUsize::new(CONTROL_CPU),
            softirq_raises: Mutex::new(Vec::new()),
        })
    }

    pub fn set_now(&self, now: TimeNs) {
        self.clock_ns.store(now, Ordering::Release);
    }

    pub fn set_current_cpu(&self, cpu: usize) {
        self.current_cpu.store(cpu, Ordering::Release);
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl HostPlatform for TestHost {
    fn current_cpu(&self) -> usize {
        self.current_cpu.load(Ordering::Acquire)
    }

    fn now(&self) -> TimeNs {
        self.clock_ns.load(Ordering::Acquire)
    }

    fn call_on_cpus(&self, cpus: &CpuMask, routine: Arc<dyn Fn(usize) + Send + Sync>) {
        for cpu in cpus.iter() {
            let routine: Arc<dyn Fn(usize) + Send + Sync> = routine.clone();
            thread::spawn(move || routine(cpu));
        }
    }

    fn raise_schedule_softirq(&self, cpus: &CpuMask) {
        self.softirq_raises
            .lock()
            .expect("softirq record lock poisoned")
            .push(*cpus);
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Builds a pool over the given hardware threads with the listed domains
/// registered (`(domid, num_vcpus)` pairs).
pub fn setup_pool(
    pool_cpus: impl IntoIterator<Item = usize>,
    domains: &[(i32, u16)],
) -> anyhow::Result<(Arc<GangPool>, Arc<TestHost>)> {
    let host: Arc<TestHost> = TestHost::new();
    let pool_mask: CpuMask = pool_cpus.into_iter().collect();
    let pool: Arc<GangPool> = GangPool::new(TEST_POOL_ID, pool_mask, SchedParams::default(), host.clone())?;
    for (domid, num_vcpus) in domains.iter() {
        pool.add_domain(DomainId(*domid), *num_vcpus)?;
    }
    Ok((pool, host))
}

pub fn entry(domid: i32, cpus: impl IntoIterator<Item = usize>, policy: Policy) -> DomainEntry {
    DomainEntry {
        domid: DomainId(domid),
        cpumap: cpus.into_iter().collect(),
        policy,
    }
}

pub fn put_request(entries: Vec<DomainEntry>) -> AdjustRequest {
    AdjustRequest {
        command: AdjustCommand::Put,
        pool_id: TEST_POOL_ID,
        entries,
    }
}

pub fn get_request() -> AdjustRequest {
    AdjustRequest {
        command: AdjustCommand::Get,
        pool_id: TEST_POOL_ID,
        entries: Vec::new(),
    }
}

pub fn time_triggered(period_ns: TimeNs, active_ns: TimeNs) -> Policy {
    Policy::TimeTriggered {
        from_ns: 0,
        period_ns,
        active_ns,
        space_filling: false,
    }
}

pub fn event_triggered(period_ns: TimeNs, active_ns: TimeNs) -> Policy {
    Policy::EventTriggered {
        from_ns: 0,
        period_ns,
        active_ns,
        space_filling: false,
    }
}

pub fn best_effort(space_filling: bool) -> Policy {
    Policy::BestEffort {
        from_ns: 0,
        weight: 1,
        space_filling,
    }
}
