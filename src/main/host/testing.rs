//! Stand-ins for the engine's collaborators, for unit tests.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use guest_helper::syscall_types::SyscallArgs;
use netbsd_api::errno::Errno;
use netbsd_api::lwp::LwpFlags;
use netbsd_api::syscall::SyscallNum;

use crate::host::engine::{CoreGuard, Engine, EngineOptions, Services, ThreadHooks};
use crate::host::heap::BrkState;
use crate::host::kernel::{Kernel, LwpMain};
use crate::host::memory::sim::SimAddressSpace;
use crate::host::memory::EngineStack;
use crate::host::signals::SignalTable;
use crate::host::thread::exit::ReturningExit;
use crate::host::thread::lifecycle::{GuestRunner, ShutdownLatch};
use crate::host::thread::Tid;
use crate::host::tool::RecordingTool;
use crate::host::translations::DiscardLog;

const TEST_PID: i32 = 4242;

thread_local! {
    static LWPID: Cell<u32> = const { Cell::new(1) };
}

/// Records every syscall passed through and answers with a scripted result,
/// or `Ok((0, 0))` if none was set. LWPs are host threads.
#[derive(Debug)]
pub struct TestKernel {
    calls: Mutex<Vec<SyscallArgs>>,
    results: Mutex<HashMap<SyscallNum, Result<(u64, u64), Errno>>>,
    next_lwpid: AtomicU32,
    lwp_flags: Mutex<Vec<LwpFlags>>,
    create_lwp_error: Mutex<Option<Errno>>,
}

impl TestKernel {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            next_lwpid: AtomicU32::new(2),
            lwp_flags: Mutex::new(Vec::new()),
            create_lwp_error: Mutex::new(None),
        }
    }

    /// Makes the next LWP creation fail with `e`.
    pub fn fail_next_lwp(&self, e: Errno) {
        *self.create_lwp_error.lock().unwrap() = Some(e);
    }

    /// The flags of every LWP creation asked for, including failed ones.
    pub fn lwp_flags(&self) -> Vec<LwpFlags> {
        self.lwp_flags.lock().unwrap().clone()
    }

    pub fn set_result(&self, nr: SyscallNum, result: Result<(u64, u64), Errno>) {
        self.results.lock().unwrap().insert(nr, result);
    }

    pub fn calls(&self) -> Vec<SyscallArgs> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, nr: SyscallNum) -> Vec<SyscallArgs> {
        self.calls()
            .into_iter()
            .filter(|c| c.number() == nr)
            .collect()
    }
}

impl Kernel for TestKernel {
    fn syscall(&self, args: &SyscallArgs) -> Result<(u64, u64), Errno> {
        self.calls.lock().unwrap().push(*args);
        self.results
            .lock()
            .unwrap()
            .get(&args.number())
            .copied()
            .unwrap_or(Ok((0, 0)))
    }

    fn create_lwp(
        &self,
        _stack: &EngineStack,
        flags: LwpFlags,
        main: LwpMain,
    ) -> Result<u32, Errno> {
        self.lwp_flags.lock().unwrap().push(flags);
        if let Some(e) = self.create_lwp_error.lock().unwrap().take() {
            return Err(e);
        }
        let lwpid = self.next_lwpid.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("lwp-{lwpid}"))
            .spawn(move || {
                LWPID.with(|id| id.set(lwpid));
                main()
            })
            .map_err(|_| Errno::EAGAIN)?;
        Ok(lwpid)
    }

    fn current_lwpid(&self) -> u32 {
        LWPID.with(|id| id.get())
    }

    fn getpid(&self) -> i32 {
        TEST_PID
    }
}

pub struct TestServices {
    pub services: Services,
    pub aspace: Arc<SimAddressSpace>,
    pub tool: Arc<RecordingTool>,
    pub translations: Arc<DiscardLog>,
    pub kernel: Arc<TestKernel>,
    pub signals: Arc<SignalTable>,
}

impl TestServices {
    pub fn new() -> Self {
        let aspace = Arc::new(SimAddressSpace::new());
        let tool = Arc::new(RecordingTool::new());
        let translations = Arc::new(DiscardLog::new());
        let kernel = Arc::new(TestKernel::new());
        let signals = Arc::new(SignalTable::new());
        let services = Services {
            aspace: aspace.clone(),
            tool: tool.clone(),
            kernel: kernel.clone(),
            signals: signals.clone(),
            translations: translations.clone(),
        };
        Self {
            services,
            aspace,
            tool,
            translations,
            kernel,
            signals,
        }
    }
}

type RunFn = dyn Fn(&Arc<Engine>, &mut CoreGuard<'_>, Tid) + Send + Sync;

/// Runs a closure in place of guest code.
pub struct FnRunner {
    f: Box<RunFn>,
}

impl FnRunner {
    pub fn new(
        f: impl Fn(&Arc<Engine>, &mut CoreGuard<'_>, Tid) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { f: Box::new(f) })
    }
}

impl GuestRunner for FnRunner {
    fn run(&self, engine: &Arc<Engine>, guard: &mut CoreGuard<'_>, tid: Tid) {
        (self.f)(engine, guard, tid)
    }
}

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub shutdown: Arc<ShutdownLatch>,
    pub aspace: Arc<SimAddressSpace>,
    pub tool: Arc<RecordingTool>,
    pub translations: Arc<DiscardLog>,
    pub kernel: Arc<TestKernel>,
    pub signals: Arc<SignalTable>,
}

pub fn test_engine(runner: Arc<dyn GuestRunner>) -> TestEngine {
    test_engine_with(runner, EngineOptions::default(), BrkState::new(0))
}

pub fn test_engine_with(
    runner: Arc<dyn GuestRunner>,
    options: EngineOptions,
    brk: BrkState,
) -> TestEngine {
    let ts = TestServices::new();
    let shutdown = Arc::new(ShutdownLatch::new());
    let hooks = ThreadHooks {
        runner,
        shutdown: shutdown.clone(),
        exit: Arc::new(ReturningExit),
    };
    TestEngine {
        engine: Engine::new(ts.services.clone(), hooks, options, brk),
        shutdown,
        aspace: ts.aspace,
        tool: ts.tool,
        translations: ts.translations,
        kernel: ts.kernel,
        signals: ts.signals,
    }
}

/// A runner that does nothing; for engines driven directly by a test.
pub fn idle_runner() -> Arc<dyn GuestRunner> {
    FnRunner::new(|_, _, _| {})
}
