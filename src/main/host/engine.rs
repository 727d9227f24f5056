//! The engine: collaborators plus all state guarded by the big lock.

use std::sync::Arc;

use crate::host::heap::BrkState;
use crate::host::kernel::Kernel;
use crate::host::memory::AddressSpace;
use crate::host::signals::SignalSubsystem;
use crate::host::syscall::fd::{FdPolicy, FdTracker};
use crate::host::syscall::table::SyscallTable;
use crate::host::thread::big_lock::{BigLock, BigLockGuard};
use crate::host::thread::exit::ThreadExit;
use crate::host::thread::lifecycle::{GuestRunner, ShutdownHandler};
use crate::host::thread::stacks::StackRegistry;
use crate::host::thread::ThreadRegistry;
use crate::host::tool::ToolHooks;
use crate::host::translations::TranslationCache;

/// Collaborators outside the engine core. Each serializes its own state.
#[derive(Clone)]
pub struct Services {
    pub aspace: Arc<dyn AddressSpace>,
    pub tool: Arc<dyn ToolHooks>,
    pub kernel: Arc<dyn Kernel>,
    pub signals: Arc<dyn SignalSubsystem>,
    pub translations: Arc<dyn TranslationCache>,
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub max_threads: usize,
    /// Size of the stack engine code runs on for each guest thread.
    pub engine_stack_size: usize,
    pub fd_policy: FdPolicy,
    /// Data segment size limit (`RLIMIT_DATA`).
    pub data_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_threads: 500,
            engine_stack_size: 1024 * 1024,
            fd_policy: FdPolicy::default(),
            data_limit: 256 * 1024 * 1024,
        }
    }
}

/// State that only the holder of the big lock may touch.
#[derive(Debug)]
pub struct CoreState {
    pub threads: ThreadRegistry,
    pub brk: BrkState,
    pub stacks: StackRegistry,
    pub fds: FdTracker,
}

pub type CoreGuard<'a> = BigLockGuard<'a, CoreState>;

/// How to run guest threads and what to do when they're done.
#[derive(Clone)]
pub struct ThreadHooks {
    pub runner: Arc<dyn GuestRunner>,
    pub shutdown: Arc<dyn ShutdownHandler>,
    pub exit: Arc<dyn ThreadExit>,
}

pub struct Engine {
    pub services: Services,
    pub core: BigLock<CoreState>,
    pub hooks: ThreadHooks,
    pub options: EngineOptions,
    pub syscalls: SyscallTable,
}

impl Engine {
    pub fn new(
        services: Services,
        hooks: ThreadHooks,
        options: EngineOptions,
        brk: BrkState,
    ) -> Arc<Self> {
        let core = CoreState {
            threads: ThreadRegistry::new(options.max_threads),
            brk,
            stacks: StackRegistry::new(),
            fds: FdTracker::new(),
        };
        Arc::new(Self {
            services,
            core: BigLock::new(core),
            hooks,
            options,
            syscalls: SyscallTable::new(),
        })
    }

    pub fn lock(&self) -> CoreGuard<'_> {
        self.core.lock()
    }

    pub fn aspace(&self) -> &dyn AddressSpace {
        self.services.aspace.as_ref()
    }

    pub fn tool(&self) -> &dyn ToolHooks {
        self.services.tool.as_ref()
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.services.kernel.as_ref()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
