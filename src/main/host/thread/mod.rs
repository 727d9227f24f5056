//! Per-thread state for emulated guest threads.
//!
//! Every guest LWP is backed by one slot in the [`ThreadRegistry`]. Slots are
//! only ever touched while holding the big lock, except for the slot status,
//! which an exiting thread flips to [`ThreadStatus::Empty`] after it has let
//! go of the lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use netbsd_api::signal::{SigSet, Signal, StackT, SS_DISABLE};

use crate::host::guest_state::GuestArchState;
use crate::host::memory::EngineStack;

pub mod big_lock;
pub mod context;
pub mod exit;
pub mod lifecycle;
pub mod registry;
pub mod stacks;

pub use registry::ThreadRegistry;

/// Engine-side thread id. `1` is always the main thread; `0` is never used.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(u32);

impl Tid {
    pub const MAIN: Tid = Tid(1);

    pub fn new(val: u32) -> Option<Self> {
        (val != 0).then_some(Self(val))
    }

    pub fn val(&self) -> u32 {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index + 1).unwrap())
    }

    pub(crate) fn index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadStatus {
    /// Unused slot.
    Empty = 0,
    /// Allocated, not yet running guest code.
    Init = 1,
    Runnable = 2,
    /// Finished, but its LWP may still be executing engine code.
    Zombie = 3,
}

impl ThreadStatus {
    fn from_u32(val: u32) -> Self {
        match val {
            0 => Self::Empty,
            1 => Self::Init,
            2 => Self::Runnable,
            3 => Self::Zombie,
            x => panic!("Invalid thread status {x}"),
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Init | Self::Runnable)
    }
}

/// A slot's status. Shared so that a terminating LWP can mark its slot empty
/// without holding the big lock.
#[derive(Clone, Debug)]
pub struct StatusCell(Arc<AtomicU32>);

impl StatusCell {
    pub fn new(status: ThreadStatus) -> Self {
        Self(Arc::new(AtomicU32::new(status as u32)))
    }

    pub fn get(&self) -> ThreadStatus {
        ThreadStatus::from_u32(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ThreadStatus) {
        self.0.store(status as u32, Ordering::Release)
    }

    /// The raw word, for primitives that store to it from assembly.
    pub fn as_ptr(&self) -> *mut u32 {
        self.0.as_ptr()
    }
}

/// Why a thread stopped running guest code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Just this thread exits.
    ExitThread,
    /// Another thread asked the whole process to exit.
    ExitProcess,
    /// Killed by a signal.
    FatalSig,
}

/// OS-specific bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct OsState {
    /// Kernel LWP id of the thread running this slot, 0 if not started.
    pub lwpid: u32,
    /// Process id.
    pub threadgroup: i32,
    pub parent: Option<Tid>,
    /// Engine stack for this slot. Allocated the first time the slot is used
    /// for a new LWP and kept across reuse.
    pub engine_stack: Option<EngineStack>,
    /// Highest byte of the guest stack, or 0 if unknown.
    pub stack_highest_byte: usize,
    pub stack_size: usize,
    /// Id in the [`StackRegistry`](stacks::StackRegistry).
    pub stack_id: Option<stacks::StackId>,
    pub exitcode: i32,
    /// `uc_link` of the most recent context restored into this thread.
    pub oldcontext: u64,
}

#[derive(Clone, Debug)]
pub struct ThreadState {
    pub tid: Tid,
    status: StatusCell,
    pub arch: GuestArchState,
    pub sig_mask: SigSet,
    /// Mask in effect while a `sigsuspend`-style call is blocked.
    pub tmp_sig_mask: SigSet,
    pub alt_stack: StackT,
    pub os_state: OsState,
    pub exitreason: Option<ExitReason>,
    pub fatalsig: Option<Signal>,
    /// Nonzero while error reporting is turned off for this thread.
    pub err_disablement_level: u32,
    pub thread_name: Option<String>,
}

impl ThreadState {
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            status: StatusCell::new(ThreadStatus::Empty),
            arch: GuestArchState::default(),
            sig_mask: SigSet::EMPTY,
            tmp_sig_mask: SigSet::EMPTY,
            alt_stack: StackT {
                ss_flags: SS_DISABLE,
                ..Default::default()
            },
            os_state: OsState::default(),
            exitreason: None,
            fatalsig: None,
            err_disablement_level: 0,
            thread_name: None,
        }
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.get()
    }

    pub fn set_status(&mut self, status: ThreadStatus) {
        self.status.set(status)
    }

    pub fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    pub fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    /// Whether the guest should stop running on this thread.
    pub fn is_exiting(&self) -> bool {
        self.exitreason.is_some()
    }

    /// Clears everything except the engine stack, which is reused.
    pub(crate) fn reset(&mut self) {
        let engine_stack = self.os_state.engine_stack.take();
        let status = self.status.clone();
        *self = Self::new(self.tid);
        self.status = status;
        self.os_state.engine_stack = engine_stack;
    }
}
