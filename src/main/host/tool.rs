//! Notification hooks for the instrumentation tool.
//!
//! The core tells the tool about every change to guest memory and registers
//! that the tool can't observe by itself. Every hook defaults to doing
//! nothing.

use std::sync::Mutex;

use netbsd_api::mman::ProtFlags;

use crate::host::thread::Tid;

/// Which part of the core a read or write notification comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CorePart {
    /// Building the initial process image.
    Startup,
    /// Emulating a syscall.
    SysCall,
    /// Delivering a signal.
    Signal,
}

#[allow(unused_variables)]
pub trait ToolHooks: Send + Sync {
    fn new_mem_startup(&self, start: usize, len: usize, prot: ProtFlags) {}
    fn new_mem_brk(&self, start: usize, len: usize, tid: Tid) {}
    fn die_mem_brk(&self, start: usize, len: usize) {}
    fn new_mem_mmap(&self, start: usize, len: usize, prot: ProtFlags) {}
    fn die_mem_stack(&self, start: usize, len: usize) {}

    fn pre_mem_read(&self, part: CorePart, tid: Tid, what: &str, addr: usize, len: usize) {}
    fn pre_mem_read_asciiz(&self, part: CorePart, tid: Tid, what: &str, addr: usize) {}
    fn pre_mem_write(&self, part: CorePart, tid: Tid, what: &str, addr: usize, len: usize) {}
    fn post_mem_write(&self, part: CorePart, tid: Tid, addr: usize, len: usize) {}

    /// `offset` and `size` index into [`GuestRegs`](crate::host::guest_state::GuestRegs).
    fn pre_reg_read(&self, part: CorePart, tid: Tid, what: &str, offset: usize, size: usize) {}
    fn post_reg_write(&self, part: CorePart, tid: Tid, offset: usize, size: usize) {}

    fn pre_thread_ll_create(&self, parent: Tid, child: Tid) {}
    fn pre_thread_first_insn(&self, tid: Tid) {}
    fn pre_thread_ll_exit(&self, tid: Tid) {}
}

/// The `none` tool.
#[derive(Debug, Default)]
pub struct NullTool;

impl ToolHooks for NullTool {}

/// One call into [`ToolHooks`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolEvent {
    NewMemStartup { start: usize, len: usize, prot: ProtFlags },
    NewMemBrk { start: usize, len: usize, tid: Tid },
    DieMemBrk { start: usize, len: usize },
    NewMemMmap { start: usize, len: usize, prot: ProtFlags },
    DieMemStack { start: usize, len: usize },
    PreMemRead { part: CorePart, tid: Tid, what: String, addr: usize, len: usize },
    PreMemReadAsciiz { part: CorePart, tid: Tid, what: String, addr: usize },
    PreMemWrite { part: CorePart, tid: Tid, what: String, addr: usize, len: usize },
    PostMemWrite { part: CorePart, tid: Tid, addr: usize, len: usize },
    PreRegRead { part: CorePart, tid: Tid, what: String, offset: usize, size: usize },
    PostRegWrite { part: CorePart, tid: Tid, offset: usize, size: usize },
    PreThreadLlCreate { parent: Tid, child: Tid },
    PreThreadFirstInsn { tid: Tid },
    PreThreadLlExit { tid: Tid },
}

/// Records every notification, in order. Useful for tracing what the core
/// reports and for tests.
#[derive(Debug, Default)]
pub struct RecordingTool {
    events: Mutex<Vec<ToolEvent>>,
}

impl RecordingTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ToolEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Returns the events recorded so far and forgets them.
    pub fn take(&self) -> Vec<ToolEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, event: ToolEvent) {
        log::trace!("tool event: {event:?}");
        self.events.lock().unwrap().push(event);
    }
}

impl ToolHooks for RecordingTool {
    fn new_mem_startup(&self, start: usize, len: usize, prot: ProtFlags) {
        self.push(ToolEvent::NewMemStartup { start, len, prot });
    }

    fn new_mem_brk(&self, start: usize, len: usize, tid: Tid) {
        self.push(ToolEvent::NewMemBrk { start, len, tid });
    }

    fn die_mem_brk(&self, start: usize, len: usize) {
        self.push(ToolEvent::DieMemBrk { start, len });
    }

    fn new_mem_mmap(&self, start: usize, len: usize, prot: ProtFlags) {
        self.push(ToolEvent::NewMemMmap { start, len, prot });
    }

    fn die_mem_stack(&self, start: usize, len: usize) {
        self.push(ToolEvent::DieMemStack { start, len });
    }

    fn pre_mem_read(&self, part: CorePart, tid: Tid, what: &str, addr: usize, len: usize) {
        self.push(ToolEvent::PreMemRead {
            part,
            tid,
            what: what.to_string(),
            addr,
            len,
        });
    }

    fn pre_mem_read_asciiz(&self, part: CorePart, tid: Tid, what: &str, addr: usize) {
        self.push(ToolEvent::PreMemReadAsciiz {
            part,
            tid,
            what: what.to_string(),
            addr,
        });
    }

    fn pre_mem_write(&self, part: CorePart, tid: Tid, what: &str, addr: usize, len: usize) {
        self.push(ToolEvent::PreMemWrite {
            part,
            tid,
            what: what.to_string(),
            addr,
            len,
        });
    }

    fn post_mem_write(&self, part: CorePart, tid: Tid, addr: usize, len: usize) {
        self.push(ToolEvent::PostMemWrite {
            part,
            tid,
            addr,
            len,
        });
    }

    fn pre_reg_read(&self, part: CorePart, tid: Tid, what: &str, offset: usize, size: usize) {
        self.push(ToolEvent::PreRegRead {
            part,
            tid,
            what: what.to_string(),
            offset,
            size,
        });
    }

    fn post_reg_write(&self, part: CorePart, tid: Tid, offset: usize, size: usize) {
        self.push(ToolEvent::PostRegWrite {
            part,
            tid,
            offset,
            size,
        });
    }

    fn pre_thread_ll_create(&self, parent: Tid, child: Tid) {
        self.push(ToolEvent::PreThreadLlCreate { parent, child });
    }

    fn pre_thread_first_insn(&self, tid: Tid) {
        self.push(ToolEvent::PreThreadFirstInsn { tid });
    }

    fn pre_thread_ll_exit(&self, tid: Tid) {
        self.push(ToolEvent::PreThreadLlExit { tid });
    }
}
