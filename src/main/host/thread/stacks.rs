//! Guest stacks known to the engine, so that stack pointer changes can be
//! classified and reported.

use guest_helper::page::page_round_up;
use netbsd_api::mman::ProtFlags;

use super::ThreadState;
use crate::host::memory::AddressSpace;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackId(u64);

/// A registered stack. `end` is inclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GuestStack {
    pub id: StackId,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Default)]
pub struct StackRegistry {
    stacks: Vec<GuestStack>,
    next_id: u64,
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, start: usize, end: usize) -> StackId {
        // Tolerate callers that get the bounds backwards.
        let (start, end) = if start > end { (end, start) } else { (start, end) };
        let id = StackId(self.next_id);
        self.next_id += 1;
        log::debug!("Registered stack {}: {start:#x}-{end:#x}", id.0);
        self.stacks.push(GuestStack { id, start, end });
        id
    }

    pub fn deregister(&mut self, id: StackId) {
        let before = self.stacks.len();
        self.stacks.retain(|s| s.id != id);
        if self.stacks.len() == before {
            log::warn!("Deregistering unknown stack {}", id.0);
        } else {
            log::debug!("Deregistered stack {}", id.0);
        }
    }

    pub fn change(&mut self, id: StackId, start: usize, end: usize) {
        match self.stacks.iter_mut().find(|s| s.id == id) {
            Some(stack) => {
                stack.start = start;
                stack.end = end;
            }
            None => log::warn!("Changing unknown stack {}", id.0),
        }
    }

    /// The stack containing `addr`.
    pub fn find(&self, addr: usize) -> Option<GuestStack> {
        self.stacks
            .iter()
            .find(|s| (s.start..=s.end).contains(&addr))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

/// Works out the bounds of the stack `sp` points into from the segment that
/// contains it, records them in `thread`, and registers the stack. Returns
/// false, leaving the bounds zeroed, if `sp` isn't in writable client memory.
pub fn guess_and_register_stack(
    aspace: &dyn AddressSpace,
    stacks: &mut StackRegistry,
    thread: &mut ThreadState,
    sp: usize,
) -> bool {
    let seg = aspace.find_segment(sp);
    let os = &mut thread.os_state;

    match seg {
        Some(seg) if aspace.is_valid_for_client(sp, 1, ProtFlags::RW) => {
            os.stack_highest_byte = page_round_up(sp + 1) - 1;
            os.stack_size = os.stack_highest_byte - seg.start + 1;
            if let Some(old) = os.stack_id.take() {
                stacks.deregister(old);
            }
            os.stack_id = Some(stacks.register(seg.start, os.stack_highest_byte));
            log::debug!(
                "tid {}: guessed client stack range [{:#x}-{:#x}]",
                thread.tid,
                seg.start,
                os.stack_highest_byte
            );
            true
        }
        _ => {
            log::warn!(
                "tid {}: failed to guess client stack range for sp {sp:#x}",
                thread.tid
            );
            os.stack_highest_byte = 0;
            os.stack_size = 0;
            false
        }
    }
}
