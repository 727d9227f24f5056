use std::collections::BTreeSet;

use netbsd_api::errno::Errno;

use super::{ThreadState, ThreadStatus, Tid};

/// The thread slots, plus a free list.
///
/// A slot is allocated in [`ThreadStatus::Init`]. When its thread finishes it
/// becomes a zombie and can't be handed out again until the LWP that ran it
/// has marked it [`ThreadStatus::Empty`].
#[derive(Debug)]
pub struct ThreadRegistry {
    slots: Vec<ThreadState>,
    /// Empty slots, lowest first.
    free: BTreeSet<usize>,
    zombies: Vec<Tid>,
    max_threads: usize,
}

impl ThreadRegistry {
    pub fn new(max_threads: usize) -> Self {
        assert!(max_threads > 0);
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            zombies: Vec::new(),
            max_threads,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Moves zombies whose LWP has finished back to the free list.
    fn reap(&mut self) {
        let slots = &self.slots;
        let free = &mut self.free;
        self.zombies.retain(|tid| {
            if slots[tid.index()].status() == ThreadStatus::Empty {
                log::trace!("Reaped thread slot {tid}");
                free.insert(tid.index());
                false
            } else {
                true
            }
        });
    }

    /// Allocates a slot in [`ThreadStatus::Init`]. Fails with `EAGAIN` when
    /// every slot is in use.
    pub fn alloc(&mut self) -> Result<Tid, Errno> {
        self.reap();

        let index = match self.free.pop_first() {
            Some(index) => index,
            None if self.slots.len() < self.max_threads => {
                let tid = Tid::from_index(self.slots.len());
                self.slots.push(ThreadState::new(tid));
                self.slots.len() - 1
            }
            None => {
                log::warn!(
                    "Out of thread slots ({} in use); increase --max-threads",
                    self.max_threads
                );
                return Err(Errno::EAGAIN);
            }
        };

        let slot = &mut self.slots[index];
        assert_eq!(slot.status(), ThreadStatus::Empty);
        slot.reset();
        slot.set_status(ThreadStatus::Init);
        Ok(slot.tid)
    }

    pub fn try_get(&self, tid: Tid) -> Option<&ThreadState> {
        self.slots.get(tid.index())
    }

    /// Panics if `tid` was never allocated.
    pub fn get(&self, tid: Tid) -> &ThreadState {
        self.try_get(tid)
            .unwrap_or_else(|| panic!("No thread slot {tid}"))
    }

    pub fn get_mut(&mut self, tid: Tid) -> &mut ThreadState {
        self.slots
            .get_mut(tid.index())
            .unwrap_or_else(|| panic!("No thread slot {tid}"))
    }

    /// Marks a finished thread. Its slot stays unusable until the thread's
    /// LWP marks it empty.
    pub fn mark_zombie(&mut self, tid: Tid) {
        let slot = self.get_mut(tid);
        assert!(slot.is_alive(), "thread {tid} isn't alive");
        slot.set_status(ThreadStatus::Zombie);
        self.zombies.push(tid);
    }

    /// Returns a slot that never started running directly to the free list.
    pub fn release(&mut self, tid: Tid) {
        let slot = self.get_mut(tid);
        assert_ne!(slot.status(), ThreadStatus::Zombie);
        slot.reset();
        slot.set_status(ThreadStatus::Empty);
        self.free.insert(tid.index());
    }

    pub fn count_living(&self) -> usize {
        self.living().count()
    }

    /// Threads in [`ThreadStatus::Init`] or [`ThreadStatus::Runnable`].
    pub fn living(&self) -> impl Iterator<Item = &ThreadState> + '_ {
        self.slots.iter().filter(|t| t.is_alive())
    }

    /// Every slot that isn't [`ThreadStatus::Empty`].
    pub fn in_use(&self) -> impl Iterator<Item = &ThreadState> + '_ {
        self.slots
            .iter()
            .filter(|t| t.status() != ThreadStatus::Empty)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadState> + '_ {
        self.slots.iter_mut()
    }

    pub fn find_by_lwpid(&self, lwpid: u32) -> Option<Tid> {
        self.living()
            .find(|t| t.os_state.lwpid == lwpid)
            .map(|t| t.tid)
    }
}
