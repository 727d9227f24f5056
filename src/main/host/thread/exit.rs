//! Terminating the LWP that runs a guest thread.
//!
//! Once an exiting thread has released the big lock, its slot may only be
//! marked empty immediately before the LWP dies: another thread reusing the
//! slot must never find the old LWP still running on the slot's engine stack.

use super::{StatusCell, ThreadStatus};

pub trait ThreadExit: Send + Sync {
    /// Marks `status` as [`ThreadStatus::Empty`] and stops the calling LWP.
    /// Implementations that really terminate the LWP never return.
    fn exit_thread(&self, status: &StatusCell, exitcode: i32);
}

/// Marks the slot empty and returns, leaving the caller to unwind back to
/// whatever started the thread. Only safe where LWPs don't run on engine
/// stacks, as with the test kernel's host threads.
#[derive(Debug, Default)]
pub struct ReturningExit;

impl ThreadExit for ReturningExit {
    fn exit_thread(&self, status: &StatusCell, exitcode: i32) {
        log::trace!("Thread returning with exit code {exitcode}");
        status.set(ThreadStatus::Empty);
    }
}

/// Stores to the status word and issues the kernel's LWP exit call back to
/// back, without touching the stack in between. For LWPs started by
/// [`NativeKernel`](crate::host::kernel::NativeKernel).
#[derive(Debug, Default)]
pub struct LwpExit;

#[cfg(all(target_arch = "x86_64", any(target_os = "netbsd", target_os = "linux")))]
impl ThreadExit for LwpExit {
    fn exit_thread(&self, status: &StatusCell, exitcode: i32) {
        #[cfg(target_os = "netbsd")]
        const NR_LWP_EXIT: u64 = 310;
        #[cfg(target_os = "linux")]
        const NR_LWP_EXIT: u64 = libc::SYS_exit as u64;

        let ptr = status.as_ptr();
        // SAFETY: `ptr` points into an `Arc` that the registry also holds, so
        // it stays valid. After the store nothing may use this LWP's stack;
        // the syscall does not return.
        unsafe {
            core::arch::asm!(
                "mov dword ptr [{status}], {empty:e}",
                "syscall",
                status = in(reg) ptr,
                empty = in(reg) ThreadStatus::Empty as u32,
                in("rax") NR_LWP_EXIT,
                in("rdi") exitcode as i64,
                options(noreturn, nostack),
            )
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", any(target_os = "netbsd", target_os = "linux"))))]
impl ThreadExit for LwpExit {
    fn exit_thread(&self, status: &StatusCell, exitcode: i32) {
        status.set(ThreadStatus::Empty);
        // SAFETY: the engine owns no state on this thread that needs
        // unwinding; the slot was released above.
        unsafe { libc::pthread_exit(exitcode as isize as *mut libc::c_void) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returning_exit() {
        let cell = StatusCell::new(ThreadStatus::Zombie);
        ReturningExit.exit_thread(&cell, 3);
        assert_eq!(cell.get(), ThreadStatus::Empty);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_lwp_exit_is_gone_once_slot_is_empty() {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        use netbsd_api::lwp::LwpFlags;

        use crate::host::kernel::{Kernel, NativeKernel};
        use crate::host::memory::EngineStack;

        let size = 256 * 1024;
        // SAFETY: fresh mapping at a kernel-chosen address, never unmapped.
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                size,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::PRIVATE,
            )
        }
        .unwrap() as usize;
        let stack = EngineStack { base, size };

        let status = StatusCell::new(ThreadStatus::Zombie);
        let returned = Arc::new(AtomicBool::new(false));
        let lwpid = {
            let status = status.clone();
            let returned = returned.clone();
            NativeKernel::new()
                .create_lwp(
                    &stack,
                    LwpFlags::empty(),
                    Box::new(move || {
                        LwpExit.exit_thread(&status, 0);
                        returned.store(true, Ordering::SeqCst);
                    }),
                )
                .unwrap()
        };

        let task = PathBuf::from(format!("/proc/self/task/{lwpid}"));
        for _ in 0..5000 {
            if status.get() == ThreadStatus::Empty && !task.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(status.get(), ThreadStatus::Empty);
        assert!(!task.exists(), "lwp {lwpid} outlived its exit");
        assert!(!returned.load(Ordering::SeqCst));
    }
}
