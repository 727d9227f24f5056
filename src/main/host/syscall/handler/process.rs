use crate::host::syscall::handler::{SyscallContext, SyscallHandler};
use crate::host::syscall::types::SyscallError;
use crate::host::thread::{ExitReason, ThreadStatus};

impl SyscallHandler {
    /// Exits the whole process: every other thread is told to stop, and the
    /// caller waits for them before exiting itself.
    pub fn exit(ctx: &mut SyscallContext, status: i32) -> Result<i32, SyscallError> {
        let tid = ctx.tid;
        log::debug!("Thread {tid}: exit({status})");

        let signals = ctx.engine.services.signals.clone();
        for thread in ctx.guard.threads.iter_mut() {
            if thread.status() == ThreadStatus::Empty {
                continue;
            }
            thread.os_state.exitcode = status;
            if thread.tid != tid && thread.is_alive() {
                thread.exitreason = Some(ExitReason::ExitProcess);
                signals.interrupt_thread(thread.tid, thread.os_state.lwpid);
            }
        }

        // Let the others run to their exit.
        while ctx.guard.threads.count_living() > 1 {
            ctx.guard.yield_lock();
        }

        ctx.thread_mut().exitreason = Some(ExitReason::ExitThread);
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use netbsd_api::syscall::SyscallNum;

    use crate::host::engine::EngineOptions;
    use crate::host::heap::BrkState;
    use crate::host::syscall::testing::SyscallHarness;
    use crate::host::testing::FnRunner;
    use crate::host::thread::lifecycle::{run_a_thread, ThreadOutcome};

    use super::*;

    #[test]
    fn test_single_thread() {
        let h = SyscallHarness::new();
        h.syscall(SyscallNum::NR_exit, &[3]).unwrap();

        let guard = h.te.engine.lock();
        let thread = guard.threads.get(h.tid);
        assert_eq!(thread.exitreason, Some(ExitReason::ExitThread));
        assert_eq!(thread.os_state.exitcode, 3);
        // Nothing for the kernel to do until the thread really ends.
        assert!(h.te.kernel.calls().is_empty());
    }

    #[test]
    fn test_waits_for_other_threads() {
        // Other threads spin until told to exit.
        let runner = FnRunner::new(|_engine, guard, tid| {
            while !guard.threads.get(tid).is_exiting() {
                guard.yield_lock();
            }
        });
        let h = SyscallHarness::with_runner(runner, EngineOptions::default(), BrkState::new(0));

        let other = h.te.engine.lock().threads.alloc().unwrap();
        let engine = h.te.engine.clone();
        let handle = std::thread::spawn(move || run_a_thread(&engine, other));

        h.syscall(SyscallNum::NR_exit, &[5]).unwrap();
        assert_eq!(handle.join().unwrap(), ThreadOutcome::Exited);

        let guard = h.te.engine.lock();
        assert_eq!(guard.threads.get(other).status(), ThreadStatus::Empty);
        assert_eq!(guard.threads.count_living(), 1);
        assert_eq!(
            guard.threads.get(h.tid).exitreason,
            Some(ExitReason::ExitThread)
        );
        assert!(h
            .te
            .signals
            .take_interrupts()
            .iter()
            .any(|(tid, _)| *tid == other));
    }
}
