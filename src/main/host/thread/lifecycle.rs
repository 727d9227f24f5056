//! Running guest threads, from their first instruction to their exit.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};
use netbsd_api::signal::Signal;

use super::{ExitReason, ThreadStatus, Tid};
use crate::core::logger::guest_logger;
use crate::host::engine::{CoreGuard, Engine};
use crate::host::kernel::LwpMain;

/// Runs guest code. This is where the execution engine plugs in.
pub trait GuestRunner: Send + Sync {
    /// Runs `tid` until its exit reason is set. The big lock is held on entry
    /// and must be held on return.
    fn run(&self, engine: &Arc<Engine>, guard: &mut CoreGuard<'_>, tid: Tid);
}

/// Called by the last thread to finish, still holding the big lock.
///
/// The guard is handed over by value: the handler decides whether and when
/// the lock is released. Nothing else in the engine runs after this.
pub trait ShutdownHandler: Send + Sync {
    fn shutdown(&self, engine: &Engine, guard: CoreGuard<'_>, tid: Tid);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadOutcome {
    /// This was the last thread; the shutdown handler has run.
    Shutdown,
    /// The thread finished and its slot was released.
    Exited,
}

/// Runs `tid`, which must be in [`ThreadStatus::Init`], on the calling LWP.
pub fn run_a_thread(engine: &Arc<Engine>, tid: Tid) -> ThreadOutcome {
    guest_logger::set_current_tid(Some(tid));
    let mut guard = engine.lock();

    {
        let thread = guard.threads.get_mut(tid);
        assert_eq!(thread.status(), ThreadStatus::Init);
        thread.set_status(ThreadStatus::Runnable);
        thread.err_disablement_level = 0;
    }

    engine.tool().pre_thread_first_insn(tid);

    {
        let thread = guard.threads.get_mut(tid);
        thread.os_state.lwpid = engine.kernel().current_lwpid();
        thread.os_state.threadgroup = engine.kernel().getpid();
        log::debug!(
            "Thread {tid} running on lwp {}",
            thread.os_state.lwpid
        );
    }

    engine.hooks.runner.run(engine, &mut guard, tid);

    let outcome = finish_thread(engine, guard, tid);
    guest_logger::set_current_tid(None);
    outcome
}

fn finish_thread(engine: &Engine, mut guard: CoreGuard<'_>, tid: Tid) -> ThreadOutcome {
    {
        let thread = guard.threads.get_mut(tid);
        assert!(thread.is_alive());
        if thread.err_disablement_level > 0 {
            log::warn!(
                "WARNING: exiting thread has error reporting disabled. \
                 Possibly caused by a missing re-enable after a disable ({} levels).",
                thread.err_disablement_level
            );
            thread.err_disablement_level = 0;
        }
    }

    if guard.threads.count_living() == 1 {
        log::debug!("Last thread {tid} finished; shutting down");
        engine.tool().pre_thread_ll_exit(tid);
        engine.hooks.shutdown.shutdown(engine, guard, tid);
        return ThreadOutcome::Shutdown;
    }

    guard.threads.mark_zombie(tid);
    engine.tool().pre_thread_ll_exit(tid);

    let thread = guard.threads.get_mut(tid);
    let stack_id = thread.os_state.stack_id.take();
    let status = thread.status_cell().clone();
    let exitcode = thread.os_state.exitcode;
    if let Some(id) = stack_id {
        guard.stacks.deregister(id);
    }

    log::debug!("Thread {tid} exiting with code {exitcode}");
    drop(guard);

    engine.hooks.exit.exit_thread(&status, exitcode);
    ThreadOutcome::Exited
}

/// The entry point for a new LWP that will run `tid`.
pub fn lwp_main(engine: Arc<Engine>, tid: Tid) -> LwpMain {
    Box::new(move || {
        run_a_thread(&engine, tid);
    })
}

/// How the process should end.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    Signal(Signal),
}

impl ProcessExit {
    /// Works out the process exit status from the last thread's state.
    pub fn for_thread(guard: &CoreGuard<'_>, tid: Tid) -> Self {
        let thread = guard.threads.get(tid);
        match (thread.exitreason, thread.fatalsig) {
            (Some(ExitReason::FatalSig), Some(sig)) => ProcessExit::Signal(sig),
            _ => ProcessExit::Code(thread.os_state.exitcode),
        }
    }

    /// The status as a shell would report it.
    pub fn code(&self) -> i32 {
        match self {
            ProcessExit::Code(c) => *c,
            ProcessExit::Signal(sig) => 128 + sig.as_i32(),
        }
    }
}

/// Hands the final exit status to whoever is waiting for it.
#[derive(Debug)]
pub struct ShutdownLatch {
    tx: Sender<ProcessExit>,
    rx: Receiver<ProcessExit>,
    calls: Mutex<u32>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam::channel::bounded(1);
        Self {
            tx,
            rx,
            calls: Mutex::new(0),
        }
    }

    /// Blocks until the last thread has finished.
    pub fn wait(&self) -> ProcessExit {
        // We hold a sender, so the channel never disconnects.
        self.rx.recv().unwrap()
    }

    pub fn try_get(&self) -> Option<ProcessExit> {
        self.rx.try_recv().ok()
    }

    /// How many times shutdown has happened. Never more than one.
    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandler for ShutdownLatch {
    fn shutdown(&self, engine: &Engine, guard: CoreGuard<'_>, tid: Tid) {
        let exit = ProcessExit::for_thread(&guard, tid);
        let living = guard.threads.count_living();
        assert_eq!(living, 1, "shutdown with {living} threads alive");

        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        assert_eq!(*calls, 1, "shutdown ran twice");

        if engine.options.fd_policy.track_fds {
            for line in guard.fds.report() {
                log::info!("{line}");
            }
        }

        log::info!("Guest finished: {exit:?}");
        if self.tx.try_send(exit).is_err() {
            log::warn!("Exit status {exit:?} was not collected");
        }
    }
}
