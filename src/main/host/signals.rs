//! The boundary with signal delivery, which lives outside this crate. The
//! syscall layer only installs handlers, asks for pending signals to be
//! polled, and kicks threads out of blocking syscalls.

use std::sync::Mutex;

use netbsd_api::errno::Errno;
use netbsd_api::signal::{SigAction, Signal, SIG_DFL};

use crate::host::thread::Tid;

/// A handler installation as requested through `__sigaction_sigtramp`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SigActionRequest {
    pub action: SigAction,
    /// Guest address of the signal return trampoline.
    pub tramp: u64,
    /// Trampoline ABI version.
    pub tramp_abi: i32,
}

pub trait SignalSubsystem: Send + Sync {
    /// Installs `new` (if given) for `sig`, returning the previous action
    /// through `old` (if given).
    fn sigaction(
        &self,
        sig: i32,
        new: Option<&SigActionRequest>,
        old: Option<&mut SigAction>,
    ) -> Result<(), Errno>;

    /// Delivers any signals that became pending for `tid`.
    fn poll_signals(&self, tid: Tid);

    /// Forces `tid`, running as `lwpid`, out of a blocking syscall.
    fn interrupt_thread(&self, tid: Tid, lwpid: u32);
}

#[derive(Debug)]
struct Installed {
    handlers: Vec<Option<SigActionRequest>>,
    polls: Vec<Tid>,
    interrupts: Vec<(Tid, u32)>,
}

/// Keeps the handler table for the guest. Delivery itself is left to the
/// execution engine, which asks for the installed handlers.
#[derive(Debug)]
pub struct SignalTable {
    inner: Mutex<Installed>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Installed {
                handlers: vec![None; Signal::NSIG as usize],
                polls: Vec::new(),
                interrupts: Vec::new(),
            }),
        }
    }

    pub fn handler(&self, sig: Signal) -> Option<SigActionRequest> {
        self.inner.lock().unwrap().handlers[sig.as_i32() as usize]
    }

    /// Threads that asked for a poll since the last call.
    pub fn take_polls(&self) -> Vec<Tid> {
        std::mem::take(&mut self.inner.lock().unwrap().polls)
    }

    pub fn take_interrupts(&self) -> Vec<(Tid, u32)> {
        std::mem::take(&mut self.inner.lock().unwrap().interrupts)
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSubsystem for SignalTable {
    fn sigaction(
        &self,
        sig: i32,
        new: Option<&SigActionRequest>,
        old: Option<&mut SigAction>,
    ) -> Result<(), Errno> {
        let sig = Signal::new(sig).ok_or(Errno::EINVAL)?;

        if let Some(new) = new {
            if (sig == Signal::SIGKILL || sig == Signal::SIGSTOP)
                && new.action.sa_handler != SIG_DFL
            {
                return Err(Errno::EINVAL);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.handlers[sig.as_i32() as usize];

        if let Some(old) = old {
            *old = slot.map(|r| r.action).unwrap_or_default();
        }
        if let Some(new) = new {
            log::debug!(
                "sigaction: signal {} handler {:#x} tramp {:#x}",
                sig.as_i32(),
                new.action.sa_handler,
                new.tramp
            );
            *slot = Some(*new);
        }
        Ok(())
    }

    fn poll_signals(&self, tid: Tid) {
        self.inner.lock().unwrap().polls.push(tid);
    }

    fn interrupt_thread(&self, tid: Tid, lwpid: u32) {
        log::debug!("Interrupting thread {tid} (lwp {lwpid})");
        self.inner.lock().unwrap().interrupts.push((tid, lwpid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(handler: u64) -> SigActionRequest {
        SigActionRequest {
            action: SigAction {
                sa_handler: handler,
                ..Default::default()
            },
            tramp: 0x7000,
            tramp_abi: 2,
        }
    }

    #[test]
    fn test_install_and_replace() {
        let table = SignalTable::new();
        let mut old = SigAction::default();
        table
            .sigaction(Signal::SIGUSR1.as_i32(), Some(&request(0x1234)), Some(&mut old))
            .unwrap();
        assert_eq!(old.sa_handler, SIG_DFL);

        table
            .sigaction(Signal::SIGUSR1.as_i32(), Some(&request(0x5678)), Some(&mut old))
            .unwrap();
        assert_eq!(old.sa_handler, 0x1234);
        assert_eq!(table.handler(Signal::SIGUSR1).unwrap().action.sa_handler, 0x5678);
    }

    #[test]
    fn test_rejects() {
        let table = SignalTable::new();
        assert_eq!(table.sigaction(0, None, None), Err(Errno::EINVAL));
        assert_eq!(table.sigaction(64, None, None), Err(Errno::EINVAL));
        assert_eq!(
            table.sigaction(Signal::SIGKILL.as_i32(), Some(&request(0x1234)), None),
            Err(Errno::EINVAL)
        );
        assert_eq!(
            table.sigaction(Signal::SIGKILL.as_i32(), Some(&request(SIG_DFL)), None),
            Ok(())
        );
    }
}
