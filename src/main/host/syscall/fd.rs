//! Which descriptors the guest may use, and which it has open.

use std::collections::{BTreeMap, BTreeSet};

use crate::host::thread::Tid;

/// Descriptors at the top of the soft limit are kept for the engine.
pub const ENGINE_RESERVED_FDS: i32 = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdPolicy {
    /// Descriptors at or above this belong to the engine.
    pub hard_limit: i32,
    /// Engine descriptors below `hard_limit`, e.g. a log file.
    pub reserved: BTreeSet<i32>,
    /// Keep a record of every descriptor the guest opens.
    pub track_fds: bool,
}

impl FdPolicy {
    /// A policy for a process whose descriptor soft limit is `soft_limit`.
    pub fn from_soft_limit(soft_limit: i32, track_fds: bool) -> Self {
        Self {
            hard_limit: (soft_limit - ENGINE_RESERVED_FDS).max(0),
            reserved: BTreeSet::new(),
            track_fds,
        }
    }

    /// Whether the guest may use `fd`. `syscall` names the caller for the
    /// warning given when a syscall returns an engine descriptor.
    pub fn fd_allowed(&self, fd: i32, syscall: &str, tid: Tid, is_new: bool) -> bool {
        if fd < 0 || fd >= self.hard_limit || self.reserved.contains(&fd) {
            if is_new {
                log::warn!("Thread {tid}: {syscall} returned fd {fd}, which is reserved");
            } else {
                log::debug!("Thread {tid}: {syscall} on reserved fd {fd}");
            }
            return false;
        }
        true
    }
}

impl Default for FdPolicy {
    fn default() -> Self {
        Self::from_soft_limit(1024, false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenFd {
    pub opened_by: Tid,
    /// The syscall that created it.
    pub origin: &'static str,
}

/// Descriptors the guest has opened through syscalls we intercept.
#[derive(Debug, Default)]
pub struct FdTracker {
    open: BTreeMap<i32, OpenFd>,
}

impl FdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&mut self, tid: Tid, fd: i32, origin: &'static str) {
        log::trace!("Thread {tid}: fd {fd} opened by {origin}");
        self.open.insert(
            fd,
            OpenFd {
                opened_by: tid,
                origin,
            },
        );
    }

    pub fn record_close(&mut self, fd: i32) {
        self.open.remove(&fd);
    }

    pub fn get(&self, fd: i32) -> Option<&OpenFd> {
        self.open.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// What's still open, one line per descriptor after a summary line.
    pub fn report(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "FILE DESCRIPTORS: {} open at exit.",
            self.open.len()
        )];
        for (fd, open) in &self.open {
            lines.push(format!(
                "Open file descriptor {fd}: opened by thread {} ({})",
                open.opened_by, open.origin
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_allowed() {
        let mut policy = FdPolicy::from_soft_limit(64, false);
        policy.reserved.insert(3);
        assert!(policy.fd_allowed(0, "pipe", Tid::MAIN, true));
        assert!(policy.fd_allowed(51, "pipe", Tid::MAIN, true));
        assert!(!policy.fd_allowed(52, "pipe", Tid::MAIN, true));
        assert!(!policy.fd_allowed(-1, "fcntl", Tid::MAIN, false));
        assert!(!policy.fd_allowed(3, "ioctl", Tid::MAIN, false));
    }

    #[test]
    fn test_tracker() {
        let mut fds = FdTracker::new();
        fds.record_open(Tid::MAIN, 5, "pipe");
        assert_eq!(fds.get(5).unwrap().origin, "pipe");
        fds.record_close(5);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_report() {
        let mut fds = FdTracker::new();
        assert_eq!(fds.report(), vec!["FILE DESCRIPTORS: 0 open at exit."]);

        fds.record_open(Tid::MAIN, 7, "socket");
        fds.record_open(Tid::MAIN, 4, "pipe");
        assert_eq!(
            fds.report(),
            vec![
                "FILE DESCRIPTORS: 2 open at exit.",
                "Open file descriptor 4: opened by thread 1 (pipe)",
                "Open file descriptor 7: opened by thread 1 (socket)",
            ]
        );
    }
}
