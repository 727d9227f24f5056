use bytemuck::{Pod, Zeroable};

/// A NetBSD signal number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signal(i32);

impl Signal {
    pub const SIGHUP: Self = Self(1);
    pub const SIGINT: Self = Self(2);
    pub const SIGQUIT: Self = Self(3);
    pub const SIGILL: Self = Self(4);
    pub const SIGTRAP: Self = Self(5);
    pub const SIGABRT: Self = Self(6);
    pub const SIGEMT: Self = Self(7);
    pub const SIGFPE: Self = Self(8);
    pub const SIGKILL: Self = Self(9);
    pub const SIGBUS: Self = Self(10);
    pub const SIGSEGV: Self = Self(11);
    pub const SIGSYS: Self = Self(12);
    pub const SIGPIPE: Self = Self(13);
    pub const SIGALRM: Self = Self(14);
    pub const SIGTERM: Self = Self(15);
    pub const SIGURG: Self = Self(16);
    pub const SIGSTOP: Self = Self(17);
    pub const SIGTSTP: Self = Self(18);
    pub const SIGCONT: Self = Self(19);
    pub const SIGCHLD: Self = Self(20);
    pub const SIGUSR1: Self = Self(30);
    pub const SIGUSR2: Self = Self(31);
    pub const SIGPWR: Self = Self(32);
    pub const SIGRTMIN: Self = Self(33);
    pub const SIGRTMAX: Self = Self(63);

    /// Number of signal slots, including the unused slot 0.
    pub const NSIG: i32 = 64;

    /// Accepts only `1..NSIG`.
    pub fn new(val: i32) -> Option<Self> {
        (1..Self::NSIG).contains(&val).then_some(Self(val))
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl From<Signal> for i32 {
    fn from(val: Signal) -> i32 {
        val.0
    }
}

/// `sigset_t`: 128 bits, signal `n` is bit `n - 1`.
#[derive(Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SigSet {
    pub bits: [u32; 4],
}

impl SigSet {
    pub const EMPTY: Self = Self { bits: [0; 4] };
    pub const FULL: Self = Self {
        bits: [u32::MAX; 4],
    };

    fn word_and_mask(sig: Signal) -> (usize, u32) {
        let bit = (sig.0 - 1) as usize;
        (bit / 32, 1 << (bit % 32))
    }

    pub fn add(&mut self, sig: Signal) {
        let (word, mask) = Self::word_and_mask(sig);
        self.bits[word] |= mask;
    }

    pub fn del(&mut self, sig: Signal) {
        let (word, mask) = Self::word_and_mask(sig);
        self.bits[word] &= !mask;
    }

    pub fn has(&self, sig: Signal) -> bool {
        let (word, mask) = Self::word_and_mask(sig);
        self.bits[word] & mask != 0
    }

    /// Removes the signals that can never be blocked.
    pub fn without_unblockable(mut self) -> Self {
        self.del(Signal::SIGKILL);
        self.del(Signal::SIGSTOP);
        self
    }
}

impl core::fmt::Debug for SigSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SigSet({:08x}:{:08x}:{:08x}:{:08x})",
            self.bits[3], self.bits[2], self.bits[1], self.bits[0]
        )
    }
}

/// Set in `StackT::ss_flags` while executing on the alternate stack.
pub const SS_ONSTACK: i32 = 0x0001;
/// Set in `StackT::ss_flags` when the alternate stack is disabled.
pub const SS_DISABLE: i32 = 0x0004;

/// `stack_t`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StackT {
    pub ss_sp: u64,
    pub ss_size: u64,
    pub ss_flags: i32,
    pub _pad: u32,
}

static_assertions::assert_eq_size!(StackT, [u8; 24]);

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

/// `struct sigaction`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SigAction {
    pub sa_handler: u64,
    pub sa_mask: SigSet,
    pub sa_flags: i32,
    pub _pad: u32,
}

static_assertions::assert_eq_size!(SigAction, [u8; 32]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigset_bits() {
        let mut set = SigSet::EMPTY;
        set.add(Signal::SIGKILL);
        set.add(Signal::SIGRTMAX);
        assert_eq!(set.bits, [1 << 8, 1 << 30, 0, 0]);
        assert!(set.has(Signal::SIGRTMAX));
        assert!(!set.has(Signal::SIGSTOP));
        assert_eq!(set.without_unblockable().bits[0], 0);
        assert!(set.without_unblockable().has(Signal::SIGRTMAX));
    }

    #[test]
    fn test_signal_range() {
        assert_eq!(Signal::new(0), None);
        assert_eq!(Signal::new(63), Some(Signal::SIGRTMAX));
        assert_eq!(Signal::new(64), None);
    }
}
