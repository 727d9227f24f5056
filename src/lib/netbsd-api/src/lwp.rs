//! Light-weight process creation.

bitflags::bitflags! {
    /// `_lwp_create` flags.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct LwpFlags: u64 {
        /// Nobody will wait for the LWP; its resources go when it exits.
        const LWP_DETACHED = 0x0000_0040;
        /// The LWP starts suspended, until someone calls `_lwp_continue`.
        const LWP_SUSPENDED = 0x0000_0080;
    }
}
