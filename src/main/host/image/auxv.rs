//! The auxiliary vector handed to the guest.
//!
//! The guest's vector is modelled on the one the engine itself was started
//! with, so that it carries the same entries in the same order as the kernel
//! would have produced. Entries whose values describe the engine rather than
//! the guest are replaced.

use netbsd_api::auxvec::{AuxVecTag, AuxvEntry};
use netbsd_api::limits::PAGE_SIZE;

use super::loader::ExeInfo;

/// Where the running process's own auxiliary vector can be read.
const HOST_AUXV_PATH: &str = "/proc/self/auxv";

/// The engine's own auxiliary vector, up to but not including `AT_NULL`.
/// Falls back to [`netbsd_prototype`] if it can't be read.
pub fn host_auxv() -> Vec<AuxvEntry> {
    match std::fs::read(HOST_AUXV_PATH) {
        Ok(bytes) => {
            let entries = parse_auxv(&bytes);
            log::debug!("Read {} auxv entries from {HOST_AUXV_PATH}", entries.len());
            entries
        }
        Err(e) => {
            log::debug!("Can't read {HOST_AUXV_PATH} ({e}); using the default auxv layout");
            netbsd_prototype()
        }
    }
}

/// Entries from a raw auxiliary vector, stopping at `AT_NULL`.
pub fn parse_auxv(bytes: &[u8]) -> Vec<AuxvEntry> {
    bytes
        .chunks_exact(std::mem::size_of::<AuxvEntry>())
        .map(bytemuck::pod_read_unaligned::<AuxvEntry>)
        .take_while(|e| e.a_type != u64::from(AuxVecTag::AT_NULL))
        .collect()
}

/// The entries NetBSD's `elf_copyargs()` produces, in its order. Only the
/// tags matter; every value that depends on the guest is filled in later.
pub fn netbsd_prototype() -> Vec<AuxvEntry> {
    let uid = nix::unistd::getuid().as_raw();
    let euid = nix::unistd::geteuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let egid = nix::unistd::getegid().as_raw();

    vec![
        AuxvEntry::new(AuxVecTag::AT_PHDR, 0),
        AuxvEntry::new(AuxVecTag::AT_PHENT, 56),
        AuxvEntry::new(AuxVecTag::AT_PHNUM, 0),
        AuxvEntry::new(AuxVecTag::AT_PAGESZ, PAGE_SIZE as u64),
        AuxvEntry::new(AuxVecTag::AT_BASE, 0),
        AuxvEntry::new(AuxVecTag::AT_FLAGS, 0),
        AuxvEntry::new(AuxVecTag::AT_ENTRY, 0),
        AuxvEntry::new(AuxVecTag::AT_EUID, euid.into()),
        AuxvEntry::new(AuxVecTag::AT_RUID, uid.into()),
        AuxvEntry::new(AuxVecTag::AT_EGID, egid.into()),
        AuxvEntry::new(AuxVecTag::AT_RGID, gid.into()),
        AuxvEntry::new(AuxVecTag::AT_STACKBASE, 0),
        AuxvEntry::new(AuxVecTag::AT_SUN_EXECNAME, 0),
    ]
}

/// How one prototype entry appears in the guest's vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientAuxv {
    Entry(AuxvEntry),
    /// `AT_SUN_EXECNAME`, whose value must point at a copy of the executable
    /// name in the guest's string table.
    ExecName,
}

/// Whether `entry` needs space in the string table.
pub fn needs_string(entry: &AuxvEntry) -> bool {
    entry.tag() == Some(AuxVecTag::AT_SUN_EXECNAME)
}

/// The guest's version of prototype entry `entry`. `stack_base` is the
/// highest byte of the guest's stack.
pub fn fix_entry(entry: AuxvEntry, exe: &ExeInfo, stack_base: usize) -> ClientAuxv {
    use AuxVecTag::*;

    let with = |val: u64| ClientAuxv::Entry(AuxvEntry { a_v: val, ..entry });
    let ignore = ClientAuxv::Entry(AuxvEntry {
        a_type: AT_IGNORE.into(),
        ..entry
    });

    match entry.tag() {
        // Nothing that refers to the engine.
        Some(AT_IGNORE | AT_PHENT | AT_PAGESZ | AT_FLAGS | AT_EUID | AT_RUID | AT_EGID | AT_RGID) => {
            ClientAuxv::Entry(entry)
        }
        Some(AT_PHDR) if exe.phdr == 0 => ignore,
        Some(AT_PHDR) => with(exe.phdr),
        Some(AT_PHNUM) if exe.phdr == 0 => ignore,
        Some(AT_PHNUM) => with(exe.phnum),
        Some(AT_BASE) => with(exe.interp_offset),
        Some(AT_ENTRY) => with(exe.entry),
        Some(AT_STACKBASE) => with(stack_base as u64),
        Some(AT_SUN_EXECNAME) => ClientAuxv::ExecName,
        _ => {
            log_once_per_value_at_level!(
                entry.a_type,
                u64,
                log::Level::Debug,
                log::Level::Trace,
                "Stomping auxv entry {}",
                entry.a_type
            );
            ignore
        }
    }
}
