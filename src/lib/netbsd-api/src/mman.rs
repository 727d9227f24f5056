bitflags::bitflags! {
    /// Memory protection (`PROT_*`).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ProtFlags: u32 {
        const PROT_READ = 0x1;
        const PROT_WRITE = 0x2;
        const PROT_EXEC = 0x4;
    }
}

bitflags::bitflags! {
    /// `mmap` flags (`MAP_*`).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const MAP_SHARED = 0x0001;
        const MAP_PRIVATE = 0x0002;
        const MAP_FIXED = 0x0010;
        const MAP_RENAME = 0x0020;
        const MAP_NORESERVE = 0x0040;
        const MAP_INHERIT = 0x0080;
        const MAP_HASSEMAPHORE = 0x0200;
        const MAP_TRYFIXED = 0x0400;
        const MAP_WIRED = 0x0800;
        const MAP_ANON = 0x1000;
        const MAP_STACK = 0x2000;
    }
}

impl ProtFlags {
    pub const RW: Self = Self::PROT_READ.union(Self::PROT_WRITE);
    pub const RWX: Self = Self::RW.union(Self::PROT_EXEC);
}
