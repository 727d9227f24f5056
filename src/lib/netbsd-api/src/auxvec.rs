use bytemuck::{Pod, Zeroable};

/// Auxiliary vector entry types, as placed on the initial stack by
/// `elf_copyargs()`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u64)]
#[allow(non_camel_case_types)]
pub enum AuxVecTag {
    AT_NULL = 0,
    AT_IGNORE = 1,
    AT_EXECFD = 2,
    AT_PHDR = 3,
    AT_PHENT = 4,
    AT_PHNUM = 5,
    AT_PAGESZ = 6,
    AT_BASE = 7,
    AT_FLAGS = 8,
    AT_ENTRY = 9,
    AT_DCACHEBSIZE = 10,
    AT_ICACHEBSIZE = 11,
    AT_UCACHEBSIZE = 12,
    AT_STACKBASE = 13,
    AT_EUID = 2000,
    AT_RUID = 2001,
    AT_EGID = 2002,
    AT_RGID = 2003,
    AT_SUN_LDELF = 2004,
    AT_SUN_LDSHDR = 2005,
    AT_SUN_LDNAME = 2006,
    AT_SUN_LPGSIZE = 2007,
    AT_SUN_PLATFORM = 2008,
    AT_SUN_HWCAP = 2009,
    AT_SUN_IFLUSH = 2010,
    AT_SUN_CPU = 2011,
    AT_SUN_EMUL_ENTRY = 2012,
    AT_SUN_EMUL_EXECFD = 2013,
    AT_SUN_EXECNAME = 2014,
}

/// One `(type, value)` pair of the auxiliary vector (`Aux64Info`).
///
/// The tag is kept as a raw integer since a prototype vector may contain
/// types we don't know about.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AuxvEntry {
    pub a_type: u64,
    pub a_v: u64,
}

impl AuxvEntry {
    pub const NULL: Self = Self { a_type: 0, a_v: 0 };

    pub fn new(tag: AuxVecTag, val: u64) -> Self {
        Self {
            a_type: tag.into(),
            a_v: val,
        }
    }

    pub fn tag(&self) -> Option<AuxVecTag> {
        AuxVecTag::try_from(self.a_type).ok()
    }
}

static_assertions::assert_eq_size!(AuxvEntry, [u64; 2]);
