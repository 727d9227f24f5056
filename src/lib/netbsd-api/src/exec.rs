use bytemuck::{Pod, Zeroable};

/// The process-strings record (`struct ps_strings`) the kernel places at the
/// very top of a new process's stack. `ps` and `setproctitle()` find the
/// argument and environment vectors through it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PsStrings {
    pub ps_argvstr: u64,
    pub ps_nargvstr: u32,
    pub _pad0: u32,
    pub ps_envstr: u64,
    pub ps_nenvstr: u32,
    pub _pad1: u32,
}

static_assertions::assert_eq_size!(PsStrings, [u8; 32]);

/// Initial value of `%rflags` for a new user process: interrupts enabled plus
/// the always-one reserved bit.
pub const PSL_USERSET: u64 = 0x202;

pub const ELFMAG: [u8; 4] = *b"\x7fELF";
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;
pub const PT_INTERP: u32 = 3;
pub const PT_PHDR: u32 = 6;
pub const PT_GNU_STACK: u32 = 0x6474_e551;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

/// ELF file header (`Elf64_Ehdr`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

static_assertions::assert_eq_size!(Elf64Ehdr, [u8; 64]);

/// Program header (`Elf64_Phdr`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

static_assertions::assert_eq_size!(Elf64Phdr, [u8; 56]);
