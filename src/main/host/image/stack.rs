//! The main thread's initial stack.
//!
//! The stack is built downwards from `clstack_end`, the highest byte of the
//! area the address space set aside for it:
//!
//! ```text
//! higher address +-----------------+ <- clstack_end
//!                | ps_strings      |
//!                +-----------------+
//!                | string table    |
//!                +-----------------+
//!                | auxv, AT_NULL   |
//!                +-----------------+
//!                | envp, NULL      |
//!                +-----------------+
//!                | argv, NULL      |
//!                +-----------------+
//!                | argc            |
//! lower address  +-----------------+ <- client_sp
//! ```
//!
//! Below the part that's in use there is more mapped stack, then a
//! reservation that the mapping grows down into as the guest's stack pointer
//! descends.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

use guest_helper::page::{page_round_down, page_round_up, round_down, round_up, PAGE_SIZE};
use netbsd_api::auxvec::{AuxVecTag, AuxvEntry};
use netbsd_api::exec::PsStrings;
use netbsd_api::limits::STACK_REDZONE_SIZE;

use super::auxv::{self, ClientAuxv};
use super::loader::ExeInfo;
use crate::host::memory::{AddressSpace, MemError, ShrinkMode};

const MIB: usize = 1024 * 1024;
const WORD: usize = std::mem::size_of::<u64>();
const AUXV_ENTRY: usize = std::mem::size_of::<AuxvEntry>();
const PSS: usize = std::mem::size_of::<PsStrings>();

/// Largest stack the resource limit alone can give the main thread.
pub const STACK_RLIMIT_MAX: usize = 16 * MIB;
/// Smallest main thread stack, whatever was asked for.
pub const STACK_MIN: usize = MIB;

/// Maximum size of the main thread's stack: the stack resource limit clamped
/// to `[1 MiB, 16 MiB]`, unless `main_stacksize` asks for a size.
pub fn main_stack_size(rlimit_cur: u64, main_stacksize: usize) -> usize {
    let rlimit = usize::try_from(rlimit_cur).unwrap_or(usize::MAX);
    let mut size = rlimit.clamp(STACK_MIN, STACK_RLIMIT_MAX);
    if main_stacksize > 0 {
        size = main_stacksize;
    }
    page_round_up(size.max(STACK_MIN))
}

/// What the stack is built from.
#[derive(Copy, Clone, Debug)]
pub struct StackContents<'a> {
    pub exe: &'a ExeInfo,
    /// Guest arguments, not including the program name.
    pub args: &'a [OsString],
    pub env: &'a [OsString],
    /// Prototype auxiliary vector. Anything from an `AT_NULL` on is ignored.
    pub auxv: &'a [AuxvEntry],
}

impl StackContents<'_> {
    /// The strings `argv` points at: a `#!` interpreter and its argument,
    /// the executable, then the arguments.
    fn argv(&self) -> Vec<&[u8]> {
        let exe = self.exe;
        exe.interp_name
            .iter()
            .chain(exe.interp_args.iter())
            .map(|s| s.as_bytes())
            .chain(std::iter::once(exe.path.as_os_str().as_bytes()))
            .chain(self.args.iter().map(|s| s.as_bytes()))
            .collect()
    }

    fn auxv_prototype(&self) -> impl Iterator<Item = &AuxvEntry> + '_ {
        self.auxv
            .iter()
            .take_while(|e| e.a_type != u64::from(AuxVecTag::AT_NULL))
    }

    /// Bytes of string table needed, including terminators.
    fn string_size(&self) -> usize {
        let exe_name_len = self.exe.path.as_os_str().len();
        let argv: usize = self.argv().iter().map(|s| s.len() + 1).sum();
        let env: usize = self.env.iter().map(|s| s.len() + 1).sum();
        let auxv: usize = self
            .auxv_prototype()
            .filter(|e| auxv::needs_string(e))
            .map(|_| exe_name_len + 1)
            .sum();
        argv + env + auxv
    }
}

/// Where everything on the stack goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackLayout {
    /// Highest byte of the stack.
    pub clstack_end: usize,
    /// Page-rounded maximum size of the stack.
    pub max_size: usize,
    /// Initial stack pointer, pointing at `argc`.
    pub client_sp: usize,
    pub strtab: usize,
    pub string_size: usize,
    pub pss: usize,
    pub anon_start: usize,
    pub anon_size: usize,
    pub resvn_start: usize,
    pub resvn_size: usize,
}

impl StackLayout {
    pub fn plan(
        contents: &StackContents,
        clstack_end: usize,
        max_size: usize,
    ) -> Result<Self, MemError> {
        assert!(guest_helper::page::is_page_aligned(clstack_end + 1));

        let argc = contents.argv().len();
        let envc = contents.env.len();
        let string_size = contents.string_size();
        let auxsize = (contents.auxv_prototype().count() + 1) * AUXV_ENTRY;

        let stacksize = WORD // argc
            + WORD * argc + WORD // argv
            + WORD * envc + WORD // envp
            + auxsize
            + PSS
            + round_up(string_size, WORD);

        let client_sp = round_down(
            clstack_end
                .checked_sub(stacksize)
                .ok_or(MemError::OutOfRange)?,
            16,
        );
        let strtab = clstack_end - PSS - round_up(string_size, std::mem::size_of::<u32>());
        let clstack_start = page_round_down(client_sp);
        let max_size = page_round_up(max_size);

        let mut anon_size = clstack_end - clstack_start + 1;
        let mut anon_start = clstack_start;
        let mut resvn_size = max_size
            .checked_sub(anon_size)
            .ok_or(MemError::OutOfRange)?;
        let resvn_start = anon_start - resvn_size;

        // The stack pointer may be near the bottom of its page, leaving no
        // room for the redzone below it. One more page always covers it.
        if STACK_REDZONE_SIZE > 0 {
            if resvn_size <= PAGE_SIZE {
                return Err(MemError::OutOfRange);
            }
            resvn_size -= PAGE_SIZE;
            anon_start -= PAGE_SIZE;
            anon_size += PAGE_SIZE;
        }
        assert_eq!(resvn_start, clstack_end + 1 - max_size);

        Ok(Self {
            clstack_end,
            max_size,
            client_sp,
            strtab,
            string_size,
            pss: clstack_end - PSS,
            anon_start,
            anon_size,
            resvn_start,
            resvn_size,
        })
    }
}

/// Writes the stack image for a [`StackLayout`] into a local buffer. Words
/// are pushed upwards from the stack pointer and strings appended to the
/// string table; the string table must end up exactly full.
struct StackBuilder<'a> {
    layout: &'a StackLayout,
    /// Covers `[client_sp, clstack_end]`.
    buf: Vec<u8>,
    /// Offset of the next word.
    words: usize,
    /// Offset of the next string.
    strings: usize,
}

impl<'a> StackBuilder<'a> {
    fn new(layout: &'a StackLayout) -> Self {
        Self {
            layout,
            buf: vec![0; layout.clstack_end + 1 - layout.client_sp],
            words: 0,
            strings: layout.strtab - layout.client_sp,
        }
    }

    /// Guest address of the next word.
    fn word_addr(&self) -> u64 {
        (self.layout.client_sp + self.words) as u64
    }

    fn push_word(&mut self, val: u64) {
        self.buf[self.words..self.words + WORD].copy_from_slice(&val.to_ne_bytes());
        self.words += WORD;
    }

    fn push_auxv(&mut self, entry: AuxvEntry) {
        self.push_word(entry.a_type);
        self.push_word(entry.a_v);
    }

    /// Appends `s` and a NUL to the string table, returning the copy's guest
    /// address.
    fn copy_str(&mut self, s: &[u8]) -> u64 {
        let table_end = self.layout.strtab - self.layout.client_sp + self.layout.string_size;
        assert!(
            self.strings + s.len() < table_end,
            "string table overflow"
        );
        let addr = self.layout.client_sp + self.strings;
        self.buf[self.strings..self.strings + s.len()].copy_from_slice(s);
        self.buf[self.strings + s.len()] = 0;
        self.strings += s.len() + 1;
        addr as u64
    }

    fn put_pss(&mut self, pss: &PsStrings) {
        let at = self.layout.pss - self.layout.client_sp;
        self.buf[at..at + PSS].copy_from_slice(bytemuck::bytes_of(pss));
    }

    fn finish(self) -> Vec<u8> {
        let strtab = self.layout.strtab - self.layout.client_sp;
        assert_eq!(self.strings - strtab, self.layout.string_size);
        assert!(self.words <= strtab, "stack vectors run into the string table");
        self.buf
    }
}

/// The main thread's stack once it's built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClientStack {
    pub layout: StackLayout,
    pub argc: usize,
    pub argv: u64,
    pub envc: usize,
    pub envp: u64,
    pub auxv: u64,
}

impl ClientStack {
    /// Lowest byte of the mapped part of the stack.
    pub fn start_base(&self) -> usize {
        self.layout.anon_start
    }

    pub fn end(&self) -> usize {
        self.layout.clstack_end
    }
}

/// Maps the main thread's stack below `clstack_end` and fills it in.
pub fn setup_client_stack(
    aspace: &dyn AddressSpace,
    contents: &StackContents,
    clstack_end: usize,
    max_size: usize,
) -> Result<ClientStack, MemError> {
    let layout = StackLayout::plan(contents, clstack_end, max_size)?;
    log::debug!(
        "Client stack: sp {:#x}, mapped {:#x}+{:#x}, reserved {:#x}+{:#x}",
        layout.client_sp,
        layout.anon_start,
        layout.anon_size,
        layout.resvn_start,
        layout.resvn_size
    );

    // A reservation that shrinks from the top, with the mapped stack on top
    // of it: together they grow down.
    aspace.create_reservation(
        layout.resvn_start,
        layout.resvn_size,
        ShrinkMode::SmUpper,
        layout.anon_size,
    )?;
    aspace.map_anon_fixed(layout.anon_start, layout.anon_size, contents.exe.stack_prot)?;

    let mut b = StackBuilder::new(&layout);

    let argv_strings = contents.argv();
    let argc = argv_strings.len();
    b.push_word(argc as u64);

    let argv = b.word_addr();
    for s in argv_strings {
        let p = b.copy_str(s);
        b.push_word(p);
    }
    b.push_word(0);

    let envp = b.word_addr();
    for var in contents.env {
        let p = b.copy_str(var.as_bytes());
        b.push_word(p);
    }
    b.push_word(0);

    let auxv_addr = b.word_addr();
    for proto in contents.auxv_prototype() {
        match auxv::fix_entry(*proto, contents.exe, clstack_end) {
            ClientAuxv::Entry(entry) => b.push_auxv(entry),
            ClientAuxv::ExecName => {
                let p = b.copy_str(contents.exe.path.as_os_str().as_bytes());
                b.push_auxv(AuxvEntry { a_v: p, ..*proto });
            }
        }
    }
    b.push_auxv(AuxvEntry::NULL);

    let envc = contents.env.len();
    b.put_pss(&PsStrings {
        ps_argvstr: argv,
        ps_nargvstr: argc as u32,
        ps_envstr: envp,
        ps_nenvstr: envc as u32,
        ..Default::default()
    });

    let image = b.finish();
    aspace.write_bytes(layout.client_sp, &image)?;

    Ok(ClientStack {
        layout,
        argc,
        argv,
        envc,
        envp,
        auxv: auxv_addr,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use guest_helper::syscall_types::ForeignPtr;
    use netbsd_api::mman::ProtFlags;

    use super::*;
    use crate::host::memory::sim::{SimAddressSpace, SIM_CLIENT_STACK_END};
    use crate::host::memory::SegKind;

    fn exe() -> ExeInfo {
        ExeInfo {
            path: PathBuf::from("/usr/bin/prog"),
            entry: 0x40_0100,
            init_ip: 0x40_0100,
            phdr: 0x40_0040,
            phnum: 5,
            interp_offset: 0,
            brkbase: 0x60_1000,
            interp_name: None,
            interp_args: None,
            stack_prot: ProtFlags::RW,
        }
    }

    fn strings(vals: &[&str]) -> Vec<OsString> {
        vals.iter().map(OsString::from).collect()
    }

    fn read_word(aspace: &dyn AddressSpace, addr: u64) -> u64 {
        aspace.read_val(ForeignPtr::<u64>::from_raw(addr as usize)).unwrap()
    }

    fn read_str(aspace: &dyn AddressSpace, addr: u64) -> String {
        let bytes = aspace
            .read_cstring(ForeignPtr::from_raw(addr as usize), 4096)
            .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    fn read_vec(aspace: &dyn AddressSpace, mut addr: u64) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            let p = read_word(aspace, addr);
            if p == 0 {
                return out;
            }
            out.push(read_str(aspace, p));
            addr += 8;
        }
    }

    #[test]
    fn test_main_stack_size() {
        assert_eq!(main_stack_size(8 * MIB as u64, 0), 8 * MIB);
        assert_eq!(main_stack_size(u64::MAX, 0), 16 * MIB);
        assert_eq!(main_stack_size(4096, 0), MIB);
        assert_eq!(main_stack_size(8 * MIB as u64, 64 * MIB), 64 * MIB);
        assert_eq!(main_stack_size(8 * MIB as u64, 100), MIB);
        assert_eq!(main_stack_size(8 * MIB as u64, 2 * MIB + 1), 2 * MIB + PAGE_SIZE);
    }

    #[test]
    fn test_layout_invariants() {
        let exe = exe();
        let args = strings(&["a", "bb", "ccc"]);
        let env = strings(&["X=1", "LONGER=yes"]);
        let auxv = auxv::netbsd_prototype();
        let contents = StackContents {
            exe: &exe,
            args: &args,
            env: &env,
            auxv: &auxv,
        };
        let layout = StackLayout::plan(&contents, SIM_CLIENT_STACK_END, 8 * MIB).unwrap();

        assert_eq!(layout.client_sp % 16, 0);
        assert!(layout.anon_start <= layout.client_sp);
        assert!(layout.client_sp < layout.strtab);
        assert_eq!(layout.pss, SIM_CLIENT_STACK_END - 32);
        assert_eq!(layout.resvn_start + layout.resvn_size, layout.anon_start);
        assert_eq!(layout.anon_start + layout.anon_size, SIM_CLIENT_STACK_END + 1);
        assert_eq!(layout.resvn_size + layout.anon_size, 8 * MIB);
        // "/usr/bin/prog" twice (argv and AT_SUN_EXECNAME) plus the rest.
        assert_eq!(layout.string_size, 2 * 14 + 2 + 3 + 4 + 4 + 11);
    }

    #[test]
    fn test_stack_contents() {
        let aspace = SimAddressSpace::new();
        let exe = exe();
        let args = strings(&["-v", "file"]);
        let env = strings(&["HOME=/home/guest", "LD_PRELOAD=x.so"]);
        let auxv = auxv::netbsd_prototype();
        let contents = StackContents {
            exe: &exe,
            args: &args,
            env: &env,
            auxv: &auxv,
        };
        let stack = setup_client_stack(&aspace, &contents, SIM_CLIENT_STACK_END, MIB).unwrap();
        let sp = stack.layout.client_sp as u64;
        let aspace: &dyn AddressSpace = &aspace;

        assert_eq!(read_word(aspace, sp), 3);
        assert_eq!(stack.argv, sp + 8);
        assert_eq!(
            read_vec(aspace, stack.argv),
            vec!["/usr/bin/prog", "-v", "file"]
        );
        assert_eq!(stack.envp, stack.argv + 4 * 8);
        assert_eq!(
            read_vec(aspace, stack.envp),
            vec!["HOME=/home/guest", "LD_PRELOAD=x.so"]
        );

        // The auxiliary vector follows the environment.
        assert_eq!(stack.auxv, stack.envp + 3 * 8);
        let mut entries = Vec::new();
        let mut at = stack.auxv;
        loop {
            let entry: AuxvEntry = aspace.read_val(ForeignPtr::from_raw(at as usize)).unwrap();
            if entry == AuxvEntry::NULL {
                break;
            }
            entries.push(entry);
            at += 16;
        }
        assert_eq!(entries.len(), auxv.len());
        let value = |tag: AuxVecTag| {
            entries
                .iter()
                .find(|e| e.tag() == Some(tag))
                .map(|e| e.a_v)
                .unwrap()
        };
        assert_eq!(value(AuxVecTag::AT_PHDR), 0x40_0040);
        assert_eq!(value(AuxVecTag::AT_PHNUM), 5);
        assert_eq!(value(AuxVecTag::AT_ENTRY), 0x40_0100);
        assert_eq!(value(AuxVecTag::AT_BASE), 0);
        assert_eq!(value(AuxVecTag::AT_STACKBASE), SIM_CLIENT_STACK_END as u64);
        assert_eq!(
            read_str(aspace, value(AuxVecTag::AT_SUN_EXECNAME)),
            "/usr/bin/prog"
        );

        let pss: PsStrings = aspace
            .read_val(ForeignPtr::from_raw(stack.layout.pss))
            .unwrap();
        assert_eq!(pss.ps_argvstr, stack.argv);
        assert_eq!(pss.ps_nargvstr, 3);
        assert_eq!(pss.ps_envstr, stack.envp);
        assert_eq!(pss.ps_nenvstr, 2);
    }

    #[test]
    fn test_script_argv() {
        let aspace = SimAddressSpace::new();
        let exe = ExeInfo {
            path: PathBuf::from("/home/guest/run.sh"),
            interp_name: Some(OsString::from("/bin/sh")),
            interp_args: Some(OsString::from("-e")),
            ..exe()
        };
        let args = strings(&["one"]);
        let contents = StackContents {
            exe: &exe,
            args: &args,
            env: &[],
            auxv: &[],
        };
        let stack = setup_client_stack(&aspace, &contents, SIM_CLIENT_STACK_END, MIB).unwrap();
        assert_eq!(stack.argc, 4);
        assert_eq!(
            read_vec(&aspace, stack.argv),
            vec!["/bin/sh", "-e", "/home/guest/run.sh", "one"]
        );
        assert_eq!(stack.envc, 0);
    }

    #[test]
    fn test_growdown_segments() {
        let aspace = SimAddressSpace::new();
        let exe = ExeInfo {
            stack_prot: ProtFlags::RWX,
            ..exe()
        };
        let contents = StackContents {
            exe: &exe,
            args: &[],
            env: &[],
            auxv: &[],
        };
        let stack = setup_client_stack(&aspace, &contents, SIM_CLIENT_STACK_END, 2 * MIB).unwrap();
        let layout = stack.layout;

        let anon = aspace.find_segment(layout.client_sp).unwrap();
        assert_eq!(anon.kind, SegKind::AnonC);
        assert_eq!(anon.prot, ProtFlags::RWX);
        assert_eq!(anon.start, layout.anon_start);
        assert_eq!(anon.end, SIM_CLIENT_STACK_END);
        // Room for the redzone below the stack pointer.
        assert!(layout.client_sp - anon.start >= PAGE_SIZE);

        let resvn = aspace.find_segment(layout.anon_start - 1).unwrap();
        assert_eq!(resvn.kind, SegKind::Resvn);
        assert_eq!(resvn.smode, ShrinkMode::SmUpper);
        assert_eq!(resvn.start, SIM_CLIENT_STACK_END + 1 - 2 * MIB);
    }

    #[test]
    fn test_too_big_for_max_size() {
        let exe = exe();
        let env = vec![OsString::from("X".repeat(2 * MIB))];
        let contents = StackContents {
            exe: &exe,
            args: &[],
            env: &env,
            auxv: &[],
        };
        assert!(matches!(
            setup_client_stack(&SimAddressSpace::new(), &contents, SIM_CLIENT_STACK_END, MIB),
            Err(MemError::OutOfRange)
        ));
    }

    #[test]
    fn test_mapping_conflict() {
        let aspace = SimAddressSpace::new();
        aspace
            .map_anon_fixed(SIM_CLIENT_STACK_END + 1 - MIB, PAGE_SIZE, ProtFlags::RW)
            .unwrap();
        let exe = exe();
        let contents = StackContents {
            exe: &exe,
            args: &[],
            env: &[],
            auxv: &[],
        };
        assert!(setup_client_stack(&aspace, &contents, SIM_CLIENT_STACK_END, MIB).is_err());
    }
}
