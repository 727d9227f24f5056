//! Finding the guest executable and loading it into the address space.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use guest_helper::page::{page_round_down, page_round_up};
use netbsd_api::exec::{
    Elf64Ehdr, Elf64Phdr, EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_X86_64, ET_DYN,
    ET_EXEC, PF_R, PF_W, PF_X, PT_GNU_STACK, PT_INTERP, PT_LOAD, PT_PHDR,
};
use netbsd_api::mman::ProtFlags;

use crate::host::memory::{AddressSpace, MemError};

/// What the image builder needs to know about a loaded executable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExeInfo {
    /// The executable (or `#!` script) as it was resolved.
    pub path: PathBuf,
    /// Entry point of the executable itself.
    pub entry: u64,
    /// Where the guest starts: the interpreter's entry point if there is one.
    pub init_ip: u64,
    /// Address of the program headers in guest memory, or 0 if they aren't
    /// mapped.
    pub phdr: u64,
    pub phnum: u64,
    /// Load bias of the program interpreter (`ld.elf_so`).
    pub interp_offset: u64,
    /// First byte past the executable's highest segment.
    pub brkbase: usize,
    /// For `#!` scripts, the interpreter named on the first line and its
    /// optional argument.
    pub interp_name: Option<OsString>,
    pub interp_args: Option<OsString>,
    pub stack_prot: ProtFlags,
}

#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    /// Not a file we know how to run.
    BadFormat(&'static str),
    /// A `#!` script whose interpreter is itself a script.
    NestedScript,
    Map(MemError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "{e}"),
            LoadError::BadFormat(why) => write!(f, "{why}"),
            LoadError::NestedScript => write!(f, "script interpreter is a script"),
            LoadError::Map(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io(e) => Some(e),
            LoadError::Map(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError::Io(e)
    }
}

impl From<MemError> for LoadError {
    fn from(e: MemError) -> Self {
        LoadError::Map(e)
    }
}

/// Maps an executable file into guest memory.
pub trait ExecutableLoader {
    fn load(&self, aspace: &dyn AddressSpace, path: &Path) -> Result<ExeInfo, LoadError>;
}

/// Resolves the program name the way a shell would: names containing a `/`
/// are used as they are, others are looked up in `$PATH`.
pub fn find_executable(name: &OsStr) -> Option<PathBuf> {
    if name.as_bytes().contains(&b'/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    match which::which(name) {
        Ok(path) => Some(path),
        Err(e) => {
            log::debug!("{}: not found in PATH: {e}", name.to_string_lossy());
            None
        }
    }
}

/// Loads `path`, which is either an executable or a `#!` script. A script
/// is run by loading its interpreter instead; the interpreter's name and
/// argument are recorded so they end up in front of `argv`.
pub fn do_exec(
    loader: &dyn ExecutableLoader,
    aspace: &dyn AddressSpace,
    path: &Path,
) -> Result<ExeInfo, LoadError> {
    let Some((interp, arg)) = read_script_header(path)? else {
        return loader.load(aspace, path);
    };

    log::debug!(
        "{} is a script for {}",
        path.display(),
        interp.to_string_lossy()
    );
    if read_script_header(Path::new(&interp))?.is_some() {
        return Err(LoadError::NestedScript);
    }

    let mut info = loader.load(aspace, Path::new(&interp))?;
    info.path = path.to_path_buf();
    info.interp_name = Some(interp);
    info.interp_args = arg;
    Ok(info)
}

/// The interpreter and optional argument from a `#!` line, or `None` if the
/// file doesn't start with `#!`.
fn read_script_header(path: &Path) -> Result<Option<(OsString, Option<OsString>)>, LoadError> {
    use std::io::Read;

    let mut head = Vec::with_capacity(256);
    std::fs::File::open(path)?
        .take(256)
        .read_to_end(&mut head)?;

    let Some(rest) = head.strip_prefix(b"#!") else {
        return Ok(None);
    };
    let line = match rest.iter().position(|&b| b == b'\n') {
        Some(end) => &rest[..end],
        None => return Err(LoadError::BadFormat("#! line is too long")),
    };
    parse_script_line(line).map(Some)
}

fn parse_script_line(line: &[u8]) -> Result<(OsString, Option<OsString>), LoadError> {
    let is_blank = |b: &u8| *b == b' ' || *b == b'\t';
    let line = trim(line, is_blank);

    let name_end = line.iter().position(is_blank).unwrap_or(line.len());
    let (name, rest) = line.split_at(name_end);
    if name.is_empty() {
        return Err(LoadError::BadFormat("#! line names no interpreter"));
    }

    // Everything after the name is a single argument.
    let arg = trim(rest, is_blank);
    let arg = (!arg.is_empty()).then(|| OsString::from_vec(arg.to_vec()));
    Ok((OsString::from_vec(name.to_vec()), arg))
}

fn trim(mut s: &[u8], pred: impl Fn(&u8) -> bool) -> &[u8] {
    while let [first, rest @ ..] = s {
        if !pred(first) {
            break;
        }
        s = rest;
    }
    while let [rest @ .., last] = s {
        if !pred(last) {
            break;
        }
        s = rest;
    }
    s
}

/// Loads 64-bit little-endian amd64 ELF executables, and the program
/// interpreter they ask for.
#[derive(Clone, Debug)]
pub struct Elf64Loader {
    /// Distance above the executable's break at which the interpreter is
    /// placed, so that the heap can grow up to its limit.
    interp_gap: usize,
}

impl Elf64Loader {
    pub fn new(data_limit: usize) -> Self {
        Self {
            interp_gap: page_round_up(data_limit),
        }
    }
}

/// One ELF object mapped into guest memory.
#[derive(Debug)]
struct LoadedObject {
    bias: u64,
    entry: u64,
    phdr: u64,
    phnum: u64,
    /// First byte past the highest `PT_LOAD` segment.
    end: usize,
    interp: Option<PathBuf>,
    stack_prot: ProtFlags,
}

fn prot_of(flags: u32) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if flags & PF_R != 0 {
        prot |= ProtFlags::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= ProtFlags::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

fn parse_headers(image: &[u8]) -> Result<(Elf64Ehdr, Vec<Elf64Phdr>), LoadError> {
    let ehdr_len = std::mem::size_of::<Elf64Ehdr>();
    if image.len() < ehdr_len || image[..4] != ELFMAG {
        return Err(LoadError::BadFormat("not an ELF file"));
    }
    let ehdr: Elf64Ehdr = bytemuck::pod_read_unaligned(&image[..ehdr_len]);

    if ehdr.e_ident[EI_CLASS] != ELFCLASS64 || ehdr.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(LoadError::BadFormat("not a 64-bit little-endian ELF file"));
    }
    if ehdr.e_machine != EM_X86_64 {
        return Err(LoadError::BadFormat("not an amd64 executable"));
    }
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(LoadError::BadFormat("not an executable or shared object"));
    }

    let phent = std::mem::size_of::<Elf64Phdr>();
    if usize::from(ehdr.e_phentsize) != phent {
        return Err(LoadError::BadFormat("unexpected program header size"));
    }
    let phoff = ehdr.e_phoff as usize;
    let phnum = usize::from(ehdr.e_phnum);
    let phdrs_end = phoff
        .checked_add(phnum * phent)
        .filter(|end| *end <= image.len())
        .ok_or(LoadError::BadFormat("program headers run past the end of the file"))?;

    let phdrs = image[phoff..phdrs_end]
        .chunks_exact(phent)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    Ok((ehdr, phdrs))
}

impl Elf64Loader {
    /// Maps `path`. Position-independent objects are placed at `base`.
    fn map_object(
        &self,
        aspace: &dyn AddressSpace,
        path: &Path,
        base: usize,
    ) -> Result<LoadedObject, LoadError> {
        let image = std::fs::read(path)?;
        let (ehdr, phdrs) = parse_headers(&image)?;

        let loads: Vec<&Elf64Phdr> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
        let Some(lowest) = loads.iter().map(|p| p.p_vaddr).min() else {
            return Err(LoadError::BadFormat("no loadable segments"));
        };

        let bias = match ehdr.e_type {
            ET_DYN => (base as u64).wrapping_sub(page_round_down(lowest as usize) as u64),
            _ => 0,
        };

        // Map everything writable to copy the file contents in, then apply
        // the segments' own protections.
        let mut mapped_end = 0;
        for ph in &loads {
            if ph.p_filesz > ph.p_memsz {
                return Err(LoadError::BadFormat("segment file size exceeds memory size"));
            }
            let start = page_round_down((ph.p_vaddr + bias) as usize).max(mapped_end);
            let end = page_round_up((ph.p_vaddr + bias + ph.p_memsz) as usize);
            if start < end {
                aspace.map_anon_fixed(start, end - start, ProtFlags::RW)?;
                mapped_end = end;
            }

            let offset = ph.p_offset as usize;
            let data = image
                .get(offset..offset + ph.p_filesz as usize)
                .ok_or(LoadError::BadFormat("segment runs past the end of the file"))?;
            aspace.write_bytes((ph.p_vaddr + bias) as usize, data)?;
        }
        for ph in &loads {
            let start = page_round_down((ph.p_vaddr + bias) as usize);
            let end = page_round_up((ph.p_vaddr + bias + ph.p_memsz) as usize);
            aspace.protect(start, end - start, prot_of(ph.p_flags))?;
        }

        let end = loads
            .iter()
            .map(|p| (p.p_vaddr + bias + p.p_memsz) as usize)
            .max()
            .unwrap_or(0);

        // The program headers are only visible to the guest if some segment
        // maps them.
        let phdr = match phdrs.iter().find(|p| p.p_type == PT_PHDR) {
            Some(p) => p.p_vaddr + bias,
            None => loads
                .iter()
                .find(|p| {
                    p.p_offset <= ehdr.e_phoff
                        && ehdr.e_phoff < p.p_offset + p.p_filesz
                })
                .map(|p| p.p_vaddr + bias + (ehdr.e_phoff - p.p_offset))
                .unwrap_or(0),
        };

        let interp = match phdrs.iter().find(|p| p.p_type == PT_INTERP) {
            Some(p) => {
                let offset = p.p_offset as usize;
                let raw = image
                    .get(offset..offset + p.p_filesz as usize)
                    .ok_or(LoadError::BadFormat("PT_INTERP runs past the end of the file"))?;
                let name = raw.split(|b| *b == 0).next().unwrap_or_default();
                Some(PathBuf::from(OsStr::from_bytes(name)))
            }
            None => None,
        };

        let stack_prot = match phdrs.iter().find(|p| p.p_type == PT_GNU_STACK) {
            Some(p) if p.p_flags & PF_X != 0 => ProtFlags::RWX,
            _ => ProtFlags::RW,
        };

        Ok(LoadedObject {
            bias,
            entry: ehdr.e_entry + bias,
            phdr,
            phnum: u64::from(ehdr.e_phnum),
            end,
            interp,
            stack_prot,
        })
    }
}

impl ExecutableLoader for Elf64Loader {
    fn load(&self, aspace: &dyn AddressSpace, path: &Path) -> Result<ExeInfo, LoadError> {
        let exe = self.map_object(aspace, path, aspace.client_base())?;
        log::debug!(
            "Loaded {} at bias {:#x}, entry {:#x}",
            path.display(),
            exe.bias,
            exe.entry
        );

        let mut info = ExeInfo {
            path: path.to_path_buf(),
            entry: exe.entry,
            init_ip: exe.entry,
            phdr: exe.phdr,
            phnum: exe.phnum,
            interp_offset: 0,
            brkbase: exe.end,
            interp_name: None,
            interp_args: None,
            stack_prot: exe.stack_prot,
        };

        if let Some(interp_path) = &exe.interp {
            let base = page_round_up(exe.end) + self.interp_gap;
            let interp = self.map_object(aspace, interp_path, base)?;
            log::debug!(
                "Loaded interpreter {} at {:#x}",
                interp_path.display(),
                interp.bias
            );
            info.interp_offset = interp.bias;
            info.init_ip = interp.entry;
        }

        Ok(info)
    }
}
