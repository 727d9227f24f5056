//! Building the guest's initial process image: loading the executable,
//! preparing its environment, and laying out its stack and heap. Then, just
//! before the first instruction, setting up the main thread's registers.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;

use guest_helper::page::page_round_up;
use netbsd_api::auxvec::AuxvEntry;
use netbsd_api::exec::PSL_USERSET;
use netbsd_api::limits::PATH_MAX;

use crate::host::engine::{CoreGuard, Engine};
use crate::host::guest_state::{GuestArchState, GuestRegs, Reg};
use crate::host::heap::{setup_client_dataseg, BrkState};
use crate::host::memory::{AddressSpace, MemError, SegKind};
use crate::host::thread::Tid;
use crate::host::tool::{CorePart, ToolHooks};

pub mod auxv;
pub mod env;
pub mod loader;
pub mod stack;

use env::PreloadConfig;
use loader::{ExeInfo, ExecutableLoader, LoadError};
use stack::{ClientStack, StackContents};

/// A failure to build the image. None of these can be recovered from; the
/// process exits with [`ImageError::exit_code`].
#[derive(Debug)]
pub enum ImageError {
    /// The program couldn't be found.
    NotFound(OsString),
    NameTooLong(PathBuf),
    Load { path: PathBuf, source: LoadError },
    Stack(MemError),
    DataSeg(MemError),
    Io(std::io::Error),
}

impl ImageError {
    pub fn exit_code(&self) -> i32 {
        match self {
            // POSIX "command not found".
            ImageError::NotFound(_) => 127,
            _ => 1,
        }
    }
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::NotFound(name) => {
                write!(f, "valgrind: {}: command not found", name.to_string_lossy())
            }
            ImageError::NameTooLong(path) => {
                write!(f, "valgrind: execname {} is too long", path.display())
            }
            ImageError::Load { path, .. } => {
                write!(f, "valgrind: could not execute '{}'", path.display())
            }
            ImageError::Stack(_) => write!(
                f,
                "valgrind: I failed to allocate space for the application's stack.\n\
                 valgrind: This may be the result of a very large --main-stacksize=\n\
                 valgrind: setting.  Cannot continue.  Sorry."
            ),
            ImageError::DataSeg(_) => {
                write!(f, "valgrind: cannot initialize data segment (brk).")
            }
            ImageError::Io(e) => write!(f, "Valgrind: FATAL: {e}"),
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::Load { source, .. } => Some(source),
            ImageError::Stack(e) | ImageError::DataSeg(e) => Some(e),
            ImageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ImageError {
    fn from(e: std::io::Error) -> Self {
        ImageError::Io(e)
    }
}

/// Everything the image is built from.
#[derive(Clone, Debug)]
pub struct ImageRequest<'a> {
    /// The program as named on the command line.
    pub exe_name: &'a OsStr,
    pub args: &'a [OsString],
    /// The engine's own environment.
    pub envp: &'a [OsString],
    pub preload: PreloadConfig<'a>,
    /// Requested main stack size, 0 to go by the resource limit.
    pub main_stacksize: usize,
    /// Soft `RLIMIT_STACK`.
    pub stack_rlimit: u64,
    /// Soft `RLIMIT_DATA`.
    pub data_limit: usize,
    pub auxv: &'a [AuxvEntry],
}

/// Soft limits on the stack and data segment sizes.
pub fn host_rlimits() -> Result<(u64, u64), ImageError> {
    use nix::sys::resource::{getrlimit, Resource};

    let (stack, _) = getrlimit(Resource::RLIMIT_STACK).map_err(std::io::Error::from)?;
    let (data, _) = getrlimit(Resource::RLIMIT_DATA).map_err(std::io::Error::from)?;
    Ok((stack, data))
}

/// The result of [`create_image`], needed to start the main thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub exe: ExeInfo,
    pub initial_sp: usize,
    pub initial_ip: u64,
    /// Guest address of the `ps_strings` record.
    pub pss: usize,
    pub auxv: u64,
    pub clstack_max_size: usize,
    pub stack: ClientStack,
    pub brk: BrkState,
}

/// Finds and loads the program, returning the loaded executable's details.
fn load_client(
    aspace: &dyn AddressSpace,
    loader: &dyn ExecutableLoader,
    exe_name: &OsStr,
) -> Result<ExeInfo, ImageError> {
    let path = loader::find_executable(exe_name)
        .ok_or_else(|| ImageError::NotFound(exe_name.to_owned()))?;

    if path.as_os_str().len() + 1 > PATH_MAX {
        return Err(ImageError::NameTooLong(path));
    }

    loader::do_exec(loader, aspace, &path).map_err(|source| ImageError::Load { path, source })
}

/// Builds the guest's memory image: maps the executable, the main thread's
/// stack and the initial heap, and tells the tool about all of it.
pub fn create_image(
    aspace: &dyn AddressSpace,
    tool: &dyn ToolHooks,
    loader: &dyn ExecutableLoader,
    req: &ImageRequest,
) -> Result<ImageInfo, ImageError> {
    log::debug!("Loading client");
    let exe = load_client(aspace, loader, req.exe_name)?;
    let brk = BrkState::new(exe.brkbase);

    log::debug!("Setup client env");
    let env = env::setup_client_env(req.envp, &req.preload);

    let clstack_max_size = stack::main_stack_size(req.stack_rlimit, req.main_stacksize);
    log::debug!("Setup client stack: size will be {clstack_max_size}");
    let contents = StackContents {
        exe: &exe,
        args: req.args,
        env: &env,
        auxv: req.auxv,
    };
    let stack = stack::setup_client_stack(
        aspace,
        &contents,
        aspace.client_stack_end(),
        clstack_max_size,
    )
    .map_err(ImageError::Stack)?;

    log::debug!(
        "Client info: initial_IP={:#x}, brk_base={:#x}",
        exe.init_ip,
        brk.base
    );
    log::debug!(
        "Client info: initial_SP={:#x} max_stack_size={clstack_max_size}",
        stack.layout.client_sp
    );

    setup_client_dataseg(aspace, &brk, req.data_limit).map_err(ImageError::DataSeg)?;

    for seg in aspace.segments() {
        if seg.kind.is_client_mapping() {
            tool.new_mem_startup(seg.start, seg.len(), seg.prot);
        }
    }

    Ok(ImageInfo {
        initial_sp: stack.layout.client_sp,
        initial_ip: exe.init_ip,
        pss: stack.layout.pss,
        auxv: stack.auxv,
        clstack_max_size,
        stack,
        brk,
        exe,
    })
}

/// Sets up `tid`, the main thread, to start running the image: every register
/// zeroed except the stack pointer, the entry point and `%rbx`, which
/// points at `ps_strings`. The initial heap is announced to the tool and
/// then taken away again, as the guest hasn't asked for any of it yet.
pub fn finalise_image(engine: &Engine, guard: &mut CoreGuard<'_>, tid: Tid, info: &ImageInfo) {
    let core = &mut **guard;
    let thread = core.threads.get_mut(tid);

    thread.arch = GuestArchState::default();
    let regs = &mut thread.arch.guest;
    regs.init_fpu();
    regs.set(Reg::Rsp, info.initial_sp as u64);
    regs.set(Reg::Rbx, info.pss as u64);
    regs.rip = info.initial_ip;
    regs.rflags = PSL_USERSET;

    let os = &mut thread.os_state;
    os.stack_highest_byte = info.stack.end();
    os.stack_size = info.clstack_max_size;
    if let Some(old) = os.stack_id.take() {
        core.stacks.deregister(old);
    }
    os.stack_id = Some(core.stacks.register(info.stack.start_base(), info.stack.end()));

    engine.tool().post_reg_write(
        CorePart::Startup,
        tid,
        0,
        std::mem::size_of::<GuestRegs>(),
    );

    core.brk = info.brk;
    let brk_base = info.brk.base;
    let seg = match engine.aspace().find_segment(page_round_up(brk_base)) {
        Some(seg) => seg,
        None => panic!("no heap segment above brk base {brk_base:#x}"),
    };
    assert_eq!(seg.kind, SegKind::AnonC);

    let len = seg.end + 1 - brk_base;
    engine.tool().new_mem_brk(brk_base, len, tid);
    engine.tool().die_mem_brk(brk_base, len);
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use netbsd_api::exec::{PF_R, PF_W};
    use netbsd_api::mman::ProtFlags;

    use super::loader::test_elf::static_exe;
    use super::loader::Elf64Loader;
    use super::*;
    use crate::host::memory::sim::SimAddressSpace;
    use crate::host::testing::{idle_runner, test_engine};
    use crate::host::tool::{RecordingTool, ToolEvent};

    const MIB: usize = 1024 * 1024;

    fn write_exe(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("prog");
        std::fs::write(&path, static_exe(PF_R | PF_W)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request<'a>(
        exe: &'a OsStr,
        libdir: &'a Path,
        args: &'a [OsString],
        envp: &'a [OsString],
        auxv: &'a [AuxvEntry],
    ) -> ImageRequest<'a> {
        ImageRequest {
            exe_name: exe,
            args,
            envp,
            preload: PreloadConfig {
                libdir,
                tool: "none",
                platform: "amd64-netbsd",
            },
            main_stacksize: 0,
            stack_rlimit: 8 * MIB as u64,
            data_limit: 2 * MIB,
            auxv,
        }
    }

    #[test]
    fn test_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let aspace = SimAddressSpace::new();
        let tool = RecordingTool::new();

        let err = create_image(
            &aspace,
            &tool,
            &Elf64Loader::new(2 * MIB),
            &request(missing.as_os_str(), dir.path(), &[], &[], &[]),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 127);
        assert_eq!(
            err.to_string(),
            format!("valgrind: {}: command not found", missing.display())
        );
        assert!(aspace.segments().is_empty());
    }

    #[test]
    fn test_not_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("text");
        std::fs::write(&path, b"plain text").unwrap();

        let err = create_image(
            &SimAddressSpace::new(),
            &RecordingTool::new(),
            &Elf64Loader::new(2 * MIB),
            &request(path.as_os_str(), dir.path(), &[], &[], &[]),
        )
        .unwrap_err();
        assert!(matches!(err, ImageError::Load { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_create_image() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_exe(dir.path());
        let aspace = SimAddressSpace::new();
        let tool = RecordingTool::new();
        let args = vec![OsString::from("arg")];
        let envp = vec![OsString::from("A=b"), OsString::from("VALGRIND_LAUNCHER=x")];
        let auxv = auxv::netbsd_prototype();

        let info = create_image(
            &aspace,
            &tool,
            &Elf64Loader::new(2 * MIB),
            &request(exe.as_os_str(), dir.path(), &args, &envp, &auxv),
        )
        .unwrap();

        assert_eq!(info.initial_ip, 0x40_0080);
        assert_eq!(info.brk, BrkState::new(0x60_2100));
        assert_eq!(info.clstack_max_size, 8 * MIB);
        assert_eq!(info.initial_sp % 16, 0);
        assert_eq!(info.stack.argc, 2);
        assert_eq!(info.stack.envc, 2);

        // The heap: 2 MiB above the data segment's last page, then a guard.
        let heap = aspace.find_segment(0x60_3000).unwrap();
        assert_eq!(heap.kind, SegKind::AnonC);
        assert_eq!(heap.end + 1, 0x60_3000 + 2 * MIB);
        let guard = aspace.find_segment(heap.end + 1).unwrap();
        assert_eq!(guard.kind, SegKind::Resvn);

        let startup: Vec<_> = tool
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ToolEvent::NewMemStartup { start, .. } => Some(start),
                _ => None,
            })
            .collect();
        assert!(startup.contains(&0x40_0000));
        assert!(startup.contains(&info.stack.start_base()));
    }

    #[test]
    fn test_stack_failure() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_exe(dir.path());
        let aspace = SimAddressSpace::new();
        // Something is already where the stack would go.
        let end = aspace.client_stack_end();
        aspace
            .map_anon_fixed(end + 1 - 4 * PAGE, PAGE, ProtFlags::RW)
            .unwrap();

        let err = create_image(
            &aspace,
            &RecordingTool::new(),
            &Elf64Loader::new(2 * MIB),
            &request(exe.as_os_str(), dir.path(), &[], &[], &[]),
        )
        .unwrap_err();
        assert!(matches!(err, ImageError::Stack(_)));
        assert_eq!(err.exit_code(), 1);
    }

    const PAGE: usize = 4096;

    #[test]
    fn test_dataseg_failure() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_exe(dir.path());
        let aspace = SimAddressSpace::new();
        // Where the guard reservation above the heap would go.
        aspace
            .map_anon_fixed(0x60_3000 + 2 * MIB, PAGE, ProtFlags::RW)
            .unwrap();

        let err = create_image(
            &aspace,
            &RecordingTool::new(),
            &Elf64Loader::new(2 * MIB),
            &request(exe.as_os_str(), dir.path(), &[], &[], &[]),
        )
        .unwrap_err();
        assert!(matches!(err, ImageError::DataSeg(_)));
        assert_eq!(
            err.to_string(),
            "valgrind: cannot initialize data segment (brk)."
        );
    }

    #[test]
    fn test_finalise_image() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_exe(dir.path());
        let te = test_engine(idle_runner());

        let info = create_image(
            te.engine.aspace(),
            te.engine.tool(),
            &Elf64Loader::new(2 * MIB),
            &request(exe.as_os_str(), dir.path(), &[], &[], &[]),
        )
        .unwrap();
        te.tool.take();

        let mut guard = te.engine.lock();
        let tid = guard.threads.alloc().unwrap();
        guard.threads.get_mut(tid).arch.guest.set(Reg::Rax, 99);
        finalise_image(&te.engine, &mut guard, tid, &info);

        let thread = guard.threads.get(tid);
        let regs = &thread.arch.guest;
        assert_eq!(regs.get(Reg::Rax), 0);
        assert_eq!(regs.get(Reg::Rsp), info.initial_sp as u64);
        assert_eq!(regs.get(Reg::Rbx), info.pss as u64);
        assert_eq!(regs.rip, 0x40_0080);
        assert_eq!(regs.rflags, 0x202);
        assert_eq!(thread.arch.shadow1, GuestRegs::default());
        assert_eq!(thread.os_state.stack_highest_byte, info.stack.end());
        assert_eq!(thread.os_state.stack_size, 8 * MIB);
        assert!(guard.stacks.find(info.initial_sp).is_some());
        assert_eq!(guard.brk, info.brk);

        let heap_end = 0x60_3000 + 2 * MIB;
        assert_eq!(
            te.tool.events(),
            vec![
                ToolEvent::PostRegWrite {
                    part: CorePart::Startup,
                    tid,
                    offset: 0,
                    size: std::mem::size_of::<GuestRegs>(),
                },
                ToolEvent::NewMemBrk {
                    start: 0x60_2100,
                    len: heap_end - 0x60_2100,
                    tid,
                },
                ToolEvent::DieMemBrk {
                    start: 0x60_2100,
                    len: heap_end - 0x60_2100,
                },
            ]
        );
    }
}
