use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use anyhow::{self, Context};
use clap::Parser;
use nix::sys::{resource, signal};
use serde::Serialize;

use crate::core::configuration::{CliOptions, ConfigFileOptions, ConfigOptions};
use crate::core::logger::guest_logger;
use crate::host::engine::{CoreGuard, Engine, Services, ThreadHooks};
use crate::host::image::env::PreloadConfig;
use crate::host::image::loader::Elf64Loader;
use crate::host::image::{self, ImageError, ImageInfo, ImageRequest};
use crate::host::kernel::{Kernel, NativeKernel};
use crate::host::memory::native::{NativeAddressSpace, DEFAULT_ARENA_SIZE};
use crate::host::memory::sim::SimAddressSpace;
use crate::host::memory::AddressSpace;
use crate::host::signals::SignalTable;
use crate::host::thread::exit::LwpExit;
use crate::host::thread::lifecycle::{self, GuestRunner, ShutdownHandler, ShutdownLatch};
use crate::host::thread::{ExitReason, Tid};
use crate::host::tool::NullTool;
use crate::host::translations::DiscardLog;

/// Main entry point. Returns the exit status for the process.
pub fn run_nbguest(args: Vec<OsString>) -> anyhow::Result<i32> {
    // the guest expects to start with nothing blocked
    signal::sigprocmask(
        signal::SigmaskHow::SIG_SETMASK,
        Some(&signal::SigSet::empty()),
        None,
    )?;

    // parse the options from the command line
    let options = match CliOptions::try_parse_from(args.clone()) {
        Ok(x) => x,
        Err(e) => {
            if e.use_stderr() {
                eprint!("{}", e);
                return Ok(1);
            } else {
                print!("{}", e);
                return Ok(0);
            }
        }
    };

    // load the configuration yaml
    let config_file: ConfigFileOptions = match &options.config {
        Some(path) => {
            let file = std::fs::File::open(path)
                .context(format!("Could not open config file {:?}", path))?;
            serde_yaml::from_reader(file)
                .context(format!("Could not parse configuration file {:?}", path))?
        }
        None => ConfigFileOptions::default(),
    };

    // generate the final configuration from the config file and cli options
    let config = ConfigOptions::new(config_file, options.clone());

    if options.show_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(0);
    }

    // disable log buffering during startup so that we see every message immediately in the terminal
    guest_logger::init(
        config.log_level().to_level_filter(),
        config.general.log_errors_to_stderr.unwrap(),
    )
    .map_err(|e| anyhow::anyhow!("Could not initialize the logger: {e}"))?;
    guest_logger::set_buffering_enabled(false);

    // check if some log levels have been compiled out
    let log_level = config.log_level();
    if log_level > log::STATIC_MAX_LEVEL {
        log::warn!(
            "Log level set to {}, but messages higher than {} have been compiled out",
            log_level,
            log::STATIC_MAX_LEVEL,
        );
    }

    log_environment(&args);

    let Some(program) = options.program() else {
        // clap only lets this through with --show-config
        anyhow::bail!("No program given");
    };

    let (fd_soft_limit, _) =
        resource::getrlimit(resource::Resource::RLIMIT_NOFILE).context("Could not get fd limit")?;
    let (stack_rlimit, data_limit) = image::host_rlimits().context("Could not get rlimits")?;
    let data_limit = usize::try_from(data_limit).unwrap_or(usize::MAX);
    let engine_options =
        config.engine_options(i32::try_from(fd_soft_limit).unwrap_or(i32::MAX), data_limit);

    let envp: Vec<OsString> = std::env::vars_os()
        .map(|(key, value)| {
            let mut var = key;
            var.push("=");
            var.push(value);
            var
        })
        .collect();
    let auxv = image::auxv::host_auxv();

    let guest = &config.guest;
    let request = ImageRequest {
        exe_name: program,
        args: options.args(),
        envp: &envp,
        preload: PreloadConfig {
            libdir: guest.libdir.as_deref().unwrap(),
            tool: guest.tool.as_deref().unwrap(),
            platform: guest.platform.as_deref().unwrap(),
        },
        main_stacksize: usize::try_from(guest.main_stacksize.unwrap()).unwrap_or(usize::MAX),
        stack_rlimit,
        data_limit,
        auxv: &auxv,
    };
    let loader = Elf64Loader::new(data_limit);

    if options.dry_run {
        let aspace = SimAddressSpace::new();
        let info = match image::create_image(&aspace, &NullTool, &loader, &request) {
            Ok(info) => info,
            Err(e) => return Ok(report_image_error(e)),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&ImageSummary::new(&info, &aspace))?
        );
        return Ok(0);
    }

    let aspace = Arc::new(
        NativeAddressSpace::new(DEFAULT_ARENA_SIZE).context("Could not reserve guest memory")?,
    );
    let tool = Arc::new(NullTool);
    let info = match image::create_image(aspace.as_ref(), tool.as_ref(), &loader, &request) {
        Ok(info) => info,
        Err(e) => return Ok(report_image_error(e)),
    };

    let kernel = Arc::new(NativeKernel::new());
    let shutdown = Arc::new(ShutdownLatch::new());
    let services = Services {
        aspace,
        tool,
        kernel: kernel.clone(),
        signals: Arc::new(SignalTable::new()),
        translations: Arc::new(DiscardLog::new()),
    };
    let hooks = ThreadHooks {
        runner: Arc::new(DetachedRunner),
        shutdown: Arc::new(ExitingShutdown {
            latch: shutdown.clone(),
            main_lwpid: kernel.current_lwpid(),
        }),
        exit: Arc::new(LwpExit),
    };
    let engine = Engine::new(services, hooks, engine_options, info.brk);

    let tid = {
        let mut guard = engine.lock();
        let tid = guard
            .threads
            .alloc()
            .map_err(|e| anyhow::anyhow!("Could not allocate the main thread: {e}"))?;
        image::finalise_image(&engine, &mut guard, tid, &info);
        tid
    };

    log::debug!("Running the main thread {tid}");
    lifecycle::run_a_thread(&engine, tid);

    let exit = shutdown
        .try_get()
        .context("The main thread finished without shutting down")?;
    Ok(exit.code())
}

/// Reports a failure to build the image the way users of the launcher
/// expect, and returns the exit status.
fn report_image_error(e: ImageError) -> i32 {
    log::debug!("{e:?}");
    eprintln!("{e}");
    e.exit_code()
}

/// Ends the process when the last guest thread finishes on an LWP other than
/// the one [`run_nbguest`] started the guest on. That LWP has already exited,
/// so nobody would collect the status from the latch.
struct ExitingShutdown {
    latch: Arc<ShutdownLatch>,
    main_lwpid: u32,
}

impl ShutdownHandler for ExitingShutdown {
    fn shutdown(&self, engine: &Engine, guard: CoreGuard<'_>, tid: Tid) {
        self.latch.shutdown(engine, guard, tid);
        if engine.kernel().current_lwpid() == self.main_lwpid {
            return;
        }
        if let Some(exit) = self.latch.try_get() {
            log::logger().flush();
            std::process::exit(exit.code());
        }
    }
}

/// Stands in for an execution engine: the guest's code is never run.
struct DetachedRunner;

impl GuestRunner for DetachedRunner {
    fn run(&self, _engine: &Arc<Engine>, guard: &mut CoreGuard<'_>, tid: Tid) {
        log::error!("No execution engine is attached; the guest can't be run");
        let thread = guard.threads.get_mut(tid);
        thread.exitreason = Some(ExitReason::ExitThread);
        thread.os_state.exitcode = 1;
    }
}

/// What `--dry-run` prints.
#[derive(Debug, Serialize)]
struct ImageSummary {
    exe: String,
    interp: Option<String>,
    initial_ip: String,
    initial_sp: String,
    ps_strings: String,
    auxv: String,
    argc: usize,
    envc: usize,
    stack_max_size: usize,
    brk_base: String,
    brk_limit: String,
    segments: Vec<SegmentSummary>,
}

#[derive(Debug, Serialize)]
struct SegmentSummary {
    kind: String,
    start: String,
    end: String,
    prot: String,
}

impl ImageSummary {
    fn new(info: &ImageInfo, aspace: &dyn AddressSpace) -> Self {
        let hex = |v: u64| format!("{v:#x}");
        Self {
            exe: info.exe.path.display().to_string(),
            interp: info
                .exe
                .interp_name
                .as_ref()
                .map(|name| name.to_string_lossy().into_owned()),
            initial_ip: hex(info.initial_ip),
            initial_sp: hex(info.initial_sp as u64),
            ps_strings: hex(info.pss as u64),
            auxv: hex(info.auxv),
            argc: info.stack.argc,
            envc: info.stack.envc,
            stack_max_size: info.clstack_max_size,
            brk_base: hex(info.brk.base as u64),
            brk_limit: hex(info.brk.limit as u64),
            segments: aspace
                .segments()
                .iter()
                .map(|seg| SegmentSummary {
                    kind: format!("{:?}", seg.kind),
                    start: hex(seg.start as u64),
                    end: hex(seg.end as u64),
                    prot: format!("{:?}", seg.prot),
                })
                .collect(),
        }
    }
}

fn log_environment(args: &[OsString]) {
    for arg in args {
        log::info!("arg: {}", arg.to_string_lossy());
    }

    for (key, value) in std::env::vars_os() {
        let level = match key.as_bytes() {
            b"LD_PRELOAD" | b"VALGRIND_LAUNCHER" | b"LD_LIBRARY_PATH" => log::Level::Info,
            _ => log::Level::Trace,
        };
        log::log!(level, "env: {:?}={:?}", key, value);
    }
}

/// Turns the result of [`run_nbguest`] into the process exit status, logging
/// and printing any error.
pub fn exit_status(result: anyhow::Result<i32>) -> i32 {
    log::logger().flush();

    match result {
        Ok(code) => code,
        Err(e) => {
            // log the full error, its context, and its backtrace if enabled
            if log::log_enabled!(log::Level::Error) {
                for line in format!("{:?}", e).split('\n') {
                    log::error!("{}", line);
                }
                log::logger().flush();

                eprintln!("** nbguest did not complete successfully: {}", e);
                eprintln!("** See the log for details");
            } else {
                eprintln!("{:?}", e);
            }
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_option_is_an_error_status() {
        let code = run_nbguest(vec!["nbguest".into(), "--no-such-option".into()]).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn test_help_succeeds() {
        let code = run_nbguest(vec!["nbguest".into(), "--help".into()]).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_show_config() {
        let code = run_nbguest(vec!["nbguest".into(), "--show-config".into()]).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_missing_config_file() {
        let err = run_nbguest(vec![
            "nbguest".into(),
            "--config".into(),
            "/nonexistent/nbguest.yaml".into(),
            "/bin/true".into(),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("Could not open config file"));
    }

    #[test]
    fn test_shutdown_on_main_lwp_returns() {
        use crate::host::testing::{idle_runner, test_engine};
        use crate::host::thread::lifecycle::ProcessExit;

        let te = test_engine(idle_runner());
        let handler = ExitingShutdown {
            latch: te.shutdown.clone(),
            main_lwpid: te.kernel.current_lwpid(),
        };
        let mut guard = te.engine.lock();
        let tid = guard.threads.alloc().unwrap();
        guard.threads.get_mut(tid).os_state.exitcode = 5;

        handler.shutdown(&te.engine, guard, tid);
        assert_eq!(te.shutdown.try_get(), Some(ProcessExit::Code(5)));
    }

    #[test]
    fn test_error_status() {
        assert_eq!(exit_status(Ok(3)), 3);
        assert_eq!(exit_status(Err(anyhow::anyhow!("boom"))), 1);
    }
}
