use std::cell::{Cell, RefCell};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

use crate::host::kernel::current_lwpid;
use crate::host::thread::Tid;

/// Trigger an asynchronous flush when this many lines are queued.
const ASYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10_000;

/// Performs a *synchronous* flush when this many lines are queued. i.e. if
/// after reaching the `ASYNC_FLUSH_QD_LINES_THRESHOLD`, log lines are still
/// coming in faster than they can actually be flushed, when we reach this limit
/// we'll pause and let it finish flushing rather than letting the queue
/// continue growing.
const SYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10 * ASYNC_FLUSH_QD_LINES_THRESHOLD;

/// Logging thread flushes at least this often.
const MIN_FLUSH_FREQUENCY: Duration = Duration::from_secs(10);

static GUEST_LOGGER: Lazy<GuestLogger> = Lazy::new(GuestLogger::new);

/// Wall time is measured from the first use of the logger.
static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Initialize the logger.
pub fn init(max_log_level: LevelFilter, log_errors_to_stderr: bool) -> Result<(), SetLoggerError> {
    Lazy::force(&START);
    GUEST_LOGGER.set_max_level(max_log_level);
    GUEST_LOGGER.set_log_errors_to_stderr(log_errors_to_stderr);

    log::set_logger(&*GUEST_LOGGER)?;

    // The logger decides for itself what to show (see `GuestLogger::enabled`).
    log::set_max_level(log::LevelFilter::Trace);

    // Start the thread that will receive log records and flush them to output.
    std::thread::Builder::new()
        .name("nbguest-logger".to_string())
        .spawn(move || GUEST_LOGGER.logger_thread_fn())
        .unwrap();

    // Arrange to flush the logger on panic.
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Flush on the current thread and ignore errors: the thread-local
        // sender may already be gone, and the logger thread may be the one
        // panicking.
        GUEST_LOGGER.flush_records(None).ok();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

/// Records which guest thread the calling LWP is running, so that log lines
/// written from it can be attributed. `None` once it's done.
pub fn set_current_tid(tid: Option<Tid>) {
    CURRENT_TID.with(|cell| cell.set(tid));
}

/// A logger that attaches the guest thread to each line and moves the
/// writing off the calling thread, which is usually holding the big lock.
pub struct GuestLogger {
    // The Sender half of a channel isn't Sync, so it's kept behind a Mutex and
    // cloned once per thread into the thread-local SENDER.
    command_sender: Mutex<Sender<LoggerCommand>>,

    // Locked for good by the logger thread.
    command_receiver: Mutex<Receiver<LoggerCommand>>,

    // Records go in a lock-free queue rather than the command channel, as
    // `Sender` can't report its length.
    records: ArrayQueue<GuestLogRecord>,

    // When false, sends a (still-asynchronous) flush command to the logger
    // thread every time a record is pushed into `records`.
    buffering_enabled: RwLock<bool>,

    max_log_level: OnceCell<LevelFilter>,

    // Whether to log errors to stderr in addition to stdout.
    log_errors_to_stderr: OnceCell<bool>,
}

thread_local!(static SENDER: RefCell<Option<Sender<LoggerCommand>>> = const { RefCell::new(None) });
thread_local!(static THREAD_NAME: String = get_thread_name());
thread_local!(static THREAD_ID: u32 = current_lwpid());
thread_local!(static CURRENT_TID: Cell<Option<Tid>> = const { Cell::new(None) });

fn get_thread_name() -> String {
    // LWPs started for guest threads have no name.
    std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_default()
}

impl GuestLogger {
    fn new() -> GuestLogger {
        let (sender, receiver) = std::sync::mpsc::channel();

        GuestLogger {
            records: ArrayQueue::new(SYNC_FLUSH_QD_LINES_THRESHOLD),
            command_sender: Mutex::new(sender),
            command_receiver: Mutex::new(receiver),
            buffering_enabled: RwLock::new(false),
            max_log_level: OnceCell::new(),
            log_errors_to_stderr: OnceCell::new(),
        }
    }

    fn logger_thread_fn(&self) {
        let command_receiver = self.command_receiver.lock().unwrap();

        loop {
            use std::sync::mpsc::RecvTimeoutError;
            match command_receiver.recv_timeout(MIN_FLUSH_FREQUENCY) {
                Ok(LoggerCommand::Flush(done_sender)) => self.flush_records(done_sender).unwrap(),
                Err(RecvTimeoutError::Timeout) => {
                    self.flush_records(None).unwrap();
                }
                Err(e) => panic!("Unexpected error {}", e),
            }
        }
    }

    // Writes out the records queued so far. If `done_sender` is provided, it's
    // notified after the flush has completed.
    fn flush_records(&self, done_sender: Option<Sender<()>>) -> std::io::Result<()> {
        use std::io::Write;

        // Records arriving during the flush wait for the next one, so that a
        // synchronous flush can't be held up indefinitely.
        let mut toflush = self.records.len();

        let stdout_unlocked = std::io::stdout();
        let stdout_locked = stdout_unlocked.lock();
        let mut stdout = std::io::BufWriter::new(stdout_locked);

        let errors_to_stderr = self.log_errors_to_stderr.get().copied().unwrap_or(false);

        while toflush > 0 {
            let record = match self.records.pop() {
                Some(r) => r,
                // Another thread is flushing too, after a panic.
                None => break,
            };
            toflush -= 1;

            if record.level <= Level::Error && errors_to_stderr {
                let stderr_unlocked = std::io::stderr();
                let stderr_locked = stderr_unlocked.lock();
                let mut stderr = std::io::BufWriter::new(stderr_locked);

                let line = format!("{record}");
                write!(stdout, "{line}")?;
                write!(stderr, "{line}")?;
            } else {
                write!(stdout, "{record}")?;
            }
        }
        if let Some(done_sender) = done_sender {
            // We can't log from this thread without risking deadlock.
            done_sender.send(()).unwrap_or_else(|e| {
                println!("WARNING: Logger couldn't notify calling thread: {:?}", e)
            });
        }
        Ok(())
    }

    /// When disabled, the logger thread is notified to write each record as
    /// soon as it's created. The calling thread still isn't blocked on the
    /// record actually being written, though.
    pub fn set_buffering_enabled(&self, buffering_enabled: bool) {
        let mut writer = self.buffering_enabled.write().unwrap();
        *writer = buffering_enabled;
    }

    /// If the maximum log level has not yet been set, returns `LevelFilter::Trace`.
    pub fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }

    /// Is only intended to be called from `init()`. Will panic if called more than once.
    fn set_max_level(&self, level: LevelFilter) {
        self.max_log_level.set(level).unwrap()
    }

    /// Is only intended to be called from `init()`. Will panic if called more than once.
    fn set_log_errors_to_stderr(&self, val: bool) {
        self.log_errors_to_stderr.set(val).unwrap()
    }

    fn flush_impl(&self, notify_done: Option<Sender<()>>) {
        self.send_command(LoggerCommand::Flush(notify_done))
    }

    // Send a flush command to the logger thread and block until it's completed.
    fn flush_sync(&self) {
        let (done_sender, done_receiver) = std::sync::mpsc::channel();
        self.flush_impl(Some(done_sender));
        done_receiver.recv().unwrap();
    }

    fn flush_async(&self) {
        self.flush_impl(None);
    }

    fn send_command(&self, cmd: LoggerCommand) {
        SENDER
            .try_with(|thread_sender| {
                if thread_sender.borrow().is_none() {
                    let lock = self.command_sender.lock().unwrap();
                    *thread_sender.borrow_mut() = Some(lock.clone());
                }
                thread_sender
                    .borrow()
                    .as_ref()
                    .unwrap()
                    .send(cmd)
                    .unwrap_or_else(|e| {
                        println!("WARNING: Couldn't send command to logger thread: {:?}", e);
                    });
            })
            .unwrap_or_else(|e| {
                println!(
                    "WARNING: Couldn't get sender channel to logger thread: {:?}",
                    e
                );
            });
    }
}

impl Log for GuestLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut guestrecord = GuestLogRecord {
            level: record.level(),
            file: record.file_static(),
            module_path: record.module_path_static(),
            line: record.line(),
            message: std::fmt::format(*record.args()),
            wall_time: START.elapsed(),
            thread_name: THREAD_NAME
                .try_with(|name| (*name).clone())
                .unwrap_or_else(|_| get_thread_name()),
            thread_id: THREAD_ID
                .try_with(|id| *id)
                .unwrap_or_else(|_| current_lwpid()),
            guest_tid: CURRENT_TID.try_with(Cell::get).ok().flatten(),
        };

        loop {
            match self.records.push(guestrecord) {
                Ok(()) => break,
                Err(r) => {
                    // Queue is full. Flush it and try again.
                    guestrecord = r;
                    self.flush_sync();
                }
            }
        }

        if record.level() == Level::Error {
            // Flush *synchronously*, since we're likely about to crash one way or another.
            self.flush_sync();
        } else if self.records.len() > ASYNC_FLUSH_QD_LINES_THRESHOLD
            || !*self.buffering_enabled.read().unwrap()
        {
            self.flush_async();
        }
    }

    fn flush(&self) {
        self.flush_sync();
    }
}

struct GuestLogRecord {
    level: Level,
    file: Option<&'static str>,
    module_path: Option<&'static str>,
    line: Option<u32>,
    message: String,
    wall_time: Duration,

    thread_name: String,
    thread_id: u32,
    guest_tid: Option<Tid>,
}

impl std::fmt::Display for GuestLogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        {
            let secs = self.wall_time.as_secs();
            write!(
                f,
                "{:02}:{:02}:{:02}.{:06}",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60,
                self.wall_time.subsec_micros()
            )?;
        }
        write!(f, " [{}:{}]", self.thread_id, self.thread_name)?;
        write!(f, " [{level}]", level = self.level)?;
        if let Some(tid) = self.guest_tid {
            write!(f, " [tid {tid}]")?;
        } else {
            write!(f, " [n/a]")?;
        }
        write!(
            f,
            " [{file}:",
            file = self
                .file
                .map(|f| if let Some(sep_pos) = f.rfind('/') {
                    &f[(sep_pos + 1)..]
                } else {
                    f
                })
                .unwrap_or("n/a"),
        )?;
        if let Some(line) = self.line {
            write!(f, "{line}")?;
        } else {
            write!(f, "n/a")?;
        }
        writeln!(
            f,
            "] [{module}] {msg}",
            module = self.module_path.unwrap_or("n/a"),
            msg = self.message
        )?;
        Ok(())
    }
}

enum LoggerCommand {
    // Flush; takes an optional one-shot channel to notify that the flush has completed.
    Flush(Option<Sender<()>>),
}

pub fn set_buffering_enabled(buffering_enabled: bool) {
    GUEST_LOGGER.set_buffering_enabled(buffering_enabled);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(guest_tid: Option<Tid>, file: Option<&'static str>) -> GuestLogRecord {
        GuestLogRecord {
            level: Level::Warn,
            file,
            module_path: Some("nbguest::host::heap"),
            line: Some(42),
            message: "brk shrink".into(),
            wall_time: Duration::from_micros(3_723_000_005),
            thread_name: "main".into(),
            thread_id: 7,
            guest_tid,
        }
    }

    #[test]
    fn test_record_format() {
        let line = record(Some(Tid::MAIN), Some("src/main/host/heap.rs")).to_string();
        assert_eq!(
            line,
            "01:02:03.000005 [7:main] [WARN] [tid 1] [heap.rs:42] [nbguest::host::heap] brk shrink\n"
        );
    }

    #[test]
    fn test_record_format_no_guest_thread() {
        let line = record(None, None).to_string();
        assert!(line.contains(" [WARN] [n/a] [n/a:42] "), "{line}");
    }

    #[test]
    fn test_current_tid_is_per_thread() {
        set_current_tid(Some(Tid::MAIN));
        let other = std::thread::spawn(|| CURRENT_TID.with(Cell::get))
            .join()
            .unwrap();
        assert_eq!(other, None);
        assert_eq!(CURRENT_TID.with(Cell::get), Some(Tid::MAIN));
        set_current_tid(None);
    }
}
