//! The engine's configuration and cli parsing code using [serde] and [clap]. Every option can be
//! given in a YAML configuration file, and most can also be given on the command line, where they
//! override the file.
//!
//! [schemars] is used to get each option's description (its doc comment) and default value so
//! that they can be shown in the CLI help text.
//!
//! This code only checks that values are well formed. It doesn't check that paths exist or that
//! the named tool has a preload library; that is left to the code that uses them, so that a
//! configuration that parses on one system also parses on another.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use merge::Merge;
use once_cell::sync::Lazy;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::host::engine::EngineOptions;
use crate::host::syscall::fd::FdPolicy;

const START_HELP_TEXT: &str = "\
    Run a NetBSD amd64 program under the instrumentation engine.\n\n\
    The program is started with the given arguments and the engine's environment.";

const END_HELP_TEXT: &str = "\
    Options given on the command line override those in the configuration file. \
    Sizes are in bytes.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "nbguest", about = START_HELP_TEXT, after_help = END_HELP_TEXT)]
#[clap(version)]
#[clap(next_display_order = None)]
#[clap(hide_possible_values = true)]
pub struct CliOptions {
    /// Path to a YAML configuration file
    #[clap(long, short = 'c', value_name = "path")]
    pub config: Option<PathBuf>,

    /// Exit after printing the final configuration
    #[clap(long)]
    pub show_config: bool,

    /// Build the guest's process image in a simulated address space, print it, and exit
    /// without running the guest
    #[clap(long)]
    pub dry_run: bool,

    #[clap(flatten)]
    pub general: GeneralOptions,

    #[clap(flatten)]
    pub guest: GuestOptions,

    /// The program to run, followed by its arguments. Everything after the program is passed
    /// to it, including anything that looks like an option.
    #[clap(
        value_name = "program [args]",
        required_unless_present = "show_config",
        trailing_var_arg = true
    )]
    pub command: Vec<OsString>,
}

impl CliOptions {
    pub fn program(&self) -> Option<&OsStr> {
        self.command.first().map(OsString::as_os_str)
    }

    /// The program's arguments, not including the program itself.
    pub fn args(&self) -> &[OsString] {
        self.command.get(1..).unwrap_or(&[])
    }
}

/// Options contained in a configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileOptions {
    #[serde(default)]
    pub general: GeneralOptions,

    #[serde(default)]
    pub guest: GuestOptions,
}

/// Configuration options after processing command-line and configuration file options.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigOptions {
    pub general: GeneralOptions,

    pub guest: GuestOptions,
}

impl ConfigOptions {
    pub fn new(mut config_file: ConfigFileOptions, options: CliOptions) -> Self {
        // a group missing from the file gets the real defaults, but a group that is present
        // only gets the serde defaults for its missing fields, so merge both
        config_file.general = config_file.general.with_defaults(GeneralOptions::default());
        config_file.guest = config_file.guest.with_defaults(GuestOptions::default());

        // override config options with command line options
        Self {
            general: options.general.with_defaults(config_file.general),
            guest: options.guest.with_defaults(config_file.guest),
        }
    }

    pub fn log_level(&self) -> log::Level {
        self.general.log_level.unwrap().into()
    }

    /// The engine options for a process whose descriptor soft limit is `fd_soft_limit`.
    pub fn engine_options(&self, fd_soft_limit: i32, data_limit: usize) -> EngineOptions {
        let track_fds = self.guest.track_fds.unwrap();
        let mut fd_policy = FdPolicy::from_soft_limit(fd_soft_limit, track_fds);
        if let Some(limit) = self.guest.fd_hard_limit {
            fd_policy.hard_limit = fd_policy.hard_limit.min(limit);
        }

        EngineOptions {
            max_threads: self.guest.max_threads.unwrap() as usize,
            engine_stack_size: self.guest.engine_stacksize.unwrap() as usize,
            fd_policy,
            data_limit,
        }
    }
}

/// Help messages used by Clap for command line arguments, combining the doc string with
/// the Serde default.
static GENERAL_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(GeneralOptions)));

// these must all be Option types since they aren't required by the CLI, even if they're
// required in the configuration file
#[derive(Debug, Clone, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "General (Override configuration file options)")]
#[clap(next_display_order = None)]
#[serde(deny_unknown_fields)]
pub struct GeneralOptions {
    /// Log level of output written on stdout. If the engine was built in release mode, then log
    /// messages at level 'trace' will always be dropped
    #[clap(long, short = 'l', value_name = "level")]
    #[clap(help = GENERAL_HELP.get("log_level").unwrap().as_str())]
    #[serde(default = "default_some_info")]
    pub log_level: Option<LogLevel>,

    /// Also write log messages at level 'error' to stderr
    #[clap(long, value_name = "bool")]
    #[clap(help = GENERAL_HELP.get("log_errors_to_stderr").unwrap().as_str())]
    #[serde(default = "default_some_true")]
    pub log_errors_to_stderr: Option<bool>,
}

impl GeneralOptions {
    /// Replace unset (`None`) values of `base` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            log_level: Some(LogLevel::Info),
            log_errors_to_stderr: Some(true),
        }
    }
}

/// Help messages used by Clap for command line arguments, combining the doc string with
/// the Serde default.
static GUEST_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(GuestOptions)));

#[derive(Debug, Clone, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "Guest (Override configuration file options)")]
#[clap(next_display_order = None)]
#[serde(deny_unknown_fields)]
pub struct GuestOptions {
    /// Name of the tool whose preload library is given to the guest
    #[clap(long, value_name = "name")]
    #[clap(help = GUEST_HELP.get("tool").unwrap().as_str())]
    #[serde(default = "default_tool")]
    pub tool: Option<String>,

    /// Directory containing the preload libraries
    #[clap(long, value_name = "path")]
    #[clap(help = GUEST_HELP.get("libdir").unwrap().as_str())]
    #[serde(default = "default_libdir")]
    pub libdir: Option<PathBuf>,

    /// Platform suffix of the preload libraries
    #[clap(long, value_name = "name")]
    #[clap(help = GUEST_HELP.get("platform").unwrap().as_str())]
    #[serde(default = "default_platform")]
    pub platform: Option<String>,

    /// Size of the main thread's stack. A value of 0 uses the stack resource limit
    #[clap(long, value_name = "bytes")]
    #[clap(help = GUEST_HELP.get("main_stacksize").unwrap().as_str())]
    #[serde(default = "default_some_0")]
    pub main_stacksize: Option<u64>,

    /// Size of the stack the engine runs on for each guest thread
    #[clap(long, value_name = "bytes")]
    #[clap(help = GUEST_HELP.get("engine_stacksize").unwrap().as_str())]
    #[serde(default = "default_engine_stacksize")]
    pub engine_stacksize: Option<u64>,

    /// Maximum number of guest threads alive at once
    #[clap(long, value_name = "N")]
    #[clap(help = GUEST_HELP.get("max_threads").unwrap().as_str())]
    #[serde(default = "default_max_threads")]
    pub max_threads: Option<u32>,

    /// Keep a record of the descriptors the guest opens
    #[clap(long, value_name = "bool")]
    #[clap(help = GUEST_HELP.get("track_fds").unwrap().as_str())]
    #[serde(default = "default_some_false")]
    pub track_fds: Option<bool>,

    /// Lowest descriptor kept for the engine. Defaults to a few below the descriptor soft limit
    #[clap(long, value_name = "fd")]
    #[clap(help = GUEST_HELP.get("fd_hard_limit").unwrap().as_str())]
    #[serde(default)]
    pub fd_hard_limit: Option<i32>,
}

impl GuestOptions {
    /// Replace unset (`None`) values of `base` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            libdir: default_libdir(),
            platform: default_platform(),
            main_stacksize: default_some_0(),
            engine_stacksize: default_engine_stacksize(),
            max_threads: default_max_threads(),
            track_fds: default_some_false(),
            fd_hard_limit: None,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Helper function for serde default `Some(true)` values.
fn default_some_true() -> Option<bool> {
    Some(true)
}

/// Helper function for serde default `Some(false)` values.
fn default_some_false() -> Option<bool> {
    Some(false)
}

/// Helper function for serde default `Some(0)` values.
fn default_some_0() -> Option<u64> {
    Some(0)
}

/// Helper function for serde default `Some(LogLevel::Info)` values.
fn default_some_info() -> Option<LogLevel> {
    Some(LogLevel::Info)
}

fn default_tool() -> Option<String> {
    Some("none".into())
}

fn default_libdir() -> Option<PathBuf> {
    Some(PathBuf::from("/usr/local/libexec/valgrind"))
}

fn default_platform() -> Option<String> {
    Some("amd64-netbsd".into())
}

fn default_engine_stacksize() -> Option<u64> {
    Some(1024 * 1024)
}

fn default_max_threads() -> Option<u32> {
    Some(500)
}

/// Generate help strings for objects in a JSON schema, including the Serde defaults if available.
fn generate_help_strs(
    schema: schemars::schema::RootSchema,
) -> std::collections::HashMap<String, String> {
    let mut defaults = std::collections::HashMap::<String, String>::new();
    for (name, obj) in &schema.schema.object.as_ref().unwrap().properties {
        if let Some(meta) = obj.clone().into_object().metadata {
            let description = meta.description.unwrap_or_default();
            let space = if !description.is_empty() { " " } else { "" };
            match meta.default {
                Some(default) => defaults.insert(
                    name.clone(),
                    format!("{}{}[default: {}]", description, space, default),
                ),
                None => defaults.insert(name.clone(), description.to_string()),
            };
        }
    }
    defaults
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliOptions {
        CliOptions::try_parse_from(std::iter::once("nbguest").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_program_and_args() {
        let options = cli(&["--tool", "memcheck", "/bin/ls", "-l", "--color", "/tmp"]);
        assert_eq!(options.program(), Some(OsStr::new("/bin/ls")));
        assert_eq!(options.args(), ["-l", "--color", "/tmp"]);
        assert_eq!(options.guest.tool.as_deref(), Some("memcheck"));
        // left at its default: the `-l` belongs to the program
        assert!(options.general.log_level.is_none());
    }

    #[test]
    fn test_program_without_args() {
        let options = cli(&["-l", "debug", "/bin/true"]);
        assert_eq!(options.program(), Some(OsStr::new("/bin/true")));
        assert!(options.args().is_empty());
        assert!(cli(&["--show-config"]).program().is_none());
    }

    #[test]
    fn test_engine_options_after_program_go_to_program() {
        let options = cli(&["/bin/echo", "--dry-run", "--show-config"]);
        assert!(!options.dry_run);
        assert!(!options.show_config);
        assert_eq!(options.args(), ["--dry-run", "--show-config"]);
    }

    #[test]
    fn test_program_required() {
        assert!(CliOptions::try_parse_from(["nbguest", "--dry-run"]).is_err());
        assert!(CliOptions::try_parse_from(["nbguest", "--show-config"]).is_ok());
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ConfigOptions::new(ConfigFileOptions::default(), cli(&["/bin/true"]));
        assert_eq!(config.guest.tool.as_deref(), Some("none"));
        assert_eq!(config.guest.platform.as_deref(), Some("amd64-netbsd"));
        assert_eq!(config.guest.max_threads, Some(500));
        assert_eq!(config.log_level(), log::Level::Info);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: ConfigFileOptions = serde_yaml::from_str(
            "general:\n  log_level: debug\nguest:\n  tool: memcheck\n  max_threads: 20\n",
        )
        .unwrap();
        let config = ConfigOptions::new(file, cli(&["--max-threads", "8", "/bin/true"]));
        assert_eq!(config.guest.max_threads, Some(8));
        assert_eq!(config.guest.tool.as_deref(), Some("memcheck"));
        assert_eq!(config.log_level(), log::Level::Debug);
        // not in the file, not on the command line
        assert_eq!(config.guest.track_fds, Some(false));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let res: Result<ConfigFileOptions, _> = serde_yaml::from_str("guest:\n  colour: red\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_engine_options() {
        let file: ConfigFileOptions =
            serde_yaml::from_str("guest:\n  fd_hard_limit: 100\n  track_fds: true\n").unwrap();
        let config = ConfigOptions::new(file, cli(&["/bin/true"]));

        let options = config.engine_options(1024, 1 << 20);
        assert_eq!(options.fd_policy.hard_limit, 100);
        assert!(options.fd_policy.track_fds);
        assert_eq!(options.max_threads, 500);
        assert_eq!(options.data_limit, 1 << 20);

        // never above what the soft limit leaves
        let options = config.engine_options(64, 0);
        assert_eq!(options.fd_policy.hard_limit, 52);
    }

    #[test]
    fn test_log_level_from_str() {
        assert!(matches!(LogLevel::from_str("warning"), Ok(LogLevel::Warning)));
        assert!(LogLevel::from_str("loud").is_err());
    }
}
