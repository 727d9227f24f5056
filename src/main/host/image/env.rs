//! The guest's environment: a copy of the engine's, with the engine's
//! preload libraries added to `LD_PRELOAD`.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::unistd::AccessFlags;

/// Set by the launcher to tell the engine where it was started from. The
/// guest must not see it.
pub const VALGRIND_LAUNCHER: &str = "VALGRIND_LAUNCHER";

const LD_PRELOAD: &str = "LD_PRELOAD=";

/// Where the preload libraries are and which ones to use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreloadConfig<'a> {
    pub libdir: &'a Path,
    pub tool: &'a str,
    pub platform: &'a str,
}

/// The value to put in front of any existing `LD_PRELOAD`: the core preload
/// library, followed by the tool's own if it has one.
pub fn preload_string(cfg: &PreloadConfig) -> OsString {
    let core = cfg
        .libdir
        .join(format!("vgpreload_core-{}.so", cfg.platform));
    let tool = cfg
        .libdir
        .join(format!("vgpreload_{}-{}.so", cfg.tool, cfg.platform));

    let mut preload = core.into_os_string();
    if nix::unistd::access(&tool, AccessFlags::R_OK).is_ok() {
        preload.push(":");
        preload.push(tool);
    }
    log::debug!("preload_string: {preload:?}");
    preload
}

/// Builds the guest's environment from `orig`.
pub fn setup_client_env(orig: &[OsString], cfg: &PreloadConfig) -> Vec<OsString> {
    let preload = preload_string(cfg);
    let mut env = Vec::with_capacity(orig.len() + 1);
    let mut preload_done = false;

    for var in orig {
        if let Some(old) = var.as_bytes().strip_prefix(LD_PRELOAD.as_bytes()) {
            let mut new = OsString::from(LD_PRELOAD);
            new.push(&preload);
            new.push(":");
            new.push(OsStr::from_bytes(old));
            env.push(new);
            preload_done = true;
        } else {
            env.push(var.clone());
        }
    }

    if !preload_done {
        let mut new = OsString::from(LD_PRELOAD);
        new.push(&preload);
        env.push(new);
    }

    // Only the first binding goes, as the launcher only sets one.
    let launcher = format!("{VALGRIND_LAUNCHER}=");
    if let Some(i) = env
        .iter()
        .position(|var| var.as_bytes().starts_with(launcher.as_bytes()))
    {
        env.remove(i);
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[&str]) -> Vec<OsString> {
        vars.iter().map(OsString::from).collect()
    }

    fn cfg(libdir: &Path) -> PreloadConfig<'_> {
        PreloadConfig {
            libdir,
            tool: "memcheck",
            platform: "amd64-netbsd",
        }
    }

    #[test]
    fn test_preload_added() {
        let dir = tempfile::tempdir().unwrap();
        let out = setup_client_env(&env(&["HOME=/root", "TERM=xterm"]), &cfg(dir.path()));

        let expected = format!(
            "LD_PRELOAD={}/vgpreload_core-amd64-netbsd.so",
            dir.path().display()
        );
        assert_eq!(out, env(&["HOME=/root", "TERM=xterm", &expected]));
    }

    #[test]
    fn test_preload_prepended() {
        let dir = tempfile::tempdir().unwrap();
        let out = setup_client_env(&env(&["LD_PRELOAD=foo.so", "A=b"]), &cfg(dir.path()));

        let expected = format!(
            "LD_PRELOAD={}/vgpreload_core-amd64-netbsd.so:foo.so",
            dir.path().display()
        );
        assert_eq!(out, env(&[&expected, "A=b"]));
    }

    #[test]
    fn test_tool_preload_when_readable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vgpreload_memcheck-amd64-netbsd.so"), b"").unwrap();

        let expected = format!(
            "{0}/vgpreload_core-amd64-netbsd.so:{0}/vgpreload_memcheck-amd64-netbsd.so",
            dir.path().display()
        );
        assert_eq!(preload_string(&cfg(dir.path())), OsString::from(expected));
    }

    #[test]
    fn test_launcher_removed() {
        let dir = tempfile::tempdir().unwrap();
        let out = setup_client_env(
            &env(&["A=1", "VALGRIND_LAUNCHER=/usr/local/bin/valgrind", "B=2"]),
            &cfg(dir.path()),
        );
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .all(|v| !v.as_bytes().starts_with(b"VALGRIND_LAUNCHER")));
        assert_eq!(out[0], "A=1");
        assert_eq!(out[1], "B=2");
    }

    #[test]
    fn test_exactly_one_preload() {
        let dir = tempfile::tempdir().unwrap();
        let out = setup_client_env(&env(&["LD_PRELOAD="]), &cfg(dir.path()));
        let count = out
            .iter()
            .filter(|v| v.as_bytes().starts_with(b"LD_PRELOAD="))
            .count();
        assert_eq!(count, 1);
    }
}
