//! Setuid launcher: detach a mount namespace, remount the shared tmpfs,
//! materialize a symlink view, drop privilege, exec the user command.
//!
//! ```text
//! with-namespace cmd args... -- mount-name target1=src1 target2=src2 ... -- env...
//! ```
//!
//! The segments are found by scanning *backwards* from the end of the
//! command line: everything after the last `--` is the environment to
//! reinstall (the loader sanitized the inherited one), the segment before
//! it is the mount label plus the `target=source` bindings, and the rest
//! is the command. The `--init.d` first-arg form only builds the symlinks
//! and metadata, priming an already-mounted tmpfs at boot.

use std::ffi::{CString, OsStr, OsString};
use std::fs::DirBuilder;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{execvp, getgid, getuid, setresgid, setresuid};

use with_core::defs;

fn main() -> ExitCode {
    let argv: Vec<OsString> = std::env::args_os().collect();
    let progname = argv
        .first()
        .map(|a| Path::new(a))
        .and_then(Path::file_name)
        .map_or_else(|| defs::NAMESPACE_HELPER.into(), |n| n.to_string_lossy().into_owned());

    match run(&argv, &progname) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{progname}: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(argv: &[OsString], progname: &str) -> Result<ExitCode> {
    if argv.len() <= 1 {
        return Ok(usage(progname));
    }

    // boot-time fast path: the tmpfs is already mounted, just prime it
    if argv[1] == "--init.d" {
        let ns_args = &argv[2..];
        if ns_args.is_empty() {
            return Ok(usage(progname));
        }
        materialize(Path::new(defs::MOUNTPOINT), ns_args)?;
        return Ok(ExitCode::SUCCESS);
    }

    let Some(split) = split_args(&argv[1..]) else {
        return Ok(usage(progname));
    };
    if split.cmd.is_empty() {
        return Ok(usage(progname));
    }

    // detach from the parent's mount namespace
    unshare(CloneFlags::CLONE_NEWNS).context("unshare")?;

    // lazily detach the inherited tmpfs; MNT_DETACH copes with a cwd
    // pointing inside it
    umount2(defs::MOUNTPOINT, MntFlags::MNT_DETACH)
        .with_context(|| format!("umount2 tmpfs {}", defs::MOUNTPOINT))?;

    // the label becomes the mount source in /proc/self/mounts
    let label = &split.ns[0];
    mount(
        Some(label.as_os_str()),
        defs::MOUNTPOINT,
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .with_context(|| format!("mount tmpfs {}", defs::MOUNTPOINT))?;

    materialize(Path::new(defs::MOUNTPOINT), &split.ns)?;
    write_env_file(Path::new(defs::MOUNTPOINT), &split.env)?;

    drop_privileges()?;
    install_env(&split.env)?;
    exec_cmd(&split.cmd)
}

fn usage(progname: &str) -> ExitCode {
    eprintln!(
        "usage: {progname} cmd args... -- mount-name target1=src1 target2=src2 ... -- env...\n\
         \x20   Setuid helper: execs cmd in a fresh mount namespace where, for each\n\
         \x20   target=src, {}/target is a symlink to src.",
        defs::MOUNTPOINT
    );
    ExitCode::FAILURE
}

struct SplitArgs {
    cmd: Vec<OsString>,
    /// Mount label followed by the `target=source` pairs
    ns: Vec<OsString>,
    env: Vec<OsString>,
}

/// Scan backwards for the two `--` separators. Returns `None` when the
/// namespace segment is missing or empty.
fn split_args(args: &[OsString]) -> Option<SplitArgs> {
    let mut i = args.len();

    let mut env = Vec::new();
    while i > 0 && args[i - 1] != "--" {
        env.push(args[i - 1].clone());
        i -= 1;
    }
    if i == 0 {
        return None;
    }
    i -= 1; // skip --
    env.reverse();

    let mut ns = Vec::new();
    while i > 0 && args[i - 1] != "--" {
        ns.push(args[i - 1].clone());
        i -= 1;
    }
    if ns.is_empty() {
        return None;
    }
    i = i.saturating_sub(1); // skip --
    ns.reverse();

    let cmd = args[..i].to_vec();
    Some(SplitArgs { cmd, ns, env })
}

/// Split one `target=source` binding on the first `=`. A missing `=` or an
/// empty source is an error.
fn split_binding(arg: &OsStr) -> Result<(PathBuf, OsString)> {
    let bytes = arg.as_bytes();
    let eq = bytes
        .iter()
        .position(|&b| b == b'=')
        .filter(|&i| i + 1 < bytes.len());
    let Some(eq) = eq else {
        bail!("argument {:?} must be of the form target=src", arg);
    };
    let target = OsStr::from_bytes(&bytes[..eq]);
    let source = OsStr::from_bytes(&bytes[eq + 1..]);
    Ok((PathBuf::from(target), source.to_os_string()))
}

/// Create the symlinks for every `target=source` after the mount label and
/// write the `.ns` metadata file listing all namespace args.
fn materialize(base: &Path, ns_args: &[OsString]) -> Result<()> {
    for arg in &ns_args[1..] {
        let (target, source) = split_binding(arg)?;
        let link = base.join(&target);

        if let Some(dir) = link.parent() {
            // recursive create tolerates pre-existing directories
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("create {}", dir.display()))?;
        }

        symlink(&source, &link).with_context(|| {
            format!("symlink {} -> {}", link.display(), source.to_string_lossy())
        })?;
    }

    let mut contents = Vec::new();
    for arg in ns_args {
        contents.extend_from_slice(arg.as_bytes());
        contents.push(b' ');
    }
    std::fs::write(base.join(defs::NS_FILE), contents)
        .context("unable to write namespace metadata")?;
    Ok(())
}

/// Write the `.env` metadata file, one entry per line
fn write_env_file(base: &Path, env_args: &[OsString]) -> Result<()> {
    let mut contents = Vec::new();
    for arg in env_args {
        contents.extend_from_slice(arg.as_bytes());
        contents.push(b'\n');
    }
    std::fs::write(base.join(defs::ENV_FILE), contents)
        .context("unable to write env metadata")?;
    Ok(())
}

/// Drop all setuid privilege to the real ids. Groups first: after the uid
/// drop there is no privilege left to change them.
fn drop_privileges() -> Result<()> {
    let gid = getgid();
    let uid = getuid();
    setresgid(gid, gid, gid).context("setresgid")?;
    setresuid(uid, uid, uid).context("setresuid")?;
    Ok(())
}

/// Reinstall the environment passed on the command line. The loader
/// sanitized the inherited environ for the setuid binary, so this is the
/// only channel for the caller's intended environment.
fn install_env(env_args: &[OsString]) -> Result<()> {
    // SAFETY: single-threaded, and exec follows immediately
    unsafe {
        libc::clearenv();
    }
    for entry in env_args {
        let entry = CString::new(entry.as_bytes())
            .with_context(|| format!("env entry {entry:?} contains a NUL byte"))?;
        // putenv keeps the pointer in environ; the string is intentionally
        // leaked since exec follows
        // SAFETY: entry is a valid NAME=VALUE string whose ownership moves
        // into environ
        let ret = unsafe { libc::putenv(entry.into_raw()) };
        if ret != 0 {
            bail!("putenv failed");
        }
    }
    Ok(())
}

fn exec_cmd(cmd: &[OsString]) -> Result<ExitCode> {
    let args: Vec<CString> = cmd
        .iter()
        .map(|a| {
            CString::new(a.as_bytes())
                .with_context(|| format!("argument {a:?} contains a NUL byte"))
        })
        .collect::<Result<_>>()?;

    match execvp(&args[0], &args) {
        Ok(never) => match never {},
        Err(errno) => bail!("cannot exec {}: {errno}", args[0].to_string_lossy()),
    }
}
