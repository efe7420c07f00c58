//! Client side of the setuid namespace launcher

use std::convert::Infallible;
use std::ffi::OsString;

use crate::argv::ExecArgs;
use crate::defs;
use crate::Result;

/// Build the launcher's tri-partite argv:
/// `helper cmd… -- mount-name target=source… -- NAME=VALUE…`
fn launcher_args(
    mount_name: &str,
    ns_args: &[String],
    cmd_argv: &[String],
    env: &[OsString],
) -> Result<ExecArgs> {
    let mut args = ExecArgs::new();
    args.push(defs::namespace_helper_path())?;
    for arg in cmd_argv {
        args.push(arg)?;
    }
    args.push("--")?;
    args.push(mount_name)?;
    for arg in ns_args {
        args.push(arg)?;
    }
    args.push("--")?;
    for entry in env {
        args.push(entry)?;
    }
    Ok(args)
}

/// Replace this process with `cmd_argv` run inside a fresh mount namespace
/// where each `target=source` pair becomes a symlink under
/// [`defs::MOUNTPOINT`].
///
/// The launcher is setuid, so the loader hands it a sanitized environment;
/// the caller's real environment rides the command line after the second
/// `--` and the helper is execed with an *empty* environ. Only returns on
/// failure.
pub fn exec_with_namespace(
    mount_name: &str,
    ns_args: &[String],
    cmd_argv: &[String],
) -> Result<Infallible> {
    let env: Vec<OsString> = std::env::vars_os()
        .map(|(mut key, value)| {
            key.push("=");
            key.push(value);
            key
        })
        .collect();
    let args = launcher_args(mount_name, ns_args, cmd_argv, &env)?;
    args.do_execve(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_sections_are_ordered_and_separated() {
        let args = launcher_args(
            "mylabel",
            &["a=/etc/hosts".into(), "b/c=/tmp".into()],
            &["sh".into(), "-c".into(), "ls /with".into()],
            &[OsString::from("PATH=/usr/bin")],
        )
        .unwrap();

        let flat: Vec<&str> = args
            .as_cstrings()
            .iter()
            .map(|c| c.to_str().unwrap())
            .collect();
        assert_eq!(
            flat,
            [
                "/usr/bin/with-namespace",
                "sh",
                "-c",
                "ls /with",
                "--",
                "mylabel",
                "a=/etc/hosts",
                "b/c=/tmp",
                "--",
                "PATH=/usr/bin",
            ]
        );
    }
}
