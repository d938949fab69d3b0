//! Executable shims the external tool is pointed at while a prompt server
//! is running. Each one re-enters the companion runtime (this binary), which
//! talks to the prompt socket.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Env var holding the caller's `GIT_SSH_COMMAND` from before it was rewritten.
pub const ORIGINAL_SSH_COMMAND_ENV: &str = "GITWARDEN_ORIGINAL_GIT_SSH_COMMAND";

/// Everything the helpers need to find their way back to the prompt server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPaths {
    /// Target for `GIT_ASKPASS` and `SSH_ASKPASS`.
    pub askpass: PathBuf,
    /// Target for `credential.helper`.
    pub credential_helper: PathBuf,
    /// Target for `GIT_SSH_COMMAND`.
    pub ssh_wrapper: PathBuf,
    /// Target for `gpg.program`.
    pub gpg_wrapper: PathBuf,
    /// The companion runtime the launchers exec.
    pub runtime: PathBuf,
    pub socket: PathBuf,
}

/// Write the launchers into `dir`.
pub fn write_launchers(dir: &Path, runtime: &Path, socket: &Path) -> Result<HelperPaths> {
    let runtime_quoted = shell_quote(&runtime.to_string_lossy());

    let askpass = dir.join("askpass.sh");
    write_executable(
        &askpass,
        &format!("#!/bin/sh\nexec {runtime_quoted} askpass \"$@\"\n"),
    )?;

    let credential_helper = dir.join("credential-helper.sh");
    write_executable(
        &credential_helper,
        &format!("#!/bin/sh\nexec {runtime_quoted} credential \"$@\"\n"),
    )?;

    // GIT_SSH_COMMAND is a shell snippet, so the original one is eval'd.
    let ssh_wrapper = dir.join("ssh-wrapper.sh");
    write_executable(
        &ssh_wrapper,
        &format!(
            "#!/bin/sh\neval \"exec ${{{ORIGINAL_SSH_COMMAND_ENV}:-ssh}} \\\"\\$@\\\"\"\n"
        ),
    )?;

    let gpg_wrapper = write_gpg_wrapper(dir, runtime)?;

    Ok(HelperPaths {
        askpass,
        credential_helper,
        ssh_wrapper,
        gpg_wrapper,
        runtime: runtime.to_path_buf(),
        socket: socket.to_path_buf(),
    })
}

/// Write only the `gpg.program` launcher, for signing without a prompt server.
pub fn write_gpg_wrapper(dir: &Path, runtime: &Path) -> Result<PathBuf> {
    let gpg_wrapper = dir.join("gpg-wrapper.sh");
    write_executable(
        &gpg_wrapper,
        &format!(
            "#!/bin/sh\nexec {} gpg \"$@\"\n",
            shell_quote(&runtime.to_string_lossy())
        ),
    )?;
    Ok(gpg_wrapper)
}

/// Single-quote `value` for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn write_executable(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    set_executable(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
