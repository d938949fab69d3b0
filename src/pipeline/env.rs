//! Environment for one invocation of the external tool.

use std::collections::BTreeMap;
use std::path::Path;

use crate::prompt::launchers::{shell_quote, HelperPaths, ORIGINAL_SSH_COMMAND_ENV};

pub const ASKPASS_LAUNCHER_ENV: &str = "GITWARDEN_ASKPASS_LAUNCHER";
pub const CREDENTIAL_HELPER_LAUNCHER_ENV: &str = "GITWARDEN_CREDENTIAL_HELPER_LAUNCHER";
pub const RUNTIME_PATH_ENV: &str = "GITWARDEN_RUNTIME_PATH";
pub const SOCKET_PATH_ENV: &str = "GITWARDEN_SOCKET_PATH";
pub const WORKDIR_PATH_ENV: &str = "GITWARDEN_WORKDIR_PATH";
pub const ORIGINAL_GIT_ASKPASS_ENV: &str = "GITWARDEN_ORIGINAL_GIT_ASKPASS";
pub const ORIGINAL_SSH_ASKPASS_ENV: &str = "GITWARDEN_ORIGINAL_SSH_ASKPASS";
pub const ORIGINAL_PATH_ENV: &str = "GITWARDEN_ORIGINAL_PATH";
/// gpg the signing wrapper runs when git config names none.
pub const GPG_PROGRAM_ENV: &str = "GITWARDEN_GPG_PROGRAM";

/// Overrides applied to every invocation: the tool must never prompt on a
/// terminal itself.
pub fn base_environment() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("GIT_TERMINAL_PROMPT".into(), "0".into());
    env
}

/// Point the tool's askpass, ssh and credential hooks at the prompt server's
/// launchers. `lookup` reads the caller's environment.
pub fn apply_credential_environment<F>(
    env: &mut BTreeMap<String, String>,
    helpers: &HelperPaths,
    working_dir: &Path,
    display_placeholder: &str,
    lookup: F,
) where
    F: Fn(&str) -> Option<String>,
{
    for (var, snapshot) in [
        ("GIT_ASKPASS", ORIGINAL_GIT_ASKPASS_ENV),
        ("SSH_ASKPASS", ORIGINAL_SSH_ASKPASS_ENV),
        ("GIT_SSH_COMMAND", ORIGINAL_SSH_COMMAND_ENV),
        ("PATH", ORIGINAL_PATH_ENV),
    ] {
        env.insert(snapshot.into(), lookup(var).unwrap_or_default());
    }

    let askpass = helpers.askpass.to_string_lossy().into_owned();
    env.insert(ASKPASS_LAUNCHER_ENV.into(), askpass.clone());
    env.insert(
        CREDENTIAL_HELPER_LAUNCHER_ENV.into(),
        helpers.credential_helper.to_string_lossy().into_owned(),
    );
    env.insert(
        RUNTIME_PATH_ENV.into(),
        helpers.runtime.to_string_lossy().into_owned(),
    );
    env.insert(
        SOCKET_PATH_ENV.into(),
        helpers.socket.to_string_lossy().into_owned(),
    );
    env.insert(
        WORKDIR_PATH_ENV.into(),
        working_dir.to_string_lossy().into_owned(),
    );

    env.insert("GIT_ASKPASS".into(), askpass.clone());
    env.insert("SSH_ASKPASS".into(), askpass);
    env.insert("SSH_ASKPASS_REQUIRE".into(), "force".into());
    env.insert(
        "GIT_SSH_COMMAND".into(),
        shell_quote(&helpers.ssh_wrapper.to_string_lossy()),
    );

    // ssh only consults SSH_ASKPASS without a tty when DISPLAY is non-empty.
    match lookup("DISPLAY") {
        Some(display) if !display.is_empty() => {}
        _ => {
            env.insert("DISPLAY".into(), display_placeholder.into());
        }
    }
}

/// `-c` override that appends our credential helper after the user's own.
///
/// Command-line entries come last in git's helper list, so configured helpers
/// answer first and also receive `store` and `erase` from git directly.
pub fn credential_helper_args(helpers: &HelperPaths) -> Vec<String> {
    vec![
        "-c".into(),
        format!(
            "credential.helper=!{}",
            shell_quote(&helpers.credential_helper.to_string_lossy())
        ),
    ]
}
