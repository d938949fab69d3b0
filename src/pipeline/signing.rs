use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::CommandFailure;

/// Exit code git uses for fatal errors, including a failed signing program.
pub const SIGNING_FAILURE_EXIT_CODE: i32 = 128;

static SIGNING_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)gpg failed|failed to sign|signing failed")
        .expect("signing failure pattern compiles")
});

/// `-c` override pointing `gpg.program` at the wrapper launcher. git runs the
/// program directly, so the path is not shell-quoted.
pub fn signing_program_args(wrapper: &Path) -> Vec<String> {
    vec![
        "-c".to_string(),
        format!("gpg.program={}", wrapper.display()),
    ]
}

/// A failure caused by the signing agent rather than the command itself.
pub fn is_signing_failure(failure: &CommandFailure) -> bool {
    failure.exit_code == SIGNING_FAILURE_EXIT_CODE && SIGNING_FAILURE.is_match(&failure.stderr)
}
