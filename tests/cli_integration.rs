//! CLI integration tests using assert_cmd to exercise the actual binary.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use gitwarden::prompt::{
    CredentialPromptServer, PromptAnswer, PromptFuture, PromptHandler, PromptQuery,
};

/// The binary with HOME pointed at an empty dir so no user config leaks in.
fn gitwarden(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("gitwarden").unwrap();
    cmd.env("HOME", home)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env_remove("GITWARDEN_IN_PROCESS")
        .env_remove("GITWARDEN_SOCKET_PATH")
        .env_remove("GITWARDEN_ORIGINAL_GIT_ASKPASS")
        .env_remove("GITWARDEN_ORIGINAL_SSH_ASKPASS")
        .env_remove("GITWARDEN_GPG_PROGRAM");
    cmd
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

#[test]
fn run_in_process_prints_stdout() {
    let tmp = TempDir::new().unwrap();
    gitwarden(tmp.path())
        .args(["run", "--in-process", "--git-path", "sh", "--", "-c", "echo hi"])
        .current_dir(tmp.path())
        .assert()
        .success()
        .stdout("hi\n");
}

#[test]
fn run_failure_mirrors_stderr_and_exit_code() {
    let tmp = TempDir::new().unwrap();
    gitwarden(tmp.path())
        .args([
            "run",
            "--in-process",
            "--git-path",
            "sh",
            "--",
            "-c",
            "echo 'fatal: not a git repository' >&2; exit 5",
        ])
        .current_dir(tmp.path())
        .assert()
        .code(5)
        .stdout("")
        .stderr(predicate::str::contains("fatal: not a git repository"));
}

#[test]
fn run_uses_cwd_flag() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    std::fs::create_dir(&repo).unwrap();
    gitwarden(tmp.path())
        .args(["run", "--in-process", "--git-path", "sh", "--cwd"])
        .arg(&repo)
        .args(["--", "-c", "pwd"])
        .assert()
        .success()
        .stdout(predicate::str::ends_with("repo\n"));
}

#[test]
fn run_delegates_to_a_sandbox_host() {
    let tmp = TempDir::new().unwrap();
    gitwarden(tmp.path())
        .args(["run", "--git-path", "sh", "--", "-c", "printf delegated"])
        .current_dir(tmp.path())
        .assert()
        .success()
        .stdout("delegated");
}

#[test]
fn in_process_env_flag_is_honored() {
    let tmp = TempDir::new().unwrap();
    gitwarden(tmp.path())
        .env("GITWARDEN_IN_PROCESS", "1")
        .args(["run", "--git-path", "sh", "--", "-c", "printf local"])
        .current_dir(tmp.path())
        .assert()
        .success()
        .stdout("local");
}

#[test]
fn run_requires_tool_arguments() {
    let tmp = TempDir::new().unwrap();
    gitwarden(tmp.path()).args(["run"]).assert().failure();
}

// ---------------------------------------------------------------------------
// Helper subcommands
// ---------------------------------------------------------------------------

#[test]
fn askpass_without_socket_fails() {
    let tmp = TempDir::new().unwrap();
    gitwarden(tmp.path())
        .args(["askpass", "Password:"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("GITWARDEN_SOCKET_PATH"));
}

#[test]
fn credential_store_and_erase_are_ignored() {
    let tmp = TempDir::new().unwrap();
    for op in ["store", "erase"] {
        gitwarden(tmp.path())
            .args(["credential", op])
            .write_stdin("protocol=https\nhost=example.com\npassword=x\n\n")
            .assert()
            .success()
            .stdout("");
    }
}

fn answering_handler() -> PromptHandler {
    Arc::new(|query: PromptQuery| -> PromptFuture {
        Box::pin(async move {
            Ok(PromptAnswer {
                username: query.include_username.then(|| "octocat".to_string()),
                password: "s3cret".into(),
            })
        })
    })
}

#[tokio::test]
async fn credential_get_answers_through_the_prompt_server() {
    let home = TempDir::new().unwrap();
    let server = CredentialPromptServer::start(answering_handler(), Path::new("/usr/bin/true"))
        .await
        .unwrap();
    let socket = server.socket_path().clone();
    let home_path = home.path().to_path_buf();

    let assert = tokio::task::spawn_blocking(move || {
        gitwarden(&home_path)
            .env("GITWARDEN_SOCKET_PATH", &socket)
            .args(["credential", "get"])
            .write_stdin("protocol=https\nhost=example.com\n\n")
            .assert()
    })
    .await
    .unwrap();

    assert.success().stdout(
        "protocol=https\nhost=example.com\nusername=octocat\npassword=s3cret\n",
    );
    server.terminate().await;
}

#[tokio::test]
async fn askpass_prints_the_password() {
    let home = TempDir::new().unwrap();
    let server = CredentialPromptServer::start(answering_handler(), Path::new("/usr/bin/true"))
        .await
        .unwrap();
    let socket = server.socket_path().clone();
    let home_path = home.path().to_path_buf();

    let assert = tokio::task::spawn_blocking(move || {
        gitwarden(&home_path)
            .env("GITWARDEN_SOCKET_PATH", &socket)
            .args(["askpass", "Enter passphrase for key:"])
            .assert()
    })
    .await
    .unwrap();

    assert.success().stdout("s3cret\n");
    server.terminate().await;
}

fn counting_handler(calls: Arc<AtomicUsize>) -> PromptHandler {
    Arc::new(move |query: PromptQuery| -> PromptFuture {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(PromptAnswer {
                username: query.include_username.then(|| "octocat".to_string()),
                password: "s3cret".into(),
            })
        })
    })
}

// ---------------------------------------------------------------------------
// User-configured askpass and credential helpers come first
// ---------------------------------------------------------------------------

#[test]
fn user_askpass_answers_without_a_prompt_server() {
    let tmp = TempDir::new().unwrap();
    let askpass = script(
        tmp.path(),
        "user-askpass.sh",
        "#!/bin/sh\necho \"from-keychain for $1\"\n",
    );
    gitwarden(tmp.path())
        .env("GITWARDEN_ORIGINAL_SSH_ASKPASS", &askpass)
        .args(["askpass", "Passphrase:"])
        .assert()
        .success()
        .stdout("from-keychain for Passphrase:\n");
}

#[tokio::test]
async fn failing_user_askpass_falls_back_to_the_prompt_server() {
    let home = TempDir::new().unwrap();
    let failing = script(home.path(), "askpass-fails.sh", "#!/bin/sh\nexit 1\n");
    let crashing = script(home.path(), "askpass-crashes.sh", "#!/bin/sh\nkill -9 $$\n");
    let calls = Arc::new(AtomicUsize::new(0));
    let server = CredentialPromptServer::start(counting_handler(calls.clone()), Path::new("/usr/bin/true"))
        .await
        .unwrap();
    let socket = server.socket_path().clone();
    let home_path = home.path().to_path_buf();

    let assert = tokio::task::spawn_blocking(move || {
        gitwarden(&home_path)
            .env("GITWARDEN_SOCKET_PATH", &socket)
            .env("GITWARDEN_ORIGINAL_GIT_ASKPASS", &failing)
            .env("GITWARDEN_ORIGINAL_SSH_ASKPASS", &crashing)
            .args(["askpass", "Speak friend and enter"])
            .assert()
    })
    .await
    .unwrap();

    assert.success().stdout("s3cret\n");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    server.terminate().await;
}

const FILL_INPUT: &str = "protocol=https\nhost=example.com\n\n";

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

/// `git credential <action>` with a user helper followed by ours, the way the
/// pipeline configures it.
fn git_credential(
    home: &Path,
    user_helper: &Path,
    socket: Option<&Path>,
    action: &str,
    input: &str,
) -> Command {
    let ours = format!(
        "credential.helper=!'{}' credential",
        env!("CARGO_BIN_EXE_gitwarden")
    );
    let mut cmd = Command::new("git");
    cmd.env("HOME", home)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env_remove("GIT_ASKPASS")
        .env_remove("SSH_ASKPASS")
        .env_remove("GITWARDEN_SOCKET_PATH")
        .current_dir(home)
        .arg("-c")
        .arg(format!("credential.helper={}", user_helper.display()))
        .arg("-c")
        .arg(ours)
        .args(["credential", action])
        .write_stdin(input.to_string());
    if let Some(socket) = socket {
        cmd.env("GITWARDEN_SOCKET_PATH", socket);
    }
    cmd
}

#[test]
fn user_credential_helper_is_preferred() {
    if !git_available() {
        return;
    }
    let home = TempDir::new().unwrap();
    let helper = script(
        home.path(),
        "credential-helper-success.sh",
        "#!/bin/sh\nif [ \"$1\" = get ]; then\n  echo username=stored\n  echo password=from-store\nfi\n",
    );
    git_credential(home.path(), &helper, None, "fill", FILL_INPUT)
        .assert()
        .success()
        .stdout(predicate::str::contains("username=stored"))
        .stdout(predicate::str::contains("password=from-store"));
}

#[tokio::test]
async fn failing_user_credential_helper_falls_back_to_the_prompt_server() {
    if !git_available() {
        return;
    }
    let home = TempDir::new().unwrap();
    let helper = script(
        home.path(),
        "credential-helper-kaboom.sh",
        "#!/bin/sh\necho 'kaboom' >&2\nexit 1\n",
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let server = CredentialPromptServer::start(counting_handler(calls.clone()), Path::new("/usr/bin/true"))
        .await
        .unwrap();
    let socket = server.socket_path().clone();
    let home_path = home.path().to_path_buf();

    let assert = tokio::task::spawn_blocking(move || {
        git_credential(&home_path, &helper, Some(socket.as_path()), "fill", FILL_INPUT).assert()
    })
    .await
    .unwrap();

    assert
        .success()
        .stdout(predicate::str::contains("username=octocat"))
        .stdout(predicate::str::contains("password=s3cret"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    server.terminate().await;
}

#[test]
fn approved_credentials_reach_the_user_helper() {
    if !git_available() {
        return;
    }
    let home = TempDir::new().unwrap();
    let stored = home.path().join("stored");
    let helper = script(
        home.path(),
        "credential-helper-store.sh",
        &format!(
            "#!/bin/sh\nif [ \"$1\" = store ]; then cat > '{}'; fi\n",
            stored.display()
        ),
    );
    git_credential(
        home.path(),
        &helper,
        None,
        "approve",
        "protocol=https\nhost=example.com\nusername=octocat\npassword=s3cret\n\n",
    )
    .assert()
    .success();

    let saved = std::fs::read_to_string(&stored).unwrap();
    assert!(saved.contains("username=octocat"));
    assert!(saved.contains("password=s3cret"));
}

// ---------------------------------------------------------------------------
// gpg wrapper
// ---------------------------------------------------------------------------

/// Signs only when handed a passphrase descriptor, like gpg with no usable
/// pinentry. `FAKE_GPG_BAD` makes every attempt a bad passphrase.
const FAKE_GPG: &str = r#"#!/bin/sh
if [ -n "$FAKE_GPG_BAD" ]; then
  echo 'gpg: signing failed: Bad passphrase' >&2
  exit 2
fi
fd=
prev=
for arg in "$@"; do
  if [ "$prev" = "--passphrase-fd" ]; then fd=$arg; fi
  prev=$arg
done
data=$(cat)
if [ -z "$fd" ]; then
  echo 'gpg: signing failed: No pinentry' >&2
  exit 2
fi
eval "read -r pass <&$fd"
printf 'signed(%s) with %s' "$data" "$pass"
echo '[GNUPG:] SIG_CREATED D' >&2
"#;

#[test]
fn gpg_wrapper_without_prompt_server_forwards_the_failure() {
    let tmp = TempDir::new().unwrap();
    let gpg = script(tmp.path(), "fake-gpg", FAKE_GPG);
    gitwarden(tmp.path())
        .current_dir(tmp.path())
        .env("GITWARDEN_GPG_PROGRAM", &gpg)
        .args(["gpg", "--status-fd=2", "-bsau", "KEY"])
        .write_stdin("tree abc")
        .assert()
        .code(2)
        .stdout("")
        .stderr(predicate::str::contains("No pinentry"));
}

#[tokio::test]
async fn gpg_wrapper_asks_the_prompt_server_for_the_passphrase() {
    let home = TempDir::new().unwrap();
    let gpg = script(home.path(), "fake-gpg", FAKE_GPG);
    let calls = Arc::new(AtomicUsize::new(0));
    let server = CredentialPromptServer::start(counting_handler(calls.clone()), Path::new("/usr/bin/true"))
        .await
        .unwrap();
    let socket = server.socket_path().clone();
    let home_path = home.path().to_path_buf();

    let assert = tokio::task::spawn_blocking(move || {
        gitwarden(&home_path)
            .current_dir(&home_path)
            .env("GITWARDEN_SOCKET_PATH", &socket)
            .env("GITWARDEN_GPG_PROGRAM", &gpg)
            .args(["gpg", "--status-fd=2", "-bsau", "KEY"])
            .write_stdin("tree abc")
            .assert()
    })
    .await
    .unwrap();

    assert
        .success()
        .stdout("signed(tree abc) with s3cret")
        .stderr(predicate::str::contains("[GNUPG:] SIG_CREATED"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    server.terminate().await;
}

#[tokio::test]
async fn gpg_wrapper_does_not_prompt_after_a_bad_passphrase() {
    let home = TempDir::new().unwrap();
    let gpg = script(home.path(), "fake-gpg", FAKE_GPG);
    let calls = Arc::new(AtomicUsize::new(0));
    let server = CredentialPromptServer::start(counting_handler(calls.clone()), Path::new("/usr/bin/true"))
        .await
        .unwrap();
    let socket = server.socket_path().clone();
    let home_path = home.path().to_path_buf();

    let assert = tokio::task::spawn_blocking(move || {
        gitwarden(&home_path)
            .current_dir(&home_path)
            .env("GITWARDEN_SOCKET_PATH", &socket)
            .env("GITWARDEN_GPG_PROGRAM", &gpg)
            .env("FAKE_GPG_BAD", "1")
            .args(["gpg", "-bsau", "KEY"])
            .write_stdin("tree abc")
            .assert()
    })
    .await
    .unwrap();

    assert.code(2).stderr(predicate::str::contains("Bad passphrase"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    server.terminate().await;
}

/// Strips `-c` overrides into `.fake-git-config`, then runs `$1` as a script.
const FAKE_GIT: &str = r#"#!/bin/sh
while [ "$1" = "-c" ]; do
  printf '%s\n' "$2" >> .fake-git-config
  shift 2
done
exec /bin/sh -c "$1"
"#;

#[test]
fn signed_run_retries_and_signs_with_the_terminal_passphrase() {
    let tmp = TempDir::new().unwrap();
    let git = script(tmp.path(), "fake-git", FAKE_GIT);
    let gpg = script(tmp.path(), "fake-gpg", FAKE_GPG);
    let config_dir = tmp.path().join(".config").join("gitwarden");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.yml"),
        format!("signing_program: {}\n", gpg.display()),
    )
    .unwrap();
    let repo = tmp.path().join("repo");
    std::fs::create_dir(&repo).unwrap();

    // What git commit does with gpg.program, reduced to the signing step.
    let commit = "w=$(sed -n 's/^gpg.program=//p' .fake-git-config | tail -n 1); \
        printf 'tree abc' | \"$w\" --status-fd=2 -bsau KEY > sig 2> status \
        || { echo 'error: gpg failed to sign the data' >&2; exit 128; }; \
        cat sig";

    gitwarden(tmp.path())
        .current_dir(&repo)
        .args(["run", "--in-process", "--sign", "--git-path"])
        .arg(&git)
        .args(["--", commit])
        .write_stdin("s3cret\n")
        .assert()
        .success()
        .stdout("signed(tree abc) with s3cret");
}
