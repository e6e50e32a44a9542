use std::process::Stdio;

use dvr::DvrError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

impl From<CommandError> for DvrError {
    fn from(e: CommandError) -> Self {
        DvrError::Command(format!("{}: {}", e.command, e.detail))
    }
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

fn build_command(program: &str, args: &[&str], privilege: Privilege) -> Command {
    match privilege {
        Privilege::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        }
        Privilege::User => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

fn into_result(
    cmd_display: String,
    output: std::io::Result<std::process::Output>,
) -> Result<String, CommandError> {
    let output = output.map_err(|e| CommandError {
        command: cmd_display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments.
/// Returns trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = build_command(program, args, privilege).output().await;
    into_result(cmd_display, output)
}

/// Execute a command, feeding `input` on stdin.
pub async fn exec_with_stdin(
    program: &str,
    args: &[&str],
    privilege: Privilege,
    input: &str,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, bytes = input.len(), "exec_with_stdin");

    let spawn_err = |e: std::io::Error| CommandError {
        command: cmd_display.clone(),
        detail: e.to_string(),
    };

    let mut child = build_command(program, args, privilege)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await.map_err(spawn_err)?;
        // Dropping stdin closes the pipe so the child sees EOF.
    }

    let output = child.wait_with_output().await;
    into_result(cmd_display, output)
}

/// Execute a command, ignoring any errors.
pub async fn exec_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec_ignore_errors");

    match build_command(program, args, privilege).output().await {
        Ok(o) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            trace!(command = %cmd_display, stderr = %stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_command_display_user() {
        let display = format_command_display("ip", &["netns", "list"], Privilege::User);
        assert_eq!(display, "ip netns list");
    }

    #[test]
    fn format_command_display_sudo() {
        let display = format_command_display("ip", &["netns", "add", "snat-r1"], Privilege::Sudo);
        assert_eq!(display, "sudo ip netns add snat-r1");
    }

    #[test]
    fn command_error_converts_to_dvr_error() {
        let err: DvrError = CommandError {
            command: "ip link del qg-1".into(),
            detail: "Cannot find device".into(),
        }
        .into();
        assert!(matches!(&err, DvrError::Command(msg) if msg.contains("Cannot find device")));
    }

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let output = exec("echo", &["hello"], Privilege::User).await.unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn exec_returns_error_on_failure() {
        let err = exec("false", &[], Privilege::User).await.unwrap_err();
        assert!(
            err.command.contains("false"),
            "command was: {}",
            err.command
        );
    }

    #[tokio::test]
    async fn exec_error_contains_stderr() {
        let err = exec("sh", &["-c", "echo oops >&2; exit 1"], Privilege::User)
            .await
            .unwrap_err();
        assert!(err.detail.contains("oops"), "detail was: {}", err.detail);
    }

    #[tokio::test]
    async fn exec_with_stdin_pipes_input() {
        let output = exec_with_stdin("cat", &[], Privilege::User, "*nat\nCOMMIT\n")
            .await
            .unwrap();
        assert_eq!(output, "*nat\nCOMMIT");
    }

    #[tokio::test]
    async fn exec_with_stdin_reports_failure() {
        let err = exec_with_stdin("sh", &["-c", "cat >/dev/null; exit 3"], Privilege::User, "x")
            .await
            .unwrap_err();
        assert!(err.command.starts_with("sh"), "command was: {}", err.command);
    }

    #[tokio::test]
    async fn exec_ignore_errors_does_not_panic_on_failure() {
        exec_ignore_errors("false", &[], Privilege::User).await;
    }
}
