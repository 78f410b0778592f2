//! Running external programs under a timeout and a cancellation token.
//!
//! Children are spawned with `kill_on_drop`, so losing the race against the
//! timeout or the token kills the process instead of orphaning it.

use crate::error::{MimepackError, Result};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

/// Run `command` to completion, capturing stdout and stderr.
///
/// `label` names the tool in error messages. A non-zero exit status is
/// reported as `MimepackError::Conversion`; a missing binary as
/// `MimepackError::MissingDependency`.
pub async fn run_command(
    mut command: Command,
    label: &str,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MimepackError::MissingDependency(format!("'{}' is not installed or not in PATH", label))
        } else {
            MimepackError::conversion(label, format!("failed to start: {}", e))
        }
    })?;
    let child_id = child.id();

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(tool = label, pid = ?child_id, "external process cancelled");
            return Err(MimepackError::Cancelled);
        }
        waited = timeout(Duration::from_secs(timeout_secs), child.wait_with_output()) => match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(MimepackError::conversion(label, format!("failed to wait: {}", e))),
            Err(_) => {
                tracing::warn!(tool = label, pid = ?child_id, timeout_secs, "external process timed out");
                return Err(MimepackError::Timeout(timeout_secs));
            }
        },
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if !stderr.trim().is_empty() { stderr } else { stdout };
        return Err(MimepackError::conversion(
            label,
            format!(
                "exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                detail.trim()
            ),
        ));
    }

    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_success() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf hello");
        let output = run_command(cmd, "sh", 5, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_run_command_failure_is_conversion_error() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken >&2; exit 3");
        let err = run_command(cmd, "sh", 5, &CancellationToken::new()).await.unwrap_err();
        match err {
            MimepackError::Conversion { message, converter } => {
                assert_eq!(converter, "sh");
                assert!(message.contains("code 3"));
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let cmd = Command::new("definitely-not-a-real-binary-mimepack");
        let err = run_command(cmd, "ghost", 5, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MimepackError::MissingDependency(_)));
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let started = std::time::Instant::now();
        let err = run_command(cmd, "sh", 1, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MimepackError::Timeout(1)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_run_command_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let err = run_command(cmd, "sh", 30, &cancel).await.unwrap_err();
        assert!(matches!(err, MimepackError::Cancelled));
    }
}
