use std::process::Output;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::exec_mock;

/// Run a host command, capturing output. Arguments are always an argv array;
/// nothing here ever passes through a shell.
pub async fn run(program: &str, args: &[&str]) -> Result<Output> {
    if let Some(output) = exec_mock::intercept(program, args) {
        return Ok(output);
    }

    Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run: {} {}", program, args.join(" ")))
}

/// Run a host command and fail on a non-zero exit, carrying stderr in the
/// error message.
pub async fn run_ok(program: &str, args: &[&str]) -> Result<()> {
    let output = run(program, args).await?;
    if !output.status.success() {
        anyhow::bail!(
            "{} {} failed (exit {}): {}",
            program,
            args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Run a host command and return trimmed stdout, failing on non-zero exit.
pub async fn run_stdout(program: &str, args: &[&str]) -> Result<String> {
    let output = run(program, args).await?;
    if !output.status.success() {
        anyhow::bail!(
            "{} {} failed (exit {}): {}",
            program,
            args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a host command and report only whether it exited zero.
pub async fn succeeds(program: &str, args: &[&str]) -> Result<bool> {
    Ok(run(program, args).await?.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_mock::{MockResponse, mock};

    #[tokio::test]
    async fn test_run_ok_surfaces_stderr() {
        let (_guard, _calls) = mock()
            .on("ip link add", MockResponse::err(2, "RTNETLINK answers: File exists"))
            .install();

        let err = run_ok("ip", &["link", "add", "vnet-x", "type", "dummy"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File exists"));
        assert!(err.to_string().contains("exit 2"));
    }

    #[tokio::test]
    async fn test_run_stdout_trims() {
        let (_guard, _calls) = mock()
            .on("cat", MockResponse::ok("  hello\n"))
            .install();
        let out = run_stdout("cat", &["/tmp/x"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_calls_are_logged() {
        let (_guard, calls) = mock().install();
        let _ = run("ip", &["link", "show"]).await.unwrap();
        let log = calls.lock().unwrap();
        assert_eq!(log.as_slice(), ["ip link show"]);
    }
}
