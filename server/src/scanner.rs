//! Scanner that shells out to an external command.
//!
//! The worker image bundles the actual scanning tool; this adapter gives it
//! the request and reads a [`ScanResult`] back:
//!
//! - `request.json` is written into the workspace, which is also the working
//!   directory of the command
//! - `PRSCAN_REQUEST_FILE`, `PRSCAN_REQUEST_ID`, `PRSCAN_OWNER`,
//!   `PRSCAN_REPO`, `PRSCAN_BRANCH`, `PRSCAN_PR_ID` and `PRSCAN_COMMIT_SHA`
//!   are set in its environment
//! - stdout must be a JSON [`ScanResult`]
//!
//! A non-zero exit or unreadable output is a failed scan. Failing to spawn
//! the command at all is transient: the message stays pending and another
//! attempt is made after reclaim.

use prscan_core::{ScanResult, WorkRequest};
use prscan_runtime::{ScanError, Scanner, Workspace};
use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const REQUEST_FILE: &str = "request.json";
const STDERR_TAIL: usize = 512;

/// Runs a configured command once per scan.
#[derive(Debug, Clone)]
pub struct CommandScanner {
    program: OsString,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl CommandScanner {
    /// Run `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Split a whitespace-separated command line into program and arguments.
    ///
    /// Returns `None` for a blank line. No shell quoting is interpreted; wrap
    /// the command in `sh -c` if it needs any.
    #[must_use]
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(parts.fold(Self::new(program), Self::arg))
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Kill the command and fail the scan after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, request: &WorkRequest, workspace: &Workspace) -> Result<ScanResult, ScanError> {
        let request_file = workspace.path().join(REQUEST_FILE);
        let body = serde_json::to_vec(request)
            .map_err(|e| ScanError::Transient(format!("encode request: {e}")))?;
        tokio::fs::write(&request_file, body)
            .await
            .map_err(|e| ScanError::Transient(format!("write {}: {e}", request_file.display())))?;

        let payload = &request.payload;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(workspace.path())
            .env("PRSCAN_REQUEST_FILE", &request_file)
            .env("PRSCAN_REQUEST_ID", request.id.to_string())
            .env("PRSCAN_OWNER", &payload.owner)
            .env("PRSCAN_REPO", &payload.repo)
            .env("PRSCAN_BRANCH", &payload.branch)
            .env("PRSCAN_PR_ID", payload.pr_id.to_string())
            .env("PRSCAN_COMMIT_SHA", &payload.commit_sha)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            ScanError::Transient(format!(
                "spawn {}: {e}",
                self.program.to_string_lossy()
            ))
        })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ScanError::Failed(format!("scan timed out after {limit:?}")))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| ScanError::Transient(format!("wait: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Failed(format!(
                "scanner exited with {}: {}",
                output.status,
                tail(stderr.trim())
            )));
        }

        serde_json::from_slice::<ScanResult>(&output.stdout)
            .map_err(|e| ScanError::Failed(format!("unreadable scanner output: {e}")))
    }
}

impl Scanner for CommandScanner {
    fn scan<'a>(
        &'a self,
        request: &'a WorkRequest,
        workspace: &'a Workspace,
    ) -> Pin<Box<dyn Future<Output = Result<ScanResult, ScanError>> + Send + 'a>> {
        Box::pin(self.run(request, workspace))
    }
}

fn tail(text: &str) -> &str {
    if text.len() <= STDERR_TAIL {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use prscan_core::{Clock, RequestId};
    use prscan_testing::helpers::sample_payload;
    use prscan_testing::test_clock;

    fn request() -> WorkRequest {
        WorkRequest::new(
            RequestId::generate(),
            sample_payload(),
            test_clock().now(),
            chrono::Duration::hours(1),
            1,
        )
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        let scanner = CommandScanner::from_command_line("  kics scan  --path . ").unwrap();
        assert_eq!(scanner.program, "kics");
        assert_eq!(scanner.args, vec!["scan", "--path", "."]);
        assert!(CommandScanner::from_command_line("   ").is_none());
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL * 2);
        assert_eq!(tail(&long).len(), STDERR_TAIL);
        assert_eq!(tail("short"), "short");
    }

    #[cfg(unix)]
    fn sh(script: &str) -> CommandScanner {
        CommandScanner::new("sh").arg("-c").arg(script)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_becomes_the_result() {
        let scanner = sh(
            r#"test -f "$PRSCAN_REQUEST_FILE" && test "$PRSCAN_PR_ID" = 42 && echo '{"success": true, "severity_counters": {"HIGH": 2}}'"#,
        );
        let workspace = Workspace::create(None).unwrap();
        let result = scanner.scan(&request(), &workspace).await.unwrap();
        assert!(result.success);
        assert_eq!(result.severity_counts["HIGH"], 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_file_is_written_to_the_workspace() {
        let scanner = sh(r#"cat request.json"#);
        let workspace = Workspace::create(None).unwrap();
        // The request itself is not a scan result
        let err = scanner.scan(&request(), &workspace).await.unwrap_err();
        assert!(matches!(err, ScanError::Failed(_)));
        let written = std::fs::read_to_string(workspace.path().join(REQUEST_FILE)).unwrap();
        assert!(written.contains("hello-world"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_failed_scan() {
        let scanner = sh("echo boom >&2; exit 3");
        let workspace = Workspace::create(None).unwrap();
        match scanner.scan(&request(), &workspace).await {
            Err(ScanError::Failed(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_a_failed_scan() {
        let scanner = sh("sleep 5").with_timeout(Duration::from_millis(100));
        let workspace = Workspace::create(None).unwrap();
        match scanner.scan(&request(), &workspace).await {
            Err(ScanError::Failed(message)) => assert!(message.contains("timed out")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_transient() {
        let scanner = CommandScanner::new("/nonexistent/prscan-scanner");
        let workspace = Workspace::create(None).unwrap();
        let err = scanner.scan(&request(), &workspace).await.unwrap_err();
        assert!(matches!(err, ScanError::Transient(_)));
    }
}
