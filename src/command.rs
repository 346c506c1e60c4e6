//! External command runner (C4).
//!
//! A single async entry point for every subprocess the core shells out to
//! (skopeo, trivy, the registry binary's `garbage-collect`). Nothing else in
//! the crate should spawn a [`tokio::process::Command`] directly — centralizing
//! here means env-var propagation, capture, and deadline handling are written
//! once.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;

/// A single subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env_overrides: Vec<(String, String)>,
    pub deadline: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env_overrides: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env_overrides = env;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Check whether a tool is on `PATH` before we bother invoking it.
pub fn tool_available(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Run `spec`, returning captured output regardless of exit status. Only
/// spawn/poll failures are propagated as errors; a non-zero exit or a
/// timeout is reported in the returned [`CommandOutput`] so callers can
/// decide how to treat it.
pub async fn run(spec: CommandSpec) -> crate::Result<CommandOutput> {
    let start = Instant::now();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env_overrides {
        command.env(key, value);
    }

    let mut child = command.spawn()?;

    let Some(deadline) = spec.deadline else {
        let output = child.wait_with_output().await?;
        return Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            duration: start.elapsed(),
        });
    };

    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => {
            let status = status?;
            let stdout = drain(child.stdout.take()).await;
            let stderr = drain(child.stderr.take()).await;
            Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
                timed_out: false,
                duration: start.elapsed(),
            })
        }
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let stdout = drain(child.stdout.take()).await;
            let mut stderr = drain(child.stderr.take()).await;
            stderr.push_str(&format!(
                "\n{} timed out after {}",
                spec.program,
                humantime::format_duration(deadline)
            ));
            Ok(CommandOutput {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: true,
                duration: start.elapsed(),
            })
        }
    }
}

/// Drain an already-spawned pipe to a string; used when a caller needs
/// partial output from a process it is killing itself rather than going
/// through [`run`].
pub async fn drain<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_and_captures_stdout() {
        let spec = CommandSpec::new("echo", ["hello"]);
        let out = run(spec).await.expect("run");
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let spec = CommandSpec::new("sh", ["-c", "exit 3"]);
        let out = run(spec).await.expect("run");
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn deadline_kills_and_reports_timeout() {
        let spec =
            CommandSpec::new("sleep", ["5"]).with_deadline(Duration::from_millis(50));
        let out = run(spec).await.expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn tool_available_detects_common_binary() {
        assert!(tool_available("sh"));
        assert!(!tool_available("this-tool-does-not-exist-xyz"));
    }
}
