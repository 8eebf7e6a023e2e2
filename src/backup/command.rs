use super::{BackupError, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const MASK: &str = "***";
const MAX_STDERR_CHARS: usize = 2048;

/// An external tool invocation. Credentials never go on the command line:
/// they travel in the environment or in a private config file, and every
/// environment value plus anything registered with `mask` is kept out of
/// `Debug`, `display_args` and error messages.
#[derive(Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    masked: Vec<String>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            masked: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Redact `value` from anything the tool prints, e.g. a URI it received
    /// through a config file
    pub fn mask(mut self, value: impl Into<String>) -> Self {
        self.masked.push(value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments as passed to the process
    pub fn raw_args(&self) -> Vec<String> {
        self.args.clone()
    }

    /// Arguments for logs and errors
    pub fn display_args(&self) -> String {
        self.redact(&self.args.join(" "))
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
    }

    /// Replace every secret value that appears in `text`
    pub fn redact(&self, text: &str) -> String {
        let secrets = self
            .masked
            .iter()
            .map(String::as_str)
            .chain(self.env.iter().map(|(_, value)| value.as_str()))
            .filter(|value| !value.is_empty());

        let mut redacted = text.to_string();
        for secret in secrets {
            redacted = redacted.replace(secret, MASK);
        }
        redacted
    }

    /// Typed failure naming the tool, with credentials masked
    pub fn failure(&self, status: impl fmt::Display, stderr: &str) -> BackupError {
        let stderr: String = self.redact(stderr.trim()).chars().take(MAX_STDERR_CHARS).collect();
        BackupError::ToolExecution {
            tool: self.program.clone(),
            args: self.display_args(),
            status: status.to_string(),
            stderr,
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.display_args())
            .field(
                "env",
                &self.env.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Run to completion; only exit status 0 is success
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs tools as child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {} {}", spec.program(), spec.display_args());

        let mut command = Command::new(spec.program());
        command
            .args(spec.raw_args())
            .envs(spec.env_vars().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin_bytes().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| spec.failure("failed to start", &e.to_string()))?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin_bytes(), child.stdin.take()) {
            let input = input.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("Failed to write child stdin: {}", e);
                }
            });
        }

        let output = match spec.timeout_duration() {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| BackupError::Timeout {
                    seconds: limit.as_secs(),
                })??,
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(spec.failure(output.status, &stderr));
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Probe a tool with `--version`
pub async fn tool_available(runner: &dyn CommandRunner, tool: &str) -> bool {
    let spec = CommandSpec::new(tool)
        .arg("--version")
        .timeout(Duration::from_secs(10));
    runner.run(&spec).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_values_stay_out_of_display_and_debug() {
        let spec = CommandSpec::new("mongodump")
            .arg("--config=/work/b1/mongo-tools.yaml")
            .arg("--out=/tmp/dump")
            .mask("mongodb://admin:pw@db:27017")
            .env("PGPASSWORD", "hunter2");

        assert_eq!(
            spec.display_args(),
            "--config=/work/b1/mongo-tools.yaml --out=/tmp/dump"
        );
        assert_eq!(
            spec.redact("failed to connect to mongodb://admin:pw@db:27017"),
            "failed to connect to ***"
        );

        let debug = format!("{spec:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("admin:pw"));
        assert!(debug.contains("PGPASSWORD"));
    }

    #[test]
    fn failure_redacts_secrets_from_stderr() {
        let spec = CommandSpec::new("pg_dump")
            .arg("--host")
            .arg("db")
            .env("PGPASSWORD", "hunter2");

        let err = spec.failure("exit status: 1", "auth failed for password hunter2\n");
        let message = err.to_string();
        assert!(message.contains("pg_dump"));
        assert!(message.contains("--host db"));
        assert!(!message.contains("hunter2"));
        assert!(message.contains("***"));
    }

    #[tokio::test]
    async fn process_runner_reports_exit_status() {
        let runner = ProcessCommandRunner::new();

        let ok = runner
            .run(&CommandSpec::new("sh").arg("-c").arg("echo hello"))
            .await
            .unwrap();
        assert_eq!(ok.stdout.trim(), "hello");

        let err = runner
            .run(&CommandSpec::new("sh").arg("-c").arg("echo boom >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            BackupError::ToolExecution { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn process_runner_enforces_timeout() {
        let runner = ProcessCommandRunner::new();
        let err = runner
            .run(
                &CommandSpec::new("sh")
                    .arg("-c")
                    .arg("sleep 5")
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Timeout { .. }));
    }

    #[tokio::test]
    async fn process_runner_feeds_stdin() {
        let runner = ProcessCommandRunner::new();
        let output = runner
            .run(&CommandSpec::new("cat").stdin(b"piped".to_vec()))
            .await
            .unwrap();
        assert_eq!(output.stdout, "piped");
    }

    #[tokio::test]
    async fn missing_tool_is_unavailable() {
        let runner = ProcessCommandRunner::new();
        assert!(!tool_available(&runner, "definitely-not-a-real-tool-xyz").await);
    }
}
