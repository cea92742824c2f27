//! External build command execution.
//!
//! The command compiles the whole forest: it reads every file under the
//! content root and writes `<tree>.xml` artifacts into the built root. Exit
//! code 0 means success; standard output and error are captured verbatim.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::models::BuildResult;

/// Placeholder replaced by the content root in command arguments.
pub const CONTENT_PLACEHOLDER: &str = "{content}";
/// Placeholder replaced by the built root in command arguments.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Default deadline for a single build.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct BuildCommand {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl BuildCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// `forester build --dir {output} {content}`
    pub fn forester() -> Self {
        Self::new("forester").args(["build", "--dir", OUTPUT_PLACEHOLDER, CONTENT_PLACEHOLDER])
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Kill the build and report failure once `timeout` elapses. `None`
    /// waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolved_args(&self, content_root: &Path, built_root: &Path) -> Vec<String> {
        let content = content_root.to_string_lossy();
        let output = built_root.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(CONTENT_PLACEHOLDER, &content)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }

    /// Run the command once and describe the outcome.
    ///
    /// A launch error, a nonzero exit and the deadline all produce
    /// `success == false`. Cancellation yields `None`: the build was
    /// abandoned, so there is no outcome to report. The child is killed if
    /// it is still running when this returns.
    pub async fn run(
        &self,
        content_root: &Path,
        built_root: &Path,
        cancel: &CancellationToken,
    ) -> Option<BuildResult> {
        let args = self.resolved_args(content_root, built_root);
        tracing::info!(program = %self.program, ?args, "Running build command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(program = %self.program, "Failed to launch build command: {}", e);
                return Some(BuildResult::failed(
                    "",
                    format!("Failed to launch build command `{}`: {}", self.program, e),
                ));
            }
        };

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(output) => {
                    tracing::info!(status = %output.status, "Build command exited");
                    Some(BuildResult {
                        success: output.status.success(),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    })
                }
                Err(e) => {
                    tracing::error!("Failed to collect build output: {}", e);
                    Some(BuildResult::failed("", format!("Failed to collect build output: {e}")))
                }
            },
            _ = deadline => {
                let limit = timeout.unwrap_or_default();
                tracing::warn!(timeout_secs = limit.as_secs_f64(), "Build command timed out, killing it");
                Some(BuildResult::failed(
                    "",
                    format!("Build command timed out after {:.1}s", limit.as_secs_f64()),
                ))
            }
            _ = cancel.cancelled() => {
                tracing::warn!("Build cancelled, killing build command");
                None
            }
        }
    }
}

impl Default for BuildCommand {
    fn default() -> Self {
        Self::forester()
    }
}
