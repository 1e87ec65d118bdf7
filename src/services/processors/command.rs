use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{ExecutionError, Processor};
use crate::models::job::JobView;

/// Captured stderr is capped so a chatty binary cannot exhaust memory.
const MAX_STDERR_BYTES: u64 = 64 * 1024;

/// qpdf exits with 3 when it succeeded with warnings.
const QPDF_WARNINGS_EXIT: i32 = 3;

/// Merges PDFs by spawning `qpdf` under a hard timeout.
pub struct CommandProcessor {
    program: PathBuf,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn merge_args(inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = vec!["--empty".to_string(), "--pages".to_string()];
        args.extend(inputs.iter().map(|p| p.display().to_string()));
        args.push("--".to_string());
        args.push(output.display().to_string());
        args
    }

    async fn run(&self, method: &str, args: &[String]) -> Result<(), ExecutionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            ExecutionError::Unavailable(format!("failed to spawn {}: {e}", self.program.display()))
        })?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(stderr) = stderr {
                let _ = stderr.take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
            }
            buf
        });

        // On timeout `child` is dropped and killed.
        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_elapsed) => {
                return Err(ExecutionError::Timeout {
                    method: method.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        };

        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
        let code = status.code().unwrap_or(-1);
        tracing::debug!(
            program = %self.program.display(),
            exit_code = code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command finished"
        );

        if status.success() || code == QPDF_WARNINGS_EXIT {
            Ok(())
        } else {
            Err(ExecutionError::Failed(format!(
                "{} exited with {code}: {}",
                self.program.display(),
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn execute(
        &self,
        job: &JobView<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<(), ExecutionError> {
        let count = job.params.input_count().ok_or_else(|| ExecutionError::Unsupported {
            method: job.method.to_string(),
            detail: "single-input jobs".to_string(),
        })?;

        let inputs: Vec<PathBuf> = (0..count).map(|n| input.join(n.to_string())).collect();
        for path in &inputs {
            if !tokio::fs::try_exists(path).await? {
                return Err(ExecutionError::MissingInput(path.display().to_string()));
            }
        }

        self.run(job.method, &Self::merge_args(&inputs, output))
            .await
    }
}
