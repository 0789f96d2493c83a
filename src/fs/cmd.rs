use std::process::Stdio;

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

/// Only the tail of the output of a failed command is kept in the error message.
const OUTPUT_TAIL_LINES: usize = 40;

#[async_trait]
pub trait RunCommand {
    /// Run to completion, returning stdout, and fail on a non-zero exit code.
    async fn run(&mut self) -> Result<Vec<u8>>;

    async fn run_with_input(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>>;

    async fn run_with_status_checker<R>(
        &mut self,
        input: Option<&[u8]>,
        check: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R>;
}

#[async_trait]
impl RunCommand for Command {
    async fn run(&mut self) -> Result<Vec<u8>> {
        self.run_with_input(None).await
    }

    async fn run_with_input(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>> {
        self.run_with_status_checker(input, |code, stdout, _| {
            if code != 0 {
                bail!("Bad exit code")
            }
            Ok(stdout)
        })
        .await
    }

    async fn run_with_status_checker<R>(
        &mut self,
        input: Option<&[u8]>,
        check: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        // Keep tool output parsable regardless of the caller's locale
        self.env("LC_ALL", "C");

        tracing::trace!(cmd=?self.as_std(), "run external cmd");

        self.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        self.stdout(Stdio::piped());
        self.stderr(Stdio::piped());

        let output = async {
            let mut child = self.kill_on_drop(true).spawn()?;

            if let Some(input) = input {
                let mut stdin = child.stdin.take().context("No stdin")?;
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }

            child.wait_with_output().await.map_err(anyhow::Error::from)
        }
        .await
        .with_context(|| format!("Failed to spawn external command: {:?}", self.as_std()))?;

        let code = output.status.code();
        let stdout = output.stdout;
        let stderr = output.stderr;

        match code {
            Some(code) => check(code, stdout.clone(), stderr.clone()),
            None => Err(anyhow!("Killed by signal")),
        }
        .with_context(|| {
            format!(
                "\ncmd: {:?}\nexit code: {}\nstdout: {}\nstderr: {}",
                self.as_std(),
                code.map(|code| code.to_string())
                    .unwrap_or_else(|| "unknown".to_owned()),
                format_output(&stdout),
                format_output(&stderr),
            )
        })
    }
}

fn format_output(output: &[u8]) -> String {
    let output = String::from_utf8_lossy(output);
    let lines = output.trim_end().lines().collect::<Vec<_>>();
    match lines.len() {
        0 => String::new(),
        1 => lines[0].to_owned(),
        n if n > OUTPUT_TAIL_LINES => format!(
            "(last {OUTPUT_TAIL_LINES} of {n} lines)\n\t{}",
            lines[n - OUTPUT_TAIL_LINES..].join("\n\t")
        ),
        _ => format!("(multi-line)\n\t{}", lines.join("\n\t")),
    }
}
