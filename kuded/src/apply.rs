//! Bounded execution of the apply command.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One invocation of the apply tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The process could not be launched.
    FailedToStart(String),
    /// The process ran; `interrupted` is set when it was killed on shutdown.
    Completed {
        exit_code: i32,
        output: String,
        interrupted: bool,
    },
}

impl ApplyCommand {
    /// `<program> apply <extra args> -f <files...>`
    pub fn apply(program: &str, extra_args: &[String], files: &[String], directory: PathBuf) -> Self {
        let mut args = Vec::with_capacity(extra_args.len() + files.len() + 2);
        args.push("apply".to_string());
        args.extend(extra_args.iter().cloned());
        args.push("-f".to_string());
        args.extend(files.iter().cloned());
        Self {
            program: program.to_string(),
            args,
            directory,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs to completion unless `cancel` fires first, in which case the child
    /// is killed. stdout and stderr are merged in arrival order.
    pub async fn run(&self, cancel: &CancellationToken) -> ApplyOutcome {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return ApplyOutcome::FailedToStart(err.to_string()),
        };
        debug!(command = %self.command_line(), dir = %self.directory.display(), "apply started");

        let buffer = Mutex::new(Vec::new());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = {
            let collect = async {
                tokio::join!(pump(stdout, &buffer), pump(stderr, &buffer));
                child.wait().await
            };
            tokio::select! {
                status = collect => Some(status),
                _ = cancel.cancelled() => None,
            }
        };

        let output = {
            let bytes = buffer.into_inner().unwrap_or_else(|e| e.into_inner());
            String::from_utf8_lossy(&bytes).into_owned()
        };

        match finished {
            Some(Ok(status)) => ApplyOutcome::Completed {
                exit_code: status.code().unwrap_or(-1),
                output,
                interrupted: false,
            },
            Some(Err(err)) => {
                warn!(command = %self.command_line(), "failed waiting for apply: {err}");
                ApplyOutcome::Completed {
                    exit_code: -1,
                    output: format!("{output}\nfailed waiting for process: {err}"),
                    interrupted: false,
                }
            }
            None => {
                if let Err(err) = child.kill().await {
                    warn!(command = %self.command_line(), "failed to kill apply: {err}");
                }
                ApplyOutcome::Completed {
                    exit_code: -1,
                    output,
                    interrupted: true,
                }
            }
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, sink: &Mutex<Vec<u8>>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&chunk[..n]),
        }
    }
}
