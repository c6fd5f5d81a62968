use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use which::which;

use crate::errors::ProcessError;
use crate::storage::{ByteSource, ProgressSender};

/// Retained stderr bytes for error reporting. Full logs stream through the
/// log sink instead of accumulating here.
const STDERR_TAIL_LIMIT: usize = 2048;
const COPY_BUF_SIZE: usize = 64 * 1024;

/// One external program invocation: arguments are passed positionally to
/// the OS, never through a shell, and credentials ride in `envs` only.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Incremental log fragment from a child's stderr or stdout.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub text: String,
    pub is_stderr: bool,
}

pub type LogSink = mpsc::UnboundedSender<LogChunk>;

/// Locates the PostgreSQL client tools. With no directory set the PATH is
/// searched per tool; a directory pins the lookup for packaged installs and
/// tests.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    dir: Option<PathBuf>,
}

impl ToolPaths {
    pub fn system() -> Self {
        Self { dir: None }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Some(dir.into()) }
    }

    pub fn resolve(&self, tool: &str) -> Result<PathBuf, ProcessError> {
        match &self.dir {
            Some(dir) => Ok(dir.join(tool)),
            None => which(tool).map_err(|_| ProcessError::ToolNotFound {
                tool: tool.to_string(),
            }),
        }
    }
}

/// A spawned child whose stdout is consumed by the caller as a byte source
/// (dump direction). Stderr drains concurrently into the log sink and a
/// bounded tail.
pub struct SourceProcess {
    child: Child,
    program: String,
    stderr_task: JoinHandle<String>,
}

/// Spawns `spec` with stdout piped. The returned byte source must be read
/// to completion (or dropped) before `finish` is awaited.
pub fn spawn_source(
    spec: &CommandSpec,
    logs: Option<LogSink>,
) -> Result<(SourceProcess, ByteSource), ProcessError> {
    let program = spec.program_name();
    let mut child = command_for(spec)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
    debug!(program = %program, pid = child.id(), "spawned dump process");

    let stdout = take_pipe(child.stdout.take(), &program)?;
    let stderr = take_pipe(child.stderr.take(), &program)?;
    let stderr_task = tokio::spawn(drain_stderr(stderr, logs));

    Ok((
        SourceProcess {
            child,
            program,
            stderr_task,
        },
        Box::new(stdout),
    ))
}

impl SourceProcess {
    /// Waits for the child. On cancellation the process is killed and
    /// reaped, never left as a zombie.
    pub async fn finish(mut self, cancel: &CancellationToken) -> Result<(), ProcessError> {
        let status = tokio::select! {
            status = self.child.wait() => status.map_err(|source| ProcessError::Pipe {
                program: self.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                self.stderr_task.abort();
                return Err(ProcessError::Cancelled);
            }
        };

        let stderr_tail = self.stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::NonZeroExit {
                program: self.program,
                code: status.code().unwrap_or(-1),
                stderr_tail,
            })
        }
    }
}

/// Runs `spec` feeding its stdin from `source` (restore direction).
/// Counts piped bytes into `progress` and returns the total. The child is
/// killed on cancellation; a non-zero exit carries the stderr tail.
pub async fn run_sink(
    spec: &CommandSpec,
    mut source: ByteSource,
    progress: &ProgressSender,
    logs: Option<LogSink>,
    cancel: &CancellationToken,
) -> Result<u64, ProcessError> {
    let program = spec.program_name();
    let mut child = command_for(spec)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
    debug!(program = %program, pid = child.id(), "spawned restore process");

    let mut stdin = take_pipe(child.stdin.take(), &program)?;
    let stderr = take_pipe(child.stderr.take(), &program)?;
    let stderr_task = tokio::spawn(drain_stderr(stderr, logs));

    let mut piped: u64 = 0;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut source_err: Option<std::io::Error> = None;
    let mut sink_err = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(ProcessError::Cancelled);
            }
            read = source.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdin.write_all(&buf[..n]).await.is_err() {
                            // Child likely exited; surface its stderr below
                            // instead of the raw broken pipe.
                            sink_err = true;
                            break;
                        }
                        piped += n as u64;
                        let _ = progress.send(piped);
                    }
                    Err(err) => {
                        source_err = Some(err);
                        break;
                    }
                }
            }
        }
    }
    drop(stdin);

    if source_err.is_some() {
        let _ = child.start_kill();
    }
    let status = tokio::select! {
        status = child.wait() => status.map_err(|source| ProcessError::Pipe {
            program: program.clone(),
            source,
        })?,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stderr_task.abort();
            return Err(ProcessError::Cancelled);
        }
    };
    let stderr_tail = stderr_task.await.unwrap_or_default();

    if let Some(err) = source_err {
        return Err(ProcessError::Pipe {
            program,
            source: err,
        });
    }
    if !status.success() {
        return Err(ProcessError::NonZeroExit {
            program,
            code: status.code().unwrap_or(-1),
            stderr_tail,
        });
    }
    if sink_err {
        return Err(ProcessError::Pipe {
            program,
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "process closed stdin before the source was exhausted",
            ),
        });
    }
    Ok(piped)
}

fn command_for(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.envs.iter().cloned())
        .kill_on_drop(true);
    cmd
}

fn take_pipe<T>(pipe: Option<T>, program: &str) -> Result<T, ProcessError> {
    pipe.ok_or_else(|| ProcessError::Spawn {
        program: program.to_string(),
        source: std::io::Error::other("child pipe not captured"),
    })
}

/// Streams stderr chunk-wise into the optional sink and keeps a bounded
/// tail for error messages.
async fn drain_stderr(mut stderr: ChildStderr, logs: Option<LogSink>) -> String {
    let mut tail = String::new();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                tail.push_str(&text);
                if tail.len() > STDERR_TAIL_LIMIT {
                    let cut = tail.len() - STDERR_TAIL_LIMIT;
                    // Avoid splitting a UTF-8 code point.
                    let cut = (cut..tail.len())
                        .find(|i| tail.is_char_boundary(*i))
                        .unwrap_or(tail.len());
                    tail.drain(..cut);
                }
                if let Some(sink) = &logs {
                    let _ = sink.send(LogChunk {
                        text,
                        is_stderr: true,
                    });
                }
            }
        }
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            envs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn source_process_streams_stdout() -> anyhow::Result<()> {
        let (proc, mut stdout) = spawn_source(&sh("printf 'dump bytes'"), None)?;
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await?;
        proc.finish(&CancellationToken::new()).await?;
        assert_eq!(out, b"dump bytes");
        Ok(())
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr_tail() -> anyhow::Result<()> {
        let (proc, mut stdout) = spawn_source(&sh("echo 'fatal: broken' >&2; exit 3"), None)?;
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await?;
        let err = proc
            .finish(&CancellationToken::new())
            .await
            .expect_err("exit 3");
        match err {
            ProcessError::NonZeroExit { code, stderr_tail, .. } => {
                assert_eq!(code, 3);
                assert!(stderr_tail.contains("fatal: broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_kills_the_child_quickly() -> anyhow::Result<()> {
        let (proc, _stdout) = spawn_source(&sh("sleep 30"), None)?;
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = proc.finish(&cancel).await.expect_err("cancelled");
        assert!(matches!(err, ProcessError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test]
    async fn sink_counts_piped_bytes() -> anyhow::Result<()> {
        let (progress, progress_rx) = watch::channel(0u64);
        let source: ByteSource = Box::new(std::io::Cursor::new(vec![7u8; 1000]));
        let piped = run_sink(
            &sh("cat >/dev/null"),
            source,
            &progress,
            None,
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(piped, 1000);
        assert_eq!(*progress_rx.borrow(), 1000);
        Ok(())
    }

    #[tokio::test]
    async fn sink_failure_reports_stderr_not_broken_pipe() -> anyhow::Result<()> {
        let (progress, _) = watch::channel(0u64);
        let source: ByteSource = Box::new(std::io::Cursor::new(vec![7u8; 64]));
        let err = run_sink(
            &sh("echo 'restore blew up' >&2; exit 1"),
            source,
            &progress,
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("exit 1");
        match err {
            ProcessError::NonZeroExit { stderr_tail, .. } => {
                assert!(stderr_tail.contains("restore blew up"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn tool_paths_prefer_pinned_directory() -> anyhow::Result<()> {
        let tools = ToolPaths::in_dir("/opt/pg/bin");
        assert_eq!(
            tools.resolve("pg_dump")?,
            PathBuf::from("/opt/pg/bin/pg_dump")
        );
        Ok(())
    }
}
