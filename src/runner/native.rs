use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::containers::{Container, ContainerStatus, LogKind, RuntimeHandle};
use crate::error::{Result, VertexError};

/// How long a process gets to react to SIGINT before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// How long we wait for the reaper after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Runs a container as a plain subprocess of this host: the executable
/// named after the service id at the instance root, stdout/stderr pumped
/// into the log sink, a background reaper turning exit into `off`.
#[derive(Debug, Clone, Default)]
pub struct NativeRunner {}

impl NativeRunner {
    pub fn new() -> Self {
        Self {}
    }

    pub async fn start(&self, container: &Arc<Container>) -> Result<()> {
        container.logs.open().await;
        container.set_status(ContainerStatus::Starting).await;

        if let Err(err) = self.spawn(container).await {
            container.logs.push(LogKind::Err, err.to_string()).await;
            container.set_status(ContainerStatus::Error).await;
            return Err(err);
        }
        Ok(())
    }

    async fn spawn(&self, container: &Arc<Container>) -> Result<()> {
        let service_id = container.service.read().await.id.clone();
        let executable = find_executable(&container.root, &service_id)?;

        info!(container = %container.uuid, executable = %executable.display(), "spawning");

        let mut child = Command::new(&executable)
            .current_dir(&container.root)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                VertexError::Runtime(format!(
                    "failed to spawn {}: {err}",
                    executable.display()
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| VertexError::Runtime("spawned process has no pid".to_string()))?
            as i32;

        let cancel = CancellationToken::new();
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, LogKind::Out, container.clone(), cancel.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, LogKind::Err, container.clone(), cancel.clone());
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        *container.runtime.lock().await = RuntimeHandle::Native {
            pid,
            exited: exit_rx,
            cancel: cancel.clone(),
        };

        // Published before the reaper is spawned; a short-lived process may
        // exit at any point after.
        container.set_status(ContainerStatus::Running).await;

        // Reaper: release the handle before publishing the new status.
        let container = container.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(container = %container.uuid, %status, "process exited");
                }
                Err(err) => error!(container = %container.uuid, "wait failed: {err}"),
                _ => {}
            }
            *container.runtime.lock().await = RuntimeHandle::Idle;
            container.set_status(ContainerStatus::Off).await;
            cancel.cancel();
            let _ = exit_tx.send(true);
        });

        Ok(())
    }

    /// SIGINT, then SIGKILL once the grace window runs out. Returns after
    /// the reaper has observed the exit.
    pub async fn stop(&self, container: &Arc<Container>) -> Result<()> {
        let (pid, mut exited) = {
            let runtime = container.runtime.lock().await;
            match &*runtime {
                RuntimeHandle::Native { pid, exited, .. } => (*pid, exited.clone()),
                // Already reaped; nothing left to signal.
                _ => return Ok(()),
            }
        };

        unsafe { libc::kill(pid, libc::SIGINT) };

        if timeout(STOP_GRACE, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(container = %container.uuid, pid, "did not exit in time, sending SIGKILL");
            unsafe { libc::kill(pid, libc::SIGKILL) };
            let _ = timeout(KILL_WAIT, exited.wait_for(|done| *done)).await;
        }

        Ok(())
    }
}

/// For a service of id `hello`, the executable is `hello`, falling back to
/// `hello.sh`.
fn find_executable(dir: &Path, service_id: &str) -> Result<PathBuf> {
    let direct = dir.join(service_id);
    if direct.is_file() {
        return Ok(direct);
    }
    let script = dir.join(format!("{service_id}.sh"));
    if script.is_file() {
        return Ok(script);
    }
    Err(VertexError::ExecutableNotFound(service_id.to_string()))
}

fn pump(
    stream: impl AsyncRead + Unpin + Send + 'static,
    kind: LogKind,
    container: Arc<Container>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => container.logs.push(kind, line).await,
                    Ok(None) => break,
                    Err(err) => {
                        error!(container = %container.uuid, "log stream read failed: {err}");
                        break;
                    }
                },
            }
        }
    });
}
