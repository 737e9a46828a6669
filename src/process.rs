//! Child process output collection.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

fn exit_status_code_parts(code: Option<i32>, _signal: Option<i32>) -> Option<i32> {
    if let Some(code) = code {
        return Some(code);
    }
    #[cfg(unix)]
    {
        if let Some(signal) = _signal {
            return Some(128 + signal);
        }
    }
    None
}

/// Exit code of a finished process, 128+signal for signal-terminated processes on Unix.
pub(crate) fn exit_status_code(status: &ExitStatus) -> Option<i32> {
    let code = status.code();
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;
    exit_status_code_parts(code, signal)
}

/// Everything a finished child left behind.
#[derive(Debug, Clone)]
pub(crate) struct ChildOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub elapsed: Duration,
}

impl ChildOutput {
    /// Stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        combine_streams(&self.stdout, &self.stderr)
    }
}

/// Errors while collecting a child's output.
#[derive(Debug, Error)]
pub(crate) enum OutputWaitError {
    #[error("failed to read {stream}: {source}")]
    Read {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for process: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },

    #[error("output reader task failed: {source}")]
    Reader {
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Stdout followed by stderr, trimmed.
pub(crate) fn combine_streams(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stdout, stderr),
    }
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

fn lossy(buf: &SharedBuf) -> String {
    let bytes = match buf.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

fn spawn_reader<R>(
    pipe: Option<R>,
    stream: &'static str,
    buf: SharedBuf,
) -> Option<JoinHandle<Result<(), OutputWaitError>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut pipe = pipe?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            let n = pipe
                .read(&mut chunk)
                .await
                .map_err(|source| OutputWaitError::Read { stream, source })?;
            if n == 0 {
                return Ok(());
            }
            match buf.lock() {
                Ok(mut guard) => guard.extend_from_slice(&chunk[..n]),
                Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
            }
        }
    }))
}

/// Stdout/stderr readers that outlive the wait for the child
///
/// Whatever has been read stays available even when the child is killed
/// before its pipes reach EOF.
pub(crate) struct OutputCapture {
    stdout: SharedBuf,
    stderr: SharedBuf,
    readers: Vec<JoinHandle<Result<(), OutputWaitError>>>,
}

impl OutputCapture {
    /// Take the child's pipes and start draining them
    pub fn start(child: &mut Child) -> Self {
        let stdout = SharedBuf::default();
        let stderr = SharedBuf::default();
        let readers = [
            spawn_reader(child.stdout.take(), "stdout", stdout.clone()),
            spawn_reader(child.stderr.take(), "stderr", stderr.clone()),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self {
            stdout,
            stderr,
            readers,
        }
    }

    fn snapshot(&self) -> (String, String) {
        (lossy(&self.stdout), lossy(&self.stderr))
    }

    /// Wait for both pipes to close
    pub async fn finish(mut self) -> Result<(String, String), OutputWaitError> {
        for reader in self.readers.drain(..) {
            reader
                .await
                .map_err(|source| OutputWaitError::Reader { source })??;
        }
        Ok(self.snapshot())
    }

    /// Give the readers `grace` to reach EOF, then return what was read
    pub async fn drain(self, grace: Duration) -> String {
        let aborts: Vec<_> = self.readers.iter().map(JoinHandle::abort_handle).collect();
        let mut readers = self.readers;
        let all = async {
            for reader in &mut readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(grace, all).await.is_err() {
            for abort in aborts {
                abort.abort();
            }
        }
        let stdout = lossy(&self.stdout);
        let stderr = lossy(&self.stderr);
        combine_streams(&stdout, &stderr)
    }
}

/// Wait for a child, reading stdout/stderr concurrently to avoid pipe deadlock.
///
/// Output that is not valid UTF-8 is kept lossily rather than failing the step.
pub(crate) async fn collect_output(child: &mut Child) -> Result<ChildOutput, OutputWaitError> {
    let start = Instant::now();
    let capture = OutputCapture::start(child);

    let status = child
        .wait()
        .await
        .map_err(|source| OutputWaitError::Wait { source })?;
    let (stdout, stderr) = capture.finish().await?;

    Ok(ChildOutput {
        stdout,
        stderr,
        exit_code: exit_status_code(&status),
        success: status.success(),
        elapsed: start.elapsed(),
    })
}

/// Stop a child and everything in its process group
///
/// SIGTERM first, SIGKILL after `grace`. The child must have been spawned
/// as a process group leader.
#[cfg(unix)]
pub(crate) async fn terminate_process_group(child: &mut Child, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(pgid, Signal::SIGTERM)
        && e != Errno::ESRCH
    {
        tracing::warn!(pid, error = %e, "SIGTERM to process group failed");
    }

    let _ = tokio::time::timeout(grace, child.wait()).await;

    // Descendants may outlive the shell; the group is killed either way
    if let Err(e) = killpg(pgid, Signal::SIGKILL)
        && e != Errno::ESRCH
    {
        tracing::warn!(pid, error = %e, "SIGKILL to process group failed");
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
pub(crate) async fn terminate_process_group(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
