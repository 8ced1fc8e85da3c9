//! Background draining of a worker's stdout and stderr.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Everything a worker wrote to its standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

type Buffer = Arc<Mutex<Vec<u8>>>;

/// Readers that keep the child's pipes empty.
pub(crate) struct OutputCapture {
    stdout: Buffer,
    stderr: Buffer,
    tasks: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    /// Take the child's piped stdout/stderr and start draining them.
    pub fn start(child: &mut Child) -> Self {
        let stdout = Buffer::default();
        let stderr = Buffer::default();
        let mut tasks = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            tasks.push(tokio::spawn(drain(pipe, Arc::clone(&stdout))));
        }
        if let Some(pipe) = child.stderr.take() {
            tasks.push(tokio::spawn(drain_lines(pipe, Arc::clone(&stderr))));
        }
        Self {
            stdout,
            stderr,
            tasks,
        }
    }

    /// What has been captured so far.
    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: lock(&self.stdout).clone(),
            stderr: lock(&self.stderr).clone(),
        }
    }

    /// Wait up to `grace` for the pipes to reach EOF, then return the output.
    pub async fn finish(self, grace: Duration) -> CapturedOutput {
        let Self {
            stdout,
            stderr,
            tasks,
        } = self;
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let joined = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, joined).await.is_err() {
            // A grandchild may still hold the pipe open.
            for abort in aborts {
                abort.abort();
            }
        }
        CapturedOutput {
            stdout: lock(&stdout).clone(),
            stderr: lock(&stderr).clone(),
        }
    }
}

fn lock(buffer: &Mutex<Vec<u8>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn drain(mut pipe: impl AsyncRead + Unpin, buffer: Buffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => lock(&buffer).extend_from_slice(&chunk[..n]),
        }
    }
}

/// Like [`drain`], re-emitting each line as a debug event.
async fn drain_lines(pipe: impl AsyncRead + Unpin, buffer: Buffer) {
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                lock(&buffer).extend_from_slice(&line);
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(target: "crossbit::worker", "{}", text.trim_end());
            }
        }
    }
}
