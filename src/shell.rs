//! One-shot shell command execution.
//!
//! All shell side-effects (firewall rules, interface bring-up, process
//! lookup, address discovery) go through [`run`]. Child processes get
//! `kill_on_drop(true)` so cancelled tasks cannot leak them, and output is
//! capped to keep a chatty command from ballooning memory.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Max captured bytes per stream.
const MAX_OUTPUT: usize = 64 * 1024;

/// Result of a completed shell command.
#[derive(Debug)]
pub struct ShellOutput {
    /// Process exit code, or `-1` if killed by a signal.
    pub exit_code: i32,
    /// Captured stdout (capped, lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (capped, lossy UTF-8).
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors from [`run`].
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("process error: {0}")]
    Wait(String),
    #[error("command timed out")]
    Timeout,
}

/// Execute `command` via `<shell> -c "<command>"` and capture both streams.
///
/// Stdout and stderr are drained concurrently to avoid pipe deadlock, and
/// the whole operation is bounded by `timeout_ms`.
pub async fn run(shell: &str, command: &str, timeout_ms: u64) -> Result<ShellOutput, ShellError> {
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ShellError::Spawn(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ShellError::Wait("failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ShellError::Wait("failed to take stderr pipe".to_string()))?;

    let timeout = tokio::time::Duration::from_millis(timeout_ms);
    tokio::time::timeout(timeout, async {
        let (out, err) = tokio::join!(read_capped(&mut stdout), read_capped(&mut stderr));
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ShellError::Wait(e.to_string()))?;

        Ok(ShellOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: out,
            stderr: err,
        })
    })
    .await
    .map_err(|_| ShellError::Timeout)?
}

/// Read an async stream keeping the first [`MAX_OUTPUT`] bytes; the rest is
/// drained and discarded so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < MAX_OUTPUT {
                    let take = n.min(MAX_OUTPUT - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = run("/bin/sh", "echo hello", 5000).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_reports_exit_code() {
        let out = run("/bin/sh", "exit 3", 5000).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn run_times_out() {
        let err = run("/bin/sh", "sleep 5", 100).await.unwrap_err();
        assert!(matches!(err, ShellError::Timeout));
    }
}
