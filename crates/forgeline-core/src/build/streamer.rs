//! Runs a build command, forwarding its combined output line by line.
//!
//! The process is started in its own process group so that a timeout or a
//! cancellation can take down the whole tree (`mvn` and `gradle` both fork
//! daemons and test JVMs).

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

use crate::constants::build::{
    KILL_GRACE_MS, RAW_CAPTURE_MAX_BYTES, RAW_CAPTURE_MAX_LINES, READER_JOIN_TIMEOUT_MS,
};
use crate::pipeline::collaborators::LineSink;

static ANSI: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
    regex::Regex::new(r"\x1b\[[\?0-9;]*[a-zA-Z]|\x1b\][^\x07]*\x07").expect("valid regex")
});

/// How a streamed command ended.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    /// `None` when the process was killed by us.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
    /// Captured output, bounded to the most recent lines.
    pub lines: Vec<String>,
    /// Lines that fell out of the capture window.
    pub dropped_lines: usize,
}

impl StreamOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Last `n` captured lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(n);
        self.lines[start..].to_vec()
    }
}

struct BoundedOutputBuffer {
    lines: VecDeque<String>,
    total_bytes: usize,
    dropped_lines: usize,
    max_lines: usize,
    max_bytes: usize,
}

impl BoundedOutputBuffer {
    fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            total_bytes: 0,
            dropped_lines: 0,
            max_lines,
            max_bytes,
        }
    }

    fn push_line(&mut self, line: String) {
        let kept = if line.len() > self.max_bytes {
            tail_by_bytes(&line, self.max_bytes)
        } else {
            line
        };

        self.total_bytes = self.total_bytes.saturating_add(kept.len());
        self.lines.push_back(kept);

        while self.lines.len() > self.max_lines || self.total_bytes > self.max_bytes {
            let Some(removed) = self.lines.pop_front() else {
                break;
            };
            self.total_bytes = self.total_bytes.saturating_sub(removed.len());
            self.dropped_lines = self.dropped_lines.saturating_add(1);
        }
    }
}

/// Keep the tail of a string within `max_bytes`, preserving UTF-8 boundaries.
fn tail_by_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut start = text.len().saturating_sub(max_bytes);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn build_shell_command(command: &str, cwd: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };

    cmd.env("NO_COLOR", "1")
        .env("TERM", "dumb")
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

async fn pump_lines<R>(pipe: Option<R>, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut reader = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        let clean = ANSI.replace_all(&line, "").into_owned();
        if tx.send(clean).is_err() {
            break;
        }
    }
}

async fn join_reader_with_timeout(mut handle: tokio::task::JoinHandle<()>) {
    if timeout(Duration::from_millis(READER_JOIN_TIMEOUT_MS), &mut handle)
        .await
        .is_err()
    {
        handle.abort();
    }

    let _ = handle.await;
}

#[cfg(unix)]
async fn terminate_unix_process_tree(pid: u32) {
    let pgid = format!("-{}", pid);

    let group_term_ok = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(&pgid)
        .status()
        .map(|s| s.success())
        .unwrap_or(false);

    if !group_term_ok {
        let _ = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status();
    }

    sleep(Duration::from_millis(200)).await;

    let still_running = std::process::Command::new("kill")
        .arg("-0")
        .arg(&pgid)
        .status()
        .map(|s| s.success())
        .unwrap_or(false);

    if still_running {
        let _ = std::process::Command::new("kill")
            .arg("-KILL")
            .arg(&pgid)
            .status();
    }
}

#[cfg(windows)]
async fn terminate_windows_process_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}

async fn terminate_process_tree(child: &mut Child) {
    let Some(pid) = child.id() else {
        let _ = child.kill().await;
        return;
    };

    tracing::info!(pid, "Terminating build process tree");

    #[cfg(unix)]
    terminate_unix_process_tree(pid).await;

    #[cfg(windows)]
    terminate_windows_process_tree(pid).await;

    if timeout(Duration::from_millis(KILL_GRACE_MS), child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            tracing::debug!("Build process killed by signal {}", sig);
            return Some(128 + sig);
        }
    }
    None
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run `command` through the shell in `cwd`.
///
/// Every output line (stdout and stderr interleaved in arrival order) is
/// handed to `on_line` before the next one is read. The process tree is
/// terminated when `limit` elapses or `cancel` fires. Spawn failures are the
/// only `Err`.
pub async fn run(
    command: &str,
    cwd: &Path,
    on_line: LineSink<'_>,
    limit: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<StreamOutcome> {
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + limit;

    let mut child = build_shell_command(command, cwd).spawn()?;
    tracing::info!(command, cwd = %cwd.display(), pid = ?child.id(), "Build process started");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stdout_handle = tokio::spawn(pump_lines(child.stdout.take(), tx.clone()));
    let stderr_handle = tokio::spawn(pump_lines(child.stderr.take(), tx));

    let mut buffer = BoundedOutputBuffer::new(RAW_CAPTURE_MAX_LINES, RAW_CAPTURE_MAX_BYTES);
    let forward = |line: String, buffer: &mut BoundedOutputBuffer| {
        on_line(&line);
        buffer.push_line(line);
    };

    let ending = loop {
        tokio::select! {
            Some(line) = rx.recv() => forward(line, &mut buffer),
            status = child.wait() => break Ending::Exited(status),
            _ = sleep_until(deadline) => break Ending::TimedOut,
            _ = cancel.cancelled() => break Ending::Cancelled,
        }
    };

    let mut outcome = StreamOutcome::default();
    match ending {
        Ending::Exited(Ok(status)) => outcome.exit_code = exit_code(status),
        Ending::Exited(Err(e)) => {
            tracing::error!("Build process wait error: {}", e);
        }
        Ending::TimedOut => {
            tracing::warn!(command, limit_secs = limit.as_secs(), "Build timed out");
            terminate_process_tree(&mut child).await;
            outcome.timed_out = true;
        }
        Ending::Cancelled => {
            tracing::info!(command, "Build cancelled");
            terminate_process_tree(&mut child).await;
            outcome.cancelled = true;
        }
    }

    join_reader_with_timeout(stdout_handle).await;
    join_reader_with_timeout(stderr_handle).await;
    // Readers are gone, so this drains whatever they sent before exiting.
    while let Some(line) = rx.recv().await {
        forward(line, &mut buffer);
    }

    outcome.duration = started.elapsed();
    outcome.dropped_lines = buffer.dropped_lines;
    outcome.lines = buffer.lines.into();
    Ok(outcome)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    async fn collect(command: &str, limit: Duration, cancel: &CancellationToken) -> (StreamOutcome, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        let seen = Mutex::new(Vec::new());
        let on_line = |line: &str| seen.lock().push(line.to_string());
        let outcome = run(command, dir.path(), &on_line, limit, cancel).await.unwrap();
        (outcome, seen.into_inner())
    }

    #[tokio::test]
    async fn forwards_every_line_in_order() {
        let (outcome, seen) = collect(
            "for i in 1 2 3; do echo line$i; done; echo oops >&2; exit 3",
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        // stdout and stderr are read concurrently; order holds per stream
        let stdout: Vec<&String> = seen.iter().filter(|l| l.starts_with("line")).collect();
        assert_eq!(stdout, ["line1", "line2", "line3"]);
        assert!(seen.contains(&"oops".to_string()));
        assert_eq!(outcome.lines, seen);
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let started = Instant::now();
        let (outcome, seen) = collect(
            "echo before; sleep 30; echo after",
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.timed_out);
        assert!(outcome.exit_code.is_none());
        assert_eq!(seen, vec!["before".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let (outcome, _) = collect("sleep 30", Duration::from_secs(60), &cancel).await;
        assert!(outcome.cancelled);
        assert!(!outcome.success());
        assert!(outcome.duration < Duration::from_secs(10));
    }

    #[test]
    fn bounded_output_buffer_keeps_recent_lines() {
        let mut buffer = BoundedOutputBuffer::new(2, 1_000);
        for line in ["a", "b", "c"] {
            buffer.push_line(line.to_string());
        }
        assert_eq!(buffer.lines, ["b", "c"]);
        assert_eq!(buffer.dropped_lines, 1);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail_by_bytes("héllo", 4), "llo");
        assert_eq!(tail_by_bytes("abc", 10), "abc");
    }
}
