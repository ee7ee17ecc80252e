//! Helpers for running child processes with timeouts.
//!
//! Agent processes have their stdout/stderr drained concurrently: every chunk
//! is forwarded to this process's own streams for live visibility and also
//! collected, in arrival order, into one combined buffer. The buffer budget is
//! enforced by the readers, so a runaway agent cannot grow memory past it.
//!
//! On unix a streamed child runs in its own process group and a timeout kills
//! the whole group, taking any helpers the agent spawned with it.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long to wait for pipe readers after a timeout kill before detaching them.
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("spawn failed: {0}")]
    Spawn(#[source] io::Error),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ProcessError::Io { context, source }
    }
}

/// Output of a child process whose streams were captured.
#[derive(Debug)]
pub struct StreamedOutput {
    pub status: ExitStatus,
    /// stdout and stderr interleaved in the order chunks arrived.
    pub combined: Vec<u8>,
    /// Bytes dropped from `combined` once `output_limit_bytes` was reached.
    pub truncated: usize,
    pub timed_out: bool,
}

impl StreamedOutput {
    /// Combined output as text, with a notice when bytes were dropped.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.combined).into_owned();
        if self.truncated > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        text
    }
}

/// Exit state of a child process that inherited our stdio.
#[derive(Debug, Clone, Copy)]
pub struct InheritedExit {
    pub status: ExitStatus,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy)]
enum Echo {
    Stdout,
    Stderr,
}

/// Capture budget shared by the stdout and stderr readers.
#[derive(Debug, Clone)]
struct Budget {
    remaining: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(limit)),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve up to `n` bytes; returns how many may be kept.
    fn take(&self, n: usize) -> usize {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                Some(left.saturating_sub(n))
            })
            .unwrap_or(0);
        let keep = n.min(prev);
        if keep < n {
            self.dropped.fetch_add(n - keep, Ordering::AcqRel);
        }
        keep
    }

    fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Run `cmd`, optionally feeding `stdin`, and capture its output.
///
/// `stdin` is written once from a helper thread and the pipe is closed right
/// after. A `timeout` of `None` waits indefinitely; on expiry the child's
/// process group is killed and `timed_out` is set. Pipe readers still blocked
/// [`KILL_GRACE`] after the kill (a helper escaped the group and kept the
/// pipes open) are detached, so the call returns promptly either way. When
/// `echo` is set, output chunks are also forwarded to our stdout/stderr as
/// they arrive.
#[instrument(skip_all, fields(timeout_ms = timeout.map(|t| t.as_millis() as u64), output_limit_bytes = output_limit_bytes, echo = echo))]
pub fn run_streaming(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    echo: bool,
) -> Result<StreamedOutput, ProcessError> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;

    let stdout = child.stdout.take().ok_or_else(|| ProcessError::Io {
        context: "take stdout",
        source: io::Error::other("stdout was not piped"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| ProcessError::Io {
        context: "take stderr",
        source: io::Error::other("stderr was not piped"),
    })?;

    let budget = Budget::new(output_limit_bytes);
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let stdout_handle = spawn_reader(
        stdout,
        tx.clone(),
        budget.clone(),
        echo.then_some(Echo::Stdout),
    );
    let stderr_handle = spawn_reader(stderr, tx, budget.clone(), echo.then_some(Echo::Stderr));

    let stdin_handle = match (stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => Some(spawn_writer(pipe, input)),
        _ => None,
    };

    let (status, timed_out) = wait_with_timeout(&mut child, timeout, true)?;

    let mut handles = vec![
        ("join stdout reader", stdout_handle),
        ("join stderr reader", stderr_handle),
    ];
    if let Some(handle) = stdin_handle {
        handles.push(("join stdin writer", handle));
    }
    if timed_out {
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline && handles.iter().any(|(_, h)| !h.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }
        for (context, handle) in handles {
            if handle.is_finished() {
                // The child is gone; read errors on its pipes no longer matter.
                if let Err(err) = join_thread(handle, context) {
                    debug!(err = %err, "i/o thread failed after timeout");
                }
            } else {
                warn!(thread = context, "pipe still held open after kill, detaching");
            }
        }
    } else {
        for (context, handle) in handles {
            join_thread(handle, context)?;
        }
    }

    // Detached readers still hold a sender, so only take what has arrived.
    let mut combined = Vec::new();
    for chunk in rx.try_iter() {
        combined.extend_from_slice(&chunk);
    }
    let truncated = budget.dropped();
    if truncated > 0 {
        warn!(truncated, "captured output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(StreamedOutput {
        status,
        combined,
        truncated,
        timed_out,
    })
}

/// Run `cmd` with inherited stdio and an optional timeout.
#[instrument(skip_all, fields(timeout_ms = timeout.map(|t| t.as_millis() as u64)))]
pub fn run_inherited(
    mut cmd: Command,
    timeout: Option<Duration>,
) -> Result<InheritedExit, ProcessError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
    let (status, timed_out) = wait_with_timeout(&mut child, timeout, false)?;
    Ok(InheritedExit { status, timed_out })
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    kill_group: bool,
) -> Result<(ExitStatus, bool), ProcessError> {
    let Some(timeout) = timeout else {
        let status = child.wait().map_err(ProcessError::io("wait for child"))?;
        return Ok((status, false));
    };
    match child
        .wait_timeout(timeout)
        .map_err(ProcessError::io("wait for child"))?
    {
        Some(status) => Ok((status, false)),
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "child timed out, killing");
            if kill_group {
                kill_process_group(child);
            }
            child.kill().map_err(ProcessError::io("kill child"))?;
            let status = child
                .wait()
                .map_err(ProcessError::io("wait for child after kill"))?;
            Ok((status, true))
        }
    }
}

/// SIGKILL the group led by `child` (spawned with `process_group(0)`).
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(err = %err, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_: &Child) {}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    tx: Sender<Vec<u8>>,
    budget: Budget,
    echo: Option<Echo>,
) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(());
            }
            if let Some(target) = echo {
                forward(target, &chunk[..n]);
            }
            let keep = budget.take(n);
            if keep > 0 {
                // The receiver may be gone once the caller has detached us.
                let _ = tx.send(chunk[..keep].to_vec());
            }
        }
    })
}

fn spawn_writer<W: Write + Send + 'static>(mut pipe: W, input: Vec<u8>) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        match pipe.write_all(&input) {
            Ok(()) => Ok(()),
            // The child may exit (or be killed) without reading all of its input.
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!("child closed stdin early");
                Ok(())
            }
            Err(err) => Err(err),
        }
        // `pipe` drops here, closing the child's stdin.
    })
}

fn forward(target: Echo, bytes: &[u8]) {
    let result = match target {
        Echo::Stdout => {
            let mut out = io::stdout().lock();
            out.write_all(bytes).and_then(|()| out.flush())
        }
        Echo::Stderr => {
            let mut err = io::stderr().lock();
            err.write_all(bytes).and_then(|()| err.flush())
        }
    };
    if let Err(err) = result {
        warn!(err = %err, "failed to forward child output");
    }
}

fn join_thread(
    handle: JoinHandle<io::Result<()>>,
    context: &'static str,
) -> Result<(), ProcessError> {
    match handle.join() {
        Ok(result) => result.map_err(ProcessError::io(context)),
        Err(_) => Err(ProcessError::Io {
            context,
            source: io::Error::other("thread panicked"),
        }),
    }
}
