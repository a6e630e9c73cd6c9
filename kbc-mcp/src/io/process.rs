//! Child processes with a wall-clock limit and bounded capture.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes kept from one output stream, plus how many were dropped.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    /// Lossy UTF-8 text with a trailing marker when bytes were dropped.
    fn text(&self, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.dropped));
        }
        text
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        self.stdout.text("stdout")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.text("stderr")
    }
}

/// How long readers may keep draining after the child is gone and the
/// overall deadline has passed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run `cmd` with stdin closed, draining both pipes on reader threads so a
/// chatty child cannot block. At most `limit` bytes per stream are kept. A
/// child still running after `timeout` is killed and reported as timed out.
///
/// Descendants that inherited the pipes can hold them open after the child
/// exits. Readers are given until the deadline (at least [`DRAIN_GRACE`] after
/// the child is reaped) and are then abandoned with whatever they captured,
/// so the call never outlives `timeout` by more than the grace period.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), limit))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    limit: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .inspect_err(|err| error!(err = %err, "spawn failed"))
        .context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let readers = Readers::spawn(&mut child, limit)?;
    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
    let deadline = (started + timeout).max(Instant::now() + DRAIN_GRACE);
    let (stdout, stderr) = readers.finish(deadline)?;

    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

type Sink = Arc<Mutex<Captured>>;

/// Reader threads writing into shared buffers and reporting completion.
struct Readers {
    stdout: Sink,
    stderr: Sink,
    done: Receiver<Result<()>>,
}

impl Readers {
    fn spawn(child: &mut Child, limit: usize) -> Result<Self> {
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
        let (tx, done) = mpsc::channel();
        let readers = Self {
            stdout: Sink::default(),
            stderr: Sink::default(),
            done,
        };
        drain(stdout, limit, readers.stdout.clone(), tx.clone());
        drain(stderr, limit, readers.stderr.clone(), tx);
        Ok(readers)
    }

    /// Wait for both readers until `deadline`, then take what was captured.
    fn finish(self, deadline: Instant) -> Result<(Captured, Captured)> {
        for _ in 0..2 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(remaining) {
                Ok(result) => result?,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("output pipes still open after child exit, abandoning readers");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("output reader panicked"));
                }
            }
        }
        Ok((take(&self.stdout)?, take(&self.stderr)?))
    }
}

fn drain<R: Read + Send + 'static>(source: R, limit: usize, sink: Sink, done: Sender<Result<()>>) {
    thread::spawn(move || {
        let result = capture(source, limit, &sink);
        let _ = done.send(result);
    });
}

fn take(sink: &Sink) -> Result<Captured> {
    let mut captured = sink.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
    Ok(std::mem::take(&mut *captured))
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "child timed out, killing");
    child.kill().context("kill child")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

fn capture<R: Read>(mut source: R, limit: usize, sink: &Sink) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = source.read(&mut chunk).context("read child output")?;
        if n == 0 {
            return Ok(());
        }
        let mut out = sink.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
        let keep = n.min(limit.saturating_sub(out.bytes.len()));
        out.bytes.extend_from_slice(&chunk[..keep]);
        out.dropped += n - keep;
    }
}
