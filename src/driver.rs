use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::VERBOSE;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_millis(250);
/// How long pipe readers may lag behind the end of a bounded run.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Program plus argument vector for one launch of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(|a| a.as_ref().to_os_string()).collect(),
        }
    }

    /// Copy of this invocation with `extra` appended after the existing arguments.
    pub fn with_extra<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut args = self.args.clone();
        args.extend(extra.into_iter().map(|a| a.as_ref().to_os_string()));
        Self {
            program: self.program.clone(),
            args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
}

impl RunResult {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }

    pub fn exit_description(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "unknown termination".to_string(),
        }
    }
}

/// Runs `invocation` to completion with `script` on stdin.
///
/// Without a timeout this blocks until the target exits, however long that takes.
/// With one, the target runs in its own process group. Once the limit expires the
/// whole group is sent SIGTERM and then SIGKILL, and the partial output comes back
/// with `timed_out` set. Anything the target started in the background dies with it.
pub fn run(invocation: &Invocation, script: &[u8], timeout: Option<Duration>) -> Result<RunResult> {
    let mut command = Command::new(invocation.program());
    command
        .args(invocation.args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if timeout.is_some() {
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {:?}", invocation.program()))?;

    let stdin = child.stdin.take().context("child stdin was not piped")?;
    let stdin_writer = spawn_stdin_writer(stdin, script.to_vec());

    let (status, stdout, stderr, timed_out) = match timeout {
        None => {
            let output = child
                .wait_with_output()
                .with_context(|| format!("waiting for {:?}", invocation.program()))?;
            stdin_writer
                .wait(None, "stdin writer")?
                .transpose()
                .context("writing script to stdin")?;
            (output.status, output.stdout, output.stderr, false)
        }
        Some(limit) => {
            let bounded = wait_bounded(&mut child, limit)?;
            // A writer still blocked at this point feeds a pipe nobody reads; leave it.
            stdin_writer
                .wait(Some(Instant::now() + DRAIN_GRACE), "stdin writer")?
                .transpose()
                .context("writing script to stdin")?;
            bounded
        }
    };

    let result = RunResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
        signal: status.signal(),
        timed_out,
    };
    if VERBOSE.load(Ordering::Relaxed) {
        println!(
            "[CMD ] {} -> {}{}, stdout {}B, stderr {}B",
            invocation,
            result.exit_description(),
            if timed_out { " (timed out)" } else { "" },
            stdout.len(),
            stderr.len()
        );
    }
    Ok(result)
}

/// Outcome of a helper thread, collected with an optional deadline.
struct Pending<T>(Receiver<T>);

impl<T: Send + 'static> Pending<T> {
    fn spawn(work: impl FnOnce() -> T + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            // The receiver is gone only when the result was abandoned.
            let _ = tx.send(work());
        });
        Pending(rx)
    }

    /// `Ok(None)` means the deadline passed first; the thread is left detached.
    fn wait(self, deadline: Option<Instant>, what: &str) -> Result<Option<T>> {
        let Some(deadline) = deadline else {
            return self.0.recv().map(Some).map_err(|_| anyhow!("{what} thread panicked"));
        };
        match self.0.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{what} thread panicked")),
        }
    }
}

fn spawn_stdin_writer(mut stdin: ChildStdin, data: Vec<u8>) -> Pending<std::io::Result<()>> {
    Pending::spawn(move || -> std::io::Result<()> {
        // The target may stop reading early (`.exit`, `.quit`); that is not our failure.
        match stdin.write_all(&data) {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
        // Dropping stdin here closes the pipe and signals end of input.
    })
}

/// Drains one output pipe into a shared buffer so a late reader still yields what it got.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    done: Pending<std::io::Result<()>>,
}

impl Drain {
    fn spawn<R: Read + Send + 'static>(mut source: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let done = Pending::spawn(move || -> std::io::Result<()> {
            let mut chunk = [0u8; 8192];
            loop {
                let n = match source.read(&mut chunk) {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                match sink.lock() {
                    Ok(mut out) => out.extend_from_slice(&chunk[..n]),
                    Err(_) => return Ok(()),
                }
            }
        });
        Drain { buf, done }
    }

    /// Returns `(bytes, finished)`; unfinished means a leftover process still holds the pipe.
    fn finish(self, deadline: Instant, what: &str) -> Result<(Vec<u8>, bool)> {
        let finished = match self.done.wait(Some(deadline), what)? {
            Some(read) => {
                read.with_context(|| format!("reading {what}"))?;
                true
            }
            None => false,
        };
        let bytes = self
            .buf
            .lock()
            .map_err(|_| anyhow!("{what} buffer poisoned"))?
            .clone();
        Ok((bytes, finished))
    }
}

fn wait_bounded(child: &mut Child, limit: Duration) -> Result<(ExitStatus, Vec<u8>, Vec<u8>, bool)> {
    let stdout = Drain::spawn(child.stdout.take().context("child stdout was not piped")?);
    let stderr = Drain::spawn(child.stderr.take().context("child stderr was not piped")?);
    let group = process_group(child)?;

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() > limit {
            timed_out = true;
            break terminate(child, group)?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    // Readers get until the limit plus a short grace, never more.
    let deadline = (start + limit).max(Instant::now()) + DRAIN_GRACE;
    let (stdout, stdout_done) = stdout.finish(deadline, "stdout")?;
    let (stderr, stderr_done) = stderr.finish(deadline, "stderr")?;
    if !(stdout_done && stderr_done) {
        // Leftover group members keep the group id alive, so it cannot have been reused.
        let _ = killpg(group, Signal::SIGKILL);
    }
    Ok((status, stdout, stderr, timed_out))
}

fn process_group(child: &Child) -> Result<Pid> {
    Ok(Pid::from_raw(i32::try_from(child.id()).context("child pid out of range")?))
}

/// SIGTERM to the whole group first so the target can flush, SIGKILL to whatever is
/// still around after the grace period.
fn terminate(child: &mut Child, group: Pid) -> Result<ExitStatus> {
    // ESRCH means everything exited between the poll and the signal.
    let _ = killpg(group, Signal::SIGTERM);
    let deadline = Instant::now() + TERM_GRACE;
    let mut status = None;
    while Instant::now() < deadline {
        if let Some(exited) = child.try_wait()? {
            status = Some(exited);
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    // Background jobs may ignore SIGTERM even when the direct child did not.
    let _ = killpg(group, Signal::SIGKILL);
    match status {
        Some(status) => Ok(status),
        None => {
            child.kill().context("killing timed out child")?;
            Ok(child.wait()?)
        }
    }
}
