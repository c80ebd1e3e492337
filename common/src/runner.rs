use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    io::{self, Write},
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use flume::{Receiver, Sender};
use indicatif::ProgressBar;
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use thiserror::Error;
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    join,
    process::{Child, Command},
    time,
};
use tracing::{debug, warn};

use crate::matrix::Trial;

/// A fully resolved external invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Overlaid on the inherited environment
    pub env: HashMap<String, String>,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: BTreeMap<_, _> = self.env.iter().collect();
        for (k, v) in env {
            write!(f, "{k}={v} ")?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Status(ExitStatus),
    /// Killed after exceeding the trial timeout
    TimedOut(Duration),
}

impl Exit {
    pub fn success(&self) -> bool {
        matches!(self, Exit::Status(s) if s.success())
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, Exit::TimedOut(_))
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Status(s) => write!(f, "{s}"),
            Exit::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs_f64()),
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Both streams, line by line, in the order the lines arrived.
    ///
    /// Not byte exact: invalid UTF-8 is replaced lossily, `\r\n` endings
    /// become `\n` and a final unterminated line gains a `\n`. The campaign
    /// log holds the same normalised lines.
    pub output: String,
    pub exit: Exit,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not start `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("waiting for `{program}`")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("reading {stream} of `{program}`")]
    Read {
        program: String,
        stream: Stream,
        #[source]
        source: io::Error,
    },
    #[error("writing campaign log")]
    Log(#[source] io::Error),
}

impl RunError {
    /// Log sink failures break the guarantee that every run's raw output is kept
    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Log(_))
    }
}

/// Durable, sequential text log of every invocation's output
pub struct CampaignLog {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl CampaignLog {
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    /// Writes and flushes a single line
    pub async fn line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    pub async fn trial_header(&mut self, trial: &Trial, stage: &str) -> io::Result<()> {
        self.line(&format!("==== [{trial}] {stage} ====")).await
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

/// Interactive sink for live child output, never fails the run
#[derive(Debug, Clone)]
pub enum Console {
    /// Print above a progress bar
    Bar(ProgressBar),
    Stdout,
    Quiet,
}

impl Console {
    pub fn line(&self, stream: Stream, line: &str) {
        match self {
            Console::Bar(bar) => bar.println(line),
            Console::Stdout => {
                let result = match stream {
                    Stream::Stdout => writeln!(io::stdout().lock(), "{line}"),
                    Stream::Stderr => writeln!(io::stderr().lock(), "{line}"),
                };
                if let Err(err) = result {
                    debug!("console write failed: {err}");
                }
            }
            Console::Quiet => {}
        }
    }

    /// Runs `f` with the progress bar hidden, so direct terminal writes such
    /// as tracing events do not tear it
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        match self {
            Console::Bar(bar) => bar.suspend(f),
            Console::Stdout | Console::Quiet => f(),
        }
    }
}

/// Runs external commands one at a time, teeing their output into the
/// campaign log and the console.
pub struct ProcessRunner {
    log: CampaignLog,
    console: Console,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(log: CampaignLog, console: Console, timeout: Option<Duration>) -> Self {
        Self {
            log,
            console,
            timeout,
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub async fn trial_header(&mut self, trial: &Trial, stage: &str) -> Result<(), RunError> {
        self.log
            .trial_header(trial, stage)
            .await
            .map_err(RunError::Log)
    }

    /// Records an operator facing message between the captured output
    pub async fn note(&mut self, message: &str) -> Result<(), RunError> {
        self.log.line(message).await.map_err(RunError::Log)
    }

    /// Runs `cmd` to completion.
    ///
    /// Both pipes are drained concurrently while the child runs, so a child
    /// blocked on a full stderr pipe can never stall behind stdout. The run is
    /// over once both pipes reached end of stream and the child was reaped. A
    /// non-zero exit is returned, not treated as an error.
    ///
    /// The timeout covers the pipes too: a descendant that outlives the child
    /// while holding stdout or stderr open cannot extend the run past it. On
    /// expiry the process group is killed and the readers are dropped.
    pub async fn run(&mut self, cmd: &CommandSpec) -> Result<RunOutcome, RunError> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(&cmd.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.timeout.is_some() {
            // own group so a timeout can take down grandchildren holding the pipes
            command.process_group(0);
        }

        let spawn_err = |source| RunError::Spawn {
            program: cmd.program.clone(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_err)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stderr not captured")))?;
        let pid = child.id();
        debug!(pid, "Spawned {cmd}");

        let (tx, rx) = flume::unbounded();
        let drain = async {
            join!(
                read_lines(stdout, Stream::Stdout, tx.clone()),
                read_lines(stderr, Stream::Stderr, tx),
                child.wait(),
            )
        };
        let (finished, captured) = join!(
            within(self.timeout, drain),
            write_lines(&mut self.log, &self.console, rx),
        );

        let (reads, exit) = match finished {
            Ok((out_read, err_read, status)) => (
                vec![(Stream::Stdout, out_read), (Stream::Stderr, err_read)],
                status.map(Exit::Status),
            ),
            Err(limit) => {
                self.console.suspend(|| {
                    warn!("`{}` exceeded {}s, killing it", cmd.program, limit.as_secs_f64())
                });
                let killed = kill_group(&mut child, pid).await;
                (Vec::new(), killed.map(|()| Exit::TimedOut(limit)))
            }
        };

        let output = captured.map_err(RunError::Log)?;
        let exit = exit.map_err(|source| RunError::Wait {
            program: cmd.program.clone(),
            source,
        })?;
        for (stream, result) in reads {
            result.map_err(|source| RunError::Read {
                program: cmd.program.clone(),
                stream,
                source,
            })?;
        }
        debug!("{} exited: {exit}", cmd.program);

        Ok(RunOutcome { output, exit })
    }

    pub async fn close(self) -> Result<(), RunError> {
        self.log.close().await.map_err(RunError::Log)
    }
}

async fn read_lines(
    pipe: impl AsyncRead + Unpin,
    stream: Stream,
    tx: Sender<(Stream, String)>,
) -> io::Result<()> {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']).to_owned();
        if tx.send_async((stream, line)).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Single writer for both readers, so lines never interleave mid line.
///
/// Keeps receiving after a log failure: the readers must keep draining or
/// the child blocks on a full pipe.
async fn write_lines(
    log: &mut CampaignLog,
    console: &Console,
    rx: Receiver<(Stream, String)>,
) -> io::Result<String> {
    let mut captured = String::new();
    let mut failed = None;
    while let Ok((stream, line)) = rx.recv_async().await {
        if failed.is_none() {
            if let Err(err) = log.line(&line).await {
                failed = Some(err);
            }
        }
        console.line(stream, &line);
        captured.push_str(&line);
        captured.push('\n');
    }
    match failed {
        Some(err) => Err(err),
        None => Ok(captured),
    }
}

/// Bounds the whole run, including pipes a lingering descendant keeps open
async fn within<T>(limit: Option<Duration>, run: impl Future<Output = T>) -> Result<T, Duration> {
    match limit {
        Some(limit) => time::timeout(limit, run).await.map_err(|_| limit),
        None => Ok(run.await),
    }
}

async fn kill_group(child: &mut Child, pid: Option<u32>) -> io::Result<()> {
    if let Some(pid) = pid {
        // ESRCH once every member of the group is gone
        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("Could not kill process group {pid}: {err}");
        }
    }
    if child.try_wait()?.is_none() {
        child.kill().await?;
    }
    Ok(())
}
