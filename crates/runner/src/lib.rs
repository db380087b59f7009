//! Runner executes one shell command at a time in a child process,
//! capturing its stdout and stderr while it runs, and resolves to the
//! command's trimmed output or a Failure carrying both raw streams.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod buffer;
mod child;
mod outcome;
mod sink;

pub use buffer::StreamBuffer;
pub use child::{exit_code, Child, ChildStdio};
pub use outcome::{aggregate, decode, strip_trailing_newline, text, Failure, NO_DIRECTORY};
pub use sink::Sink;

/// Environment variable naming the interpreter used to run commands.
pub const SHELL_ENV: &str = "SHELL";
/// Interpreter used when neither Config nor the environment names one.
pub const DEFAULT_SHELL: &str = "/bin/sh";

// Size of a single read from a child pipe.
const CHUNK_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Failed(#[from] Failure),
    #[error("failed to spawn {shell:?}")]
    Spawn {
        shell: String,
        #[source]
        err: std::io::Error,
    },
    #[error("error while waiting for the process")]
    Wait(#[source] std::io::Error),
    #[error("failed to service stdout")]
    Stdout(#[source] std::io::Error),
    #[error("failed to service stderr")]
    Stderr(#[source] std::io::Error),
}

impl Error {
    /// The Failure of a run which terminated with a non-zero status,
    /// or which had no working directory.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Error::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Config is fixed when the Runner is built, and shared by all its runs.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Working directory of runs which don't provide their own.
    pub default_dir: Option<PathBuf>,
    /// Interpreter which runs commands. When None, `$SHELL` is consulted
    /// on each run, falling back to DEFAULT_SHELL.
    pub shell: Option<String>,
}

impl Config {
    /// Config which defaults to this process's current directory.
    pub fn from_env() -> Self {
        Self {
            default_dir: std::env::current_dir().ok(),
            shell: None,
        }
    }

    pub fn with_default_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_dir = Some(dir.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    fn resolve_shell(&self) -> String {
        pick_shell(self.shell.as_deref(), std::env::var(SHELL_ENV).ok())
    }
}

// An empty `$SHELL` is treated as unset.
fn pick_shell(configured: Option<&str>, env: Option<String>) -> String {
    match (configured, env) {
        (Some(shell), _) => shell.to_string(),
        (None, Some(shell)) if !shell.is_empty() => shell,
        _ => DEFAULT_SHELL.to_string(),
    }
}

/// Invocation is a single request to run a command.
#[derive(Debug)]
pub struct Invocation {
    /// Command text, passed through to the interpreter as-is.
    pub command: String,
    /// Working directory, overriding Config::default_dir.
    pub dir: Option<PathBuf>,
    /// When non-zero, the command and its outcome are echoed to the console.
    pub verbosity: u8,
    /// Optional live copy of the child's stdout.
    pub stdout_sink: Option<Sink>,
    /// Optional live copy of the child's stderr.
    pub stderr_sink: Option<Sink>,
    /// When false, the child inherits this process's stderr and nothing is captured.
    pub capture_stderr: bool,
}

impl Invocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            dir: None,
            verbosity: 0,
            stdout_sink: None,
            stderr_sink: None,
            capture_stderr: true,
        }
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn stdout_sink(mut self, sink: Sink) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    pub fn stderr_sink(mut self, sink: Sink) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Runner {
    config: Config,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the invocation to completion, resolving to its stdout less one
    /// trailing newline. A non-zero exit status is always an Error::Failed.
    ///
    /// The run completes when the child process exits. Background processes
    /// it started may keep running and holding its pipes, but output they
    /// write after the child's exit isn't captured.
    ///
    /// Dropping the returned future before it completes delivers SIGTERM
    /// to the child's process group.
    pub async fn run(&self, invocation: Invocation) -> Result<String, Error> {
        let Invocation {
            command,
            dir,
            verbosity,
            stdout_sink,
            stderr_sink,
            capture_stderr,
        } = invocation;

        let Some(dir) = dir.or_else(|| self.config.default_dir.clone()) else {
            tracing::debug!(%command, "no working directory for command");
            return Err(Failure::no_directory().into());
        };
        let shell = self.config.resolve_shell();
        let script = format!("cd {} && {command}", escape_spaces(&dir));

        if verbosity > 0 {
            println!("{command}");
        }

        let mut cmd = std::process::Command::new(&shell);
        cmd.arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if capture_stderr {
                Stdio::piped()
            } else {
                Stdio::inherit()
            });

        tracing::debug!(%shell, ?dir, %command, "invoking");

        let mut child = Child::spawn(&mut cmd).map_err(|err| Error::Spawn {
            shell: shell.clone(),
            err,
        })?;
        let pid = child.id();

        let (stdout, stderr) = (Arc::new(StreamBuffer::new()), Arc::new(StreamBuffer::new()));

        let exited = CancellationToken::new();

        let stdout_drain = child.stdout.take().map(|reader| {
            Drainer::spawn(drain(reader, stdout.clone(), stdout_sink, exited.clone()))
        });
        let stderr_drain = child.stderr.take().map(|reader| {
            Drainer::spawn(drain(reader, stderr.clone(), stderr_sink, exited.clone()))
        });

        let status = child.wait().await.map_err(Error::Wait)?;
        exited.cancel();

        // Joining both drainers is the barrier after which everything the
        // child wrote to either pipe has been appended to its buffer.
        let stdout_sink = join(stdout_drain).await.map_err(Error::Stdout)?;
        let stderr_sink = join(stderr_drain).await.map_err(Error::Stderr)?;

        for sink in [stdout_sink, stderr_sink].into_iter().flatten() {
            if let Err(error) = sink.finish().await {
                tracing::warn!(%pid, ?error, "failed to finish output sink");
            }
        }

        let status = exit_code(status);
        tracing::debug!(
            %pid,
            status,
            stdout = stdout.len(),
            stderr = stderr.len(),
            "process exited"
        );

        match aggregate(status, stdout.snapshot(), stderr.snapshot()) {
            Ok(output) => {
                if verbosity > 0 && !output.is_empty() {
                    println!("{output}");
                }
                Ok(output)
            }
            Err(failure) => {
                if verbosity > 0 {
                    eprintln!(
                        "command failed with status {}: {}",
                        failure.status,
                        failure.output_text()
                    );
                }
                Err(failure.into())
            }
        }
    }
}

/// Escape spaces of a directory so it survives as a single shell word.
/// This is the only escaping applied to commands.
pub fn escape_spaces(dir: &Path) -> String {
    dir.display().to_string().replace(' ', "\\ ")
}

// Drain `reader` into `buffer`, copying each chunk to `sink`, until EOF or
// until `exited` is cancelled. After the child exits, only the bytes already
// in the pipe are read: processes it left running may hold the pipe open.
async fn drain(
    reader: ChildStdio,
    buffer: Arc<StreamBuffer>,
    mut sink: Option<Sink>,
    exited: CancellationToken,
) -> std::io::Result<Option<Sink>> {
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = exited.cancelled() => break,
            read = reader.read(&mut chunk) => read?,
        };
        if n == 0 {
            return Ok(sink);
        }
        forward(&chunk[..n], &buffer, &mut sink).await;
    }

    // Bound by what's buffered now, so a writer left behind can't keep us here.
    let mut remaining = reader.buffered_len()?;

    while remaining != 0 {
        let limit = remaining.min(CHUNK_SIZE);

        let n = match reader.read_buffered(&mut chunk[..limit]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        forward(&chunk[..n], &buffer, &mut sink).await;
        remaining -= n;
    }
    Ok(sink)
}

// A failing sink is dropped rather than failing the run, and draining
// continues so the child never blocks on a full pipe.
async fn forward(chunk: &[u8], buffer: &StreamBuffer, sink: &mut Option<Sink>) {
    buffer.append(chunk);

    let forwarded = match sink.as_mut() {
        Some(writer) => writer.write(chunk).await,
        None => Ok(()),
    };
    if let Err(error) = forwarded {
        tracing::warn!(?error, "output sink failed, no longer forwarding to it");
        *sink = None;
    }
}

// Drainer is a spawned `drain` task, which is aborted if dropped before it's joined.
struct Drainer(tokio::task::JoinHandle<std::io::Result<Option<Sink>>>);

impl Drainer {
    fn spawn<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = std::io::Result<Option<Sink>>> + Send + 'static,
    {
        Self(tokio::spawn(fut))
    }

    async fn join(mut self) -> std::io::Result<Option<Sink>> {
        match (&mut self.0).await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "output drain was cancelled",
            )),
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}

impl Drop for Drainer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn join(drainer: Option<Drainer>) -> std::io::Result<Option<Sink>> {
    match drainer {
        Some(drainer) => drainer.join().await,
        None => Ok(None),
    }
}
