use shared_child::SharedChild;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;

/// Child is a spawned process with non-blocking stdout and stderr pipes.
///
/// The process leads a new process group, so everything it forks can be
/// signalled together. A Child which is dropped before its process exits
/// delivers SIGTERM to that whole group and reaps the process in the
/// background. This is what makes an abandoned `Runner::run` future clean
/// up after itself.
pub struct Child {
    inner: Arc<SharedChild>,

    pub stdout: Option<ChildStdio>,
    pub stderr: Option<ChildStdio>,
}

/// ChildStdio is the read end of a child pipe, registered with the tokio reactor.
pub struct ChildStdio(AsyncFd<std::fs::File>);

impl Child {
    /// Spawn the command as the leader of a new process group.
    /// Stdio configuration is left to the caller. Must be called from
    /// within a tokio runtime, as pipes are registered with its reactor.
    pub fn spawn(cmd: &mut std::process::Command) -> io::Result<Self> {
        let mut inner = cmd.process_group(0).spawn()?;
        let stdout = map_stdio(inner.stdout.take());
        let stderr = map_stdio(inner.stderr.take());

        Ok(Self {
            inner: Arc::new(SharedChild::new(inner)?),
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    pub fn wait(&self) -> impl std::future::Future<Output = io::Result<std::process::ExitStatus>> {
        let cloned_inner = self.inner.clone();
        let handle = tokio::task::spawn_blocking(move || cloned_inner.wait());

        async move {
            match handle.await {
                Ok(status) => status,
                Err(err) if err.is_cancelled() => Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "wait was cancelled by runtime shutdown",
                )),
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            }
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.inner.try_wait() {
            return;
        }
        let pid = self.inner.id();

        // The child is its group's leader, so its pid is also the group id.
        // Signalling the group reaches grandchildren which may hold our pipes.
        if let Err(error) = signal_group(pid, libc::SIGTERM) {
            tracing::error!(%pid, ?error, "failed to signal process group of dropped child");
        }

        // Reaping needs a runtime, but the signal doesn't.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%pid, "dropped child process outside of a runtime");
            return;
        };
        let wait = self.wait();

        runtime.spawn(async move {
            match tokio::time::timeout(REAP_TIMEOUT, wait).await {
                Ok(Ok(status)) => tracing::debug!(%pid, ?status, "reaped dropped child process"),
                Ok(Err(error)) => {
                    tracing::error!(%pid, ?error, "failed to reap dropped child process")
                }
                Err(_) => {
                    tracing::error!(%pid, ?REAP_TIMEOUT, "dropped child process ignored SIGTERM")
                }
            }
        });
    }
}

// How long a dropped child has to exit after SIGTERM before we stop waiting on it.
const REAP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // ESRCH means every member of the group is already gone.
    if unsafe { libc::kill(-(pid as libc::pid_t), signal) } == 0 {
        return Ok(());
    }
    match io::Error::last_os_error() {
        err if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        err => Err(err),
    }
}

impl ChildStdio {
    /// Wait until the pipe is readable, then read into `buf`.
    /// Returns zero once every writer of the pipe has closed it.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.0.readable().await?;

            match guard.try_io(|fd| {
                let mut file = fd.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Read bytes which are already in the pipe, without waiting for more.
    /// Fails with `io::ErrorKind::WouldBlock` if the pipe is empty but still
    /// has writers.
    pub fn read_buffered(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.0.get_ref();
        file.read(buf)
    }

    /// Number of bytes currently sitting in the pipe.
    pub fn buffered_len(&self) -> io::Result<usize> {
        let mut len: libc::c_int = 0;
        let len_ptr: *mut libc::c_int = &mut len;

        if unsafe { libc::ioctl(self.0.as_raw_fd(), libc::FIONREAD, len_ptr) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }
}

impl std::fmt::Debug for ChildStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChildStdio").field(&self.0.as_raw_fd()).finish()
    }
}

/// Map an ExitStatus into a signed status code.
/// Processes terminated by a signal map to 128 + the signal number,
/// which is what a shell would report in `$?`.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

fn map_stdio<F>(f: Option<F>) -> io::Result<Option<ChildStdio>>
where
    F: Into<OwnedFd>,
{
    let Some(fd) = f.map(Into::<OwnedFd>::into) else {
        return Ok(None);
    };
    set_nonblocking(&fd)?;

    Ok(Some(ChildStdio(AsyncFd::new(std::fs::File::from(fd))?)))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();

    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
