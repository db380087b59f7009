use std::pin::Pin;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Sink receives a live copy of each chunk read from a child stream,
/// as it's read and before the run completes.
///
/// An owned Sink is shut down when the run finishes. A Sink over one of
/// this process's standard streams is only flushed.
pub struct Sink {
    writer: Pin<Box<dyn AsyncWrite + Send>>,
    owned: bool,
}

impl Sink {
    /// Sink which forwards to this process's stdout.
    pub fn stdout() -> Self {
        Self::borrowed(tokio::io::stdout())
    }

    /// Sink which forwards to this process's stderr.
    pub fn stderr() -> Self {
        Self::borrowed(tokio::io::stderr())
    }

    /// Sink which takes ownership of `writer` and closes it when the run finishes.
    pub fn owned<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            writer: Box::pin(writer),
            owned: true,
        }
    }

    /// Sink over a writer that outlives the run. It's flushed but left open.
    pub fn borrowed<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            writer: Box::pin(writer),
            owned: false,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub(crate) async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(chunk).await
    }

    pub(crate) async fn finish(mut self) -> std::io::Result<()> {
        if self.owned {
            self.writer.shutdown().await
        } else {
            self.writer.flush().await
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").field("owned", &self.owned).finish()
    }
}
