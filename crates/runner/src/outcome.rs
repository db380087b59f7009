/// Message placed into both buffers of the Failure returned when
/// no working directory could be resolved.
pub const NO_DIRECTORY: &str = "no working directory";

/// Failure of a run which terminated with a non-zero status.
/// Buffers hold the raw bytes captured up to termination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "command failed with status {status}\nstderr: {}\nstdout: {}",
    text(.stderr),
    text(.stdout)
)]
pub struct Failure {
    pub status: i32,
    pub stderr: Vec<u8>,
    pub stdout: Vec<u8>,
}

impl Failure {
    pub(crate) fn no_directory() -> Self {
        Self {
            status: 1,
            stderr: NO_DIRECTORY.as_bytes().to_vec(),
            stdout: NO_DIRECTORY.as_bytes().to_vec(),
        }
    }

    /// Decoded stdout, less one trailing newline.
    pub fn output_text(&self) -> String {
        text(&self.stdout)
    }

    /// Decoded stderr, less one trailing newline.
    pub fn error_text(&self) -> String {
        text(&self.stderr)
    }
}

/// Decode raw stream bytes as UTF-8. Bytes which aren't valid UTF-8
/// decode as empty text rather than failing.
pub fn decode(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap_or_default()
}

/// Remove at most one trailing newline.
pub fn strip_trailing_newline(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

/// Decode and strip, yielding owned text.
pub fn text(bytes: &[u8]) -> String {
    strip_trailing_newline(decode(bytes)).to_string()
}

/// Map a terminated process's status and captured streams into its result.
pub fn aggregate(status: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Result<String, Failure> {
    if status != 0 {
        return Err(Failure {
            status,
            stderr,
            stdout,
        });
    }
    Ok(text(&stdout))
}
