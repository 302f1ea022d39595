//! Temporary on-disk capture of a child's output streams.
//!
//! Each stream gets its own unbounded temp file. Only the tail of a file is
//! ever read back, when a diagnostic message has to be built.

use std::io::{Read, Seek, SeekFrom, Write};
use std::process::Stdio;
use tempfile::NamedTempFile;

/// Which child stream a sink captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Label used in diagnostic messages ("Stdout", "Stderr").
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Stdout => "Stdout",
            StreamKind::Stderr => "Stderr",
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            StreamKind::Stdout => "pushwrap-stdout-",
            StreamKind::Stderr => "pushwrap-stderr-",
        }
    }
}

/// The decoded end of a captured stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TailWindow {
    /// Last bytes of the stream, decoded as UTF-8 with invalid sequences dropped.
    pub text: String,
    /// Total number of bytes the stream produced.
    pub total_size: u64,
}

impl TailWindow {
    #[cfg(test)]
    pub fn new(text: impl Into<String>, total_size: u64) -> Self {
        Self {
            text: text.into(),
            total_size,
        }
    }
}

/// Append-only capture file for one child stream.
///
/// The backing file is deleted when the sink is dropped, whichever way the
/// owning scope is left.
#[derive(Debug)]
pub struct StreamSink {
    kind: StreamKind,
    file: NamedTempFile,
}

impl StreamSink {
    /// Create an empty sink backed by a fresh temp file.
    pub fn create(kind: StreamKind) -> std::io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(kind.file_prefix())
            .tempfile()?;
        tracing::debug!(
            stream = kind.label(),
            path = %file.path().display(),
            "created stream sink"
        );
        Ok(Self { kind, file })
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }

    /// A handle the child can write into.
    ///
    /// The handle shares the sink's open file description, so everything the
    /// child writes lands in order at the end of the file.
    pub fn stdio(&self) -> std::io::Result<Stdio> {
        Ok(Stdio::from(self.file.as_file().try_clone()?))
    }
}

/// Anything whose captured output can be read back as a tail window.
pub trait TailSource {
    /// Read the last `suffix_size` bytes of the stream.
    fn tail_window(&mut self, suffix_size: u64) -> std::io::Result<TailWindow>;
}

impl TailSource for StreamSink {
    fn tail_window(&mut self, suffix_size: u64) -> std::io::Result<TailWindow> {
        let file = self.file.as_file_mut();
        file.flush()?;
        let total_size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(total_size.saturating_sub(suffix_size)))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        tracing::trace!(
            stream = self.kind.label(),
            total_size,
            window_bytes = bytes.len(),
            "read tail window"
        );

        Ok(TailWindow {
            text: decode_ignoring_invalid(&bytes),
            total_size,
        })
    }
}

/// Decode UTF-8, dropping invalid sequences instead of replacing them.
///
/// A window cut in the middle of a multi-byte character therefore starts at
/// the next complete character.
pub fn decode_ignoring_invalid(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}
