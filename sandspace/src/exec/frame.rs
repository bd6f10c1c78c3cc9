//! Multiplexed exec output.
//!
//! Without a TTY the engine interleaves stdout and stderr on one connection
//! as tagged frames. The engine client splits the connection into [`Frame`]s
//! (stream tag plus payload); [`Demuxed`] folds them back into one buffer per
//! stream.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            payload: payload.into(),
        }
    }

    pub fn stderr(payload: impl Into<Bytes>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            payload: payload.into(),
        }
    }
}

/// Separate stdout and stderr buffers built from a sequence of frames.
///
/// Bytes of one stream never appear in the other, whatever the interleaving.
/// Stdin echo frames are dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demuxed {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Demuxed {
    pub fn push(&mut self, frame: &Frame) {
        match frame.stream {
            StreamKind::Stdout => self.stdout.extend_from_slice(&frame.payload),
            StreamKind::Stderr => self.stderr.extend_from_slice(&frame.payload),
            StreamKind::Stdin => {}
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
