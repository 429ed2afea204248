//! Error taxonomy for the H5J save pipeline.
//!
//! Every fatal failure unwinds to `writer::save_stack`, which removes the
//! partial output file. Out-of-range tuning values are not errors: they are
//! logged and replaced by defaults in `config`.

use std::path::PathBuf;
use thiserror::Error;

/// Packing a slice into an encoder raster failed.
///
/// Only happens on precondition violations (wrong plane size or sample type).
#[derive(Debug, Error)]
pub enum FramePackError {
    #[error("slice {slice}: plane has {found} samples, expected {expected} ({width}x{height})")]
    PlaneSize {
        slice: usize,
        expected: usize,
        found: usize,
        width: usize,
        height: usize,
    },
    #[error("slice {slice}: {found}-bit samples supplied for a {expected}-bit stack")]
    SampleType {
        slice: usize,
        expected: u8,
        found: u8,
    },
    #[error("packing worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("slice {0} was never packed")]
    MissingSlice(usize),
    #[error("failed to spawn packing worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Encoder session failures.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Codec/container negotiation failed.
    #[error("failed to open encoder '{codec}': {reason}")]
    EncoderOpen { codec: String, reason: String },
    /// Codec rejected a frame.
    #[error("encoder rejected frame {frame}: {reason}")]
    EncodeSubmit { frame: i64, reason: String },
    /// Codec failed while emitting packets or finalizing the stream.
    #[error("encoder drain failed: {0}")]
    EncodeDrain(String),
    #[error("encoder session is already closed")]
    SessionClosed,
}

impl EncodeError {
    pub(crate) fn open(codec: &str, reason: impl Into<String>) -> Self {
        EncodeError::EncoderOpen {
            codec: codec.to_string(),
            reason: reason.into(),
        }
    }
}

/// Structured-storage write failure.
#[derive(Debug, Error)]
pub enum ContainerWriteError {
    #[error("hdf5: {0}")]
    Hdf5(#[from] hdf5::Error),
    #[error("failed to replace existing file {path}: {source}")]
    Replace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("channel {found} written out of order (expected channel {expected})")]
    ChannelOrder { expected: usize, found: usize },
    #[error("container closed with {written} of {expected} channels")]
    MissingChannels { expected: usize, written: usize },
    #[error("invalid attribute value for '{name}': {reason}")]
    Attribute { name: &'static str, reason: String },
}

/// Top-level save failure.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("invalid image stack: {0}")]
    InvalidStack(String),
    #[error("channel {channel}: {source}")]
    Pack {
        channel: usize,
        source: FramePackError,
    },
    #[error("channel {channel}: {source}")]
    Encode {
        channel: usize,
        source: EncodeError,
    },
    #[error(transparent)]
    Container(#[from] ContainerWriteError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SaveError> = std::result::Result<T, E>;
