//! Per-channel video encoding.
//!
//! `ChannelEncoder` drives the push-frame / pull-packet / flush protocol and
//! tracks encoder latency. The codec itself sits behind `FrameEncoder`;
//! `FfmpegEncoder` is the production implementation (libx265 through FFmpeg,
//! muxed as MP4).

pub mod ffmpeg;
pub mod session;

pub use self::ffmpeg::FfmpegEncoder;
pub use self::session::{ChannelEncoder, SessionState};

use serde::{Deserialize, Serialize};

use crate::config::{EncoderTuning, MAX_CRF, SaveOptions};
use crate::error::EncodeError;
use crate::geometry::PaddedGeometry;
use crate::pack::PackedFrame;
use crate::stack::BitDepth;

/// Movie crf when none is configured.
pub const MOVIE_CRF: u8 = 7;

/// Codec configuration for one channel session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Padded frame width.
    pub width: u32,
    /// Padded frame height.
    pub height: u32,
    pub bit_depth: BitDepth,
    /// FFmpeg encoder name, e.g. "libx265".
    pub codec: String,
    /// HEVC preset.
    pub preset: String,
    pub tuning: EncoderTuning,
}

impl EncoderConfig {
    /// Config for `channel` of a stack with the given geometry.
    pub fn for_channel(
        geometry: &PaddedGeometry,
        bit_depth: BitDepth,
        options: &SaveOptions,
        channel: usize,
    ) -> Self {
        Self {
            width: geometry.scaled_width as u32,
            height: geometry.scaled_height as u32,
            bit_depth,
            codec: options.codec.clone(),
            preset: options.preset.clone(),
            tuning: options.tuning_for(channel, bit_depth),
        }
    }

    /// Target bit rate: 4 bits per padded pixel per frame.
    /// Settings for a movie of the whole stack at its source size. Only the
    /// first crf entry applies; it falls back to `MOVIE_CRF`.
    pub fn for_movie(geometry: &PaddedGeometry, bit_depth: BitDepth, options: &SaveOptions) -> Self {
        let mut tuning = options.tuning_for(0, bit_depth);
        tuning.crf = match options.crf.first() {
            Some(&crf) if (0..=MAX_CRF).contains(&crf) => crf as u8,
            _ => MOVIE_CRF,
        };
        Self {
            width: geometry.scaled_width as u32,
            height: geometry.scaled_height as u32,
            bit_depth,
            codec: options.codec.clone(),
            preset: options.preset.clone(),
            tuning,
        }
    }

    pub fn bit_rate(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// GOP length (keyframe interval).
pub const GOP_SIZE: u32 = 12;
/// Nominal frame rate; frames are slices, so this only fixes the time base.
pub const FRAME_RATE: i32 = 25;

/// Streaming codec boundary.
///
/// Calls for one instance are strictly sequential.
pub trait FrameEncoder {
    /// Queue one frame. `pts` is its submission index.
    fn send_frame(&mut self, frame: &PackedFrame, pts: i64) -> Result<(), EncodeError>;

    /// Signal end of stream. Calls after the first are no-ops.
    fn send_eof(&mut self) -> Result<(), EncodeError>;

    /// Pull at most one packet into the output stream and return its payload
    /// size. `Ok(None)` means the codec has nothing ready (look-ahead or
    /// fully drained), which is not an error.
    fn receive_packet(&mut self) -> Result<Option<usize>, EncodeError>;

    /// Finalize the stream (trailer) and return the complete output bytes.
    fn finish(&mut self) -> Result<Vec<u8>, EncodeError>;
}

/// Final encoded stream of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedChannel {
    pub channel: usize,
    pub data: Vec<u8>,
}

impl EncodedChannel {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encode `frames` (ascending z) into one channel stream.
pub fn encode_frames<E: FrameEncoder>(
    backend: E,
    channel: usize,
    frames: impl IntoIterator<Item = PackedFrame>,
) -> Result<(EncodedChannel, usize), EncodeError> {
    let mut session = ChannelEncoder::with_backend(backend);
    for frame in frames {
        session.submit(&frame)?;
    }
    session.finish()?;
    session.close()?;
    let encoded_frames = session.encoded_frames();
    Ok((session.into_encoded(channel)?, encoded_frames))
}
