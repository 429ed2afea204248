//! FFmpeg-backed `FrameEncoder`.
//!
//! Packs frames through swscale into the codec's pixel format, encodes with
//! the configured encoder (libx265 by default) and muxes into MP4 (MOV for
//! FFV1). FFmpeg's safe API can only mux to a path, so the muxer writes a
//! temporary file that is read back on `finish` and removed on drop.
//! `create_file` muxes straight to a caller path instead, with the container
//! guessed from its extension.

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use playa_ffmpeg as ffmpeg;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

use super::{EncoderConfig, FRAME_RATE, FrameEncoder, GOP_SIZE};
use crate::error::EncodeError;
use crate::pack::{PackedData, PackedFrame};
use crate::stack::BitDepth;

static INIT: OnceCell<Result<(), String>> = OnceCell::new();

/// Initialize FFmpeg once per process and silence its logging.
pub fn init() -> Result<(), EncodeError> {
    INIT.get_or_init(|| {
        ffmpeg::init().map_err(|e| e.to_string())?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Quiet);
        Ok(())
    })
    .clone()
    .map_err(|e| EncodeError::open("ffmpeg", format!("initialization failed: {}", e)))
}

/// True when FFmpeg knows an encoder with this name.
pub fn encoder_available(name: &str) -> bool {
    init().is_ok() && ffmpeg::encoder::find_by_name(name).is_some()
}

/// (codec pixel format, raw raster format) for a bit depth.
fn pixel_formats(bit_depth: BitDepth) -> (ffmpeg::format::Pixel, ffmpeg::format::Pixel) {
    match bit_depth {
        BitDepth::Eight => (ffmpeg::format::Pixel::YUV444P, ffmpeg::format::Pixel::RGB24),
        BitDepth::Sixteen => (ffmpeg::format::Pixel::GRAY12LE, ffmpeg::format::Pixel::GRAY16LE),
    }
}

/// Where the muxer writes.
enum Sink {
    /// Temporary file, read back into memory by `finish`.
    Buffer(TempPath),
    /// Caller-owned file; `finish` leaves the stream on disk.
    File(PathBuf),
}

/// One open FFmpeg encoder + muxer pair.
///
/// Field order is drop order: codec, muxer, then the temporary file.
pub struct FfmpegEncoder {
    encoder: ffmpeg::encoder::video::Encoder,
    octx: ffmpeg::format::context::Output,
    scaler: SwsContext,
    stream_index: usize,
    encoder_tb: ffmpeg::Rational,
    stream_tb: ffmpeg::Rational,
    delayed: bool,
    flushed: bool,
    finished: bool,
    packets: i64,
    sink: Sink,
}

impl FfmpegEncoder {
    /// Encoder muxing into memory (via a temporary file).
    pub fn open(config: &EncoderConfig) -> Result<Self, EncodeError> {
        init()?;
        let name = config.codec.as_str();
        let codec = find_codec(name)?;

        // Deduce the muxer: MOV for FFV1, MP4 otherwise, MPEG as last resort
        let preferred = if codec.id() == ffmpeg::codec::Id::FFV1 { "mov" } else { "mp4" };
        let (octx, out_path) = open_muxer(name, preferred)
            .or_else(|_| open_muxer(name, "mpeg"))
            .map_err(|e| EncodeError::open(name, format!("unable to deduce video format: {}", e)))?;

        Self::with_muxer(config, codec, octx, Sink::Buffer(out_path))
    }

    /// Encoder muxing to `path`; the container format comes from its extension.
    pub fn create_file(config: &EncoderConfig, path: &Path) -> Result<Self, EncodeError> {
        init()?;
        let name = config.codec.as_str();
        let codec = find_codec(name)?;

        let octx = ffmpeg::format::output(path).map_err(|e| {
            EncodeError::open(
                name,
                format!("unable to deduce video format from {}: {}", path.display(), e),
            )
        })?;

        Self::with_muxer(config, codec, octx, Sink::File(path.to_path_buf()))
    }

    fn with_muxer(
        config: &EncoderConfig,
        codec: ffmpeg::codec::Codec,
        mut octx: ffmpeg::format::context::Output,
        sink: Sink,
    ) -> Result<Self, EncodeError> {
        let name = config.codec.as_str();
        let delayed = codec
            .capabilities()
            .contains(ffmpeg::codec::Capabilities::DELAY);

        if config.width % 2 != 0 || config.height % 2 != 0 {
            warn!(
                "Video size {}x{} is not a multiple of 2",
                config.width,
                config.height
            );
        }

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| EncodeError::open(name, format!("failed to create context: {}", e)))?;

        let (pixel_format, raw_format) = pixel_formats(config.bit_depth);
        let time_base = ffmpeg::Rational::new(1, FRAME_RATE);
        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(pixel_format);
        encoder.set_bit_rate(config.bit_rate());
        encoder.set_gop(GOP_SIZE);
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(ffmpeg::Rational::new(FRAME_RATE, 1)));
        encoder.compliance(ffmpeg::codec::Compliance::Experimental);
        if octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER)
        {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = ffmpeg::Dictionary::new();
        if codec.id() == ffmpeg::codec::Id::HEVC {
            let params = config.tuning.to_x265_params();
            opts.set("preset", &config.preset);
            opts.set("x265-params", &params);
            debug!("HEVC options: preset={} x265-params={}", config.preset, params);
        }

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| EncodeError::open(name, format!("failed to open codec: {}", e)))?;

        let stream_index = {
            let mut ost = octx
                .add_stream(codec)
                .map_err(|e| EncodeError::open(name, format!("failed to add stream: {}", e)))?;
            ost.set_parameters(&encoder);
            ost.set_time_base(time_base);
            ost.index()
        };

        octx.write_header()
            .map_err(|e| EncodeError::open(name, format!("failed to write header: {}", e)))?;

        // The muxer may adjust the stream time base in write_header
        let stream_tb = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| EncodeError::open(name, "stream missing after header"))?;
        let encoder_tb = encoder.time_base();

        let scaler = SwsContext::new(raw_format, pixel_format, config.width, config.height)
            .map_err(|e| EncodeError::open(name, e))?;

        info!(
            "Encoder '{}' opened: {}x{} {:?} -> {:?}, {} bps, time_base: encoder={:?} stream={:?}",
            name,
            config.width,
            config.height,
            raw_format,
            pixel_format,
            config.bit_rate(),
            encoder_tb,
            stream_tb
        );

        Ok(Self {
            encoder,
            octx,
            scaler,
            stream_index,
            encoder_tb,
            stream_tb,
            delayed,
            flushed: false,
            finished: false,
            packets: 0,
            sink,
        })
    }
}

fn find_codec(name: &str) -> Result<ffmpeg::codec::Codec, EncodeError> {
    ffmpeg::encoder::find_by_name(name).ok_or_else(|| EncodeError::open(name, "encoder not found"))
}

fn open_muxer(
    codec: &str,
    format: &str,
) -> Result<(ffmpeg::format::context::Output, TempPath), String> {
    let out_path = tempfile::Builder::new()
        .prefix(&format!("h5j-{}-", codec))
        .suffix(&format!(".{}", format))
        .tempfile()
        .map_err(|e| format!("temporary output: {}", e))?
        .into_temp_path();
    let path = out_path.to_path_buf();
    let octx = ffmpeg::format::output_as(&path, format).map_err(|e| format!("{}: {}", format, e))?;
    Ok((octx, out_path))
}

impl FrameEncoder for FfmpegEncoder {
    fn send_frame(&mut self, frame: &PackedFrame, pts: i64) -> Result<(), EncodeError> {
        let mut yuv = self
            .scaler
            .convert(frame)
            .map_err(|reason| EncodeError::EncodeSubmit { frame: pts, reason })?;
        yuv.set_pts(Some(pts));
        self.encoder
            .send_frame(&yuv)
            .map_err(|e| EncodeError::EncodeSubmit {
                frame: pts,
                reason: e.to_string(),
            })
    }

    fn send_eof(&mut self) -> Result<(), EncodeError> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        match self.encoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(EncodeError::EncodeDrain(format!("failed to flush encoder: {}", e))),
        }
    }

    fn receive_packet(&mut self) -> Result<Option<usize>, EncodeError> {
        let mut packet = ffmpeg::Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                return Ok(None);
            }
            Err(e) => return Err(EncodeError::EncodeDrain(format!("receive_packet: {}", e))),
        }

        let size = packet.size();
        if packet.pts().is_none() && !self.delayed {
            packet.set_pts(Some(self.packets));
        }
        packet.set_stream(self.stream_index);
        packet.set_duration(1);
        packet.rescale_ts(self.encoder_tb, self.stream_tb);
        if packet.dts().is_none()
            && let Some(pts) = packet.pts()
        {
            packet.set_dts(Some(pts));
        }
        packet
            .write_interleaved(&mut self.octx)
            .map_err(|e| EncodeError::EncodeDrain(format!("failed to write packet: {}", e)))?;
        self.packets += 1;
        Ok(Some(size))
    }

    fn finish(&mut self) -> Result<Vec<u8>, EncodeError> {
        if self.finished {
            return Err(EncodeError::SessionClosed);
        }
        self.finished = true;
        self.octx
            .write_trailer()
            .map_err(|e| EncodeError::EncodeDrain(format!("failed to write trailer: {}", e)))?;
        match &self.sink {
            Sink::Buffer(out_path) => {
                let bytes = std::fs::read(out_path).map_err(|e| {
                    EncodeError::EncodeDrain(format!("failed to read muxed stream: {}", e))
                })?;
                debug!("Muxed {} packets into {} bytes", self.packets, bytes.len());
                Ok(bytes)
            }
            Sink::File(path) => {
                debug!("Muxed {} packets into {}", self.packets, path.display());
                Ok(Vec::new())
            }
        }
    }
}

/// Reusable swscale context from a packed raster layout to the codec format.
pub struct SwsContext {
    ctx: ffmpeg::software::scaling::Context,
    src_format: ffmpeg::format::Pixel,
    dst_format: ffmpeg::format::Pixel,
    width: u32,
    height: u32,
}

impl SwsContext {
    pub fn new(
        src_format: ffmpeg::format::Pixel,
        dst_format: ffmpeg::format::Pixel,
        width: u32,
        height: u32,
    ) -> Result<Self, String> {
        let ctx = ffmpeg::software::scaling::Context::get(
            src_format,
            width,
            height,
            dst_format,
            width,
            height,
            ffmpeg::software::scaling::Flags::BICUBIC,
        )
        .map_err(|e| format!("Failed to create swscale context: {}", e))?;

        Ok(Self {
            ctx,
            src_format,
            dst_format,
            width,
            height,
        })
    }

    /// Copy `frame` into a source frame (honouring stride) and convert it.
    pub fn convert(
        &mut self,
        frame: &PackedFrame,
    ) -> Result<ffmpeg::util::frame::video::Video, String> {
        if frame.width != self.width as usize || frame.height != self.height as usize {
            return Err(format!(
                "Frame size {}x{} does not match encoder size {}x{}",
                frame.width, frame.height, self.width, self.height
            ));
        }

        let mut src_frame =
            ffmpeg::util::frame::video::Video::new(self.src_format, self.width, self.height);
        let stride = src_frame.stride(0);
        let width = frame.width;

        match (&frame.data, self.src_format) {
            (PackedData::Rgb24(data), ffmpeg::format::Pixel::RGB24) => {
                let row_bytes = width * 3;
                let dst = src_frame.data_mut(0);
                for (y, row) in data.chunks_exact(row_bytes).enumerate() {
                    dst[y * stride..y * stride + row_bytes].copy_from_slice(row);
                }
            }
            (PackedData::Gray16(data), ffmpeg::format::Pixel::GRAY16LE) => {
                let dst = src_frame.data_mut(0);
                for (y, row) in data.chunks_exact(width).enumerate() {
                    let line = &mut dst[y * stride..y * stride + width * 2];
                    for (out, value) in line.chunks_exact_mut(2).zip(row) {
                        out.copy_from_slice(&value.to_le_bytes());
                    }
                }
            }
            (_, format) => {
                return Err(format!(
                    "{}-lane frame does not match raw format {:?}",
                    frame.lanes(),
                    format
                ));
            }
        }

        let mut dst_frame =
            ffmpeg::util::frame::video::Video::new(self.dst_format, self.width, self.height);
        self.ctx
            .run(&src_frame, &mut dst_frame)
            .map_err(|e| format!("swscale conversion failed: {}", e))?;
        Ok(dst_frame)
    }
}
