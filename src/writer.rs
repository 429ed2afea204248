//! Save orchestration: stack → packed frames → HEVC streams → H5J file.

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::path::Path;
use std::time::Instant;

use crate::config::SaveOptions;
use crate::container::{ContainerMetadata, ContainerWriter};
use crate::encode::{ChannelEncoder, EncoderConfig, FfmpegEncoder, FrameEncoder};
use crate::error::{EncodeError, SaveError};
use crate::geometry::PaddedGeometry;
use crate::pack::LaneSelector;
use crate::stack::ImageStack;
use crate::workers::SliceScheduler;

/// Pipeline stage a progress message refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveStage {
    Packing,
    Encoding,
    Stored,
}

/// Progress update sent while a save runs.
#[derive(Clone, Debug, PartialEq)]
pub struct SaveProgress {
    pub channel: usize,
    pub total_channels: usize,
    /// Completed fraction of the whole save, in [0, 1].
    pub fraction: f64,
    pub stage: SaveStage,
}

/// Encode `stack` into an H5J file at `path`.
///
/// An invalid stack is rejected before `path` is touched, so an existing file
/// survives it. Otherwise any existing file is replaced, and on failure the
/// partial file is removed.
pub fn save_stack<S: ImageStack + ?Sized>(
    stack: &S,
    path: &Path,
    options: &SaveOptions,
    progress: Option<&Sender<SaveProgress>>,
) -> Result<(), SaveError> {
    save_stack_with(stack, path, options, progress, FfmpegEncoder::open)
}

/// Same as `save_stack` with a caller-supplied codec factory, called once per
/// channel.
pub fn save_stack_with<S, E, F>(
    stack: &S,
    path: &Path,
    options: &SaveOptions,
    progress: Option<&Sender<SaveProgress>>,
    open_encoder: F,
) -> Result<(), SaveError>
where
    S: ImageStack + ?Sized,
    E: FrameEncoder,
    F: FnMut(&EncoderConfig) -> Result<E, EncodeError>,
{
    validate(stack)?;

    let started = Instant::now();
    let result = write_stack(stack, path, options, progress, open_encoder);

    match &result {
        Ok(()) => info!(
            "Saved {} in {:.2}s",
            path.display(),
            started.elapsed().as_secs_f64()
        ),
        Err(_) => {
            if path.exists()
                && let Err(e) = std::fs::remove_file(path)
            {
                warn!("Failed to remove partial file {}: {}", path.display(), e);
            }
        }
    }
    result
}

/// Boolean wrapper for hosts that only need success/failure; the error is
/// logged.
pub fn save<S: ImageStack + ?Sized>(
    stack: &S,
    path: &Path,
    options: &SaveOptions,
    progress: Option<&Sender<SaveProgress>>,
) -> bool {
    match save_stack(stack, path, options, progress) {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to save {}: {}", path.display(), e);
            false
        }
    }
}

/// Encode channels 0..2 as the RGB lanes of one movie at `path`.
///
/// The muxer is chosen from the file extension and frames keep the source
/// size. Stacks with fewer channels repeat channel 0 on the missing lanes;
/// 16-bit stacks encode channel 0 as gray.
pub fn save_movie<S: ImageStack + ?Sized>(
    stack: &S,
    path: &Path,
    options: &SaveOptions,
) -> Result<(), SaveError> {
    save_movie_with(stack, path, options, FfmpegEncoder::create_file)
}

/// Same as `save_movie` with a caller-supplied codec factory.
pub fn save_movie_with<S, E, F>(
    stack: &S,
    path: &Path,
    options: &SaveOptions,
    open_encoder: F,
) -> Result<(), SaveError>
where
    S: ImageStack + ?Sized,
    E: FrameEncoder,
    F: FnOnce(&EncoderConfig, &Path) -> Result<E, EncodeError>,
{
    validate(stack)?;

    let result = write_movie(stack, path, options, open_encoder);
    if result.is_err()
        && path.exists()
        && let Err(e) = std::fs::remove_file(path)
    {
        warn!("Failed to remove partial movie {}: {}", path.display(), e);
    }
    result
}

fn write_movie<S, E, F>(
    stack: &S,
    path: &Path,
    options: &SaveOptions,
    open_encoder: F,
) -> Result<(), SaveError>
where
    S: ImageStack + ?Sized,
    E: FrameEncoder,
    F: FnOnce(&EncoderConfig, &Path) -> Result<E, EncodeError>,
{
    let geometry = PaddedGeometry::unpadded(stack.width(), stack.height());
    let bit_depth = stack.bit_depth();
    let scheduler = SliceScheduler::new(options.worker_count());
    info!(
        "Saving {}x{}x{} movie ({} channels, {}-bit) to {}",
        stack.width(),
        stack.height(),
        stack.slices(),
        stack.channels(),
        bit_depth,
        path.display()
    );

    let frames = scheduler
        .pack_frames(stack, LaneSelector::direct(), &geometry, &options.intensity)
        .map_err(|source| SaveError::Pack { channel: 0, source })?;

    let config = EncoderConfig::for_movie(&geometry, bit_depth, options);
    let encode_err = |source| SaveError::Encode { channel: 0, source };
    let mut session = ChannelEncoder::with_backend(open_encoder(&config, path).map_err(encode_err)?);
    for frame in &frames {
        session.submit(frame).map_err(encode_err)?;
    }
    session.finish().map_err(encode_err)?;
    session.close().map_err(encode_err)?;

    info!(
        "Saved movie {} ({} frames)",
        path.display(),
        session.encoded_frames()
    );
    Ok(())
}

fn validate<S: ImageStack + ?Sized>(stack: &S) -> Result<(), SaveError> {
    if stack.width() == 0 || stack.height() == 0 {
        return Err(SaveError::InvalidStack(format!(
            "empty plane {}x{}",
            stack.width(),
            stack.height()
        )));
    }
    if stack.channels() == 0 {
        return Err(SaveError::InvalidStack("no channels".to_string()));
    }
    if stack.slices() == 0 {
        return Err(SaveError::InvalidStack("no slices".to_string()));
    }
    Ok(())
}

fn write_stack<S, E, F>(
    stack: &S,
    path: &Path,
    options: &SaveOptions,
    progress: Option<&Sender<SaveProgress>>,
    mut open_encoder: F,
) -> Result<(), SaveError>
where
    S: ImageStack + ?Sized,
    E: FrameEncoder,
    F: FnMut(&EncoderConfig) -> Result<E, EncodeError>,
{
    let geometry = PaddedGeometry::new(stack.width(), stack.height());
    let channels = stack.channels();
    let bit_depth = stack.bit_depth();
    let scheduler = SliceScheduler::new(options.worker_count());

    info!(
        "Saving {}x{}x{} ({} channels, {}-bit) to {}",
        stack.width(),
        stack.height(),
        stack.slices(),
        channels,
        bit_depth,
        path.display()
    );
    debug!(
        "Padded to {}x{}, {} packing workers",
        geometry.scaled_width,
        geometry.scaled_height,
        scheduler.threads()
    );

    let metadata = ContainerMetadata::new(
        &geometry,
        stack.slices(),
        channels,
        stack.voxel_size(),
        stack.unit(),
    );
    let mut container = ContainerWriter::create(path, &metadata)?;

    let report = |channel: usize, fraction: f64, stage: SaveStage| {
        if let Some(tx) = progress {
            // receiver may be gone, the save itself still completes
            let _ = tx.send(SaveProgress {
                channel,
                total_channels: channels,
                fraction,
                stage,
            });
        }
    };

    for channel in 0..channels {
        let base = channel as f64 / channels as f64;
        report(channel, base, SaveStage::Packing);

        let frames = scheduler
            .pack_channel(stack, channel, &geometry, &options.intensity)
            .map_err(|source| SaveError::Pack { channel, source })?;

        report(channel, base, SaveStage::Encoding);
        let config = EncoderConfig::for_channel(&geometry, bit_depth, options, channel);
        let encode_err = |source| SaveError::Encode { channel, source };

        let mut session = ChannelEncoder::with_backend(open_encoder(&config).map_err(encode_err)?);
        for frame in &frames {
            session.submit(frame).map_err(encode_err)?;
        }
        drop(frames);
        session.finish().map_err(encode_err)?;
        if session.encoded_frames() < session.frames_submitted() {
            warn!(
                "Channel {}: {} of {} frames emitted after flush",
                channel,
                session.encoded_frames(),
                session.frames_submitted()
            );
        }
        session.close().map_err(encode_err)?;
        let encoded = session.into_encoded(channel).map_err(encode_err)?;

        container.write_channel(encoded)?;

        let fraction = (channel + 1) as f64 / channels as f64;
        info!("Progress: {:.3}", fraction);
        report(channel, fraction, SaveStage::Stored);
    }

    container.finish()?;
    Ok(())
}
