//! Source image stacks.
//!
//! `ImageStack` is the host boundary: anything that can hand out borrowed
//! (channel, slice) planes can be saved. `VolumeStack` is the owned
//! implementation used by the CLI and tests, and can be built from per-channel
//! slice files (one 2-D image per z-slice).

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SaveError};

/// Sample depth class of a stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    pub fn bits(self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }
}

impl std::fmt::Display for BitDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Physical voxel spacing.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoxelSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for VoxelSize {
    fn default() -> Self {
        Self { x: 1.0, y: 1.0, z: 1.0 }
    }
}

/// One borrowed 2-D sample plane, row-major, `width * height` samples.
#[derive(Clone, Copy, Debug)]
pub enum Plane<'a> {
    U8(&'a [u8]),
    U16(&'a [u16]),
}

impl Plane<'_> {
    pub fn len(&self) -> usize {
        match self {
            Plane::U8(s) => s.len(),
            Plane::U16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only multi-channel volume supplied by the host.
///
/// Must be `Sync`: slices of one channel are packed from several threads.
pub trait ImageStack: Sync {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn channels(&self) -> usize;
    fn slices(&self) -> usize;
    fn bit_depth(&self) -> BitDepth;
    fn voxel_size(&self) -> VoxelSize;
    fn unit(&self) -> &str;
    /// Plane for `(channel, slice)`. Both indices are in range.
    fn plane(&self, channel: usize, slice: usize) -> Plane<'_>;
}

/// Owned sample storage for one channel (all slices).
#[derive(Clone, Debug)]
pub enum ChannelData {
    U8(Vec<Vec<u8>>),
    U16(Vec<Vec<u16>>),
}

impl ChannelData {
    fn slices(&self) -> usize {
        match self {
            ChannelData::U8(v) => v.len(),
            ChannelData::U16(v) => v.len(),
        }
    }
}

/// In-memory `ImageStack`.
#[derive(Clone, Debug)]
pub struct VolumeStack {
    width: usize,
    height: usize,
    bit_depth: BitDepth,
    voxel_size: VoxelSize,
    unit: String,
    channels: Vec<ChannelData>,
}

impl VolumeStack {
    /// Build a stack from owned channel data, checking that all planes agree.
    pub fn new(
        width: usize,
        height: usize,
        channels: Vec<ChannelData>,
        voxel_size: VoxelSize,
        unit: impl Into<String>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(SaveError::InvalidStack(format!(
                "empty slice dimensions {}x{}",
                width, height
            )));
        }
        let first = channels
            .first()
            .ok_or_else(|| SaveError::InvalidStack("stack has no channels".into()))?;
        let bit_depth = match first {
            ChannelData::U8(_) => BitDepth::Eight,
            ChannelData::U16(_) => BitDepth::Sixteen,
        };
        let depth = first.slices();
        if depth == 0 {
            return Err(SaveError::InvalidStack("stack has no slices".into()));
        }

        for (c, data) in channels.iter().enumerate() {
            if data.slices() != depth {
                return Err(SaveError::InvalidStack(format!(
                    "channel {} has {} slices, channel 0 has {}",
                    c,
                    data.slices(),
                    depth
                )));
            }
            let sizes: Vec<usize> = match (data, bit_depth) {
                (ChannelData::U8(v), BitDepth::Eight) => v.iter().map(Vec::len).collect(),
                (ChannelData::U16(v), BitDepth::Sixteen) => v.iter().map(Vec::len).collect(),
                _ => {
                    return Err(SaveError::InvalidStack(format!(
                        "channel {} sample type differs from channel 0",
                        c
                    )));
                }
            };
            if let Some(z) = sizes.iter().position(|&len| len != width * height) {
                return Err(SaveError::InvalidStack(format!(
                    "channel {} slice {} has {} samples, expected {}",
                    c,
                    z,
                    sizes[z],
                    width * height
                )));
            }
        }

        Ok(Self {
            width,
            height,
            bit_depth,
            voxel_size,
            unit: unit.into(),
            channels,
        })
    }

    /// Load one channel per glob pattern; each pattern's matches, sorted by
    /// path, become that channel's slices in z order.
    ///
    /// Any 16-bit slice promotes the whole stack to 16-bit.
    pub fn from_slice_globs(
        patterns: &[String],
        voxel_size: VoxelSize,
        unit: &str,
    ) -> Result<Self> {
        let mut files = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let mut paths: Vec<PathBuf> = glob::glob(pattern)
                .map_err(|e| SaveError::InvalidStack(format!("bad pattern '{}': {}", pattern, e)))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                .collect();
            paths.sort();
            if paths.is_empty() {
                return Err(SaveError::InvalidStack(format!(
                    "pattern '{}' matched no files",
                    pattern
                )));
            }
            debug!("Pattern '{}': {} slices", pattern, paths.len());
            files.push(paths);
        }
        Self::from_slice_files(&files, voxel_size, unit)
    }

    /// Load channels from explicit per-channel slice file lists.
    pub fn from_slice_files(
        files: &[Vec<PathBuf>],
        voxel_size: VoxelSize,
        unit: &str,
    ) -> Result<Self> {
        let mut decoded = Vec::with_capacity(files.len());
        let mut wide = false;
        let mut dims: Option<(usize, usize)> = None;

        for (c, paths) in files.iter().enumerate() {
            let mut slices = Vec::with_capacity(paths.len());
            for path in paths {
                let img = load_slice(path)?;
                let size = (img.width() as usize, img.height() as usize);
                match dims {
                    None => dims = Some(size),
                    Some(expected) if expected != size => {
                        return Err(SaveError::InvalidStack(format!(
                            "{}: {}x{} differs from {}x{}",
                            path.display(),
                            size.0,
                            size.1,
                            expected.0,
                            expected.1
                        )));
                    }
                    Some(_) => {}
                }
                wide |= is_wide(&img);
                slices.push(img);
            }
            debug!("Channel {}: decoded {} slices", c, slices.len());
            decoded.push(slices);
        }

        let (width, height) =
            dims.ok_or_else(|| SaveError::InvalidStack("no slice files given".into()))?;

        let channels = decoded
            .into_iter()
            .map(|slices| {
                if wide {
                    ChannelData::U16(slices.into_iter().map(widen_slice).collect())
                } else {
                    ChannelData::U8(
                        slices
                            .into_iter()
                            .map(|img| img.into_luma8().into_raw())
                            .collect(),
                    )
                }
            })
            .collect();

        let stack = Self::new(width, height, channels, voxel_size, unit)?;
        info!(
            "Loaded stack: {}x{}x{}, {} channel(s), {}",
            stack.width,
            stack.height,
            stack.slices(),
            stack.channels(),
            stack.bit_depth
        );
        Ok(stack)
    }
}

fn load_slice(path: &Path) -> Result<image::DynamicImage> {
    image::open(path)
        .map_err(|e| SaveError::InvalidStack(format!("{}: {}", path.display(), e)))
}

/// Samples of one slice in a 16-bit stack. 8-bit slices keep their values;
/// `into_luma16` would scale them by 257.
fn widen_slice(img: image::DynamicImage) -> Vec<u16> {
    if is_wide(&img) {
        img.into_luma16().into_raw()
    } else {
        img.into_luma8().into_raw().into_iter().map(u16::from).collect()
    }
}

fn is_wide(img: &image::DynamicImage) -> bool {
    matches!(
        img.color(),
        image::ColorType::L16
            | image::ColorType::La16
            | image::ColorType::Rgb16
            | image::ColorType::Rgba16
    )
}

impl ImageStack for VolumeStack {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn channels(&self) -> usize {
        self.channels.len()
    }

    fn slices(&self) -> usize {
        self.channels.first().map_or(0, ChannelData::slices)
    }

    fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    fn voxel_size(&self) -> VoxelSize {
        self.voxel_size
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn plane(&self, channel: usize, slice: usize) -> Plane<'_> {
        match &self.channels[channel] {
            ChannelData::U8(v) => Plane::U8(&v[slice]),
            ChannelData::U16(v) => Plane::U16(&v[slice]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_u8(w: usize, h: usize, z: usize) -> Vec<u8> {
        (0..w * h).map(|i| ((i + z) % 251) as u8).collect()
    }

    #[test]
    fn test_new_stack_dimensions() {
        let data = ChannelData::U8((0..3).map(|z| gradient_u8(10, 10, z)).collect());
        let stack =
            VolumeStack::new(10, 10, vec![data.clone(), data], VoxelSize::default(), "um").unwrap();

        assert_eq!(stack.channels(), 2);
        assert_eq!(stack.slices(), 3);
        assert_eq!(stack.bit_depth(), BitDepth::Eight);
        assert_eq!(stack.unit(), "um");
        assert_eq!(stack.plane(1, 2).len(), 100);
    }

    #[test]
    fn test_mismatched_slice_counts_rejected() {
        let a = ChannelData::U8(vec![vec![0; 4]; 3]);
        let b = ChannelData::U8(vec![vec![0; 4]; 2]);
        let result = VolumeStack::new(2, 2, vec![a, b], VoxelSize::default(), "");
        assert!(matches!(result, Err(SaveError::InvalidStack(_))));
    }

    #[test]
    fn test_mixed_sample_types_rejected() {
        let a = ChannelData::U8(vec![vec![0; 4]]);
        let b = ChannelData::U16(vec![vec![0; 4]]);
        let result = VolumeStack::new(2, 2, vec![a, b], VoxelSize::default(), "");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_slice_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for z in 0..2u8 {
            let path = dir.path().join(format!("slice_{}.png", z));
            image::GrayImage::from_pixel(5, 3, image::Luma([z * 10])).save(&path).unwrap();
            paths.push(path);
        }

        let stack = VolumeStack::from_slice_files(&[paths], VoxelSize::default(), "um").unwrap();
        assert_eq!((stack.width(), stack.height(), stack.slices()), (5, 3, 2));
        assert_eq!(stack.bit_depth(), BitDepth::Eight);
        match stack.plane(0, 1) {
            Plane::U8(s) => assert!(s.iter().all(|&v| v == 10)),
            Plane::U16(_) => panic!("expected 8-bit plane"),
        }
    }

    #[test]
    fn test_sixteen_bit_slice_promotes_stack() {
        let dir = tempfile::tempdir().unwrap();
        let narrow = dir.path().join("a_0.png");
        let wide = dir.path().join("a_1.png");
        image::GrayImage::from_pixel(4, 4, image::Luma([100])).save(&narrow).unwrap();
        image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_pixel(4, 4, image::Luma([4000]))
            .save(&wide)
            .unwrap();

        let pattern = dir.path().join("a_*.png").to_string_lossy().into_owned();
        let stack = VolumeStack::from_slice_globs(&[pattern], VoxelSize::default(), "").unwrap();
        assert_eq!(stack.bit_depth(), BitDepth::Sixteen);
        assert_eq!(stack.slices(), 2);

        // 8-bit slice is widened as-is, 16-bit slice is untouched
        match (stack.plane(0, 0), stack.plane(0, 1)) {
            (Plane::U16(narrow), Plane::U16(wide)) => {
                assert!(narrow.iter().all(|&v| v == 100));
                assert!(wide.iter().all(|&v| v == 4000));
            }
            _ => panic!("expected 16-bit planes"),
        }

        let geometry = crate::geometry::PaddedGeometry::new(4, 4);
        let frame = crate::pack::pack_gray16(0, stack.plane(0, 0), &geometry).unwrap();
        let crate::pack::PackedData::Gray16(data) = &frame.data else {
            panic!("expected GRAY16");
        };
        assert_eq!(data[0], 1600);
    }

    #[test]
    fn test_empty_glob_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("*.tif").to_string_lossy().into_owned();
        assert!(VolumeStack::from_slice_globs(&[pattern], VoxelSize::default(), "").is_err());
    }
}
