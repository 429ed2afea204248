//! Frame packing: source plane → padded encoder raster.
//!
//! 8-bit stacks become interleaved RGB24 (three lanes, usually the same gray
//! channel broadcast), deeper stacks become single-lane GRAY16. Pixels outside
//! the source rectangle are zero.

use crate::config::IntensityMap;
use crate::error::FramePackError;
use crate::geometry::PaddedGeometry;
use crate::stack::{BitDepth, ImageStack, Plane};

/// 12-bit sensor range → 16-bit container range.
pub const WIDE_SCALE: u32 = 16;

/// Raster payload in the layout the encoder's scaler expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackedData {
    /// `scaled_width * scaled_height * 3` bytes, RGB interleaved.
    Rgb24(Vec<u8>),
    /// `scaled_width * scaled_height` samples.
    Gray16(Vec<u16>),
}

/// One packed slice, ready for `ChannelEncoder::submit`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedFrame {
    pub slice: usize,
    pub width: usize,
    pub height: usize,
    pub data: PackedData,
}

impl PackedFrame {
    /// Samples per pixel.
    pub fn lanes(&self) -> usize {
        match self.data {
            PackedData::Rgb24(_) => 3,
            PackedData::Gray16(_) => 1,
        }
    }
}

/// Source channel feeding each of the three RGB lanes.
///
/// Indices beyond the stack's channel count read channel 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaneSelector(pub [usize; 3]);

impl LaneSelector {
    /// Same channel on all lanes (gray movie).
    pub fn broadcast(channel: usize) -> Self {
        Self([channel; 3])
    }

    /// Lanes 0..2 read channels 0..2 directly.
    pub fn direct() -> Self {
        Self([0, 1, 2])
    }

    pub fn resolve(self, channels: usize) -> [usize; 3] {
        self.0.map(|c| if c >= channels { 0 } else { c })
    }
}

/// `(value - min) * range`, truncated toward zero and wrapped to a byte.
#[inline]
pub fn rescale_u8(value: f64, map: IntensityMap) -> u8 {
    ((value - map.min) * map.range) as i32 as u8
}

/// `value * 16`, wrapped to 16 bits.
#[inline]
pub fn rescale_u16(value: u16) -> u16 {
    (u32::from(value) * WIDE_SCALE) as u16
}

/// Pack slice `slice` of `stack` using `selector` for the RGB lanes.
///
/// `intensity` is indexed by source channel; missing entries are identity.
pub fn pack_slice<S: ImageStack + ?Sized>(
    stack: &S,
    selector: LaneSelector,
    slice: usize,
    geometry: &PaddedGeometry,
    intensity: &[IntensityMap],
) -> Result<PackedFrame, FramePackError> {
    let lanes = selector.resolve(stack.channels());
    match stack.bit_depth() {
        BitDepth::Eight => {
            let planes = lanes.map(|c| stack.plane(c, slice));
            let maps = lanes.map(|c| intensity.get(c).copied().unwrap_or_default());
            pack_rgb24(slice, planes, maps, geometry)
        }
        BitDepth::Sixteen => pack_gray16(slice, stack.plane(lanes[0], slice), geometry),
    }
}

/// Pack three 8-bit lanes into a padded RGB24 raster.
pub fn pack_rgb24(
    slice: usize,
    planes: [Plane<'_>; 3],
    maps: [IntensityMap; 3],
    geometry: &PaddedGeometry,
) -> Result<PackedFrame, FramePackError> {
    let mut lanes: [&[u8]; 3] = [&[]; 3];
    for (lane, plane) in planes.iter().enumerate() {
        check_len(slice, plane, geometry)?;
        lanes[lane] = match plane {
            Plane::U8(s) => *s,
            Plane::U16(_) => {
                return Err(FramePackError::SampleType {
                    slice,
                    expected: 8,
                    found: 16,
                });
            }
        };
    }

    let (w, h, sw) = (geometry.width, geometry.height, geometry.scaled_width);
    let mut out = vec![0u8; geometry.padded_pixels() * 3];
    for y in 0..h {
        let src_row = y * w;
        let dst_row = y * sw * 3;
        for x in 0..w {
            let dst = dst_row + x * 3;
            for lane in 0..3 {
                out[dst + lane] = rescale_u8(f64::from(lanes[lane][src_row + x]), maps[lane]);
            }
        }
    }

    Ok(PackedFrame {
        slice,
        width: sw,
        height: geometry.scaled_height,
        data: PackedData::Rgb24(out),
    })
}

/// Pack one 16-bit plane into a padded GRAY16 raster.
pub fn pack_gray16(
    slice: usize,
    plane: Plane<'_>,
    geometry: &PaddedGeometry,
) -> Result<PackedFrame, FramePackError> {
    check_len(slice, &plane, geometry)?;
    let src = match plane {
        Plane::U16(s) => s,
        Plane::U8(_) => {
            return Err(FramePackError::SampleType {
                slice,
                expected: 16,
                found: 8,
            });
        }
    };

    let (w, h, sw) = (geometry.width, geometry.height, geometry.scaled_width);
    let mut out = vec![0u16; geometry.padded_pixels()];
    for y in 0..h {
        let src_row = &src[y * w..(y + 1) * w];
        let dst_row = &mut out[y * sw..y * sw + w];
        for (dst, &value) in dst_row.iter_mut().zip(src_row) {
            *dst = rescale_u16(value);
        }
    }

    Ok(PackedFrame {
        slice,
        width: sw,
        height: geometry.scaled_height,
        data: PackedData::Gray16(out),
    })
}

fn check_len(
    slice: usize,
    plane: &Plane<'_>,
    geometry: &PaddedGeometry,
) -> Result<(), FramePackError> {
    if plane.len() != geometry.source_len() {
        return Err(FramePackError::PlaneSize {
            slice,
            expected: geometry.source_len(),
            found: plane.len(),
            width: geometry.width,
            height: geometry.height,
        });
    }
    Ok(())
}
