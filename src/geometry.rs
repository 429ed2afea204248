//! Padded frame geometry.
//!
//! HEVC wants frame dimensions aligned to the coding block size, so every
//! slice is padded on the right and bottom up to the next multiple of 8.

use serde::{Deserialize, Serialize};

/// Round `val` up to the next multiple of 8 (unchanged when already aligned).
pub fn nearest_multiple_of_eight(val: usize) -> usize {
    let lower = val >> 3 << 3;
    if lower == val { lower } else { (val + 8) >> 3 << 3 }
}

/// Source and padded dimensions for one save operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddedGeometry {
    pub width: usize,
    pub height: usize,
    pub scaled_width: usize,
    pub scaled_height: usize,
}

impl PaddedGeometry {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            scaled_width: nearest_multiple_of_eight(width),
            scaled_height: nearest_multiple_of_eight(height),
        }
    }

    /// Geometry without padding, for movies muxed at the source size.
    pub fn unpadded(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            scaled_width: width,
            scaled_height: height,
        }
    }

    pub fn pad_right(&self) -> usize {
        self.scaled_width - self.width
    }

    pub fn pad_bottom(&self) -> usize {
        self.scaled_height - self.height
    }

    /// Samples in one source plane.
    pub fn source_len(&self) -> usize {
        self.width * self.height
    }

    /// Pixels in one padded raster.
    pub fn padded_pixels(&self) -> usize {
        self.scaled_width * self.scaled_height
    }

    /// True when (x, y) lies inside the source image.
    #[inline]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_examples() {
        assert_eq!(nearest_multiple_of_eight(512), 512);
        assert_eq!(nearest_multiple_of_eight(100), 104);
        assert_eq!(nearest_multiple_of_eight(10), 16);
        assert_eq!(nearest_multiple_of_eight(1), 8);
        assert_eq!(nearest_multiple_of_eight(8), 8);
        assert_eq!(nearest_multiple_of_eight(9), 16);
    }

    #[test]
    fn test_padding_invariant() {
        for w in 1..300 {
            let s = nearest_multiple_of_eight(w);
            assert_eq!(s % 8, 0, "w={}", w);
            assert!(s >= w);
            assert!(s - w < 8);
            if w % 8 == 0 {
                assert_eq!(s, w);
            }
        }
    }

    #[test]
    fn test_pads() {
        let g = PaddedGeometry::new(10, 10);
        assert_eq!((g.scaled_width, g.scaled_height), (16, 16));
        assert_eq!((g.pad_right(), g.pad_bottom()), (6, 6));

        let g = PaddedGeometry::new(512, 100);
        assert_eq!((g.pad_right(), g.pad_bottom()), (0, 4));
        assert!(g.contains(511, 99));
        assert!(!g.contains(511, 100));

        let g = PaddedGeometry::unpadded(13, 7);
        assert_eq!((g.scaled_width, g.scaled_height), (13, 7));
        assert_eq!((g.pad_right(), g.pad_bottom()), (0, 0));
    }
}
