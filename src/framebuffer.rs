// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Framebuffer storage and region geometry.
//!
//! A [`Framebuffer`] couples immutable geometry (width, height, stride, pixel
//! format, name) with a lock-guarded pixel buffer. Dimensions never change for
//! a given instance; a source that resizes returns a replacement framebuffer
//! and the session advertises the new extents to the client.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Result, VncError};
use crate::protocol::PixelFormat;

/// A rectangular region of the framebuffer, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl Region {
    /// Creates a new region.
    #[must_use]
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns true if the region covers no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Area of the region in pixels.
    #[must_use]
    pub fn area(&self) -> u32 {
        u32::from(self.width) * u32::from(self.height)
    }

    /// Returns the intersection of two regions, or `None` if they are disjoint.
    ///
    /// Coordinate sums are computed in u32; wire-supplied regions may sit at
    /// the top of the u16 range.
    #[must_use]
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let x1 = u32::from(self.x).max(u32::from(other.x));
        let y1 = u32::from(self.y).max(u32::from(other.y));
        let x2 = (u32::from(self.x) + u32::from(self.width))
            .min(u32::from(other.x) + u32::from(other.width));
        let y2 = (u32::from(self.y) + u32::from(self.height))
            .min(u32::from(other.y) + u32::from(other.height));

        if x1 < x2 && y1 < y2 {
            #[allow(clippy::cast_possible_truncation)] // bounded by the u16 inputs
            Some(Region::new(
                x1 as u16,
                y1 as u16,
                (x2 - x1) as u16,
                (y2 - y1) as u16,
            ))
        } else {
            None
        }
    }

    /// Returns the bounding box of two regions.
    #[must_use]
    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }

        let x1 = u32::from(self.x).min(u32::from(other.x));
        let y1 = u32::from(self.y).min(u32::from(other.y));
        let x2 = (u32::from(self.x) + u32::from(self.width))
            .max(u32::from(other.x) + u32::from(other.width));
        let y2 = (u32::from(self.y) + u32::from(self.height))
            .max(u32::from(other.y) + u32::from(other.height));
        #[allow(clippy::cast_possible_truncation)] // clamped below the u16 ceiling
        Region::new(
            x1 as u16,
            y1 as u16,
            (x2 - x1).min(u32::from(u16::MAX)) as u16,
            (y2 - y1).min(u32::from(u16::MAX)) as u16,
        )
    }

    /// Clamps the region to a `width` x `height` framebuffer.
    ///
    /// The result may be empty when the region lies entirely outside the
    /// framebuffer.
    #[must_use]
    pub fn clamp_to(&self, width: u16, height: u16) -> Region {
        let x = self.x.min(width);
        let y = self.y.min(height);
        let w = self.width.min(width - x);
        let h = self.height.min(height - y);
        Region::new(x, y, w, h)
    }
}

/// A framebuffer: fixed geometry plus a lock-guarded byte buffer.
///
/// The buffer holds `stride * height` bytes; rows are `stride` bytes apart
/// and a row's pixels occupy the first `width * bytes_per_pixel` of it.
pub struct Framebuffer {
    width: u16,
    height: u16,
    stride: usize,
    format: PixelFormat,
    name: String,
    pixels: Mutex<Vec<u8>>,
}

impl Framebuffer {
    /// Creates a zero-filled framebuffer with a tight stride.
    #[must_use]
    pub fn new(width: u16, height: u16, format: PixelFormat, name: impl Into<String>) -> Self {
        let stride = width as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            stride,
            format,
            name: name.into(),
            pixels: Mutex::new(vec![0; stride * height as usize]),
        }
    }

    /// Creates a framebuffer from existing pixel data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the stride is smaller than a row of
    /// pixels or the buffer is shorter than `stride * height`.
    pub fn from_pixels(
        width: u16,
        height: u16,
        stride: usize,
        format: PixelFormat,
        name: impl Into<String>,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        if stride < width as usize * format.bytes_per_pixel() {
            return Err(VncError::InvalidArgument(
                "stride is smaller than one row of pixels".into(),
            ));
        }
        if pixels.len() < stride * height as usize {
            return Err(VncError::InvalidArgument(
                "pixel buffer is shorter than stride * height".into(),
            ));
        }
        Ok(Self {
            width,
            height,
            stride,
            format,
            name: name.into(),
            pixels: Mutex::new(pixels),
        })
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Bytes between the start of one row and the next.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The native pixel format of the buffer.
    #[must_use]
    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    /// Desktop name sent to the client during initialization.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full extent of the framebuffer as a region.
    #[must_use]
    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width, self.height)
    }

    /// Locks and returns the pixel buffer.
    ///
    /// Callers must not hold the guard across an `.await`.
    pub fn pixels(&self) -> MutexGuard<'_, Vec<u8>> {
        self.pixels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copies tightly-packed rows of native-format pixels into `region`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the region exceeds the framebuffer
    /// extents or `src` is shorter than the region's pixel data.
    pub fn update_region(&self, src: &[u8], region: Region) -> Result<()> {
        let bpp = self.format.bytes_per_pixel();
        let row_len = region.width as usize * bpp;

        if u32::from(region.x) + u32::from(region.width) > u32::from(self.width)
            || u32::from(region.y) + u32::from(region.height) > u32::from(self.height)
        {
            return Err(VncError::InvalidArgument(
                "region exceeds framebuffer extents".into(),
            ));
        }
        if src.len() < row_len * region.height as usize {
            return Err(VncError::InvalidArgument(
                "source buffer is shorter than the region".into(),
            ));
        }

        let mut pixels = self.pixels();
        for row in 0..region.height as usize {
            let dst_off = (region.y as usize + row) * self.stride + region.x as usize * bpp;
            let src_off = row * row_len;
            pixels[dst_off..dst_off + row_len].copy_from_slice(&src[src_off..src_off + row_len]);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Producer of framebuffer contents, supplied by the embedder.
///
/// The session calls [`capture`](FramebufferSource::capture) once during
/// desktop initialization and then before each update pass. A capture may
/// return the same instance (contents mutated in place) or a replacement
/// framebuffer, possibly with different dimensions.
#[async_trait]
pub trait FramebufferSource: Send + Sync {
    /// Produces the current screen contents.
    async fn capture(&self) -> Result<Arc<Framebuffer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_intersect() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(5, 5, 10, 10);
        assert_eq!(a.intersect(&b), Some(Region::new(5, 5, 5, 5)));

        let c = Region::new(10, 0, 5, 5);
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn test_region_union_and_area() {
        let a = Region::new(0, 0, 5, 5);
        let b = Region::new(10, 10, 5, 5);
        assert_eq!(a.union(&b), Region::new(0, 0, 15, 15));
        assert_eq!(a.area(), 25);
    }

    #[test]
    fn test_region_clamp() {
        let r = Region::new(1, 1, 100, 100).clamp_to(10, 8);
        assert_eq!(r, Region::new(1, 1, 9, 7));

        let outside = Region::new(20, 20, 5, 5).clamp_to(10, 8);
        assert!(outside.is_empty());
    }

    #[test]
    fn test_update_region_respects_stride() {
        let fb = Framebuffer::from_pixels(
            2,
            2,
            12, // padded stride: 2 pixels * 4 bytes + 4 bytes padding
            PixelFormat::rgba32(),
            "t",
            vec![0; 24],
        )
        .unwrap();

        fb.update_region(&[1; 8], Region::new(0, 1, 2, 1)).unwrap();
        let pixels = fb.pixels();
        assert_eq!(&pixels[12..20], &[1; 8]);
        assert_eq!(&pixels[20..24], &[0; 4]);
    }

    #[test]
    fn test_update_region_rejects_out_of_range() {
        let fb = Framebuffer::new(4, 4, PixelFormat::rgba32(), "t");
        let err = fb.update_region(&[0; 64], Region::new(2, 2, 4, 4));
        assert!(matches!(err, Err(VncError::InvalidArgument(_))));
    }
}
