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

//! Shadow cache and line-granular framebuffer diffing.
//!
//! The cache keeps a copy of the pixels the client last saw. Each update pass
//! compares the live buffer against the shadow one scanline at a time,
//! mirrors changed lines into the shadow, and reports the changed area as a
//! minimal set of rectangles.
//!
//! Line granularity is chosen over tiles: every rectangle costs 12 bytes of
//! wire header, and coalescing consecutive changed lines into one vertically
//! extended rectangle minimizes both comparisons and headers. A full-width
//! row is also the natural unit for raw encoding's row-major layout.

use std::sync::Arc;

use log::debug;

use crate::framebuffer::{Framebuffer, Region};

/// Shadow copy of the last-sent pixels for one framebuffer instance.
///
/// A cache is valid only for the framebuffer it was built from; the session
/// replaces it wholesale when the source hands back a different instance.
pub(crate) struct FramebufferCache {
    framebuffer: Arc<Framebuffer>,
    /// Mirror of the live buffer, `stride * height` bytes, zero-initialized
    /// so the first pass reports everything that is not black.
    shadow: Vec<u8>,
    /// Per-line scratch for the current diff pass.
    line_invalid: Vec<bool>,
}

impl FramebufferCache {
    pub(crate) fn new(framebuffer: Arc<Framebuffer>) -> Self {
        let shadow = vec![0u8; framebuffer.stride() * framebuffer.height() as usize];
        let line_invalid = vec![false; framebuffer.height() as usize];
        debug!(
            "framebuffer cache built for {}x{} ({} shadow bytes)",
            framebuffer.width(),
            framebuffer.height(),
            shadow.len()
        );
        Self {
            framebuffer,
            shadow,
            line_invalid,
        }
    }

    /// True when this cache mirrors the given framebuffer instance.
    pub(crate) fn is_bound_to(&self, framebuffer: &Arc<Framebuffer>) -> bool {
        Arc::ptr_eq(&self.framebuffer, framebuffer)
    }

    /// Compares `region` of the live buffer against the shadow, mirrors any
    /// changed scanlines, and returns the rectangles to send.
    ///
    /// Incremental mode coalesces consecutive changed lines into maximal
    /// vertical runs the full width of the request region. Non-incremental
    /// mode returns the whole clamped region as a single rectangle (the
    /// shadow is still brought up to date so later incremental passes stay
    /// accurate).
    pub(crate) fn diff_region(&mut self, region: Region, incremental: bool) -> Vec<Region> {
        let region = region.clamp_to(self.framebuffer.width(), self.framebuffer.height());
        if region.is_empty() {
            return Vec::new();
        }

        let stride = self.framebuffer.stride();
        let bpp = self.framebuffer.format().bytes_per_pixel();
        let line_len = region.width as usize * bpp;

        {
            let live = self.framebuffer.pixels();
            for line in 0..region.height as usize {
                let y = region.y as usize + line;
                let offset = y * stride + region.x as usize * bpp;
                let live_slice = &live[offset..offset + line_len];
                let shadow_slice = &mut self.shadow[offset..offset + line_len];
                if live_slice == shadow_slice {
                    self.line_invalid[line] = false;
                } else {
                    shadow_slice.copy_from_slice(live_slice);
                    self.line_invalid[line] = true;
                }
            }
        }

        if !incremental {
            return vec![region];
        }

        // Coalesce consecutive invalid lines into maximal vertical runs.
        let mut rects = Vec::new();
        let mut run_start: Option<usize> = None;
        for line in 0..region.height as usize {
            if self.line_invalid[line] {
                if run_start.is_none() {
                    run_start = Some(line);
                }
            } else if let Some(start) = run_start.take() {
                rects.push(self.run_rect(region, start, line));
            }
        }
        if let Some(start) = run_start {
            rects.push(self.run_rect(region, start, region.height as usize));
        }

        debug!(
            "diff over {}x{} at ({},{}) produced {} rectangle(s)",
            region.width,
            region.height,
            region.x,
            region.y,
            rects.len()
        );
        rects
    }

    #[allow(clippy::cast_possible_truncation)] // line indices are bounded by the u16 region height
    fn run_rect(&self, region: Region, start: usize, end: usize) -> Region {
        Region::new(
            region.x,
            region.y + start as u16,
            region.width,
            (end - start) as u16,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PixelFormat;

    fn test_framebuffer(width: u16, height: u16) -> Arc<Framebuffer> {
        Arc::new(Framebuffer::new(
            width,
            height,
            PixelFormat::rgba32(),
            "cache-test",
        ))
    }

    #[test]
    fn test_clean_framebuffer_produces_nothing_incremental() {
        let fb = test_framebuffer(8, 6);
        let mut cache = FramebufferCache::new(fb.clone());
        // Zeroed framebuffer matches the zero-initialized shadow.
        assert!(cache.diff_region(fb.bounds(), true).is_empty());
    }

    #[test]
    fn test_non_incremental_returns_whole_region() {
        let fb = test_framebuffer(8, 6);
        let mut cache = FramebufferCache::new(fb.clone());
        let rects = cache.diff_region(Region::new(2, 1, 4, 3), false);
        assert_eq!(rects, vec![Region::new(2, 1, 4, 3)]);
    }

    #[test]
    fn test_single_changed_line() {
        let fb = test_framebuffer(8, 6);
        // Change row 3, columns 5..8.
        fb.update_region(&[0xAB; 12], Region::new(5, 3, 3, 1)).unwrap();

        let mut cache = FramebufferCache::new(fb.clone());
        let rects = cache.diff_region(fb.bounds(), true);
        assert_eq!(rects, vec![Region::new(0, 3, 8, 1)]);

        // The shadow now mirrors the live buffer; a second pass is clean.
        assert!(cache.diff_region(fb.bounds(), true).is_empty());
    }

    #[test]
    fn test_consecutive_lines_coalesce() {
        let fb = test_framebuffer(4, 8);
        fb.update_region(&[1; 16], Region::new(0, 1, 4, 1)).unwrap();
        fb.update_region(&[2; 16], Region::new(0, 2, 4, 1)).unwrap();
        fb.update_region(&[3; 16], Region::new(0, 4, 4, 1)).unwrap();

        let mut cache = FramebufferCache::new(fb.clone());
        let rects = cache.diff_region(fb.bounds(), true);
        assert_eq!(
            rects,
            vec![Region::new(0, 1, 4, 2), Region::new(0, 4, 4, 1)]
        );
    }

    #[test]
    fn test_open_run_flushed_at_last_line() {
        let fb = test_framebuffer(4, 4);
        fb.update_region(&[9; 32], Region::new(0, 2, 4, 2)).unwrap();

        let mut cache = FramebufferCache::new(fb.clone());
        let rects = cache.diff_region(fb.bounds(), true);
        assert_eq!(rects, vec![Region::new(0, 2, 4, 2)]);
    }

    #[test]
    fn test_diff_confined_to_request_region() {
        let fb = test_framebuffer(8, 8);
        fb.update_region(&[7; 32], Region::new(0, 0, 8, 1)).unwrap();
        fb.update_region(&[7; 32], Region::new(0, 6, 8, 1)).unwrap();

        let mut cache = FramebufferCache::new(fb.clone());
        let rects = cache.diff_region(Region::new(0, 5, 8, 3), true);
        assert_eq!(rects, vec![Region::new(0, 6, 8, 1)]);

        // Row 0 was outside the request and stays pending for a later pass.
        let rects = cache.diff_region(fb.bounds(), true);
        assert_eq!(rects, vec![Region::new(0, 0, 8, 1)]);
    }

    #[test]
    fn test_request_region_clamped() {
        let fb = test_framebuffer(4, 4);
        let mut cache = FramebufferCache::new(fb.clone());
        let rects = cache.diff_region(Region::new(0, 0, 100, 100), false);
        assert_eq!(rects, vec![Region::new(0, 0, 4, 4)]);
        assert!(cache.diff_region(Region::new(10, 10, 5, 5), false).is_empty());
    }

    #[test]
    fn test_cache_binding_identity() {
        let fb = test_framebuffer(4, 4);
        let other = test_framebuffer(4, 4);
        let cache = FramebufferCache::new(fb.clone());
        assert!(cache.is_bound_to(&fb));
        assert!(!cache.is_bound_to(&other));
    }
}
