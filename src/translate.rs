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


//! Pixel translation between the framebuffer's format and the client's.
//!
//! [`copy_region`] lifts a rectangle out of a source buffer into a
//! destination buffer, re-encoding pixels when the two formats differ. A
//! pixel is treated as a little machine word: the bytes are assembled in the
//! order the format's endian flag dictates, each channel is masked out and
//! rescaled straight from the source range to the destination range, and the
//! result is split back into bytes. Scaling never passes through an 8-bit
//! intermediate, so widening a narrow channel costs no extra precision.
//!
//! Identical formats skip all of that and copy whole rows at a time.

use crate::error::{Result, VncError};
use crate::framebuffer::Region;
use crate::protocol::PixelFormat;

/// Copies `region` from the source buffer to the destination origin,
/// converting pixel format if needed.
///
/// `src` is addressed with `src_stride` bytes per row; the region must lie
/// inside a `src_width`-pixel-wide buffer. The destination receives the
/// region starting at its own row 0, addressed with `dst_stride` bytes per
/// row and `dst_width` pixels of capacity per row.
///
/// # Errors
///
/// Returns `InvalidArgument` when the region falls outside either buffer or
/// a stride is smaller than one row of pixels.
#[allow(clippy::too_many_arguments)]
pub fn copy_region(
    src: &[u8],
    src_width: u16,
    src_stride: usize,
    src_format: &PixelFormat,
    region: Region,
    dst: &mut [u8],
    dst_width: u16,
    dst_stride: usize,
    dst_format: &PixelFormat,
) -> Result<()> {
    if region.is_empty() {
        return Ok(());
    }

    let src_bpp = src_format.bytes_per_pixel();
    let dst_bpp = dst_format.bytes_per_pixel();
    let width = region.width as usize;
    let height = region.height as usize;

    if u32::from(region.x) + u32::from(region.width) > u32::from(src_width) {
        return Err(VncError::InvalidArgument(
            "region exceeds source width".into(),
        ));
    }
    if region.width > dst_width {
        return Err(VncError::InvalidArgument(
            "region exceeds destination width".into(),
        ));
    }
    if src_stride < src_width as usize * src_bpp || dst_stride < dst_width as usize * dst_bpp {
        return Err(VncError::InvalidArgument(
            "stride is smaller than one row of pixels".into(),
        ));
    }

    let src_row_base = region.y as usize * src_stride + region.x as usize * src_bpp;
    let src_end = src_row_base + (height - 1) * src_stride + width * src_bpp;
    if src_end > src.len() {
        return Err(VncError::InvalidArgument(
            "region exceeds source buffer".into(),
        ));
    }
    let dst_end = (height - 1) * dst_stride + width * dst_bpp;
    if dst_end > dst.len() {
        return Err(VncError::InvalidArgument(
            "region exceeds destination buffer".into(),
        ));
    }

    if src_format == dst_format {
        // Row-by-row memory copy; no per-pixel work.
        for row in 0..height {
            let s = src_row_base + row * src_stride;
            let d = row * dst_stride;
            dst[d..d + width * src_bpp].copy_from_slice(&src[s..s + width * src_bpp]);
        }
        return Ok(());
    }

    for row in 0..height {
        let mut s = src_row_base + row * src_stride;
        let mut d = row * dst_stride;
        for _ in 0..width {
            let word = read_word(&src[s..s + src_bpp], src_format.big_endian_flag != 0);
            let converted = convert_word(word, src_format, dst_format);
            write_word(&mut dst[d..d + dst_bpp], converted, dst_format.big_endian_flag != 0);
            s += src_bpp;
            d += dst_bpp;
        }
    }

    Ok(())
}

/// Assembles a pixel word from its wire bytes.
///
/// Works for any width from one to four bytes; `big_endian` picks which end
/// of the slice holds the most significant byte.
fn read_word(bytes: &[u8], big_endian: bool) -> u32 {
    let mut word = 0u32;
    if big_endian {
        for &byte in bytes {
            word = word << 8 | u32::from(byte);
        }
    } else {
        for &byte in bytes.iter().rev() {
            word = word << 8 | u32::from(byte);
        }
    }
    word
}

/// Splits a pixel word back into wire bytes, the inverse of [`read_word`].
#[allow(clippy::cast_possible_truncation)] // each step keeps the low byte only
fn write_word(bytes: &mut [u8], mut word: u32, big_endian: bool) {
    if big_endian {
        for slot in bytes.iter_mut().rev() {
            *slot = word as u8;
            word >>= 8;
        }
    } else {
        for slot in bytes.iter_mut() {
            *slot = word as u8;
            word >>= 8;
        }
    }
}

/// Re-packs one pixel word from the source channel layout into the
/// destination layout.
fn convert_word(word: u32, src: &PixelFormat, dst: &PixelFormat) -> u32 {
    rescale_channel(word, src.red_shift, src.red_max, dst.red_shift, dst.red_max)
        | rescale_channel(
            word,
            src.green_shift,
            src.green_max,
            dst.green_shift,
            dst.green_max,
        )
        | rescale_channel(
            word,
            src.blue_shift,
            src.blue_max,
            dst.blue_shift,
            dst.blue_max,
        )
}

/// Extracts one channel from `word` and rescales it from `0..=src_max` to
/// `0..=dst_max`, already shifted into its destination position.
///
/// The product fits in u32 because both maxes are u16.
fn rescale_channel(word: u32, src_shift: u8, src_max: u16, dst_shift: u8, dst_max: u16) -> u32 {
    if src_max == 0 {
        return 0;
    }
    let raw = (word >> src_shift) & u32::from(src_max);
    let scaled = if src_max == dst_max {
        raw
    } else {
        raw * u32::from(dst_max) / u32::from(src_max)
    };
    scaled << dst_shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_format_region_copy() {
        let format = PixelFormat::rgba32();
        // 4x2 source, copy the middle 2x2
        let src: Vec<u8> = (0u8..32).collect();
        let mut dst = vec![0u8; 16];

        copy_region(
            &src,
            4,
            16,
            &format,
            Region::new(1, 0, 2, 2),
            &mut dst,
            2,
            8,
            &format,
        )
        .unwrap();

        assert_eq!(&dst[0..8], &src[4..12]);
        assert_eq!(&dst[8..16], &src[20..28]);
    }

    #[test]
    fn test_padded_source_stride() {
        let format = PixelFormat::rgba32();
        // 1x2 source with a 12-byte stride (4 bytes of row padding)
        let mut src = vec![0u8; 24];
        src[0..4].copy_from_slice(&[1, 2, 3, 4]);
        src[12..16].copy_from_slice(&[5, 6, 7, 8]);
        let mut dst = vec![0u8; 8];

        copy_region(
            &src,
            1,
            12,
            &format,
            Region::new(0, 0, 1, 2),
            &mut dst,
            1,
            4,
            &format,
        )
        .unwrap();

        assert_eq!(&dst, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_rgba32_to_rgb565() {
        let src_format = PixelFormat::rgba32();
        let dst_format = PixelFormat::rgb565();

        // Pure red: R=255, G=0, B=0 in RGBA32
        let src = vec![255u8, 0, 0, 0];
        let mut dst = vec![0u8; 2];

        copy_region(
            &src,
            1,
            4,
            &src_format,
            Region::new(0, 0, 1, 1),
            &mut dst,
            1,
            2,
            &dst_format,
        )
        .unwrap();

        // Full red keeps its full range: 31 << 11 = 0xF800
        let value = u16::from_le_bytes([dst[0], dst[1]]);
        assert_eq!(value, 0xF800);
    }

    #[test]
    fn test_big_endian_destination() {
        let src_format = PixelFormat::rgba32();
        let mut dst_format = PixelFormat::rgb565();
        dst_format.big_endian_flag = 1;

        let src = vec![255u8, 0, 0, 0];
        let mut dst = vec![0u8; 2];

        copy_region(
            &src,
            1,
            4,
            &src_format,
            Region::new(0, 0, 1, 1),
            &mut dst,
            1,
            2,
            &dst_format,
        )
        .unwrap();

        assert_eq!(u16::from_be_bytes([dst[0], dst[1]]), 0xF800);
    }

    #[test]
    fn test_out_of_range_region_rejected() {
        let format = PixelFormat::rgba32();
        let src = vec![0u8; 16];
        let mut dst = vec![0u8; 16];

        let err = copy_region(
            &src,
            2,
            8,
            &format,
            Region::new(1, 0, 2, 2),
            &mut dst,
            2,
            8,
            &format,
        );
        assert!(matches!(err, Err(VncError::InvalidArgument(_))));
    }

    #[test]
    fn test_read_word_both_byte_orders() {
        assert_eq!(read_word(&[0x12, 0x34], true), 0x1234);
        assert_eq!(read_word(&[0x12, 0x34], false), 0x3412);
        assert_eq!(read_word(&[0xAA], true), 0xAA);
        assert_eq!(read_word(&[0x01, 0x02, 0x03], false), 0x030201);
        assert_eq!(read_word(&[0x01, 0x02, 0x03, 0x04], true), 0x01020304);
    }

    #[test]
    fn test_write_word_inverts_read_word() {
        for big_endian in [false, true] {
            let mut bytes = [0u8; 3];
            write_word(&mut bytes, 0x0A0B0C, big_endian);
            assert_eq!(read_word(&bytes, big_endian), 0x0A0B0C);
        }

        let mut bytes = [0u8; 2];
        write_word(&mut bytes, 0xF800, true);
        assert_eq!(bytes, [0xF8, 0x00]);
    }

    #[test]
    fn test_rescale_channel_ranges() {
        // Widening a 5-bit channel to 8 bits: 15/31 of full scale.
        assert_eq!(rescale_channel(15, 0, 31, 0, 255), 123);
        // Narrowing 8 bits to 5: endpoints map to endpoints.
        assert_eq!(rescale_channel(0, 0, 255, 0, 31), 0);
        assert_eq!(rescale_channel(255, 0, 255, 0, 31), 31);
        assert_eq!(rescale_channel(128, 0, 255, 0, 31), 15);
        // Equal ranges pass through untouched, just repositioned.
        assert_eq!(rescale_channel(0xAB << 8, 8, 255, 16, 255), 0xAB << 16);
        // A degenerate channel contributes nothing.
        assert_eq!(rescale_channel(0xFF, 0, 0, 0, 255), 0);
    }

    #[test]
    fn test_convert_word_between_layouts() {
        let rgba = PixelFormat::rgba32();
        let rgb565 = PixelFormat::rgb565();

        // Mid grey in RGBA32: R=G=B=128 at shifts 0/8/16.
        let grey = 128 | 128 << 8 | 128 << 16;
        let converted = convert_word(grey, &rgba, &rgb565);
        // 128*31/255 = 15 for the 5-bit channels, 128*63/255 = 31 for green.
        assert_eq!(converted, 15 << 11 | 31 << 5 | 15);

        // And back up: channel positions move, values rescale.
        let restored = convert_word(converted, &rgb565, &rgba);
        assert_eq!(restored & 0xFF, 123); // 15*255/31
        assert_eq!(restored >> 8 & 0xFF, 125); // 31*255/63
        assert_eq!(restored >> 16 & 0xFF, 123);
    }
}
