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

//! RFB wire-protocol constants and core message structures.
//!
//! Everything in this module is fixed by RFC 6143: the message-type and
//! security tags, the encoding numbers, and the exact byte layouts of
//! [`PixelFormat`], [`ServerInit`] and the update rectangle header. The
//! session engine builds its messages out of these pieces; nothing here
//! touches the stream itself.
//!
//! A session moves through the protocol in four stages: the version banner
//! exchange, the security handshake, the init messages, and then the
//! steady-state message loop that the rest of this crate serves.

use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// Version banner this server sends: RFB 3.8, the baseline spoken by
/// effectively every current client. Exactly 12 bytes, newline included.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// The protocol version this server negotiates with, as (major, minor).
pub const SERVER_VERSION: (u32, u32) = (3, 8);

// Client-to-Server Message Types

/// The client wants framebuffer updates delivered in a different pixel
/// layout from now on.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// The client lists the encodings it can decode, best first.
///
/// Until this arrives the server assumes nothing beyond Raw; in particular
/// CopyRect and the DesktopSize pseudo-encoding stay unused.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// The client asks for a framebuffer update over a region, either a full
/// repaint or only what changed since its last update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// A key went down or up on the client's keyboard.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// The client's pointer moved or a button changed state.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// The client is sharing its clipboard text.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Carries one or more rectangles of screen content; the server's side of
/// the update request/reply cycle and the bulk of all traffic.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Asks the client to beep or flash.
pub const SERVER_MSG_BELL: u8 = 2;

/// Shares the server's clipboard text with the client.
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types

/// Raw encoding: the rectangle's pixels as-is, row by row. Costs the most
/// bandwidth and is the one encoding every client must accept.
pub const ENCODING_RAW: i32 = 0;

/// CopyRect encoding: "you already have these pixels, copy them from here."
/// Two coordinates instead of pixel data, ideal for scrolls and moves.
pub const ENCODING_COPYRECT: i32 = 1;

/// DesktopSize pseudo-encoding: a rectangle whose geometry announces new
/// framebuffer extents and whose payload is empty.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

// Security Types

/// Placeholder tag for a failed or unknown security negotiation.
#[allow(dead_code)]
pub const SECURITY_TYPE_INVALID: u8 = 0;

/// Open access: the handshake proceeds without credentials.
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Classic VNC authentication: the server sends a 16-byte challenge and the
/// client returns it DES-encrypted with the password.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Security outcome word for success.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Security outcome word for failure.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Maximum number of encodings accepted in a single SetEncodings message.
pub const MAX_CLIENT_ENCODINGS: usize = 511;

/// Maximum length in bytes accepted for client cut text.
pub const MAX_CUT_TEXT_LENGTH: u32 = 0x00FF_FFFF;

/// Maximum rectangles accumulated in one FramebufferUpdate batch, leaving
/// one slot of the 16-bit count for a DesktopSize rectangle.
pub const MAX_RECTANGLES_PER_UPDATE: usize = 65534;

/// Describes how a pixel value maps onto red, green and blue.
///
/// A pixel is a word of `bits_per_pixel` bits; each channel occupies a
/// contiguous run of bits selected by its shift and masked by its max.
/// Serialized as a 16-byte blob inside ServerInit and SetPixelFormat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Total bits per pixel on the wire: 8, 16, 24 or 32.
    pub bits_per_pixel: u8,
    /// How many of those bits carry color information.
    pub depth: u8,
    /// Non-zero when multi-byte pixels travel most significant byte first.
    pub big_endian_flag: u8,
    /// Non-zero for direct color; zero means the pixel indexes a color map.
    pub true_colour_flag: u8,
    /// Largest red value, which doubles as the channel's bit mask.
    pub red_max: u16,
    /// Largest green value, which doubles as the channel's bit mask.
    pub green_max: u16,
    /// Largest blue value, which doubles as the channel's bit mask.
    pub blue_max: u16,
    /// Bit position of the red channel within the pixel word.
    pub red_shift: u8,
    /// Bit position of the green channel within the pixel word.
    pub green_shift: u8,
    /// Bit position of the blue channel within the pixel word.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Shared builder for the little-endian true-color presets below.
    fn truecolor(bits_per_pixel: u8, depth: u8, channels: [(u16, u8); 3]) -> Self {
        let [(red_max, red_shift), (green_max, green_shift), (blue_max, blue_shift)] = channels;
        Self {
            bits_per_pixel,
            depth,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max,
            green_max,
            blue_max,
            red_shift,
            green_shift,
            blue_shift,
        }
    }

    /// The format most pixel sources produce natively: 32 bits per pixel
    /// with 8-bit red, green and blue channels in ascending byte order and
    /// the top byte unused.
    #[must_use]
    pub fn rgba32() -> Self {
        Self::truecolor(32, 24, [(0xFF, 0), (0xFF, 8), (0xFF, 16)])
    }

    /// 16-bit RGB565, common on embedded panels and thin links: five bits of
    /// red at the top of the word, six of green, five of blue.
    #[must_use]
    pub fn rgb565() -> Self {
        Self::truecolor(16, 16, [(0x1F, 11), (0x3F, 5), (0x1F, 0)])
    }

    /// 16-bit RGB555: five bits per channel, top bit of the word unused.
    #[must_use]
    pub fn rgb555() -> Self {
        Self::truecolor(16, 15, [(0x1F, 10), (0x1F, 5), (0x1F, 0)])
    }

    /// 8-bit BGR233 for legacy and very low bandwidth clients: three bits of
    /// red in the low end, three of green, two of blue on top.
    #[must_use]
    pub fn bgr233() -> Self {
        Self::truecolor(8, 8, [(0x07, 0), (0x07, 3), (0x03, 6)])
    }

    /// Number of whole bytes occupied by one pixel in this format.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize).div_ceil(8)
    }

    /// Whether a format received off the wire is one this server can serve.
    ///
    /// Accepts the standard pixel widths with a plausible depth, and
    /// requires every channel to be a contiguous run of low bits that, once
    /// shifted into place, still fits inside the pixel word. Color-mapped
    /// formats are only honored at 8 bits per pixel.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 24 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }

        if self.true_colour_flag == 0 {
            return self.bits_per_pixel == 8;
        }

        let channel_fits = |max: u16, shift: u8| {
            let mask = u32::from(max);
            // A max of 2^n - 1 is exactly a run of n low bits; anything with
            // holes cannot be masked out of a pixel word.
            mask != 0
                && (mask + 1) & mask == 0
                && u32::from(shift) + (32 - mask.leading_zeros()) <= u32::from(self.bits_per_pixel)
        };

        channel_fits(self.red_max, self.red_shift)
            && channel_fits(self.green_max, self.green_shift)
            && channel_fits(self.blue_max, self.blue_shift)
    }

    /// Appends the 16-byte wire form of this format to `buf`.
    ///
    /// The layout is fixed: four single-byte fields, the three channel maxes
    /// as big-endian u16, the three shifts, then three bytes of padding.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Decodes the 16-byte wire form from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an `UnexpectedEof` error when fewer than 16 bytes are
    /// available.
    pub fn from_bytes(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Not enough bytes for PixelFormat",
            ));
        }

        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// The ServerInit message, the server's half of the init exchange.
///
/// Tells the client what it is about to look at: framebuffer extents, the
/// native pixel layout, and a desktop name to put in its title bar.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// The height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The name of the desktop.
    pub name: String,
}

impl ServerInit {
    /// Appends the wire form to `buf`: width and height as big-endian u16,
    /// the 16-byte pixel format, then the name as a length-prefixed UTF-8
    /// string.
    #[allow(clippy::cast_possible_truncation)] // Desktop name length limited to u32 per VNC protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// Header of one rectangle inside a FramebufferUpdate message.
///
/// A FramebufferUpdate is a sequence of rectangles, each announcing its
/// position, size and encoding before whatever payload that encoding
/// requires.
#[derive(Debug)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
    /// The encoding of the payload that follows this header.
    pub encoding: i32,
}

impl Rectangle {
    /// Appends the 12-byte header to `buf`: the four geometry fields as
    /// big-endian u16, then the encoding as a signed 32-bit integer.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}
