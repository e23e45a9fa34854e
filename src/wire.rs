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

//! Wire-level codec for the RFB protocol.
//!
//! All multi-byte integers on the wire are big-endian. Reads block until the
//! requested byte count has been delivered; an early end of stream surfaces
//! as [`VncError::Transport`]. Outbound messages are assembled whole in a
//! `BytesMut` and written in one `write_all` call under the session's stream
//! write lock, so no two messages ever interleave.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, VncError};
use crate::framebuffer::Region;
use crate::protocol::PixelFormat;

/// Reads exactly `len` bytes from the stream.
pub async fn read_bytes<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads a single byte.
pub async fn read_u8<R>(reader: &mut R) -> Result<u8>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u8().await?)
}

/// Reads an unsigned 16-bit big-endian integer.
pub async fn read_u16<R>(reader: &mut R) -> Result<u16>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u16().await?)
}

/// Reads an unsigned 32-bit big-endian integer.
pub async fn read_u32<R>(reader: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u32().await?)
}

/// Reads a signed 32-bit big-endian integer.
pub async fn read_i32<R>(reader: &mut R) -> Result<i32>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_i32().await?)
}

/// Discards `len` padding bytes.
pub async fn skip_padding<R>(reader: &mut R, len: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf[..len]).await?;
    Ok(())
}

/// Reads the 12-byte protocol version banner `"RFB xxx.yyy\n"`.
///
/// # Errors
///
/// Returns `UnrecognizedProtocolElement` when the banner does not match the
/// required shape.
pub async fn read_version<R>(reader: &mut R) -> Result<(u32, u32)>
where
    R: AsyncRead + Unpin,
{
    let mut banner = [0u8; 12];
    reader.read_exact(&mut banner).await?;
    parse_version(&banner)
}

/// Parses a 12-byte version banner into (major, minor).
pub fn parse_version(banner: &[u8; 12]) -> Result<(u32, u32)> {
    let malformed = || {
        VncError::UnrecognizedProtocolElement(format!(
            "protocol version banner {:?}",
            String::from_utf8_lossy(banner)
        ))
    };

    if &banner[0..4] != b"RFB " || banner[7] != b'.' || banner[11] != b'\n' {
        return Err(malformed());
    }

    let number = |digits: &[u8]| -> Result<u32> {
        if digits.iter().all(u8::is_ascii_digit) {
            Ok(digits
                .iter()
                .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0')))
        } else {
            Err(malformed())
        }
    };

    Ok((number(&banner[4..7])?, number(&banner[8..11])?))
}

/// Writes the 12-byte protocol version banner for (major, minor).
pub async fn write_version<W>(writer: &mut W, major: u32, minor: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let banner = format!("RFB {major:03}.{minor:03}\n");
    writer.write_all(banner.as_bytes()).await?;
    Ok(())
}

/// Reads a length-prefixed UTF-8 string.
///
/// The 32-bit big-endian length must not exceed `max_len`; invalid UTF-8
/// sequences are replaced rather than rejected, since VNC clients commonly
/// send Latin-1.
///
/// # Errors
///
/// Returns `SanityCheck` when the peer announces more than `max_len` bytes.
pub async fn read_string<R>(reader: &mut R, max_len: u32) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > max_len {
        return Err(VncError::SanityCheck(format!(
            "string length {len} exceeds maximum {max_len}"
        )));
    }
    let bytes = read_bytes(reader, len as usize).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Appends a length-prefixed UTF-8 string to an outbound buffer.
#[allow(clippy::cast_possible_truncation)] // string lengths limited to u32 per VNC protocol
pub fn put_string(buf: &mut BytesMut, text: &str) {
    buf.put_u32(text.len() as u32);
    buf.put_slice(text.as_bytes());
}

/// Reads a rectangle as four 16-bit big-endian fields (x, y, w, h).
pub async fn read_region<R>(reader: &mut R) -> Result<Region>
where
    R: AsyncRead + Unpin,
{
    let x = reader.read_u16().await?;
    let y = reader.read_u16().await?;
    let width = reader.read_u16().await?;
    let height = reader.read_u16().await?;
    Ok(Region::new(x, y, width, height))
}

/// Appends a rectangle as four 16-bit big-endian fields.
pub fn put_region(buf: &mut BytesMut, region: Region) {
    buf.put_u16(region.x);
    buf.put_u16(region.y);
    buf.put_u16(region.width);
    buf.put_u16(region.height);
}

/// Reads a 16-byte pixel format blob.
pub async fn read_pixel_format<R>(reader: &mut R) -> Result<PixelFormat>
where
    R: AsyncRead + Unpin,
{
    let mut blob = BytesMut::from(&read_bytes(reader, 16).await?[..]);
    Ok(PixelFormat::from_bytes(&mut blob)?)
}
