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


//! # rustvncsession
//!
//! A pure Rust implementation of the server side of a VNC (RFB) session.
//!
//! This library serves a single VNC client over an already-established
//! duplex byte stream. It conducts the RFB 3.8 handshake (RFC 6143),
//! dispatches client input and clipboard messages to the embedding
//! application, and produces framebuffer updates from a line-granular shadow
//! diff, rate-capped and driven by client requests. The transport, the
//! listener, and the screen capture itself stay with the embedder.
//!
//! ## Features
//!
//! - **RFB 3.8 handshake**: version negotiation, None and VNC
//!   challenge/response authentication with a pluggable challenge source
//! - **Shadow-diff updates**: changed scanlines are detected against a
//!   server-side copy of what the client last saw and coalesced into minimal
//!   rectangles
//! - **Raw, CopyRect and DesktopSize encodings**: resizes are advertised
//!   when the pixel source changes dimensions
//! - **All true-color pixel formats**: 8/16/24/32-bit, either endianness,
//!   converted per the client's SetPixelFormat
//! - **Async I/O**: built on Tokio; one reader task and one rate-capped
//!   update task per session
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rustvncsession::{
//!     Framebuffer, FramebufferSource, PixelFormat, Result, SessionHandler,
//!     SessionOptions, VncServerSession,
//! };
//!
//! struct Screen {
//!     framebuffer: Arc<Framebuffer>,
//! }
//!
//! #[async_trait::async_trait]
//! impl FramebufferSource for Screen {
//!     async fn capture(&self) -> Result<Arc<Framebuffer>> {
//!         // Draw into self.framebuffer here.
//!         Ok(self.framebuffer.clone())
//!     }
//! }
//!
//! struct Events;
//!
//! #[async_trait::async_trait]
//! impl SessionHandler for Events {
//!     async fn key_changed(&self, keysym: u32, pressed: bool) {
//!         println!("key {keysym:#x} pressed={pressed}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5900").await?;
//!     let (stream, _) = listener.accept().await?;
//!
//!     let screen = Screen {
//!         framebuffer: Arc::new(Framebuffer::new(1920, 1080, PixelFormat::rgba32(), "demo")),
//!     };
//!     let session = VncServerSession::new(Arc::new(Events));
//!     session.set_framebuffer_source(Some(Arc::new(screen)));
//!     session.connect(stream, SessionOptions::default()).await?;
//!
//!     // ... later, after drawing:
//!     session.framebuffer_changed();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │            Your Application               │
//! │                                           │
//! │  • Supply the stream and pixel source     │
//! │  • Receive input/clipboard events         │
//! │  • Hint when the framebuffer changes      │
//! └──────────────────┬────────────────────────┘
//!                    │
//!                    ▼
//! ┌───────────────────────────────────────────┐
//! │         VncServerSession (Public)         │
//! │                                           │
//! │  reader task          update task         │
//! │  • handshake          • rate-capped       │
//! │  • message dispatch   • capture + diff    │
//! └──────────┬──────────────────┬─────────────┘
//!            │                  │
//!            ▼                  ▼
//! ┌────────────────┐  ┌─────────────────────┐
//! │ SessionHandler │  │  Shadow cache       │
//! │ callbacks      │  │  • line-granular    │
//! │                │  │    diff + coalesce  │
//! └────────────────┘  └─────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod protocol;
pub mod session;
pub mod wire;

// Internal modules
mod cache;
mod scheduler;
mod translate;

// Re-exports
pub use auth::{RandomChallenge, SecurityChallenge};
pub use error::{Result, VncError};
pub use events::SessionHandler;
pub use framebuffer::{Framebuffer, FramebufferSource, Region};
pub use protocol::PixelFormat;
pub use session::{
    AuthenticationMethod, ManualUpdate, SessionOptions, SessionPhase, VncServerSession,
    DEFAULT_MAX_UPDATE_RATE,
};

/// VNC protocol version.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
