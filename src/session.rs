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

//! VNC server session engine.
//!
//! A [`VncServerSession`] serves one client over one embedder-supplied duplex
//! byte stream. It conducts the RFB 3.8 handshake, dispatches client messages
//! to the embedder's [`SessionHandler`], and produces framebuffer updates
//! from a shadow-diff pass capped at [`max_update_rate`] frames per second.
//!
//! # Session Flow
//!
//! 1. **Handshake**: protocol version exchange, security negotiation,
//!    desktop initialization from the first captured framebuffer
//! 2. **Message loop**: the reader task handles incoming client messages in
//!    arrival order
//! 3. **Updates**: the scheduler task wakes on update requests and
//!    framebuffer-change hints, diffs against the shadow cache, and sends the
//!    changed rectangles
//!
//! Two long-lived tasks serve the session; both deliver callbacks directly,
//! so handlers must be thread-safe.
//!
//! [`max_update_rate`]: VncServerSession::max_update_rate

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;

use crate::auth::{RandomChallenge, SecurityChallenge};
use crate::cache::FramebufferCache;
use crate::error::{Result, VncError};
use crate::events::SessionHandler;
use crate::framebuffer::{Framebuffer, FramebufferSource, Region};
use crate::protocol::*;
use crate::scheduler::UpdateScheduler;
use crate::translate;
use crate::wire;

/// Default cap on framebuffer updates per second.
pub const DEFAULT_MAX_UPDATE_RATE: f64 = 15.0;

tokio::task_local! {
    /// Marks the session's own tasks so [`VncServerSession::close`] never
    /// joins the task it is called from.
    static SESSION_TASK: ();
}

/// Authentication methods a session can be configured to offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthenticationMethod {
    /// No authentication; the client connects directly.
    #[default]
    None,
    /// VNC challenge/response authentication. The embedder judges the
    /// response via [`SessionHandler::password_provided`].
    Password,
}

/// Per-connection options supplied to [`VncServerSession::connect`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// The authentication method offered to the client.
    pub authentication_method: AuthenticationMethod,
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionPhase {
    /// No connection yet.
    Fresh = 0,
    /// Protocol banners have been exchanged.
    VersionNegotiated = 1,
    /// Security negotiation finished; the challenge provider is frozen.
    SecurityNegotiated = 2,
    /// ServerInit has been sent.
    DesktopInitialized = 3,
    /// The message loop and update scheduler are running.
    Running = 4,
    /// The session has ended.
    Closed = 5,
}

impl SessionPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Fresh,
            1 => Self::VersionNegotiated,
            2 => Self::SecurityNegotiated,
            3 => Self::DesktopInitialized,
            4 => Self::Running,
            _ => Self::Closed,
        }
    }
}

/// The client's outstanding framebuffer update request. At most one is
/// pending; it is cleared only when a reply carrying at least one rectangle
/// goes out.
#[derive(Debug, Clone, Copy)]
struct UpdateRequest {
    incremental: bool,
    region: Region,
}

/// One encoded rectangle queued for the next FramebufferUpdate message.
struct UpdateRectangle {
    region: Region,
    encoding: i32,
    payload: Vec<u8>,
}

/// Everything guarded by the update lock: the pending request, the queued
/// rectangles, the shadow cache binding, and the geometry/format the client
/// last observed.
struct UpdateState {
    framebuffer: Option<Arc<Framebuffer>>,
    cache: Option<FramebufferCache>,
    pending: Option<UpdateRequest>,
    rects: Vec<UpdateRectangle>,
    client_format: PixelFormat,
    client_encodings: Vec<i32>,
    client_width: u16,
    client_height: u16,
}

struct Shared {
    handler: Arc<dyn SessionHandler>,
    options: std::sync::Mutex<SessionOptions>,
    phase: AtomicU8,
    started: AtomicBool,
    connected: AtomicBool,
    terminal_event_sent: AtomicBool,
    max_update_rate_bits: AtomicU64,
    /// Scheduler wakeup; exists before the scheduler so early
    /// `framebuffer_changed` hints are not lost.
    signal: Arc<Notify>,
    shutdown: Notify,
    writer: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    update: Mutex<UpdateState>,
    source: std::sync::Mutex<Option<Arc<dyn FramebufferSource>>>,
    challenge: std::sync::Mutex<Arc<dyn SecurityChallenge>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<UpdateScheduler>>,
    client_version: std::sync::Mutex<Option<(u32, u32)>>,
}

impl Shared {
    fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn max_update_rate(&self) -> f64 {
        f64::from_bits(self.max_update_rate_bits.load(Ordering::SeqCst))
    }

    /// Writes one complete outbound message under the stream write lock.
    async fn write_message(&self, message: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(VncError::InvalidArgument(
                "session has no connected stream".into(),
            ));
        };
        stream.write_all(message).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Server side of a single RFB session.
///
/// Cloning is cheap and clones refer to the same session.
#[derive(Clone)]
pub struct VncServerSession {
    shared: Arc<Shared>,
}

impl VncServerSession {
    /// Creates a session that reports to `handler`.
    ///
    /// The session does nothing until [`connect`](Self::connect) hands it a
    /// stream; set a framebuffer source first, since desktop initialization
    /// captures from it.
    #[must_use]
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler,
                options: std::sync::Mutex::new(SessionOptions::default()),
                phase: AtomicU8::new(SessionPhase::Fresh as u8),
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                terminal_event_sent: AtomicBool::new(false),
                max_update_rate_bits: AtomicU64::new(DEFAULT_MAX_UPDATE_RATE.to_bits()),
                signal: Arc::new(Notify::new()),
                shutdown: Notify::new(),
                writer: Mutex::new(None),
                update: Mutex::new(UpdateState {
                    framebuffer: None,
                    cache: None,
                    pending: None,
                    rects: Vec::new(),
                    client_format: PixelFormat::rgba32(),
                    client_encodings: Vec::new(),
                    client_width: 0,
                    client_height: 0,
                }),
                source: std::sync::Mutex::new(None),
                challenge: std::sync::Mutex::new(Arc::new(RandomChallenge)),
                reader: std::sync::Mutex::new(None),
                scheduler: Mutex::new(None),
                client_version: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Takes ownership of an established duplex stream and starts the
    /// session tasks. The handshake runs on the spawned reader task; its
    /// outcome arrives through the handler as either `connected` or
    /// `connection_failed`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the session was already connected.
    pub async fn connect<S>(&self, stream: S, options: SessionOptions) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(VncError::InvalidArgument(
                "session already connected".into(),
            ));
        }

        *lock(&self.shared.options) = options;
        let (read_half, write_half) = tokio::io::split(stream);
        *self.shared.writer.lock().await = Some(Box::new(write_half));

        let shared = self.shared.clone();
        let handle = tokio::spawn(SESSION_TASK.scope((), async move {
            let result = tokio::select! {
                _ = shared.shutdown.notified() => Err(VncError::Transport(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "session closed",
                ))),
                result = run_session(&shared, read_half) => result,
            };
            teardown(&shared, result).await;
        }));
        *lock(&self.shared.reader) = Some(handle);
        Ok(())
    }

    /// Ends the session. Idempotent.
    ///
    /// Blocks until the session tasks exit, except when called from inside a
    /// handler callback; there it only requests shutdown, and the tasks
    /// unwind once the callback returns.
    pub async fn close(&self) {
        self.shared.shutdown.notify_one();

        if SESSION_TASK.try_with(|_| ()).is_ok() {
            return;
        }

        let handle = lock(&self.shared.reader).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        } else {
            self.shared.set_phase(SessionPhase::Closed);
        }
    }

    /// Sets or clears the pixel source captures are taken from.
    pub fn set_framebuffer_source(&self, source: Option<Arc<dyn FramebufferSource>>) {
        *lock(&self.shared.source) = source;
    }

    /// Hints that the framebuffer contents changed; wakes the update
    /// scheduler if an update request is outstanding. Hints between two
    /// scheduler wakeups collapse into one.
    pub fn framebuffer_changed(&self) {
        self.shared.signal.notify_one();
    }

    /// The current cap on framebuffer updates per second.
    #[must_use]
    pub fn max_update_rate(&self) -> f64 {
        self.shared.max_update_rate()
    }

    /// Sets the cap on framebuffer updates per second.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for zero, negative, or non-finite rates;
    /// the current rate is left unchanged.
    pub fn set_max_update_rate(&self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(VncError::InvalidArgument(
                "max update rate must be a positive number".into(),
            ));
        }
        self.shared
            .max_update_rate_bits
            .store(rate.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    /// Replaces the authentication challenge provider.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` once security negotiation has completed;
    /// the provider is frozen from that point on.
    pub fn set_security_challenge(&self, challenge: Arc<dyn SecurityChallenge>) -> Result<()> {
        if self.shared.phase() >= SessionPhase::SecurityNegotiated {
            return Err(VncError::InvalidArgument(
                "security has already been negotiated".into(),
            ));
        }
        *lock(&self.shared.challenge) = challenge;
        Ok(())
    }

    /// The protocol version the client announced, once known.
    #[must_use]
    pub fn client_version(&self) -> Option<(u32, u32)> {
        *lock(&self.shared.client_version)
    }

    /// The session's current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Rings the client's bell.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when no stream is connected, `Transport` on
    /// write failure.
    pub async fn bell(&self) -> Result<()> {
        self.shared.write_message(&[SERVER_MSG_BELL]).await
    }

    /// Sends the server's clipboard text to the client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when no stream is connected, `Transport` on
    /// write failure.
    pub async fn send_clipboard_change(&self, text: &str) -> Result<()> {
        let mut msg = BytesMut::with_capacity(8 + text.len());
        msg.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        msg.put_bytes(0, 3); // padding
        wire::put_string(&mut msg, text);
        self.shared.write_message(&msg).await
    }

    /// Opens a manual framebuffer update and takes the update lock.
    ///
    /// Queue rectangles on the returned [`ManualUpdate`], then call
    /// [`end_update`](ManualUpdate::end_update) to send them as one message.
    /// Not for use inside [`SessionHandler::framebuffer_updating`], which
    /// already holds the open update.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless the session is running.
    pub async fn begin_update(&self) -> Result<ManualUpdate<'_>> {
        if self.shared.phase() != SessionPhase::Running {
            return Err(VncError::InvalidArgument("session is not running".into()));
        }
        let state = self.shared.update.lock().await;
        Ok(ManualUpdate {
            shared: self.shared.as_ref(),
            state,
            sent_rects: 0,
        })
    }
}

/// An open framebuffer update.
///
/// Holds the session's update lock for its whole lifetime: rectangles queued
/// here and the shadow cache cannot race with the scheduler. Dropping the
/// guard without [`end_update`](Self::end_update) keeps queued rectangles for
/// the next update instead of sending them.
pub struct ManualUpdate<'a> {
    shared: &'a Shared,
    state: MutexGuard<'a, UpdateState>,
    sent_rects: usize,
}

impl ManualUpdate<'_> {
    /// The framebuffer this update draws from.
    #[must_use]
    pub fn framebuffer(&self) -> Option<Arc<Framebuffer>> {
        self.state.framebuffer.clone()
    }

    /// The client's outstanding request as `(incremental, region)`, if any.
    #[must_use]
    pub fn pending_request(&self) -> Option<(bool, Region)> {
        self.state.pending.map(|r| (r.incremental, r.region))
    }

    /// Queues `region` to be resent as raw pixels in the client's format.
    ///
    /// The region is clamped to the framebuffer; a region that clamps to
    /// nothing is ignored.
    ///
    /// # Errors
    ///
    /// Returns `SanityCheck` when no framebuffer exists yet, `Transport` if
    /// flushing a full batch fails.
    pub async fn invalidate(&mut self, region: Region) -> Result<()> {
        let Some(framebuffer) = self.state.framebuffer.clone() else {
            return Err(VncError::SanityCheck("no framebuffer to invalidate".into()));
        };
        let region = region.clamp_to(framebuffer.width(), framebuffer.height());
        if region.is_empty() {
            return Ok(());
        }

        let client_format = self.state.client_format.clone();
        let row_len = region.width as usize * client_format.bytes_per_pixel();
        let mut payload = vec![0u8; row_len * region.height as usize];
        {
            let pixels = framebuffer.pixels();
            translate::copy_region(
                &pixels,
                framebuffer.width(),
                framebuffer.stride(),
                framebuffer.format(),
                region,
                &mut payload,
                region.width,
                row_len,
                &client_format,
            )?;
        }

        self.push_rect(UpdateRectangle {
            region,
            encoding: ENCODING_RAW,
            payload,
        })
        .await
    }

    /// Queues several regions; equivalent to repeated
    /// [`invalidate`](Self::invalidate) calls.
    ///
    /// # Errors
    ///
    /// As for [`invalidate`](Self::invalidate).
    pub async fn invalidate_regions(&mut self, regions: &[Region]) -> Result<()> {
        for region in regions {
            self.invalidate(*region).await?;
        }
        Ok(())
    }

    /// Queues the whole framebuffer.
    ///
    /// # Errors
    ///
    /// As for [`invalidate`](Self::invalidate).
    pub async fn invalidate_all(&mut self) -> Result<()> {
        let Some(framebuffer) = self.state.framebuffer.clone() else {
            return Err(VncError::SanityCheck("no framebuffer to invalidate".into()));
        };
        self.invalidate(framebuffer.bounds()).await
    }

    /// Tells the client that `target` now shows the pixels previously at
    /// `(src_x, src_y)`.
    ///
    /// Uses CopyRect when the client has advertised it. Otherwise the pixels
    /// are resent raw: either the bounding box of source and target, or the
    /// two rectangles separately, whichever covers less area.
    ///
    /// # Errors
    ///
    /// As for [`invalidate`](Self::invalidate).
    pub async fn copy_region(&mut self, target: Region, src_x: u16, src_y: u16) -> Result<()> {
        let Some(framebuffer) = self.state.framebuffer.clone() else {
            return Err(VncError::SanityCheck("no framebuffer to copy within".into()));
        };
        let target = target.clamp_to(framebuffer.width(), framebuffer.height());
        if target.is_empty() {
            return Ok(());
        }

        if self.state.client_encodings.contains(&ENCODING_COPYRECT) {
            let mut payload = Vec::with_capacity(4);
            payload.extend_from_slice(&src_x.to_be_bytes());
            payload.extend_from_slice(&src_y.to_be_bytes());
            debug!(
                "copy region ({},{}) -> ({},{} {}x{}) via CopyRect",
                src_x, src_y, target.x, target.y, target.width, target.height
            );
            return self
                .push_rect(UpdateRectangle {
                    region: target,
                    encoding: ENCODING_COPYRECT,
                    payload,
                })
                .await;
        }

        let source = Region::new(src_x, src_y, target.width, target.height);
        let bounding = source.union(&target);
        if u64::from(source.area()) + u64::from(target.area()) < u64::from(bounding.area()) {
            self.invalidate(source).await?;
            self.invalidate(target).await
        } else {
            self.invalidate(bounding).await
        }
    }

    /// Runs the shadow-diff pass against the pending request, queueing the
    /// changed rectangles.
    pub(crate) async fn respond_with_cache(&mut self) -> Result<()> {
        let Some(request) = self.state.pending else {
            return Ok(());
        };
        let Some(framebuffer) = self.state.framebuffer.clone() else {
            return Ok(());
        };

        // The shadow is only meaningful for the framebuffer it was built
        // from; rebuild on any identity change.
        let mut cache = match self.state.cache.take() {
            Some(cache) if cache.is_bound_to(&framebuffer) => cache,
            _ => FramebufferCache::new(framebuffer.clone()),
        };
        let changed = cache.diff_region(request.region, request.incremental);
        self.state.cache = Some(cache);

        for region in changed {
            self.invalidate(region).await?;
        }
        Ok(())
    }

    /// Closes the update: advertises a desktop resize if the framebuffer
    /// dimensions no longer match what the client saw (and the client opted
    /// in to DesktopSize), then sends the queued rectangles as one
    /// FramebufferUpdate message.
    ///
    /// Returns whether anything was sent. A reply carrying at least one
    /// rectangle clears the pending request.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the write fails.
    pub async fn end_update(mut self) -> Result<bool> {
        if let Some(framebuffer) = self.state.framebuffer.clone() {
            let resized = framebuffer.width() != self.state.client_width
                || framebuffer.height() != self.state.client_height;
            if resized && self.state.client_encodings.contains(&ENCODING_DESKTOP_SIZE) {
                self.state.rects.insert(
                    0,
                    UpdateRectangle {
                        region: Region::new(0, 0, framebuffer.width(), framebuffer.height()),
                        encoding: ENCODING_DESKTOP_SIZE,
                        payload: Vec::new(),
                    },
                );
                self.state.client_width = framebuffer.width();
                self.state.client_height = framebuffer.height();
                info!(
                    "advertising desktop resize to {}x{}",
                    framebuffer.width(),
                    framebuffer.height()
                );
            }
        }

        self.flush_batch().await?;
        Ok(self.sent_rects > 0)
    }

    async fn push_rect(&mut self, rect: UpdateRectangle) -> Result<()> {
        if self.state.rects.len() >= MAX_RECTANGLES_PER_UPDATE {
            debug!(
                "rectangle batch full at {} entries, flushing early",
                self.state.rects.len()
            );
            self.flush_batch().await?;
        }
        self.state.rects.push(rect);
        Ok(())
    }

    /// Sends all queued rectangles as one FramebufferUpdate message and
    /// clears the pending request.
    #[allow(clippy::cast_possible_truncation)] // batches are capped below u16::MAX
    async fn flush_batch(&mut self) -> Result<()> {
        if self.state.rects.is_empty() {
            return Ok(());
        }

        let count = self.state.rects.len();
        let size: usize = self.state.rects.iter().map(|r| 12 + r.payload.len()).sum();
        let mut msg = BytesMut::with_capacity(4 + size);
        msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        msg.put_u8(0); // padding
        msg.put_u16(count as u16);
        for rect in self.state.rects.drain(..) {
            Rectangle {
                x: rect.region.x,
                y: rect.region.y,
                width: rect.region.width,
                height: rect.region.height,
                encoding: rect.encoding,
            }
            .write_header(&mut msg);
            msg.extend_from_slice(&rect.payload);
        }
        self.state.pending = None;
        self.sent_rects += count;

        self.shared.write_message(&msg).await?;
        debug!("sent framebuffer update: {count} rectangle(s), {} bytes", msg.len());
        Ok(())
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_session<R>(shared: &Arc<Shared>, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    handshake(shared, &mut reader).await?;

    let scheduler = {
        let action_shared = shared.clone();
        let rate_shared = shared.clone();
        UpdateScheduler::start(
            shared.signal.clone(),
            move || {
                let shared = action_shared.clone();
                async move { SESSION_TASK.scope((), send_changes(&shared)).await }
            },
            move || rate_shared.max_update_rate(),
            false,
        )
    };
    *shared.scheduler.lock().await = Some(scheduler);

    shared.connected.store(true, Ordering::SeqCst);
    shared.set_phase(SessionPhase::Running);
    shared.handler.connected().await;
    info!("VNC client handshake completed");

    loop {
        dispatch_message(shared, &mut reader).await?;
    }
}

/// Runs the fixed handshake sequence; any error is fatal to the session.
async fn handshake<R>(shared: &Arc<Shared>, reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    // Protocol version
    shared.write_message(PROTOCOL_VERSION.as_bytes()).await?;
    let client_version = wire::read_version(reader).await?;
    info!(
        "client protocol version {}.{}",
        client_version.0, client_version.1
    );
    *lock(&shared.client_version) = Some(client_version);
    shared.set_phase(SessionPhase::VersionNegotiated);

    // Security negotiation. Anything other than 3.8 gets the empty set,
    // which fails the handshake after telling the client why.
    let configured = lock(&shared.options).authentication_method;
    let offered: Vec<u8> = if client_version == SERVER_VERSION {
        match configured {
            AuthenticationMethod::Password => vec![SECURITY_TYPE_VNC_AUTH],
            AuthenticationMethod::None => vec![SECURITY_TYPE_NONE],
        }
    } else {
        Vec::new()
    };

    if offered.is_empty() {
        let mut msg = BytesMut::new();
        msg.put_u8(0);
        wire::put_string(&mut msg, "unsupported protocol version");
        shared.write_message(&msg).await?;
        return Err(VncError::NoSupportedAuthenticationMethods);
    }

    let mut msg = BytesMut::new();
    msg.put_u8(u8::try_from(offered.len()).unwrap_or(u8::MAX));
    msg.put_slice(&offered);
    shared.write_message(&msg).await?;

    let selected = wire::read_u8(reader).await?;
    if !offered.contains(&selected) {
        return Err(VncError::UnrecognizedProtocolElement(format!(
            "security type {selected}"
        )));
    }

    if selected == SECURITY_TYPE_VNC_AUTH {
        let challenge = lock(&shared.challenge).generate_challenge();
        shared.write_message(&challenge).await?;

        let mut response = [0u8; 16];
        response.copy_from_slice(&wire::read_bytes(reader, 16).await?);
        let accepted = shared.handler.password_provided(&challenge, &response).await;

        let mut status = BytesMut::new();
        status.put_u32(if accepted {
            SECURITY_RESULT_OK
        } else {
            SECURITY_RESULT_FAILED
        });
        shared.write_message(&status).await?;

        if !accepted {
            return Err(VncError::AuthenticationFailed);
        }
        info!("VNC authentication accepted");
    } else {
        let mut status = BytesMut::new();
        status.put_u32(SECURITY_RESULT_OK);
        shared.write_message(&status).await?;
    }
    shared.set_phase(SessionPhase::SecurityNegotiated);

    // Desktop initialization
    let shared_desktop = wire::read_u8(reader).await? != 0;
    shared.handler.creating_desktop(shared_desktop).await;

    let source = lock(&shared.source).clone().ok_or_else(|| {
        VncError::SanityCheck("no framebuffer source to initialize the desktop".into())
    })?;
    let framebuffer = source.capture().await?;

    let server_init = ServerInit {
        framebuffer_width: framebuffer.width(),
        framebuffer_height: framebuffer.height(),
        pixel_format: framebuffer.format().clone(),
        name: framebuffer.name().to_string(),
    };

    {
        let mut state = shared.update.lock().await;
        state.client_format = framebuffer.format().clone();
        state.client_width = framebuffer.width();
        state.client_height = framebuffer.height();
        state.framebuffer = Some(framebuffer);
        // No encodings are assumed until the client announces some.
        state.client_encodings.clear();
    }

    let mut msg = BytesMut::new();
    server_init.write_to(&mut msg);
    shared.write_message(&msg).await?;
    shared.set_phase(SessionPhase::DesktopInitialized);
    info!(
        "desktop initialized: {}x{} \"{}\"",
        server_init.framebuffer_width, server_init.framebuffer_height, server_init.name
    );
    Ok(())
}

/// Reads and handles one client message. Unknown message types are fatal;
/// the RFB stream has no framing to recover with.
async fn dispatch_message<R>(shared: &Arc<Shared>, reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let msg_type = wire::read_u8(reader).await?;
    match msg_type {
        CLIENT_MSG_SET_PIXEL_FORMAT => {
            wire::skip_padding(reader, 3).await?;
            let format = wire::read_pixel_format(reader).await?;
            if !format.is_valid() {
                return Err(VncError::UnrecognizedProtocolElement(format!(
                    "pixel format (bpp={}, depth={}, truecolor={})",
                    format.bits_per_pixel, format.depth, format.true_colour_flag
                )));
            }
            info!(
                "client set pixel format: {}bpp, depth {}, R{}:{} G{}:{} B{}:{}",
                format.bits_per_pixel,
                format.depth,
                format.red_shift,
                format.red_max,
                format.green_shift,
                format.green_max,
                format.blue_shift,
                format.blue_max
            );
            shared.update.lock().await.client_format = format;
        }
        CLIENT_MSG_SET_ENCODINGS => {
            wire::skip_padding(reader, 1).await?;
            let count = wire::read_u16(reader).await? as usize;
            if count > MAX_CLIENT_ENCODINGS {
                return Err(VncError::SanityCheck(format!(
                    "client announced {count} encodings"
                )));
            }
            let mut encodings = Vec::with_capacity(count);
            for _ in 0..count {
                encodings.push(wire::read_i32(reader).await?);
            }
            info!("client set {} encodings: {:?}", count, encodings);
            shared.update.lock().await.client_encodings = encodings;
        }
        CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
            let incremental = wire::read_u8(reader).await? != 0;
            let region = wire::read_region(reader).await?;
            debug!(
                "framebuffer update request: incremental={} region=({},{} {}x{})",
                incremental, region.x, region.y, region.width, region.height
            );

            let mut state = shared.update.lock().await;
            if let Some(framebuffer) = &state.framebuffer {
                let region = region.clamp_to(framebuffer.width(), framebuffer.height());
                if !region.is_empty() {
                    state.pending = Some(UpdateRequest {
                        incremental,
                        region,
                    });
                    shared.signal.notify_one();
                }
            }
        }
        CLIENT_MSG_KEY_EVENT => {
            let pressed = wire::read_u8(reader).await? != 0;
            wire::skip_padding(reader, 2).await?;
            let keysym = wire::read_u32(reader).await?;
            shared.handler.key_changed(keysym, pressed).await;
        }
        CLIENT_MSG_POINTER_EVENT => {
            let button_mask = wire::read_u8(reader).await?;
            let x = wire::read_u16(reader).await?;
            let y = wire::read_u16(reader).await?;
            shared.handler.pointer_changed(x, y, button_mask).await;
        }
        CLIENT_MSG_CLIENT_CUT_TEXT => {
            wire::skip_padding(reader, 3).await?;
            let text = wire::read_string(reader, MAX_CUT_TEXT_LENGTH).await?;
            shared.handler.remote_clipboard_changed(text).await;
        }
        other => {
            return Err(VncError::UnrecognizedProtocolElement(format!(
                "client message type {other}"
            )));
        }
    }
    Ok(())
}

/// The scheduler action: one capture-diff-send pass.
async fn send_changes(shared: &Arc<Shared>) -> bool {
    match try_send_changes(shared).await {
        Ok(sent) => sent,
        Err(e) => {
            error!("framebuffer update failed: {e}");
            shared.shutdown.notify_one();
            false
        }
    }
}

async fn try_send_changes(shared: &Arc<Shared>) -> Result<bool> {
    let mut state = shared.update.lock().await;
    if state.pending.is_none() {
        return Ok(false);
    }

    shared.handler.framebuffer_capturing().await;
    let source = lock(&shared.source).clone();
    if let Some(source) = source {
        match source.capture().await {
            Ok(framebuffer) => state.framebuffer = Some(framebuffer),
            // Capture failures are not fatal; serve the previous frame.
            Err(e) => warn!("framebuffer capture failed, serving the previous frame: {e}"),
        }
    }

    let mut update = ManualUpdate {
        shared: shared.as_ref(),
        state,
        sent_rects: 0,
    };
    let handled = shared.handler.framebuffer_updating(&mut update).await;
    if !handled {
        update.respond_with_cache().await?;
    }
    update.end_update().await
}

async fn teardown(shared: &Arc<Shared>, result: Result<()>) {
    match &result {
        Ok(()) => {}
        Err(VncError::Transport(e)) if e.kind() == io::ErrorKind::Interrupted => {
            debug!("session closed locally");
        }
        Err(e) => error!("session ended: {e}"),
    }

    if let Some(scheduler) = shared.scheduler.lock().await.take() {
        scheduler.stop().await;
    }

    if let Some(mut writer) = shared.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }

    shared.set_phase(SessionPhase::Closed);

    if !shared.terminal_event_sent.swap(true, Ordering::SeqCst) {
        if shared.connected.load(Ordering::SeqCst) {
            shared.handler.closed().await;
        } else {
            shared.handler.connection_failed().await;
        }
    }
}
