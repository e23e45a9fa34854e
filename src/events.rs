//! Session events delivered to the embedding application.

use async_trait::async_trait;

use crate::session::ManualUpdate;

/// Callbacks raised by a [`VncServerSession`](crate::VncServerSession).
///
/// Delivery is synchronous on the session task that produced the event: the
/// handshake and message dispatch run on the reader task, update callbacks on
/// the scheduler task. Implementations must therefore be thread-safe, and
/// should not block for long; the session makes no progress while a callback
/// runs.
///
/// Every method has a default, so embedders implement only what they need.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// The client answered a VNC authentication challenge.
    ///
    /// Return `true` to accept the credentials. Embedders holding a plaintext
    /// password can decide with
    /// [`verify_challenge_response`](crate::auth::verify_challenge_response).
    /// The default rejects everything.
    async fn password_provided(&self, _challenge: &[u8; 16], _response: &[u8; 16]) -> bool {
        false
    }

    /// The client sent its init message; `shared` is its shared-desktop flag.
    async fn creating_desktop(&self, _shared: bool) {}

    /// The handshake completed and the session is running.
    async fn connected(&self) {}

    /// The session ended before the handshake completed.
    async fn connection_failed(&self) {}

    /// A previously running session ended.
    async fn closed(&self) {}

    /// An update pass is about to capture from the framebuffer source.
    async fn framebuffer_capturing(&self) {}

    /// An update pass is assembling a reply.
    ///
    /// The handler may queue rectangles on `update` itself and return `true`
    /// to mark the request handled, in which case the session skips its
    /// shadow-diff pass and sends whatever was queued. Do not call
    /// [`begin_update`](crate::VncServerSession::begin_update) from inside
    /// this callback; `update` is the already-open update.
    async fn framebuffer_updating(&self, _update: &mut ManualUpdate<'_>) -> bool {
        false
    }

    /// A key was pressed or released.
    async fn key_changed(&self, _keysym: u32, _pressed: bool) {}

    /// The pointer moved or a button changed state.
    async fn pointer_changed(&self, _x: u16, _y: u16, _button_mask: u8) {}

    /// The client sent clipboard text.
    async fn remote_clipboard_changed(&self, _text: String) {}
}
