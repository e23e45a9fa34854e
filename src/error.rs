//! Error types for the VNC session library.

use std::io;
use thiserror::Error;

/// Result type for VNC session operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur while running a VNC server session.
#[derive(Debug, Error)]
pub enum VncError {
    /// The underlying stream failed or ended unexpectedly.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent an ill-formed or unsupported value at a position the
    /// protocol defines.
    #[error("unrecognized protocol element: {0}")]
    UnrecognizedProtocolElement(String),

    /// The intersection of offered and configured authentication methods is
    /// empty.
    #[error("no supported authentication methods")]
    NoSupportedAuthenticationMethods,

    /// The embedder rejected the client's credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Self-consistency violation, such as a missing framebuffer or an
    /// impossibly large count.
    #[error("sanity check failed: {0}")]
    SanityCheck(String),

    /// Caller misuse of the embedder API.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
