//! The error surface of the transport.
//!
//! Every failure a caller can observe is one of these kinds; service-level
//! failures are not transport errors and travel back inside the response
//! message instead.

use {std::io, thiserror::Error};

use crate::tls::Thumbprint;

/// An error raised by the transport while sending, receiving, or dispatching
/// a message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The destination URI scheme is neither `https` nor `poll`.
    #[error("unrecognized destination scheme: {0}")]
    UnknownScheme(String),

    /// The TLS peer presented a leaf certificate whose thumbprint does not
    /// match the one pinned for the endpoint. Never retried.
    #[error("server presented thumbprint {presented}, expected {pinned}")]
    UnknownServerThumbprint {
        presented: Thumbprint,
        pinned: Thumbprint,
    },

    /// An inbound connection authenticated with a thumbprint that is not in
    /// the trust set, or presented no client certificate at all.
    #[error("client thumbprint {0:?} is not trusted")]
    UntrustedClient(Option<Thumbprint>),

    /// The remote sent something the protocol does not allow here: a bad
    /// preamble, an unexpected turn token, an oversized frame, or bytes that
    /// do not decode. The stream must be destroyed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An in-flight exchange exceeded its deadline. The stream must be
    /// destroyed.
    #[error("transport deadline exceeded")]
    TransportTimeout,

    /// A request sat in a pending-request queue past its deadline without
    /// any subscriber claiming it.
    #[error("request expired before any subscriber collected it")]
    PollingTimeout,

    /// The runtime was disposed while the operation was in progress.
    #[error("transport runtime has shut down")]
    Shutdown,

    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The TLS handshake itself failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),
}

impl TransportError {
    /// Shorthand for a [`TransportError::ProtocolViolation`].
    pub(crate) fn protocol(message: impl Into<String>) -> TransportError {
        TransportError::ProtocolViolation(message.into())
    }

    /// Whether a failed transaction on a *pooled* stream may be transparently
    /// retried on a freshly dialled one. Only plain I/O failures qualify: a
    /// pooled stream that died while idle surfaces as one of these on first
    /// use. Deadline, pinning, and protocol failures are never retried.
    pub(crate) fn is_stale_connection_error(&self) -> bool {
        matches!(self, TransportError::Io(_))
    }
}
