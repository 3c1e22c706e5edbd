//! A secure, bidirectional RPC transport.
//!
//! Two mutually-authenticated peers exchange typed request/response messages
//! over long-lived, certificate-pinned TLS sessions. Either side of a
//! connection may originate requests: a *listener* accepts connections and
//! serves requests, while a *poller* dials out to a listener and then serves
//! requests arriving over that same socket. This lets a node behind a
//! firewall act as a server without accepting a single inbound connection.
//!
//! The pieces, bottom up:
//!
//! * [`framing`]: length-delimited, compressed, typed frames on a stream;
//! * [`protocol`]: the identity preamble and the turn-taking exchange
//!   state machine;
//! * [`queue`]: the per-subscription rendezvous between outbound callers
//!   and inbound pollers;
//! * [`pool`]: keyed reuse of authenticated idle connections;
//! * [`client`] / [`listener`] / [`polling`]: the dialling, accepting, and
//!   subscribing halves of the transport;
//! * [`runtime`]: the top-level wiring (trust set, route table, queues,
//!   service dispatch).

pub mod client;
pub mod config;
pub mod defaults;
pub mod error;
pub mod framing;
pub mod listener;
pub mod message;
pub mod pool;
pub mod polling;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod service;
pub mod tls;

pub use crate::{
    config::Config,
    error::TransportError,
    listener::FriendlyPage,
    message::{
        ErrorDetail, RemoteIdentity, RequestMessage, ResponseMessage, Scheme, ServiceEndpoint,
    },
    queue::PendingRequestQueue,
    runtime::TransportRuntime,
    service::{InvokeError, RequestHandler, Service, ServiceRegistry},
    tls::{Identity, Thumbprint, TrustSet},
};
