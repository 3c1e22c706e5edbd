//! The message-exchange protocol: the identity preamble and the turn-taking
//! state machine that carries request/response bursts over one
//! mutually-authenticated stream.
//!
//! A session is strictly turn-taking. The *requesting* side sends one typed
//! request and waits for one typed response; between bursts it announces
//! `NEXT` and waits for `PROCEED`, or says `END` when it is done. The
//! *responding* side answers requests and acknowledges every `NEXT` with
//! `PROCEED`. The same two machines serve both connection directions: a
//! listener drains a subscription with the requester machine, and the poller
//! that dialled it runs the responder machine, which is exactly what a
//! listener runs for an ordinary client.

use {
    http::Uri,
    std::{io, sync::Arc, time::Duration},
    tokio::io::{AsyncRead, AsyncWrite},
    tracing::{debug, warn},
};

use crate::{
    error::TransportError,
    framing::FramedStream,
    message::{RemoteIdentity, RequestMessage, ResponseMessage},
    queue::PendingRequestQueue,
    service::RequestHandler,
};

pub(crate) const PROTOCOL_VERSION: &str = "1.0";

const CLIENT_HELLO: &str = "MX-CLIENT";
const SUBSCRIBER_HELLO: &str = "MX-SUBSCRIBER";
const SERVER_HELLO: &str = "MX-SERVER";

const NEXT: &str = "NEXT";
const PROCEED: &str = "PROCEED";
const END: &str = "END";

/// Render the preamble line for an identity.
pub(crate) fn identity_line(identity: &RemoteIdentity) -> String {
    match identity {
        RemoteIdentity::Client => format!("{} {}", CLIENT_HELLO, PROTOCOL_VERSION),
        RemoteIdentity::Server => format!("{} {}", SERVER_HELLO, PROTOCOL_VERSION),
        RemoteIdentity::Subscriber(subscription) => format!(
            "{} {} {}",
            SUBSCRIBER_HELLO, PROTOCOL_VERSION, subscription
        ),
    }
}

/// Parse one preamble line. Format violations are fatal protocol errors.
pub(crate) fn parse_identity(line: &str) -> Result<RemoteIdentity, TransportError> {
    let mut parts = line.split_whitespace();
    let hello = parts
        .next()
        .ok_or_else(|| TransportError::protocol("empty identity preamble"))?;
    let version = parts
        .next()
        .ok_or_else(|| TransportError::protocol("identity preamble carries no version"))?;
    if version != PROTOCOL_VERSION {
        return Err(TransportError::protocol(format!(
            "unsupported protocol version '{}'",
            version
        )));
    }
    let identity = match hello {
        CLIENT_HELLO => RemoteIdentity::Client,
        SERVER_HELLO => RemoteIdentity::Server,
        SUBSCRIBER_HELLO => {
            let url = parts.next().ok_or_else(|| {
                TransportError::protocol("subscriber preamble carries no subscription URL")
            })?;
            let subscription: Uri = url
                .parse()
                .map_err(|_| TransportError::protocol("subscription URL does not parse"))?;
            if subscription.scheme().is_none() {
                return Err(TransportError::protocol(
                    "subscription URL must be absolute",
                ));
            }
            RemoteIdentity::Subscriber(subscription)
        }
        other => {
            return Err(TransportError::protocol(format!(
                "unrecognized identity preamble '{}'",
                other
            )));
        }
    };
    if parts.next().is_some() && !matches!(identity, RemoteIdentity::Subscriber(_)) {
        return Err(TransportError::protocol("trailing data after identity"));
    }
    Ok(identity)
}

/// Announce `identity` on a freshly dialled stream and consume the server's
/// acknowledgment.
pub(crate) async fn identify<S>(
    framed: &mut FramedStream<S>,
    identity: &RemoteIdentity,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.write_line(&identity_line(identity)).await?;
    let ack = framed.read_line().await?;
    match parse_identity(&ack)? {
        RemoteIdentity::Server => Ok(()),
        other => Err(TransportError::protocol(format!(
            "peer acknowledged with {:?} instead of a server identity",
            other
        ))),
    }
}

/// Acknowledge a parsed identity preamble on an accepted stream.
pub(crate) async fn acknowledge_identity<S>(
    framed: &mut FramedStream<S>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.write_line(&identity_line(&RemoteIdentity::Server)).await
}

/// States of the requesting side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    /// Free to send a request immediately.
    Idle,
    /// A request is on the wire; its response has not arrived.
    AwaitResponse,
    /// A burst completed; the next one must be announced with `NEXT`, or the
    /// session ended with `END`, or the stream pooled as-is.
    Decide,
    /// `NEXT` is on the wire; `PROCEED` has not arrived.
    AwaitProceed,
    /// The session is over, cleanly or not; the stream must not be reused.
    Terminal,
}

/// A message-exchange session bound to one identified stream.
///
/// The instance assumes exclusive access to its stream; it is driven by one
/// task at a time.
pub struct MessageExchange<S> {
    framed: FramedStream<S>,
    state: ExchangeState,
}

impl<S> MessageExchange<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(framed: FramedStream<S>) -> MessageExchange<S> {
        MessageExchange {
            framed,
            state: ExchangeState::Idle,
        }
    }

    /// Run one burst as the requesting side: send `request`, return its
    /// response. On a stream that already carried a burst, the new one is
    /// first announced with `NEXT`/`PROCEED`.
    ///
    /// Any failure leaves the session terminal; the stream must be destroyed
    /// rather than pooled.
    pub async fn exchange_as_client(
        &mut self,
        request: &RequestMessage,
    ) -> Result<ResponseMessage, TransportError> {
        let result = self.request_burst(request).await;
        if result.is_err() {
            self.state = ExchangeState::Terminal;
        }
        result
    }

    async fn request_burst(
        &mut self,
        request: &RequestMessage,
    ) -> Result<ResponseMessage, TransportError> {
        match self.state {
            ExchangeState::Idle => {}
            ExchangeState::Decide => {
                self.framed.write_line(NEXT).await?;
                self.state = ExchangeState::AwaitProceed;
                self.expect_token(PROCEED).await?;
                self.state = ExchangeState::Idle;
            }
            _ => {
                return Err(TransportError::protocol(
                    "exchange is terminal or mid-burst",
                ));
            }
        }

        self.framed.send_typed(request).await?;
        self.state = ExchangeState::AwaitResponse;
        let response: ResponseMessage = self.framed.receive_typed().await?;
        if response.id != request.id {
            return Err(TransportError::protocol(format!(
                "response answers request '{}', expected '{}'",
                response.id, request.id
            )));
        }
        self.state = ExchangeState::Decide;
        Ok(response)
    }

    /// End the session gracefully with `END` and close the stream. Used when
    /// a stream is retired instead of pooled.
    pub async fn finish(mut self) -> Result<(), TransportError> {
        match self.state {
            ExchangeState::Idle | ExchangeState::Decide => {
                self.framed.write_line(END).await?;
                self.state = ExchangeState::Terminal;
                self.framed.shutdown().await
            }
            _ => Ok(()),
        }
    }

    /// Serve bursts as the responding side until the requester says `END` or
    /// departs between bursts.
    ///
    /// This is the loop a listener runs for a client, and equally the loop a
    /// poller runs after identifying as a subscriber.
    pub async fn serve_requests(
        &mut self,
        handler: &dyn RequestHandler,
    ) -> Result<(), TransportError> {
        let result = self.respond_loop(handler).await;
        self.state = ExchangeState::Terminal;
        result
    }

    async fn respond_loop(&mut self, handler: &dyn RequestHandler) -> Result<(), TransportError> {
        loop {
            // WAIT_REQUEST: a peer that pooled its stream may park here
            // indefinitely, or close it without another word.
            let request: RequestMessage = match self.receive_request_or_eof().await? {
                Some(request) => request,
                None => {
                    debug!("peer departed between bursts");
                    return Ok(());
                }
            };

            // HANDLE
            let response = handler.handle(request).await;
            self.framed.send_typed(&response).await?;

            // EXPECT_TURN
            match self.framed.read_line_or_eof().await? {
                None => {
                    debug!("peer departed between bursts");
                    return Ok(());
                }
                Some(token) if token == NEXT => {
                    self.framed.write_line(PROCEED).await?;
                }
                Some(token) if token == END => return Ok(()),
                Some(other) => {
                    return Err(TransportError::protocol(format!(
                        "unexpected turn token '{}'",
                        other
                    )));
                }
            }
        }
    }

    /// Drain `queue` as the requesting side of an inverted session: the
    /// subscriber on the other end of this stream serves our requests.
    ///
    /// Ends the session with `END` when the queue stays empty for `max_wait`.
    /// A failure mid-burst abandons the in-flight entry so its caller is
    /// woken with the transport failure.
    pub async fn drain_subscription(
        &mut self,
        queue: &PendingRequestQueue,
        max_wait: Duration,
    ) -> Result<(), TransportError> {
        loop {
            // POLL_QUEUE
            let entry = match queue.dequeue(max_wait).await {
                Some(entry) => entry,
                None => {
                    self.framed.write_line(END).await?;
                    self.state = ExchangeState::Terminal;
                    return Ok(());
                }
            };

            let outcome = async {
                if self.state == ExchangeState::Decide {
                    self.framed.write_line(NEXT).await?;
                    self.state = ExchangeState::AwaitProceed;
                    self.expect_token(PROCEED).await?;
                    self.state = ExchangeState::Idle;
                }

                // SEND_REQUEST
                self.framed.send_typed(entry.request()).await?;
                self.state = ExchangeState::AwaitResponse;

                // AWAIT_RESPONSE
                let response: ResponseMessage = self.framed.receive_typed().await?;
                if response.id != entry.request().id {
                    return Err(TransportError::protocol(format!(
                        "response answers request '{}', expected '{}'",
                        response.id,
                        entry.request().id
                    )));
                }
                self.state = ExchangeState::Decide;
                Ok(response)
            }
            .await;

            match outcome {
                Ok(response) => queue.complete(entry, response),
                Err(error) => {
                    self.state = ExchangeState::Terminal;
                    warn!(%error, "subscriber stream failed mid-burst");
                    queue.abandon(
                        entry,
                        TransportError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            format!("subscriber stream failed mid-burst: {}", error),
                        )),
                    );
                    return Err(error);
                }
            }
        }
    }

    /// Dispatch an accepted, identified stream: serve a client's requests, or
    /// drain the pending-request queue a subscriber came to collect.
    pub async fn exchange_as_server(
        &mut self,
        identity: RemoteIdentity,
        handler: &dyn RequestHandler,
        queue_for: impl FnOnce(&Uri) -> Arc<PendingRequestQueue>,
        queue_wait: Duration,
    ) -> Result<(), TransportError> {
        match identity {
            RemoteIdentity::Client => self.serve_requests(handler).await,
            RemoteIdentity::Subscriber(subscription) => {
                debug!(%subscription, "subscriber session started");
                let queue = queue_for(&subscription);
                self.drain_subscription(&queue, queue_wait).await
            }
            RemoteIdentity::Server => Err(TransportError::protocol(
                "peer identified as a server on an inbound connection",
            )),
        }
    }

    async fn receive_request_or_eof(&mut self) -> Result<Option<RequestMessage>, TransportError> {
        match self.framed.receive_typed().await {
            Ok(request) => Ok(Some(request)),
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn expect_token(&mut self, expected: &str) -> Result<(), TransportError> {
        let token = self.framed.read_line().await?;
        if token == expected {
            Ok(())
        } else {
            Err(TransportError::protocol(format!(
                "expected '{}', got '{}'",
                expected, token
            )))
        }
    }
}
