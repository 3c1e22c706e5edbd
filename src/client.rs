//! The dialling side of the transport: TCP + TLS + thumbprint pin + identity
//! exchange, with pooled reuse of streams that finished a burst cleanly.

use {
    std::{
        future::Future,
        io,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::{net::TcpStream, time::timeout},
    tokio_rustls::{client::TlsStream, rustls, webpki::DNSNameRef, TlsConnector},
    tracing::debug,
};

use crate::{
    config::Config,
    error::TransportError,
    framing::FramedStream,
    message::{RemoteIdentity, RequestMessage, ResponseMessage, ServiceEndpoint},
    pool::ConnectionPool,
    protocol::{self, MessageExchange},
    tls::{self, Identity},
};

/// SNI placeholder used when the endpoint host is not a DNS name (an IP
/// address, typically). The pin check carries the authentication either way.
const SNI_PLACEHOLDER: &str = "pinned.invalid";

/// An exchange session over an authenticated outbound stream.
pub type ClientExchange = MessageExchange<TlsStream<TcpStream>>;

/// Dials endpoints, verifies their pinned thumbprints, and runs one-burst
/// transactions over pooled streams.
pub struct SecureClient {
    tls_config: Arc<rustls::ClientConfig>,
    pool: ConnectionPool<ServiceEndpoint, ClientExchange>,
    max_frame_length: usize,
    dials: AtomicU64,
}

impl SecureClient {
    pub fn new(identity: &Identity, config: &Config) -> Result<SecureClient, io::Error> {
        Ok(SecureClient {
            tls_config: Arc::new(identity.client_tls_config()?),
            pool: ConnectionPool::new(
                config.pool_capacity_per_endpoint,
                config.pool_idle_timeout,
            ),
            max_frame_length: config.max_frame_length,
            dials: AtomicU64::new(0),
        })
    }

    /// How many times this client has dialled out. Warm pool hits do not
    /// dial.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Idle pooled connections for `endpoint`.
    pub fn idle_count(&self, endpoint: &ServiceEndpoint) -> usize {
        self.pool.idle_count(endpoint)
    }

    /// Run `transaction` against an authenticated exchange session for
    /// `endpoint`, under `deadline`.
    ///
    /// A pooled session is used when one is idle; otherwise a fresh one is
    /// dialled, pin-checked, and identified. The transaction owns the session
    /// while it runs and hands it back with its result: a session that ends
    /// cleanly returns to the pool, a failed one is destroyed. If a *pooled*
    /// session fails with a plain I/O error (the signature of a stream that
    /// died while idle), exactly one fresh dial replaces it transparently.
    pub async fn execute_transaction<T, F, Fut>(
        &self,
        endpoint: &ServiceEndpoint,
        deadline: Duration,
        transaction: F,
    ) -> Result<T, TransportError>
    where
        F: Fn(ClientExchange) -> Fut,
        Fut: Future<Output = (ClientExchange, Result<T, TransportError>)>,
    {
        let started = Instant::now();

        if let Some(exchange) = self.pool.take(endpoint) {
            match timeout(deadline, transaction(exchange)).await {
                Ok((exchange, Ok(value))) => {
                    self.stash(endpoint.clone(), exchange);
                    return Ok(value);
                }
                Ok((_, Err(error))) if error.is_stale_connection_error() => {
                    debug!(%endpoint, %error, "pooled connection was dead; dialling fresh");
                }
                Ok((_, Err(error))) => return Err(error),
                Err(_) => return Err(TransportError::TransportTimeout),
            }
        }

        let remaining = deadline
            .checked_sub(started.elapsed())
            .ok_or(TransportError::TransportTimeout)?;
        let fresh = async {
            let exchange = self.dial(endpoint, &RemoteIdentity::Client).await?;
            Ok::<_, TransportError>(transaction(exchange).await)
        };
        match timeout(remaining, fresh).await {
            Ok(Ok((exchange, Ok(value)))) => {
                self.stash(endpoint.clone(), exchange);
                Ok(value)
            }
            Ok(Ok((_, Err(error)))) => Err(error),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(TransportError::TransportTimeout),
        }
    }

    /// One request/response burst against `endpoint`.
    pub async fn call(
        &self,
        endpoint: &ServiceEndpoint,
        request: &RequestMessage,
        deadline: Duration,
    ) -> Result<ResponseMessage, TransportError> {
        let request = request.clone();
        self.execute_transaction(endpoint, deadline, move |mut exchange| {
            let request = request.clone();
            async move {
                let result = exchange.exchange_as_client(&request).await;
                (exchange, result)
            }
        })
        .await
    }

    /// Dial `endpoint` and identify as a subscriber for `subscription`. The
    /// stream belongs to the polling loop and never touches the pool.
    pub(crate) async fn connect_subscriber(
        &self,
        endpoint: &ServiceEndpoint,
        subscription: &http::Uri,
    ) -> Result<ClientExchange, TransportError> {
        self.dial(endpoint, &RemoteIdentity::Subscriber(subscription.clone()))
            .await
    }

    async fn dial(
        &self,
        endpoint: &ServiceEndpoint,
        identity: &RemoteIdentity,
    ) -> Result<ClientExchange, TransportError> {
        self.dials.fetch_add(1, Ordering::Relaxed);

        let host = endpoint.host()?;
        let port = endpoint.port();
        let mut addresses = tokio::net::lookup_host((host, port)).await?;

        // Try each resolved address, keeping the last error around in case
        // none of them answer.
        let mut connection_error = None;
        let tcp_stream = loop {
            if let Some(address) = addresses.next() {
                match TcpStream::connect(address).await {
                    Ok(tcp_stream) => {
                        // Bursts are small; send them immediately.
                        tcp_stream.set_nodelay(true)?;
                        break tcp_stream;
                    }
                    Err(e) => connection_error = Some(e),
                }
            } else {
                return Err(TransportError::Io(connection_error.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("unknown host: {}", host),
                    )
                })));
            }
        };

        let sni_host = if DNSNameRef::try_from_ascii_str(host).is_ok() {
            host
        } else {
            SNI_PLACEHOLDER
        };
        let sni = DNSNameRef::try_from_ascii_str(sni_host)
            .map_err(|_| TransportError::protocol("endpoint host is not usable for SNI"))?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let tls_stream = connector
            .connect(sni, tcp_stream)
            .await
            .map_err(TransportError::Handshake)?;

        // The pin check happens here, before a single application byte moves.
        let presented = {
            let (_, session) = tls_stream.get_ref();
            tls::peer_thumbprint(session)
        }
        .ok_or_else(|| TransportError::protocol("server presented no certificate"))?;
        let pinned = endpoint.remote_thumbprint();
        if !pinned.matches(&presented) {
            return Err(TransportError::UnknownServerThumbprint {
                presented,
                pinned: *pinned,
            });
        }

        let mut framed = FramedStream::new(tls_stream, self.max_frame_length);
        protocol::identify(&mut framed, identity).await?;
        Ok(MessageExchange::new(framed))
    }

    fn stash(&self, key: ServiceEndpoint, exchange: ClientExchange) {
        if let Some(rejected) = self.pool.put(key, exchange) {
            // Bucket full or pool disposed: retire the stream gracefully.
            tokio::spawn(async move {
                let _ = rejected.finish().await;
            });
        }
    }

    /// Drop every idle pooled connection and refuse future returns.
    pub(crate) fn dispose(&self) {
        let drained = self.pool.dispose();
        debug!(count = drained.len(), "dropping pooled connections");
        drop(drained);
    }
}
