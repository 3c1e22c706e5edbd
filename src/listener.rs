//! The accepting side of the transport: TLS accept, trust-set gate, the
//! friendly page for stray browsers, and dispatch into the message-exchange
//! protocol.

use {
    std::{io, net::SocketAddr, sync::Arc, time::Duration},
    tokio::{
        net::{TcpListener, TcpStream},
        sync::mpsc,
        task::JoinHandle,
    },
    tokio_rustls::TlsAcceptor,
    tracing::{debug, error, info},
};

use crate::{
    config::Config,
    error::TransportError,
    framing::FramedStream,
    protocol::{self, MessageExchange},
    queue::QueueMap,
    service::RequestHandler,
    tls::{self, Identity, TrustSet},
};

/// The HTML answer served to a peer whose first bytes are an HTTP request
/// rather than an identity preamble.
#[derive(Debug, Clone)]
pub struct FriendlyPage {
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl Default for FriendlyPage {
    fn default() -> Self {
        FriendlyPage {
            body: "<html><body><p>This is a message exchange endpoint, \
                   not a web server.</p></body></html>"
                .to_string(),
            headers: vec![(
                "Content-Type".to_string(),
                "text/html; charset=utf-8".to_string(),
            )],
        }
    }
}

impl FriendlyPage {
    fn render(&self) -> String {
        let mut response = String::from("HTTP/1.0 200 OK\r\n");
        for (name, value) in &self.headers {
            response.push_str(name);
            response.push_str(": ");
            response.push_str(value);
            response.push_str("\r\n");
        }
        response.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        response.push_str("Connection: close\r\n\r\n");
        response.push_str(&self.body);
        response
    }
}

/// Accepts inbound connections, requires a trusted client thumbprint, and
/// hands each identified stream to the exchange protocol. Each accepted
/// connection runs as its own task.
pub struct SecureListener {
    tls_acceptor: TlsAcceptor,
    trust: TrustSet,
    handler: Arc<dyn RequestHandler>,
    queues: Arc<QueueMap>,
    friendly_page: Option<FriendlyPage>,
    max_frame_length: usize,
    queue_wait: Duration,
}

/// A running listener. Dropping the handle does not stop the listener; call
/// [`ListenerHandle::shutdown`].
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(()).await;
        let _ = self.join.await;
    }
}

impl SecureListener {
    pub fn new(
        identity: &Identity,
        trust: TrustSet,
        handler: Arc<dyn RequestHandler>,
        queues: Arc<QueueMap>,
        friendly_page: Option<FriendlyPage>,
        config: &Config,
    ) -> Result<SecureListener, io::Error> {
        Ok(SecureListener {
            tls_acceptor: TlsAcceptor::from(Arc::new(identity.server_tls_config()?)),
            trust,
            handler,
            queues,
            friendly_page,
            max_frame_length: config.max_frame_length,
            queue_wait: config.polling_queue_wait,
        })
    }

    /// Bind `address` and serve until the returned handle is shut down.
    pub async fn serve(self, address: impl Into<SocketAddr>) -> Result<ListenerHandle, io::Error> {
        let listener = TcpListener::bind(address.into()).await?;
        let local_addr = listener.local_addr()?;
        info!("serving on: {:?}", local_addr);

        let (stop, mut stop_receiver) = mpsc::channel::<()>(1);
        let this = Arc::new(self);
        let join = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    result = listener.accept() => result,
                    _ = stop_receiver.recv() => break,
                };
                match accepted {
                    Err(e) => error!("accept failed: {}", e),
                    Ok((tcp_stream, addr)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_connection(tcp_stream, addr).await {
                                error!("connection error [{}]: {}", addr, e);
                            }
                        });
                    }
                }
            }
        });

        Ok(ListenerHandle {
            local_addr,
            stop,
            join,
        })
    }

    async fn handle_connection(
        &self,
        tcp_stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), TransportError> {
        tcp_stream.set_nodelay(true)?;
        let tls_stream = self
            .tls_acceptor
            .accept(tcp_stream)
            .await
            .map_err(TransportError::Handshake)?;
        let client_thumbprint = {
            let (_, session) = tls_stream.get_ref();
            tls::peer_thumbprint(session)
        };

        let mut framed = FramedStream::new(tls_stream, self.max_frame_length);
        let first_line = match framed.read_line_or_eof().await? {
            Some(line) => line,
            // Handshake then silence; some scanners do this.
            None => return Ok(()),
        };

        if looks_like_http(&first_line) {
            if let Some(page) = &self.friendly_page {
                debug!(%addr, "serving friendly page to an HTTP peer");
                framed.write_raw(page.render().as_bytes()).await?;
            }
            let _ = framed.shutdown().await;
            return Ok(());
        }

        // Anything past this point requires a trusted client certificate.
        let thumbprint = match client_thumbprint {
            Some(thumbprint) if self.trust.contains(&thumbprint) => thumbprint,
            other => {
                let _ = framed.shutdown().await;
                return Err(TransportError::UntrustedClient(other));
            }
        };

        let identity = protocol::parse_identity(&first_line)?;
        protocol::acknowledge_identity(&mut framed).await?;
        debug!(client = %thumbprint, ?identity, %addr, "session identified");

        let mut exchange = MessageExchange::new(framed);
        exchange
            .exchange_as_server(
                identity,
                self.handler.as_ref(),
                |subscription| self.queues.get_or_create(subscription),
                self.queue_wait,
            )
            .await
    }
}

/// Whether a first line smells like an HTTP request preamble rather than an
/// identity line.
fn looks_like_http(line: &str) -> bool {
    line.contains(" HTTP/")
        && matches!(
            line.split(' ').next(),
            Some("GET") | Some("POST") | Some("HEAD") | Some("PUT") | Some("OPTIONS")
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_preambles_are_recognized() {
        assert!(looks_like_http("GET / HTTP/1.1"));
        assert!(looks_like_http("POST /index.html HTTP/1.0"));
        assert!(!looks_like_http("MX-CLIENT 1.0"));
        assert!(!looks_like_http("NEXT"));
        assert!(!looks_like_http("GETAWAY"));
    }

    #[test]
    fn friendly_page_renders_headers_and_body() {
        let page = FriendlyPage::default();
        let rendered = page.render();
        assert!(rendered.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(rendered.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(rendered.contains(&format!("Content-Length: {}\r\n", page.body.len())));
        assert!(rendered.ends_with(&page.body));
    }
}
