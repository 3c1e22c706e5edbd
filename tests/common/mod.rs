//! Shared fixtures for the end-to-end tests: the two TLS identities under
//! `tests/fixtures/`, a calculator service, and a bare TLS client for poking
//! at listeners without transport machinery.

use std::{net::SocketAddr, sync::Arc, sync::Once};

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_rustls::{
    client::TlsStream,
    rustls::{self, RootCertStore, ServerCertVerified, ServerCertVerifier, TLSError},
    webpki::DNSNameRef,
    TlsConnector,
};

use mx_transport::{
    Identity, InvokeError, RequestMessage, Service, ServiceEndpoint, Thumbprint,
};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
    });
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

pub fn server_identity() -> Identity {
    Identity::load(fixture("server_cert.pem"), fixture("server_key.pem"))
        .expect("server fixture identity loads")
}

pub fn client_identity() -> Identity {
    Identity::load(fixture("client_cert.pem"), fixture("client_key.pem"))
        .expect("client fixture identity loads")
}

pub fn https_endpoint(addr: SocketAddr, thumbprint: Thumbprint) -> ServiceEndpoint {
    ServiceEndpoint::new(
        format!("https://{}/", addr).parse().expect("address forms a URI"),
        thumbprint,
    )
}

pub fn add_request(endpoint: ServiceEndpoint, lhs: i64, rhs: i64) -> RequestMessage {
    RequestMessage::new(
        endpoint,
        "Calculator",
        "add",
        vec![Value::from(lhs), Value::from(rhs)],
    )
}

pub struct Calculator;

#[async_trait]
impl Service for Calculator {
    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value, InvokeError> {
        match method {
            "add" => {
                if params.len() != 2 {
                    return Err(InvokeError::BadArity {
                        method: method.to_string(),
                        expected: 2,
                        actual: params.len(),
                    });
                }
                let lhs = params[0]
                    .as_i64()
                    .ok_or_else(|| InvokeError::Failed("expected an integer".to_string()))?;
                let rhs = params[1]
                    .as_i64()
                    .ok_or_else(|| InvokeError::Failed("expected an integer".to_string()))?;
                Ok(Value::from(lhs + rhs))
            }
            other => Err(InvokeError::NoSuchMethod(other.to_string())),
        }
    }
}

struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// A TLS connection with no client certificate at all, the posture of a
/// browser that stumbled into the port.
pub async fn anonymous_tls_client(addr: SocketAddr) -> TlsStream<TcpStream> {
    let mut config = rustls::ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await.expect("TCP connects");
    connector
        .connect(
            DNSNameRef::try_from_ascii_str("localhost").expect("valid DNS name"),
            tcp,
        )
        .await
        .expect("TLS handshake completes")
}
