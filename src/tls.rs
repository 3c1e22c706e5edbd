//! Certificate identity for the transport: SHA-1 thumbprints, PEM loading,
//! and the rustls glue that defers verification to an explicit post-handshake
//! thumbprint check.
//!
//! No CA trust exists anywhere in this protocol. A peer *is* the SHA-1
//! thumbprint of its leaf certificate: clients pin the thumbprint they expect
//! a server to present, and listeners keep a mutable set of client
//! thumbprints they will serve.

use {
    ring::{constant_time, digest},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashSet,
        convert::TryFrom,
        fmt::{self, Debug, Display},
        fs, io,
        path::{Path, PathBuf},
        str::FromStr,
        sync::{Arc, Mutex, MutexGuard},
    },
    thiserror::Error,
    tokio_rustls::{
        rustls::{
            Certificate, ClientCertVerified, ClientCertVerifier, DistinguishedNames, PrivateKey,
            RootCertStore, ServerCertVerified, ServerCertVerifier, Session, TLSError,
        },
        webpki::{DNSName, DNSNameRef},
    },
};

/// The SHA-1 digest of a peer's DER-encoded leaf certificate.
///
/// Rendered as uppercase hex with no separators; parsed case-insensitively.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Thumbprint([u8; digest::SHA1_OUTPUT_LEN]);

impl Thumbprint {
    /// Digest a DER-encoded certificate.
    pub fn of_certificate(certificate: &Certificate) -> Thumbprint {
        let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &certificate.0);
        let mut bytes = [0; digest::SHA1_OUTPUT_LEN];
        bytes.copy_from_slice(hash.as_ref());
        Thumbprint(bytes)
    }

    /// Constant-time equality, for comparing a presented thumbprint against a
    /// pinned one.
    pub fn matches(&self, other: &Thumbprint) -> bool {
        constant_time::verify_slices_are_equal(&self.0, &other.0).is_ok()
    }
}

#[derive(Debug, Error)]
pub enum InvalidThumbprint {
    #[error("thumbprint is not hexadecimal: {0}")]
    BadHex(#[from] hex::FromHexError),
    #[error("thumbprint must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
}

impl FromStr for Thumbprint {
    type Err = InvalidThumbprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)?;
        if decoded.len() != digest::SHA1_OUTPUT_LEN {
            return Err(InvalidThumbprint::BadLength {
                expected: digest::SHA1_OUTPUT_LEN,
                actual: decoded.len(),
            });
        }
        let mut bytes = [0; digest::SHA1_OUTPUT_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Thumbprint(bytes))
    }
}

impl TryFrom<String> for Thumbprint {
    type Error = InvalidThumbprint;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Thumbprint> for String {
    fn from(thumbprint: Thumbprint) -> String {
        thumbprint.to_string()
    }
}

impl Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thumbprint({})", self)
    }
}

/// A local TLS identity: certificate chain, private key, and the leaf
/// thumbprint peers will observe.
#[derive(Clone)]
pub struct Identity {
    certificate_chain: Vec<Certificate>,
    private_key: PrivateKey,
    thumbprint: Thumbprint,
}

impl Identity {
    /// Load an identity from PEM-encoded certificate chain and private key
    /// files. The first certificate in the chain is the leaf.
    pub fn load(
        certificate_path: impl AsRef<Path>,
        private_key_path: impl AsRef<Path>,
    ) -> Result<Identity, InvalidIdentity> {
        let certificate_chain = read_certificates(certificate_path)?;
        let private_key = read_private_key(private_key_path)?;
        Identity::new(certificate_chain, private_key)
    }

    pub fn new(
        certificate_chain: Vec<Certificate>,
        private_key: PrivateKey,
    ) -> Result<Identity, InvalidIdentity> {
        let leaf = certificate_chain
            .first()
            .ok_or(InvalidIdentity::EmptyChain)?;
        let thumbprint = Thumbprint::of_certificate(leaf);
        Ok(Identity {
            certificate_chain,
            private_key,
            thumbprint,
        })
    }

    /// The thumbprint remote peers will see for this identity.
    pub fn thumbprint(&self) -> Thumbprint {
        self.thumbprint
    }

    pub(crate) fn client_tls_config(
        &self,
    ) -> Result<tokio_rustls::rustls::ClientConfig, InvalidIdentity> {
        let mut config = tokio_rustls::rustls::ClientConfig::new();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(DeferServerVerification));
        config
            .set_single_client_cert(self.certificate_chain.clone(), self.private_key.clone())
            .map_err(|_| InvalidIdentity::Rejected)?;
        Ok(config)
    }

    pub(crate) fn server_tls_config(
        &self,
    ) -> Result<tokio_rustls::rustls::ServerConfig, InvalidIdentity> {
        let mut config =
            tokio_rustls::rustls::ServerConfig::new(Arc::new(RequestClientCertificate));
        config
            .set_single_cert(self.certificate_chain.clone(), self.private_key.clone())
            .map_err(|_| InvalidIdentity::Rejected)?;
        Ok(config)
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("thumbprint", &self.thumbprint)
            .finish()
    }
}

/// A failure assembling the local TLS identity from key material on disk.
#[derive(Debug, Error)]
pub enum InvalidIdentity {
    #[error("could not read {path:?}: {source}")]
    Unreadable { path: PathBuf, source: io::Error },
    #[error("{path:?} is not valid PEM: {source}")]
    BadPem { path: PathBuf, source: pem::PemError },
    #[error("{path:?} contains no CERTIFICATE entry")]
    NoCertificates { path: PathBuf },
    #[error("{path:?} holds a '{tag}' entry where a PRIVATE KEY was expected")]
    NotAPrivateKey { path: PathBuf, tag: String },
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("certificate chain or private key rejected by the TLS stack")]
    Rejected,
}

// Runtime construction surfaces I/O errors; identity problems fold into them.
impl From<InvalidIdentity> for io::Error {
    fn from(error: InvalidIdentity) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

/// The thumbprint of the leaf certificate the peer presented during the
/// handshake, if it presented one at all.
pub(crate) fn peer_thumbprint(session: &dyn Session) -> Option<Thumbprint> {
    session
        .get_peer_certificates()
        .and_then(|certificates| certificates.first().map(Thumbprint::of_certificate))
}

/// Accepts any server certificate during the handshake; the dialler performs
/// the pinned-thumbprint comparison itself immediately afterwards, before any
/// application byte is written. Rejecting here would only bury the structured
/// `UnknownServerThumbprint` error inside an opaque handshake failure.
struct DeferServerVerification;

impl ServerCertVerifier for DeferServerVerification {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        presented_certs: &[Certificate],
        _dns_name: DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        if presented_certs.is_empty() {
            return Err(TLSError::NoCertificatesPresented);
        }
        Ok(ServerCertVerified::assertion())
    }
}

/// Requests (but does not require) a client certificate. The listener checks
/// the presented thumbprint against its trust set after the handshake: a
/// browser fishing for the friendly page has no certificate to offer and must
/// still get through the handshake.
struct RequestClientCertificate;

impl ClientCertVerifier for RequestClientCertificate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self, _sni: Option<&DNSName>) -> Option<bool> {
        Some(false)
    }

    fn client_auth_root_subjects(&self, _sni: Option<&DNSName>) -> Option<DistinguishedNames> {
        Some(DistinguishedNames::new())
    }

    fn verify_client_cert(
        &self,
        _presented_certs: &[Certificate],
        _sni: Option<&DNSName>,
    ) -> Result<ClientCertVerified, TLSError> {
        Ok(ClientCertVerified::assertion())
    }
}

/// The set of client thumbprints a listener will serve.
///
/// A single mutex guards the set; it is read once per TLS accept, where
/// contention is dwarfed by the handshake itself.
#[derive(Debug, Clone, Default)]
pub struct TrustSet {
    inner: Arc<Mutex<HashSet<Thumbprint>>>,
}

impl TrustSet {
    pub fn new() -> TrustSet {
        TrustSet::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashSet<Thumbprint>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, thumbprint: Thumbprint) {
        self.locked().insert(thumbprint);
    }

    pub fn remove(&self, thumbprint: &Thumbprint) -> bool {
        self.locked().remove(thumbprint)
    }

    /// Atomically replace the entire set.
    pub fn replace_all(&self, thumbprints: impl IntoIterator<Item = Thumbprint>) {
        let mut set = self.locked();
        set.clear();
        set.extend(thumbprints);
    }

    pub fn contains(&self, thumbprint: &Thumbprint) -> bool {
        self.locked().contains(thumbprint)
    }
}

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Load every `CERTIFICATE` entry from the PEM file at `path`, leaf first.
/// Entries with any other tag are ignored; a file with no certificate at all
/// is refused rather than handed to the TLS stack as an empty chain.
pub fn read_certificates(path: impl AsRef<Path>) -> Result<Vec<Certificate>, InvalidIdentity> {
    let path = path.as_ref();
    let certificates: Vec<Certificate> = pem::parse_many(read_pem_file(path)?)
        .into_iter()
        .filter(|entry| entry.tag == CERTIFICATE_TAG)
        .map(|entry| Certificate(entry.contents))
        .collect();
    if certificates.is_empty() {
        return Err(InvalidIdentity::NoCertificates {
            path: path.to_owned(),
        });
    }
    Ok(certificates)
}

/// Load the single PKCS#8 `PRIVATE KEY` entry from the PEM file at `path`.
pub fn read_private_key(path: impl AsRef<Path>) -> Result<PrivateKey, InvalidIdentity> {
    let path = path.as_ref();
    let entry = pem::parse(read_pem_file(path)?).map_err(|source| InvalidIdentity::BadPem {
        path: path.to_owned(),
        source,
    })?;
    if entry.tag != PRIVATE_KEY_TAG {
        return Err(InvalidIdentity::NotAPrivateKey {
            path: path.to_owned(),
            tag: entry.tag,
        });
    }
    Ok(PrivateKey(entry.contents))
}

fn read_pem_file(path: &Path) -> Result<Vec<u8>, InvalidIdentity> {
    fs::read(path).map_err(|source| InvalidIdentity::Unreadable {
        path: path.to_owned(),
        source,
    })
}
