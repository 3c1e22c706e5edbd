//! The typed messages the transport carries, and the endpoint/identity types
//! that route them.

use {
    http::Uri,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::{
        collections::BTreeMap,
        fmt::{self, Display},
        hash::{Hash, Hasher},
    },
    uuid::Uuid,
};

use crate::{defaults, error::TransportError, tls::Thumbprint};

/// One outbound invocation: who to call, what to call, and with which
/// arguments. The `id` is unique for the lifetime of the originating runtime
/// and ties the eventual response back to this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: String,
    pub destination: ServiceEndpoint,
    pub service_type: String,
    pub method_name: String,
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl RequestMessage {
    pub fn new(
        destination: ServiceEndpoint,
        service_type: impl Into<String>,
        method_name: impl Into<String>,
        params: Vec<Value>,
    ) -> RequestMessage {
        RequestMessage {
            id: Uuid::new_v4().to_string(),
            destination,
            service_type: service_type.into(),
            method_name: method_name.into(),
            params,
            metadata: None,
        }
    }
}

/// The answer to one [`RequestMessage`]: exactly one of `result` and `error`
/// is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl ResponseMessage {
    pub fn success(id: impl Into<String>, result: Value) -> ResponseMessage {
        ResponseMessage {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorDetail) -> ResponseMessage {
        ResponseMessage {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the caller-facing result.
    pub fn into_result(self) -> Result<Value, ErrorDetail> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A structured description of a failure that happened on the remote side
/// while the request itself was delivered successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_stack: Option<String>,
}

impl ErrorDetail {
    pub const SERVICE_ERROR: &'static str = "ServiceError";
    pub const NO_SUCH_SERVICE: &'static str = "NoSuchService";
    pub const NO_SUCH_METHOD: &'static str = "NoSuchMethod";
    pub const BAD_ARITY: &'static str = "BadArity";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> ErrorDetail {
        ErrorDetail {
            kind: kind.into(),
            message: message.into(),
            remote_stack: None,
        }
    }
}

impl Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What the peer on an accepted connection claimed to be during the identity
/// preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteIdentity {
    /// A dialling peer that will send requests.
    Client,
    /// A listening peer acknowledging an identity preamble.
    Server,
    /// A dialling peer offering to *serve* requests for the named
    /// subscription.
    Subscriber(Uri),
}

/// Where a request goes: a base URI plus the thumbprint the remote peer must
/// present. Two endpoints are the same pool / route-table key iff both fields
/// match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(with = "http_serde::uri")]
    base_uri: Uri,
    remote_thumbprint: Thumbprint,
}

impl Eq for ServiceEndpoint {}

// `http::Uri` has no `Hash`; hash the components that participate in
// equality.
impl Hash for ServiceEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base_uri.scheme_str().hash(state);
        self.base_uri.authority().map(|a| a.as_str()).hash(state);
        self.base_uri.path().hash(state);
        self.remote_thumbprint.hash(state);
    }
}

/// The destination schemes the transport knows how to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Dial out directly over TLS.
    Https,
    /// Park the request on a pending-request queue for a subscriber to
    /// collect.
    Poll,
}

impl ServiceEndpoint {
    pub fn new(base_uri: Uri, remote_thumbprint: Thumbprint) -> ServiceEndpoint {
        ServiceEndpoint {
            base_uri,
            remote_thumbprint,
        }
    }

    pub fn base_uri(&self) -> &Uri {
        &self.base_uri
    }

    pub fn remote_thumbprint(&self) -> &Thumbprint {
        &self.remote_thumbprint
    }

    /// The destination scheme, compared case-insensitively.
    pub fn scheme(&self) -> Result<Scheme, TransportError> {
        let scheme = self.base_uri.scheme_str().unwrap_or("");
        if scheme.eq_ignore_ascii_case("https") {
            Ok(Scheme::Https)
        } else if scheme.eq_ignore_ascii_case("poll") {
            Ok(Scheme::Poll)
        } else {
            Err(TransportError::UnknownScheme(scheme.to_string()))
        }
    }

    pub fn host(&self) -> Result<&str, TransportError> {
        self.base_uri
            .host()
            .ok_or_else(|| TransportError::protocol("destination URI has no host"))
    }

    pub fn port(&self) -> u16 {
        self.base_uri.port_u16().unwrap_or_else(defaults::port)
    }
}

impl Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.base_uri, self.remote_thumbprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn thumbprint(byte: &str) -> Thumbprint {
        byte.repeat(20).parse().unwrap()
    }

    fn endpoint(uri: &str, tp: &str) -> ServiceEndpoint {
        ServiceEndpoint::new(uri.parse().unwrap(), thumbprint(tp))
    }

    fn hash_of(endpoint: &ServiceEndpoint) -> u64 {
        let mut hasher = DefaultHasher::new();
        endpoint.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn endpoints_equal_iff_uri_and_thumbprint_match() {
        let a = endpoint("https://example.com:10933/", "aa");
        let b = endpoint("https://example.com:10933/", "aa");
        let other_uri = endpoint("https://example.org:10933/", "aa");
        let other_tp = endpoint("https://example.com:10933/", "bb");

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, other_uri);
        assert_ne!(a, other_tp);
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert_eq!(
            endpoint("HTTPS://example.com/", "aa").scheme().unwrap(),
            Scheme::Https
        );
        assert_eq!(
            endpoint("poll://inbox/", "aa").scheme().unwrap(),
            Scheme::Poll
        );
        assert!(matches!(
            endpoint("ftp://example.com/", "aa").scheme(),
            Err(TransportError::UnknownScheme(_))
        ));
    }

    #[test]
    fn default_port_applies_when_unspecified() {
        assert_eq!(endpoint("https://example.com/", "aa").port(), 10933);
        assert_eq!(endpoint("https://example.com:4443/", "aa").port(), 4443);
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = RequestMessage::new(
            endpoint("https://example.com/", "aa"),
            "Calculator",
            "add",
            vec![Value::from(2), Value::from(3)],
        );
        let encoded = serde_json::to_vec(&request).unwrap();
        let decoded: RequestMessage = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn response_collapses_to_result_or_error() {
        let ok = ResponseMessage::success("r1", Value::from(5));
        assert_eq!(ok.into_result().unwrap(), Value::from(5));

        let err = ResponseMessage::failure(
            "r2",
            ErrorDetail::new(ErrorDetail::SERVICE_ERROR, "boom"),
        );
        assert_eq!(err.into_result().unwrap_err().kind, ErrorDetail::SERVICE_ERROR);
    }
}
