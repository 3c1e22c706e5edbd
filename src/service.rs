//! The contract between the transport and the services it dispatches inbound
//! requests to.
//!
//! The transport knows nothing about service interfaces: a service is
//! anything that can `invoke` a method by name with positional arguments. A
//! typed facade, if wanted, is a thin wrapper on the caller's side of a
//! [`RequestMessage`](crate::message::RequestMessage) and does not concern
//! the transport.

use {
    async_trait::async_trait,
    serde_json::Value,
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
    thiserror::Error,
    tracing::debug,
};

use crate::message::{ErrorDetail, RequestMessage, ResponseMessage};

/// A failure raised by a service while (or before) running a method.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no method named '{0}'")]
    NoSuchMethod(String),
    #[error("method '{method}' takes {expected} arguments, got {actual}")]
    BadArity {
        method: String,
        expected: usize,
        actual: usize,
    },
    #[error("{0}")]
    Failed(String),
}

impl InvokeError {
    fn to_detail(&self) -> ErrorDetail {
        let kind = match self {
            InvokeError::NoSuchMethod(_) => ErrorDetail::NO_SUCH_METHOD,
            InvokeError::BadArity { .. } => ErrorDetail::BAD_ARITY,
            InvokeError::Failed(_) => ErrorDetail::SERVICE_ERROR,
        };
        ErrorDetail::new(kind, self.to_string())
    }
}

/// A service implementation: method lookup by name and argument arity is the
/// implementor's business.
#[async_trait]
pub trait Service: Send + Sync {
    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value, InvokeError>;
}

/// Anything that can answer an inbound request. The listener and the polling
/// client both hand requests to one of these.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: RequestMessage) -> ResponseMessage;
}

/// Services keyed by their service-type identifier.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    pub fn register(&self, service_type: impl Into<String>, service: Arc<dyn Service>) {
        let service_type = service_type.into();
        debug!(%service_type, "registered service");
        self.services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(service_type, service);
    }

    fn get(&self, service_type: &str) -> Option<Arc<dyn Service>> {
        self.services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(service_type)
            .cloned()
    }
}

#[async_trait]
impl RequestHandler for ServiceRegistry {
    /// Invoke the service the request names. Failures become structured
    /// error details in the response; they are never transport errors.
    async fn handle(&self, request: RequestMessage) -> ResponseMessage {
        let service = match self.get(&request.service_type) {
            Some(service) => service,
            None => {
                return ResponseMessage::failure(
                    request.id,
                    ErrorDetail::new(
                        ErrorDetail::NO_SUCH_SERVICE,
                        format!("no service registered as '{}'", request.service_type),
                    ),
                );
            }
        };
        match service.invoke(&request.method_name, request.params).await {
            Ok(result) => ResponseMessage::success(request.id, result),
            Err(error) => ResponseMessage::failure(request.id, error.to_detail()),
        }
    }
}
