//! The transport runtime: the top-level object that owns the trust set, the
//! connection pool, the pending-request queues, the route table, and the
//! service registry, and wires them into listeners, polling clients, and the
//! outbound `send` path.

use {
    http::Uri,
    std::{
        collections::HashMap,
        io,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex as SyncMutex,
        },
        time::Duration,
    },
    tokio::sync::Mutex,
    tracing::debug,
};

use crate::{
    client::SecureClient,
    config::Config,
    error::TransportError,
    listener::{FriendlyPage, ListenerHandle, SecureListener},
    message::{RequestMessage, ResponseMessage, Scheme, ServiceEndpoint},
    polling::PollingClient,
    queue::QueueMap,
    service::{RequestHandler, Service, ServiceRegistry},
    tls::{Identity, Thumbprint, TrustSet},
};

/// The per-destination routing hint: a one-step lookup consulted before
/// dialling, never chained.
#[derive(Default)]
pub struct RouteTable {
    routes: SyncMutex<HashMap<ServiceEndpoint, ServiceEndpoint>>,
}

impl RouteTable {
    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceEndpoint, ServiceEndpoint>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, to: ServiceEndpoint, via: ServiceEndpoint) {
        self.locked().insert(to, via);
    }

    /// Resolve a destination through at most one route entry.
    pub fn resolve(&self, destination: &ServiceEndpoint) -> ServiceEndpoint {
        self.locked()
            .get(destination)
            .cloned()
            .unwrap_or_else(|| destination.clone())
    }
}

struct RuntimeInner {
    config: Config,
    identity: Identity,
    trust: TrustSet,
    client: Arc<SecureClient>,
    queues: Arc<QueueMap>,
    routes: RouteTable,
    services: Arc<ServiceRegistry>,
    friendly_page: SyncMutex<Option<FriendlyPage>>,
    listeners: Mutex<Vec<ListenerHandle>>,
    pollers: SyncMutex<Vec<PollingClient>>,
    disposed: AtomicBool,
}

/// A complete transport node: it can listen, poll, and send, all at once.
#[derive(Clone)]
pub struct TransportRuntime {
    inner: Arc<RuntimeInner>,
}

impl TransportRuntime {
    pub fn new(identity: Identity, config: Config) -> Result<TransportRuntime, io::Error> {
        let client = Arc::new(SecureClient::new(&identity, &config)?);
        Ok(TransportRuntime {
            inner: Arc::new(RuntimeInner {
                config,
                identity,
                trust: TrustSet::new(),
                client,
                queues: Arc::new(QueueMap::default()),
                routes: RouteTable::default(),
                services: Arc::new(ServiceRegistry::new()),
                friendly_page: SyncMutex::new(Some(FriendlyPage::default())),
                listeners: Mutex::new(Vec::new()),
                pollers: SyncMutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// The thumbprint remote peers will see when this runtime dials or
    /// listens.
    pub fn thumbprint(&self) -> Thumbprint {
        self.inner.identity.thumbprint()
    }

    /// The set of client thumbprints this runtime's listeners will serve.
    pub fn trust_set(&self) -> TrustSet {
        self.inner.trust.clone()
    }

    pub fn register_service(&self, service_type: impl Into<String>, service: Arc<dyn Service>) {
        self.inner.services.register(service_type, service);
    }

    /// Replace the page served to HTTP peers; `None` closes them silently.
    /// Affects listeners started after the call.
    pub fn set_friendly_page(&self, page: Option<FriendlyPage>) {
        *self
            .inner
            .friendly_page
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = page;
    }

    /// Record that requests addressed to `to` should be sent to `via`
    /// instead. A single lookup; routes are never chained.
    pub fn route(&self, to: ServiceEndpoint, via: ServiceEndpoint) {
        self.inner.routes.insert(to, via);
    }

    /// Bind a listener. Returns the bound address (useful with port 0).
    pub async fn listen(&self, address: impl Into<SocketAddr>) -> Result<SocketAddr, io::Error> {
        let friendly_page = self
            .inner
            .friendly_page
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let listener = SecureListener::new(
            &self.inner.identity,
            self.inner.trust.clone(),
            self.inner.services.clone() as Arc<dyn RequestHandler>,
            self.inner.queues.clone(),
            friendly_page,
            &self.inner.config,
        )?;
        let handle = listener.serve(address).await?;
        let local_addr = handle.local_addr();
        self.inner.listeners.lock().await.push(handle);
        Ok(local_addr)
    }

    /// Start polling `endpoint` for requests addressed to `subscription`.
    /// Inbound requests are served by this runtime's own services.
    pub fn poll(&self, subscription: Uri, endpoint: ServiceEndpoint) {
        let poller = PollingClient::spawn(
            subscription,
            endpoint,
            self.inner.client.clone(),
            self.inner.services.clone() as Arc<dyn RequestHandler>,
            self.inner.config.polling_backoff_initial,
            self.inner.config.polling_backoff_max,
        );
        self.inner
            .pollers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(poller);
    }

    /// Send `request` under the configured default deadline.
    pub async fn send(&self, request: RequestMessage) -> Result<ResponseMessage, TransportError> {
        let deadline = self.inner.config.request_timeout;
        self.send_with_deadline(request, deadline).await
    }

    /// Send `request`, waiting at most `deadline` for its response.
    pub async fn send_with_deadline(
        &self,
        request: RequestMessage,
        deadline: Duration,
    ) -> Result<ResponseMessage, TransportError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }

        let destination = self.inner.routes.resolve(&request.destination);
        match destination.scheme()? {
            Scheme::Https => {
                self.inner
                    .client
                    .call(&destination, &request, deadline)
                    .await
            }
            Scheme::Poll => {
                let queue = self.inner.queues.get_or_create(destination.base_uri());
                queue.enqueue_and_wait(request, deadline).await
            }
        }
    }

    /// Dispatch an inbound request to the registered services, as a listener
    /// or poller would. Failures come back as structured error responses.
    pub async fn handle_incoming(&self, request: RequestMessage) -> ResponseMessage {
        self.inner.services.handle(request).await
    }

    /// Dials made by this runtime's secure client.
    pub fn dial_count(&self) -> u64 {
        self.inner.client.dial_count()
    }

    /// Idle pooled connections for `endpoint`.
    pub fn idle_connections(&self, endpoint: &ServiceEndpoint) -> usize {
        self.inner.client.idle_count(endpoint)
    }

    /// Requests currently parked on `subscription`'s pending-request queue.
    pub async fn pending_request_count(&self, subscription: &Uri) -> usize {
        self.inner.queues.get_or_create(subscription).len().await
    }

    /// Stop everything: listeners, polling clients, pooled connections, and
    /// pending-request queues. Blocked callers observe `Shutdown`.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing transport runtime");

        let listeners: Vec<ListenerHandle> =
            self.inner.listeners.lock().await.drain(..).collect();
        futures::future::join_all(listeners.into_iter().map(ListenerHandle::shutdown)).await;

        let pollers: Vec<PollingClient> = {
            let mut pollers = self
                .inner
                .pollers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pollers.drain(..).collect()
        };
        for poller in &pollers {
            poller.abort();
        }
        drop(pollers);

        self.inner.client.dispose();
        self.inner.queues.close_all().await;
    }
}
