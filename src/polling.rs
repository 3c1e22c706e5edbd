//! The polling client: a long-lived task that dials a listener, identifies
//! as a subscriber, and serves the requests the listener drains from the
//! subscription's pending-request queue.

use {
    http::Uri,
    rand::Rng,
    std::{sync::Arc, time::Duration},
    tokio::task::JoinHandle,
    tracing::{debug, warn},
};

use crate::{client::SecureClient, message::ServiceEndpoint, service::RequestHandler};

/// One polling loop, bound to a (subscription, endpoint) pair for its whole
/// life. Created by the runtime; aborted on dispose.
pub struct PollingClient {
    join: JoinHandle<()>,
}

impl PollingClient {
    pub(crate) fn spawn(
        subscription: Uri,
        endpoint: ServiceEndpoint,
        client: Arc<SecureClient>,
        handler: Arc<dyn RequestHandler>,
        backoff_initial: Duration,
        backoff_max: Duration,
    ) -> PollingClient {
        let join = tokio::spawn(async move {
            let mut backoff = backoff_initial;
            loop {
                match client.connect_subscriber(&endpoint, &subscription).await {
                    Ok(mut exchange) => {
                        debug!(%subscription, %endpoint, "subscriber session established");
                        match exchange.serve_requests(handler.as_ref()).await {
                            Ok(()) => {
                                // The listener ended the session because its
                                // queue stayed empty; dial right back in.
                                backoff = backoff_initial;
                                continue;
                            }
                            Err(error) => {
                                warn!(%subscription, %error, "subscriber session failed");
                            }
                        }
                    }
                    Err(error) => {
                        warn!(
                            %subscription,
                            %error,
                            retry_in_ms = backoff.as_millis() as u64,
                            "subscriber dial failed"
                        );
                    }
                }
                let jitter = backoff.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(backoff_max);
            }
        });
        PollingClient { join }
    }

    /// Stop the loop, aborting any in-progress dial or session.
    pub(crate) fn abort(&self) {
        self.join.abort();
    }
}

impl Drop for PollingClient {
    fn drop(&mut self) {
        self.join.abort();
    }
}
