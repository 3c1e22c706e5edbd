//! The pending-request queue: the rendezvous between callers that addressed a
//! request to a `poll://` destination and the subscriber sessions that dial
//! in to collect them.
//!
//! One queue exists per subscription URI, created on first use and kept for
//! the runtime's lifetime. Ownership makes delivery at-most-once: `dequeue`
//! moves an entry out of the queue and `complete`/`abandon` consume it, so an
//! entry can never be answered twice.

use {
    http::Uri,
    std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex as SyncMutex},
        time::Duration,
    },
    tokio::{
        sync::{oneshot, Mutex, Notify},
        time::{timeout, timeout_at, Instant},
    },
    tracing::debug,
};

use crate::{
    error::TransportError,
    message::{RequestMessage, ResponseMessage},
};

/// A request waiting for (or claimed by) a subscriber, with the slot its
/// response will be delivered through.
pub struct PendingEntry {
    request: RequestMessage,
    responder: oneshot::Sender<Result<ResponseMessage, TransportError>>,
}

impl PendingEntry {
    pub fn request(&self) -> &RequestMessage {
        &self.request
    }
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PendingEntry>,
    closed: bool,
}

/// A FIFO of requests pending collection by one subscription.
#[derive(Default)]
pub struct PendingRequestQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl PendingRequestQueue {
    pub fn new() -> PendingRequestQueue {
        PendingRequestQueue::default()
    }

    /// Park `request` on the queue and wait for a subscriber to answer it.
    ///
    /// If `deadline` elapses while the entry is still queued, it is removed
    /// and the caller observes [`TransportError::PollingTimeout`]; if a
    /// subscriber had already claimed it, the deadline surfaces as
    /// [`TransportError::TransportTimeout`] instead.
    pub async fn enqueue_and_wait(
        &self,
        request: RequestMessage,
        deadline: Duration,
    ) -> Result<ResponseMessage, TransportError> {
        let request_id = request.id.clone();
        let (responder, receiver) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TransportError::Shutdown);
            }
            state.waiting.push_back(PendingEntry { request, responder });
        }
        self.available.notify_one();

        match timeout(deadline, receiver).await {
            Ok(Ok(outcome)) => outcome,
            // The entry was dropped without an answer: the runtime tore the
            // session down before `complete` or `abandon` could run.
            Ok(Err(_)) => Err(TransportError::Shutdown),
            Err(_) => {
                let mut state = self.state.lock().await;
                let before = state.waiting.len();
                state.waiting.retain(|entry| entry.request.id != request_id);
                if state.waiting.len() < before {
                    debug!(id = %request_id, "request expired while queued");
                    Err(TransportError::PollingTimeout)
                } else {
                    // Claimed by a subscriber but not answered in time.
                    Err(TransportError::TransportTimeout)
                }
            }
        }
    }

    /// Wait up to `max_wait` for an entry. `None` means the deadline elapsed
    /// with the queue empty (or the queue was closed) and the subscriber
    /// session should end its turn.
    pub async fn dequeue(&self, max_wait: Duration) -> Option<PendingEntry> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.waiting.pop_front() {
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                // Deadline: one last look, in case an enqueue raced the wait.
                return self.state.lock().await.waiting.pop_front();
            }
        }
    }

    /// Answer the caller that enqueued this entry.
    pub fn complete(&self, entry: PendingEntry, response: ResponseMessage) {
        // The enqueuer may have given up already; that is its business.
        let _ = entry.responder.send(Ok(response));
    }

    /// Wake the enqueuer with a transport failure: the subscriber that
    /// claimed the entry died mid-burst.
    pub fn abandon(&self, entry: PendingEntry, error: TransportError) {
        let _ = entry.responder.send(Err(error));
    }

    /// Close the queue: every waiting caller observes `Shutdown`, and
    /// subsequent enqueues fail fast.
    pub async fn close(&self) {
        let drained: Vec<PendingEntry> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.waiting.drain(..).collect()
        };
        self.available.notify_waiters();
        for entry in drained {
            let _ = entry.responder.send(Err(TransportError::Shutdown));
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.waiting.len()
    }
}

/// Lazily-created queues, one per subscription URI, alive for the runtime's
/// lifetime.
#[derive(Default)]
pub(crate) struct QueueMap {
    queues: SyncMutex<HashMap<String, Arc<PendingRequestQueue>>>,
}

impl QueueMap {
    pub(crate) fn get_or_create(&self, subscription: &Uri) -> Arc<PendingRequestQueue> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .entry(subscription.to_string())
            .or_insert_with(|| {
                debug!(%subscription, "created pending-request queue");
                Arc::new(PendingRequestQueue::new())
            })
            .clone()
    }

    pub(crate) async fn close_all(&self) {
        let queues: Vec<Arc<PendingRequestQueue>> = {
            let map = self
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.values().cloned().collect()
        };
        for queue in queues {
            queue.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::ServiceEndpoint, tls::Thumbprint};
    use serde_json::Value;

    fn request(marker: i64) -> RequestMessage {
        let thumbprint: Thumbprint = "aa".repeat(20).parse().unwrap();
        let destination =
            ServiceEndpoint::new("poll://inbox/".parse().unwrap(), thumbprint);
        RequestMessage::new(destination, "Echo", "echo", vec![Value::from(marker)])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dequeue_sees_entries_in_fifo_order() {
        let queue = Arc::new(PendingRequestQueue::new());

        let mut callers = Vec::new();
        for marker in 0..3 {
            let queue = queue.clone();
            callers.push(tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(marker), Duration::from_secs(5))
                    .await
            }));
            // Make arrival order deterministic.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for expected in 0..3 {
            let entry = queue.dequeue(Duration::from_secs(1)).await.unwrap();
            assert_eq!(entry.request().params[0], Value::from(expected));
            let id = entry.request().id.clone();
            queue.complete(entry, ResponseMessage::success(id, Value::from(expected)));
        }

        for (marker, caller) in callers.into_iter().enumerate() {
            let response = caller.await.unwrap().unwrap();
            assert_eq!(response.result, Some(Value::from(marker as i64)));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_while_queued_is_polling_timeout_and_empties_queue() {
        let queue = PendingRequestQueue::new();
        let outcome = queue
            .enqueue_and_wait(request(0), Duration::from_millis(200))
            .await;
        assert!(matches!(outcome, Err(TransportError::PollingTimeout)));
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_while_claimed_is_transport_timeout() {
        let queue = Arc::new(PendingRequestQueue::new());
        let enqueuer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(0), Duration::from_millis(200))
                    .await
            })
        };

        // Claim the entry and sit on it past the caller's deadline.
        let entry = queue.dequeue(Duration::from_secs(1)).await.unwrap();
        let outcome = enqueuer.await.unwrap();
        assert!(matches!(outcome, Err(TransportError::TransportTimeout)));
        drop(entry);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandon_wakes_the_caller_with_the_failure() {
        let queue = Arc::new(PendingRequestQueue::new());
        let enqueuer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(0), Duration::from_secs(5))
                    .await
            })
        };

        let entry = queue.dequeue(Duration::from_secs(1)).await.unwrap();
        queue.abandon(
            entry,
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "subscriber died",
            )),
        );
        assert!(matches!(
            enqueuer.await.unwrap(),
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn each_entry_is_claimed_by_at_most_one_dequeuer() {
        let queue = Arc::new(PendingRequestQueue::new());
        let _caller = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(0), Duration::from_secs(5))
                    .await
            })
        };

        let first = queue.dequeue(Duration::from_millis(300)).await;
        let second = queue.dequeue(Duration::from_millis(300)).await;
        assert_eq!(first.is_some() as usize + second.is_some() as usize, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_wakes_waiters_with_shutdown() {
        let queue = Arc::new(PendingRequestQueue::new());
        let enqueuer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(0), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.close().await;
        assert!(matches!(
            enqueuer.await.unwrap(),
            Err(TransportError::Shutdown)
        ));
        assert!(matches!(
            queue
                .enqueue_and_wait(request(1), Duration::from_secs(1))
                .await,
            Err(TransportError::Shutdown)
        ));
        assert!(queue.dequeue(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_map_reuses_queues_per_subscription() {
        let map = QueueMap::default();
        let uri: Uri = "poll://inbox/".parse().unwrap();
        let other: Uri = "poll://other/".parse().unwrap();

        let a = map.get_or_create(&uri);
        let b = map.get_or_create(&uri);
        let c = map.get_or_create(&other);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
