//! Registry of in-flight RPC requests awaiting their replies.
//!
//! Each entry owns a timer that enforces the caller's deadline. After any
//! operation the invariant holds: a correlation id is either present with
//! an armed timer, or absent with no timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::message::Response;

/// Resolver half of a pending RPC call.
pub(crate) type ReplySender = oneshot::Sender<Result<Response, Error>>;

/// A single outstanding request.
pub(crate) struct PendingReply {
    sender: ReplySender,
    timer: JoinHandle<()>,
    /// Routing key the request went out on.
    pub routing_key: String,
    /// Cache slot to write the response through to, when caching is on.
    pub cache_key: Option<u64>,
}

impl PendingReply {
    /// Delivers the terminal outcome. Exactly one settle happens per
    /// entry; the armed timer is disarmed first.
    pub fn settle(self, outcome: Result<Response, Error>) {
        self.timer.abort();
        let _ = self.sender.send(outcome);
    }
}

/// Pending replies keyed by correlation id.
#[derive(Clone)]
pub(crate) struct ReplyStorage {
    inner: Arc<Mutex<HashMap<String, PendingReply>>>,
}

impl ReplyStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a pending reply and arms its timeout timer.
    ///
    /// # Errors
    ///
    /// Fails with an invalid-operation error when the correlation id is
    /// already pending.
    pub fn push(
        &self,
        correlation_id: &str,
        routing_key: &str,
        cache_key: Option<u64>,
        timeout: Duration,
        sender: ReplySender,
    ) -> Result<(), Error> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(correlation_id) {
            return Err(Error::InvalidOperation(format!(
                "correlation id `{correlation_id}` is already pending"
            )));
        }

        let timer = tokio::spawn({
            let storage = self.clone();
            let id = correlation_id.to_string();
            let route = routing_key.to_string();
            async move {
                tokio::time::sleep(timeout).await;
                storage.reject(&id, Error::Timeout { route, timeout });
            }
        });

        map.insert(
            correlation_id.to_string(),
            PendingReply {
                sender,
                timer,
                routing_key: routing_key.to_string(),
                cache_key,
            },
        );
        Ok(())
    }

    /// Atomically removes and returns an entry, disarming its timer.
    pub fn pop(&self, correlation_id: &str) -> Option<PendingReply> {
        let entry = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id)?;
        entry.timer.abort();
        Some(entry)
    }

    /// Rejects a pending reply. A no-op when the id is not pending.
    pub fn reject(&self, correlation_id: &str, error: Error) {
        if let Some(entry) = self.pop(correlation_id) {
            tracing::debug!(
                route = %entry.routing_key,
                correlation_id,
                error = %error,
                "rejecting pending reply"
            );
            entry.settle(Err(error));
        }
    }

    /// Rejects every pending reply, used on transport teardown.
    pub fn reject_all(&self, make_error: impl Fn(&str) -> Error) {
        let drained: Vec<(String, PendingReply)> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, entry) in drained {
            entry.settle(Err(make_error(&id)));
        }
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn response(data: serde_json::Value) -> Response {
        Response {
            headers: BTreeMap::new(),
            data,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_pop_settle_resolves_the_caller() {
        let storage = ReplyStorage::new();
        let (tx, rx) = oneshot::channel();
        storage
            .push("id-1", "echo", None, Duration::from_secs(10), tx)
            .unwrap();

        let entry = storage.pop("id-1").unwrap();
        assert_eq!(entry.routing_key, "echo");
        entry.settle(Ok(response(json!({"a": 1}))));

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.data, json!({"a": 1}));
        assert_eq!(storage.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_correlation_ids_are_refused() {
        let storage = ReplyStorage::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        storage
            .push("id-1", "echo", None, Duration::from_secs(10), tx1)
            .unwrap();
        let err = storage
            .push("id-1", "echo", None, Duration::from_secs(10), tx2)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expiry_rejects_with_a_timeout() {
        let storage = ReplyStorage::new();
        let (tx, rx) = oneshot::channel();
        storage
            .push("id-1", "echo", None, Duration::from_millis(200), tx)
            .unwrap();

        let outcome = rx.await.unwrap();
        let Err(Error::Timeout { route, timeout }) = outcome else {
            panic!("expected a timeout rejection");
        };
        assert_eq!(route, "echo");
        assert_eq!(timeout, Duration::from_millis(200));
        assert_eq!(storage.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_disarms_the_timer() {
        let storage = ReplyStorage::new();
        let (tx, rx) = oneshot::channel();
        storage
            .push("id-1", "echo", None, Duration::from_millis(50), tx)
            .unwrap();

        let entry = storage.pop("id-1").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The disarmed timer must not have rejected; dropping the entry
        // without settling closes the channel instead.
        drop(entry);
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reject_is_idempotent_for_absent_ids() {
        let storage = ReplyStorage::new();
        storage.reject("missing", Error::Validation("whatever".to_string()));
        assert_eq!(storage.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_all_clears_every_pending_entry() {
        let storage = ReplyStorage::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        storage
            .push("id-1", "a", None, Duration::from_secs(10), tx1)
            .unwrap();
        storage
            .push("id-2", "b", None, Duration::from_secs(10), tx2)
            .unwrap();

        storage.reject_all(|id| Error::InvalidOperation(format!("closing, dropping {id}")));

        assert!(matches!(
            rx1.await.unwrap(),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(storage.len(), 0);
    }
}
