//! Per-request context and cancellation registry
//!
//! Each JSON-RPC dispatch owns exactly one `RequestContext`. The registry
//! indexes live contexts by request id so `notifications/cancelled` can find
//! the in-flight handler; `cleanup_expired` is a safety net whose evictions
//! indicate a teardown leak upstream.

use crate::auth::ResolvedAuth;
use crate::error::{BridgeError, Result};
use crate::storage::token_store::now_ms;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

/// Maximum age of a registered context before the sweep reclaims it
pub const CONTEXT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

type CancelListener = Box<dyn FnOnce(Option<&str>) + Send>;

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    reason: Option<String>,
    listeners: Vec<CancelListener>,
}

struct TokenInner {
    state: Mutex<CancelState>,
    notify: Notify,
}

/// Cooperative cancellation handle for one request
///
/// Listeners fire at most once, in registration order, on the cancelling
/// task, and are cleared after firing.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create an uncancelled token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(CancelState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Cancel the token; returns false if it was already cancelled
    pub fn cancel(&self, reason: Option<String>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock().unwrap();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.reason = reason;
            std::mem::take(&mut state.listeners)
        };

        let reason = self.reason();
        for listener in listeners {
            listener(reason.as_deref());
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Whether the token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().unwrap().cancelled
    }

    /// The cancellation reason, if any
    pub fn reason(&self) -> Option<String> {
        self.inner.state.lock().unwrap().reason.clone()
    }

    /// Register a listener invoked on cancellation
    ///
    /// If the token is already cancelled the listener fires immediately on
    /// the calling task.
    pub fn on_cancelled<F>(&self, listener: F)
    where
        F: FnOnce(Option<&str>) + Send + 'static,
    {
        let mut slot = Some(listener);
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.cancelled {
                if let Some(f) = slot.take() {
                    state.listeners.push(Box::new(f));
                }
            }
        }

        // Token was already cancelled: fire on this task
        if let Some(f) = slot {
            let reason = self.reason();
            f(reason.as_deref());
        }
    }

    /// Error-returning cancellation check for use between suspension points
    pub fn throw_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BridgeError::mcp("Request was cancelled"))
        } else {
            Ok(())
        }
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Context owned by a single JSON-RPC dispatch
#[derive(Clone)]
pub struct RequestContext {
    /// Stringified JSON-RPC request id
    pub request_id: String,
    /// Owning session id
    pub session_id: String,
    /// Credential snapshot taken at dispatch
    pub auth: ResolvedAuth,
    /// Cancellation handle for the handler
    pub token: CancellationToken,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
}

/// Registry of in-flight request contexts keyed by JSON-RPC id
#[derive(Default)]
pub struct RequestContextRegistry {
    contexts: RwLock<HashMap<String, RequestContext>>,
}

impl RequestContextRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a context for one dispatch
    pub async fn create(
        &self,
        request_id: &str,
        session_id: &str,
        auth: ResolvedAuth,
    ) -> RequestContext {
        let context = RequestContext {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            auth,
            token: CancellationToken::new(),
            created_at: now_ms(),
        };

        let mut contexts = self.contexts.write().await;
        contexts.insert(request_id.to_string(), context.clone());
        context
    }

    /// Fetch a live context by request id
    pub async fn get(&self, request_id: &str) -> Option<RequestContext> {
        self.contexts.read().await.get(request_id).cloned()
    }

    /// Cancel the context registered under `request_id`
    ///
    /// Returns false when no such context exists (already completed or never
    /// registered); callers log that at debug and accept the notification.
    pub async fn cancel(&self, request_id: &str, reason: Option<String>) -> bool {
        let context = self.contexts.read().await.get(request_id).cloned();
        match context {
            Some(context) => context.token.cancel(reason),
            None => false,
        }
    }

    /// Remove a context after its dispatch completes
    pub async fn delete(&self, request_id: &str) {
        self.contexts.write().await.remove(request_id);
    }

    /// Remove all contexts belonging to a session; returns the count
    pub async fn delete_by_session(&self, session_id: &str) -> usize {
        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|_, context| context.session_id != session_id);
        before - contexts.len()
    }

    /// Reclaim contexts older than `max_age`
    ///
    /// A nonzero count signals a teardown leak upstream and is logged at
    /// warning.
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let cutoff = now_ms() - max_age.as_millis() as i64;
        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|request_id, context| {
            let stale = context.created_at < cutoff;
            if stale {
                debug!("Reclaiming stale request context {}", request_id);
            }
            !stale
        });

        let evicted = before - contexts.len();
        if evicted > 0 {
            warn!(
                "Request-context sweep reclaimed {} stale entries; a dispatch is leaking contexts",
                evicted
            );
        }
        evicted
    }

    /// Number of live contexts
    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn the 60-second safety-net sweep
    pub fn spawn_sweeper(registry: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.cleanup_expired(CONTEXT_MAX_AGE).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ResolvedAuth;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel(Some("stop".to_string())));
        assert!(!token.cancel(Some("again".to_string())));
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("stop"));
    }

    #[test]
    fn test_listeners_fire_once_in_order() {
        let token = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            token.on_cancelled(move |_| order.lock().unwrap().push(i));
        }

        token.cancel(None);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        // Listeners are cleared after firing; a second cancel is a no-op
        token.cancel(None);
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_listener_after_cancel_fires_immediately() {
        let token = CancellationToken::new();
        token.cancel(Some("done".to_string()));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        token.on_cancelled(move |reason| {
            assert_eq!(reason, Some("done"));
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel(None);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = RequestContextRegistry::new();
        registry.create("req-1", "sess-1", ResolvedAuth::passthrough()).await;
        registry.create("req-2", "sess-1", ResolvedAuth::passthrough()).await;
        registry.create("req-3", "sess-2", ResolvedAuth::passthrough()).await;

        assert!(registry.get("req-1").await.is_some());
        assert!(registry.cancel("req-1", Some("abort".to_string())).await);
        assert!(!registry.cancel("req-missing", None).await);

        assert_eq!(registry.delete_by_session("sess-1").await, 2);
        assert_eq!(registry.len().await, 1);

        registry.delete("req-3").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_only_stale_contexts() {
        let registry = RequestContextRegistry::new();
        let fresh = registry.create("req-fresh", "sess", ResolvedAuth::passthrough()).await;
        assert!(!fresh.token.is_cancelled());

        {
            let mut contexts = registry.contexts.write().await;
            let stale = contexts.get_mut("req-fresh").unwrap().clone();
            let mut old = stale;
            old.request_id = "req-old".to_string();
            old.created_at = now_ms() - CONTEXT_MAX_AGE.as_millis() as i64 - 1000;
            contexts.insert("req-old".to_string(), old);
        }

        let evicted = registry.cleanup_expired(CONTEXT_MAX_AGE).await;
        assert_eq!(evicted, 1);
        assert!(registry.get("req-fresh").await.is_some());
        assert!(registry.get("req-old").await.is_none());
    }
}
