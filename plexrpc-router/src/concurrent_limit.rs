//! Per-key in-flight request limiting middleware.
//!
//! Each key tracks its number of in-flight handler invocations; a
//! request is admitted only while the count is below capacity. The count
//! is released the moment the wrapped call settles, on success and
//! failure alike, via a scope guard.

use crate::context::RequestContext;
use crate::error::RouterError;
use crate::keying::LimitKey;
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;
use plexrpc_protocol::Value;
use prometheus::{IntCounter, Opts, Registry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Ceiling on resident keys, guarding against key-flooding peers.
const DEFAULT_MAX_KEYS: usize = 65_536;

struct ActiveState {
    active: HashMap<String, u32>,
    destroyed: bool,
}

/// The in-flight accounting engine behind [`ConcurrentLimit`].
pub struct ConcurrentLimitEngine {
    capacity: u32,
    max_keys: usize,
    state: Mutex<ActiveState>,
}

impl ConcurrentLimitEngine {
    /// Creates an engine with the given per-key capacity, clamped to at
    /// least one.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            max_keys: DEFAULT_MAX_KEYS,
            state: Mutex::new(ActiveState {
                active: HashMap::new(),
                destroyed: false,
            }),
        }
    }

    /// Tries to take an in-flight slot for `key`. An absent key has zero
    /// in flight.
    pub fn try_acquire(&self, key: &str) -> Result<bool, RouterError> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(RouterError::ConcurrentLimitDestroyed);
        }
        match state.active.get_mut(key) {
            Some(active) if *active >= self.capacity => Ok(false),
            Some(active) => {
                *active += 1;
                Ok(true)
            }
            None => {
                if state.active.len() >= self.max_keys {
                    tracing::warn!(key, "concurrency limiter key ceiling reached");
                    return Ok(false);
                }
                state.active.insert(key.to_string(), 1);
                Ok(true)
            }
        }
    }

    /// Returns an in-flight slot for `key`, removing the key when its
    /// count reaches zero. Releasing an absent key is ignored.
    pub fn release(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return;
        }
        let drained = match state.active.get_mut(key) {
            Some(active) => {
                *active -= 1;
                *active == 0
            }
            None => return,
        };
        if drained {
            state.active.remove(key);
        }
    }

    /// Clears all counts and marks the engine destroyed. Destroying
    /// twice is an error.
    pub fn destroy(&self) -> Result<(), RouterError> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(RouterError::ConcurrentLimitDestroyed);
        }
        state.destroyed = true;
        state.active.clear();
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }

    /// The in-flight count for `key`.
    pub fn active(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .active
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Releases one in-flight slot when dropped, so the count comes back on
/// success, failure and cancellation alike.
struct InFlightGuard {
    engine: Arc<ConcurrentLimitEngine>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.engine.release(&self.key);
    }
}

/// In-flight request limiting middleware, bucketed per peer.
pub struct ConcurrentLimit {
    engine: Arc<ConcurrentLimitEngine>,
    key: LimitKey,
    rejected: OnceLock<IntCounter>,
}

impl ConcurrentLimit {
    fn new(key: LimitKey, capacity: u32) -> Self {
        Self {
            engine: Arc::new(ConcurrentLimitEngine::new(capacity)),
            key,
            rejected: OnceLock::new(),
        }
    }

    /// Buckets by the peer's remote host string.
    pub fn by_remote_address(capacity: u32) -> Self {
        Self::new(LimitKey::RemoteAddress, capacity)
    }

    /// Buckets by the peer's identity key.
    pub fn by_remote_public_key(capacity: u32) -> Self {
        Self::new(LimitKey::RemotePublicKey, capacity)
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<ConcurrentLimitEngine> {
        &self.engine
    }
}

#[async_trait]
impl Middleware for ConcurrentLimit {
    async fn on_close(&self) -> Result<(), RouterError> {
        self.engine.destroy()
    }

    async fn on_request(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<Value, RouterError> {
        let key = self.key.extract(ctx.connection());
        if !self.engine.try_acquire(&key)? {
            if let Some(counter) = self.rejected.get() {
                counter.inc();
            }
            tracing::debug!(key = %key, method = ctx.method(), "concurrent limit exceeded");
            return Err(RouterError::ConcurrentLimitExceeded { key });
        }
        let _guard = InFlightGuard {
            engine: self.engine.clone(),
            key,
        };
        next.run(ctx).await
    }

    fn register_metrics(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        let counter = IntCounter::with_opts(Opts::new(
            "plexrpc_concurrent_limit_rejected_total",
            "Requests rejected by the concurrency limiter",
        ))?;
        registry.register(Box::new(counter.clone()))?;
        let _ = self.rejected.set(counter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bounds_in_flight() {
        let engine = ConcurrentLimitEngine::new(2);
        assert!(engine.try_acquire("k").unwrap());
        assert!(engine.try_acquire("k").unwrap());
        assert!(!engine.try_acquire("k").unwrap());
        assert_eq!(engine.active("k"), 2);
    }

    #[test]
    fn test_release_restores_capacity_immediately() {
        let engine = ConcurrentLimitEngine::new(1);
        assert!(engine.try_acquire("k").unwrap());
        assert!(!engine.try_acquire("k").unwrap());
        engine.release("k");
        assert!(engine.try_acquire("k").unwrap());
    }

    #[test]
    fn test_zero_count_removes_key() {
        let engine = ConcurrentLimitEngine::new(3);
        assert!(engine.try_acquire("k").unwrap());
        assert!(engine.try_acquire("k").unwrap());
        engine.release("k");
        assert_eq!(engine.active("k"), 1);
        engine.release("k");
        assert_eq!(engine.active("k"), 0);
        // Release on an absent key is ignored.
        engine.release("k");
        assert_eq!(engine.active("k"), 0);
    }

    #[test]
    fn test_key_independence() {
        let engine = ConcurrentLimitEngine::new(1);
        assert!(engine.try_acquire("a").unwrap());
        assert!(!engine.try_acquire("a").unwrap());
        assert!(engine.try_acquire("b").unwrap());
    }

    #[test]
    fn test_destroy_clears_and_latches() {
        let engine = ConcurrentLimitEngine::new(2);
        assert!(engine.try_acquire("k").unwrap());

        engine.destroy().unwrap();
        assert!(engine.is_destroyed());
        assert_eq!(engine.active("k"), 0);

        assert!(matches!(
            engine.try_acquire("k"),
            Err(RouterError::ConcurrentLimitDestroyed)
        ));
        assert!(matches!(
            engine.destroy(),
            Err(RouterError::ConcurrentLimitDestroyed)
        ));
    }

    #[tokio::test]
    async fn test_guard_releases_on_failure() {
        use crate::middleware::Chain;
        use futures::future::BoxFuture;

        let limiter = ConcurrentLimit::by_remote_address(1);
        let engine = limiter.engine().clone();
        let mut chain = Chain::new();
        chain.layer(limiter);

        let (server, _client) = plexrpc_transport::pair();
        let ctx = RequestContext::new("boom", Value::raw(&b""[..]), server.clone());
        let key = LimitKey::RemoteAddress.extract(&server);

        let failing = |_ctx: RequestContext| -> BoxFuture<'static, Result<Value, RouterError>> {
            Box::pin(async move { Err(RouterError::handler_msg("boom")) })
        };

        let result = chain.run(&ctx, &failing).await;
        assert!(result.is_err());
        assert_eq!(engine.active(&key), 0);
    }

    #[test]
    fn test_metrics_registration() {
        let limiter = ConcurrentLimit::by_remote_address(2);
        let registry = Registry::new();
        limiter.register_metrics(&registry).unwrap();
        assert!(registry
            .gather()
            .iter()
            .any(|family| family.get_name() == "plexrpc_concurrent_limit_rejected_total"));
    }
}
