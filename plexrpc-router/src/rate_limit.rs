//! Per-key token-bucket rate limiting middleware.
//!
//! Each key owns a bucket of `capacity` tokens; an admitted request
//! spends one and only the refill ticker ever returns them. A single
//! ticker serves all keys: every `interval` it adds one token to each
//! resident bucket and evicts buckets that reach capacity, so a full
//! bucket costs no memory and an absent key means "full".

use crate::context::RequestContext;
use crate::error::RouterError;
use crate::keying::LimitKey;
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;
use plexrpc_protocol::Value;
use prometheus::{IntCounter, Opts, Registry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Ceiling on resident keys, guarding against key-flooding peers.
const DEFAULT_MAX_KEYS: usize = 65_536;

struct BucketState {
    buckets: HashMap<String, u32>,
    destroyed: bool,
}

/// The token accounting engine behind [`RateLimit`].
pub struct RateLimitEngine {
    capacity: u32,
    interval: Duration,
    max_keys: usize,
    state: Mutex<BucketState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimitEngine {
    /// Creates an engine with the given bucket capacity and refill
    /// interval. Capacity is clamped to at least one token, the interval
    /// to at least one millisecond.
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            interval: interval.max(Duration::from_millis(1)),
            max_keys: DEFAULT_MAX_KEYS,
            state: Mutex::new(BucketState {
                buckets: HashMap::new(),
                destroyed: false,
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Tries to spend one token for `key`.
    ///
    /// A key with no resident bucket is full: it spends from `capacity`
    /// and becomes resident. Returns `false` when the bucket is empty or
    /// the resident-key ceiling is reached.
    pub fn try_acquire(&self, key: &str) -> Result<bool, RouterError> {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(RouterError::RateLimitDestroyed);
        }
        match state.buckets.get_mut(key) {
            Some(0) => Ok(false),
            Some(tokens) => {
                *tokens -= 1;
                Ok(true)
            }
            None => {
                if state.buckets.len() >= self.max_keys {
                    tracing::warn!(key, "rate limiter key ceiling reached");
                    return Ok(false);
                }
                state.buckets.insert(key.to_string(), self.capacity - 1);
                Ok(true)
            }
        }
    }

    /// One refill tick: add a token to every resident bucket, evicting
    /// buckets that reach capacity.
    fn tick(&self) {
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return;
        }
        let capacity = self.capacity;
        state.buckets.retain(|_, tokens| {
            *tokens += 1;
            *tokens < capacity
        });
    }

    /// Starts the refill ticker if it is not already running.
    ///
    /// The ticker holds a weak reference, so dropping the engine stops
    /// it even without an explicit destroy.
    pub fn start(this: &Arc<Self>) {
        let mut ticker = this.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }
        let engine = Arc::downgrade(this);
        let interval = this.interval;
        *ticker = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                match Weak::upgrade(&engine) {
                    Some(engine) => engine.tick(),
                    None => break,
                }
            }
        }));
    }

    /// Stops the ticker, clears all buckets and marks the engine
    /// destroyed. Destroying twice is an error.
    pub fn destroy(&self) -> Result<(), RouterError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.destroyed {
                return Err(RouterError::RateLimitDestroyed);
            }
            state.destroyed = true;
            state.buckets.clear();
        }
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }

    /// Number of keys with a resident bucket.
    pub fn resident_keys(&self) -> usize {
        self.state.lock().unwrap().buckets.len()
    }
}

/// Token-bucket rate limiting middleware, bucketed per peer.
pub struct RateLimit {
    engine: Arc<RateLimitEngine>,
    key: LimitKey,
    rejected: OnceLock<IntCounter>,
}

impl RateLimit {
    fn new(key: LimitKey, capacity: u32, interval: Duration) -> Self {
        Self {
            engine: Arc::new(RateLimitEngine::new(capacity, interval)),
            key,
            rejected: OnceLock::new(),
        }
    }

    /// Buckets by the peer's remote host string.
    pub fn by_remote_address(capacity: u32, interval: Duration) -> Self {
        Self::new(LimitKey::RemoteAddress, capacity, interval)
    }

    /// Buckets by the peer's identity key.
    pub fn by_remote_public_key(capacity: u32, interval: Duration) -> Self {
        Self::new(LimitKey::RemotePublicKey, capacity, interval)
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<RateLimitEngine> {
        &self.engine
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn on_open(&self) -> Result<(), RouterError> {
        RateLimitEngine::start(&self.engine);
        Ok(())
    }

    async fn on_close(&self) -> Result<(), RouterError> {
        self.engine.destroy()
    }

    async fn on_request(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<Value, RouterError> {
        let key = self.key.extract(ctx.connection());
        if self.engine.try_acquire(&key)? {
            // Tokens are spent, not released; only the ticker refills.
            next.run(ctx).await
        } else {
            if let Some(counter) = self.rejected.get() {
                counter.inc();
            }
            tracing::debug!(key = %key, method = ctx.method(), "rate limit exceeded");
            Err(RouterError::RateLimitExceeded { key })
        }
    }

    fn register_metrics(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        let counter = IntCounter::with_opts(Opts::new(
            "plexrpc_rate_limit_rejected_total",
            "Requests rejected by the rate limiter",
        ))?;
        registry.register(Box::new(counter.clone()))?;
        let _ = self.rejected.set(counter);
        Ok(())
    }
}
