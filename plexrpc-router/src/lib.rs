//! # plexrpc-router
//!
//! The core of the plexrpc responder framework.
//!
//! This crate provides:
//! - A [`Router`] that binds named methods to peer connections and runs
//!   every request through a composed middleware chain
//! - The [`Middleware`] contract with onion-ordered request hooks,
//!   open/close lifecycle hooks and metrics registration
//! - Built-in middleware: per-key token-bucket [`RateLimit`], per-key
//!   in-flight [`ConcurrentLimit`] and a payload [`encoding`] adapter
//! - A capability handshake gate run once per attached connection
//!
//! ```no_run
//! use plexrpc_protocol::Value;
//! use plexrpc_router::{ConcurrentLimit, MethodOptions, RateLimit, RequestContext, Router};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), plexrpc_router::RouterError> {
//! let (server, _client) = plexrpc_transport::pair();
//!
//! let mut router = Router::new();
//! router.layer(RateLimit::by_remote_address(64, Duration::from_millis(250)))?;
//! router
//!     .method(
//!         "echo",
//!         MethodOptions::default(),
//!         |value: Value, _ctx: RequestContext| async move { Ok(value) },
//!     )?
//!     .layer(ConcurrentLimit::by_remote_public_key(8));
//!
//! router.open().await?;
//! router.attach(&server)?;
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod concurrent_limit;
pub mod context;
pub mod encoding;
pub mod error;
pub mod keying;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod router;

pub use capability::{CapabilityConfig, CapabilityReject};
pub use concurrent_limit::{ConcurrentLimit, ConcurrentLimitEngine};
pub use context::RequestContext;
pub use encoding::{encoding, EncodingAdapter};
pub use error::{AggregateError, ErrorCode, RouterError};
pub use keying::LimitKey;
pub use metrics::RouterStats;
pub use middleware::{Chain, Middleware, Next};
pub use rate_limit::{RateLimit, RateLimitEngine};
pub use router::{Handler, MethodOptions, MethodRegistration, Router, RouterState};
