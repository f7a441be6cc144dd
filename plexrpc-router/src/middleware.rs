//! Middleware contract and chain composition.
//!
//! A chain is a flat slice of middleware; the onion is an interpreter
//! ([`Next`]) over that slice. Pre-request hooks run front to back, the
//! terminal runs the decode → handler → encode pipeline, and post-request
//! code runs back to front as the nested calls unwind. Concatenation is
//! the chain combinator; the empty chain is the identity.

use crate::context::RequestContext;
use crate::error::{AggregateError, RouterError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use plexrpc_protocol::Value;
use prometheus::Registry;
use std::sync::Arc;

/// The innermost stage of a request: decode, invoke the handler, encode.
pub type Terminal =
    dyn Fn(RequestContext) -> BoxFuture<'static, Result<Value, RouterError>> + Send + Sync;

/// A middleware layer.
///
/// Every hook defaults to the identity, so implementations override only
/// what they need.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Runs when the router opens. Failure aborts the open and rolls back
    /// the already-opened prefix.
    async fn on_open(&self) -> Result<(), RouterError> {
        Ok(())
    }

    /// Runs when the router closes. Always invoked, even when an earlier
    /// close hook failed; failures are aggregated.
    async fn on_close(&self) -> Result<(), RouterError> {
        Ok(())
    }

    /// Wraps one request. Call `next.run(ctx)` to delegate inward; code
    /// before the call sees the request, code after sees the response.
    async fn on_request(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<Value, RouterError> {
        next.run(ctx).await
    }

    /// Registers any metrics this middleware exposes.
    fn register_metrics(&self, _registry: &Registry) -> Result<(), prometheus::Error> {
        Ok(())
    }
}

/// The remainder of a chain, from one middleware's point of view.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    /// Delegates to the rest of the chain, ending at the terminal.
    pub async fn run(self, ctx: &RequestContext) -> Result<Value, RouterError> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .on_request(
                        ctx,
                        Next {
                            rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => (self.terminal)(ctx.clone()).await,
        }
    }
}

/// An ordered middleware chain.
#[derive(Clone, Default)]
pub struct Chain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    /// The identity chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware layer.
    pub fn layer(&mut self, middleware: impl Middleware + 'static) {
        self.layers.push(Arc::new(middleware));
    }

    /// Appends an already-shared middleware layer.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.layers.push(middleware);
    }

    /// Left-to-right composition: `self` wraps `inner`.
    pub fn compose(&self, inner: &Chain) -> Chain {
        let mut layers = Vec::with_capacity(self.layers.len() + inner.layers.len());
        layers.extend(self.layers.iter().cloned());
        layers.extend(inner.layers.iter().cloned());
        Chain { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Opens every layer front to back.
    ///
    /// If a layer fails, the already-opened prefix is closed in reverse
    /// (close failures logged and swallowed) and the original failure
    /// propagates; later layers are never opened.
    pub async fn open(&self) -> Result<(), RouterError> {
        for (index, middleware) in self.layers.iter().enumerate() {
            if let Err(err) = middleware.on_open().await {
                for opened in self.layers[..index].iter().rev() {
                    if let Err(close_err) = opened.on_close().await {
                        tracing::warn!(error = %close_err, "close failed during open rollback");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Closes every layer back to front, aggregating failures.
    ///
    /// Every close hook runs regardless of earlier failures; the
    /// collected errors surface as one aggregate at the end.
    pub async fn close(&self) -> Result<(), RouterError> {
        let mut aggregate = AggregateError::new();
        for middleware in self.layers.iter().rev() {
            if let Err(err) = middleware.on_close().await {
                aggregate.push(err);
            }
        }
        aggregate.into_result()
    }

    /// Fans metrics registration out to every layer in order.
    ///
    /// A failing layer is logged and does not stop the fan-out.
    pub fn register_metrics(&self, registry: &Registry) {
        for middleware in &self.layers {
            if let Err(err) = middleware.register_metrics(registry) {
                tracing::warn!(error = %err, "middleware metrics registration failed");
            }
        }
    }

    /// Runs a request through the chain down to the terminal.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        terminal: &Terminal,
    ) -> Result<Value, RouterError> {
        Next {
            rest: &self.layers,
            terminal,
        }
        .run(ctx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        trace: Trace,
        fail_open: bool,
        fail_close: bool,
    }

    impl Recorder {
        fn new(name: &'static str, trace: &Trace) -> Self {
            Self {
                name,
                trace: trace.clone(),
                fail_open: false,
                fail_close: false,
            }
        }

        fn failing_open(name: &'static str, trace: &Trace) -> Self {
            Self {
                fail_open: true,
                ..Self::new(name, trace)
            }
        }

        fn failing_close(name: &'static str, trace: &Trace) -> Self {
            Self {
                fail_close: true,
                ..Self::new(name, trace)
            }
        }

        fn record(&self, event: &str) {
            self.trace
                .lock()
                .unwrap()
                .push(format!("{}:{event}", self.name));
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn on_open(&self) -> Result<(), RouterError> {
            self.record("open");
            if self.fail_open {
                return Err(RouterError::handler_msg(format!("{} open failed", self.name)));
            }
            Ok(())
        }

        async fn on_close(&self) -> Result<(), RouterError> {
            self.record("close");
            if self.fail_close {
                return Err(RouterError::handler_msg(format!(
                    "{} close failed",
                    self.name
                )));
            }
            Ok(())
        }

        async fn on_request(
            &self,
            ctx: &RequestContext,
            next: Next<'_>,
        ) -> Result<Value, RouterError> {
            self.record("before");
            let result = next.run(ctx).await;
            self.record("after");
            result
        }
    }

    fn test_ctx() -> RequestContext {
        let (server, _client) = plexrpc_transport::pair();
        RequestContext::new("echo", Value::text("foo"), server)
    }

    fn echo_terminal(trace: &Trace) -> impl Fn(RequestContext) -> BoxFuture<'static, Result<Value, RouterError>> + Send + Sync
    {
        let trace = trace.clone();
        move |ctx: RequestContext| -> BoxFuture<'static, Result<Value, RouterError>> {
            let trace = trace.clone();
            Box::pin(async move {
                trace.lock().unwrap().push("handler".to_string());
                Ok(ctx.value())
            })
        }
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut outer = Chain::new();
        outer.layer(Recorder::new("g1", &trace));
        outer.layer(Recorder::new("g2", &trace));
        let mut inner = Chain::new();
        inner.layer(Recorder::new("m1", &trace));
        inner.layer(Recorder::new("m2", &trace));

        let chain = outer.compose(&inner);
        let terminal = echo_terminal(&trace);
        let result = chain.run(&test_ctx(), &terminal).await.unwrap();

        assert_eq!(result, Value::text("foo"));
        assert_eq!(
            trace.lock().unwrap().as_slice(),
            &[
                "g1:before",
                "g2:before",
                "m1:before",
                "m2:before",
                "handler",
                "m2:after",
                "m1:after",
                "g2:after",
                "g1:after",
            ]
        );
    }

    #[tokio::test]
    async fn test_identity_chain_runs_terminal() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new();
        let terminal = echo_terminal(&trace);
        let result = chain.run(&test_ctx(), &terminal).await.unwrap();
        assert_eq!(result, Value::text("foo"));
        assert_eq!(trace.lock().unwrap().as_slice(), &["handler"]);
    }

    #[tokio::test]
    async fn test_compose_is_associative_on_requests() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut a = Chain::new();
        a.layer(Recorder::new("a", &trace));
        let mut b = Chain::new();
        b.layer(Recorder::new("b", &trace));
        let mut c = Chain::new();
        c.layer(Recorder::new("c", &trace));

        let left = a.compose(&b).compose(&c);
        let right = a.compose(&b.compose(&c));

        let terminal = echo_terminal(&trace);
        left.run(&test_ctx(), &terminal).await.unwrap();
        let left_trace = std::mem::take(&mut *trace.lock().unwrap());
        right.run(&test_ctx(), &terminal).await.unwrap();
        let right_trace = trace.lock().unwrap().clone();

        assert_eq!(left_trace, right_trace);
    }

    #[tokio::test]
    async fn test_open_close_symmetry() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.layer(Recorder::new("m1", &trace));
        chain.layer(Recorder::new("m2", &trace));
        chain.layer(Recorder::new("m3", &trace));

        chain.open().await.unwrap();
        chain.close().await.unwrap();

        assert_eq!(
            trace.lock().unwrap().as_slice(),
            &["m1:open", "m2:open", "m3:open", "m3:close", "m2:close", "m1:close"]
        );
    }

    #[tokio::test]
    async fn test_partial_open_rollback() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.layer(Recorder::new("m1", &trace));
        chain.layer(Recorder::new("m2", &trace));
        chain.layer(Recorder::failing_open("m3", &trace));
        chain.layer(Recorder::new("m4", &trace));

        let err = chain.open().await.unwrap_err();
        assert!(err.to_string().contains("m3 open failed"));

        // m4 never opened; m1 and m2 closed in reverse.
        assert_eq!(
            trace.lock().unwrap().as_slice(),
            &["m1:open", "m2:open", "m3:open", "m2:close", "m1:close"]
        );
    }

    #[tokio::test]
    async fn test_rollback_swallows_close_failures() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.layer(Recorder::failing_close("m1", &trace));
        chain.layer(Recorder::failing_open("m2", &trace));

        let err = chain.open().await.unwrap_err();
        assert!(err.to_string().contains("m2 open failed"));
        assert_eq!(
            trace.lock().unwrap().as_slice(),
            &["m1:open", "m2:open", "m1:close"]
        );
    }

    #[tokio::test]
    async fn test_close_aggregates_failures_in_order() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.layer(Recorder::new("m1", &trace));
        chain.layer(Recorder::failing_close("m2", &trace));
        chain.layer(Recorder::new("m3", &trace));
        chain.layer(Recorder::failing_close("m4", &trace));

        let err = chain.close().await.unwrap_err();
        match err {
            RouterError::Aggregate(agg) => {
                assert_eq!(agg.len(), 2);
                // Reverse close order: m4 failed first.
                assert!(agg.errors()[0].to_string().contains("m4"));
                assert!(agg.errors()[1].to_string().contains("m2"));
            }
            other => panic!("expected aggregate, got {other:?}"),
        }

        assert_eq!(
            trace.lock().unwrap().as_slice(),
            &["m4:close", "m3:close", "m2:close", "m1:close"]
        );
    }

    #[tokio::test]
    async fn test_single_close_failure_is_not_aggregated() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain.layer(Recorder::failing_close("m1", &trace));

        let err = chain.close().await.unwrap_err();
        assert!(matches!(err, RouterError::Handler(_)));
    }

    #[test]
    fn test_metrics_fanout_survives_failures() {
        struct FailingMetrics;
        impl Middleware for FailingMetrics {
            fn register_metrics(&self, _registry: &Registry) -> Result<(), prometheus::Error> {
                Err(prometheus::Error::Msg("nope".to_string()))
            }
        }

        struct CountingMetrics {
            calls: Arc<Mutex<u32>>,
        }
        impl Middleware for CountingMetrics {
            fn register_metrics(&self, _registry: &Registry) -> Result<(), prometheus::Error> {
                *self.calls.lock().unwrap() += 1;
                Ok(())
            }
        }

        let calls = Arc::new(Mutex::new(0));
        let mut chain = Chain::new();
        chain.layer(FailingMetrics);
        chain.layer(CountingMetrics {
            calls: calls.clone(),
        });

        chain.register_metrics(&Registry::new());
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
