//! Payload encoding adapter middleware.

use crate::context::RequestContext;
use crate::error::RouterError;
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;
use plexrpc_protocol::{codec, Codec, Value};
use std::sync::Arc;

/// Middleware that decodes the inbound payload before the rest of the
/// chain runs and encodes the result on the way back out.
///
/// Only its own codec failures are wrapped (as decode/encode errors with
/// the codec failure as cause); anything the inner chain or handler
/// raises passes through untouched.
pub struct EncodingAdapter {
    request: Option<Arc<dyn Codec>>,
    response: Option<Arc<dyn Codec>>,
}

/// Creates an [`EncodingAdapter`] with optional request and response
/// codecs. A missing codec leaves that direction untouched.
pub fn encoding(
    request: Option<Arc<dyn Codec>>,
    response: Option<Arc<dyn Codec>>,
) -> EncodingAdapter {
    EncodingAdapter { request, response }
}

#[async_trait]
impl Middleware for EncodingAdapter {
    async fn on_request(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<Value, RouterError> {
        if let Some(request) = &self.request {
            let decoded =
                codec::decode_value(request.as_ref(), ctx.value()).map_err(RouterError::Decode)?;
            ctx.set_value(decoded);
        }

        let result = next.run(ctx).await?;

        match &self.response {
            Some(response) => {
                let bytes =
                    codec::encode(response.as_ref(), &result).map_err(RouterError::Encode)?;
                Ok(Value::Raw(bytes))
            }
            None => Ok(result),
        }
    }
}
