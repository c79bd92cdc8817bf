//! Middleware pipeline for proxied requests.
//!
//! Each layer wraps the next one and may inspect the request, answer it
//! directly, or decorate the response coming back. The proxy assembles its
//! stack from these pieces: request logging, the control endpoints, and
//! finally the worker itself.
//!
//! - [`Middleware`]: trait implemented by every layer.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable layer.
//! - [`from_middleware`]: turns a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`LoggerMiddleware`]: one log line per request.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;

use crate::context::Context;
use crate::http::{Response, StatusCode};

/// Boxed future returned by every middleware.
pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a layer can forward a request
/// at most once.
///
/// # Examples
///
/// ```rust,no_run
/// use offcache::context::Context;
/// use offcache::middleware::{Middleware, MiddlewareFuture, Next};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, ctx: Context, next: Next) -> MiddlewareFuture {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    index: usize,
}

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler =
    Arc<dyn Fn(Context, Next) -> MiddlewareFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a cursor positioned at the start of `middlewares`.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next layer and returns its response.
    ///
    /// Running off the end of the chain yields `500 Internal Server Error`.
    pub async fn run(mut self, ctx: Context) -> Response {
        if let Some(handler) = self.middlewares.get(self.index).cloned() {
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// A layer in the proxy pipeline.
///
/// Implementors may pass the request through with `next.run(ctx).await`,
/// short-circuit by returning a [`Response`] without calling `next`, or
/// decorate whatever `next` returns.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> MiddlewareFuture;
}

/// Logs method, URL, status, response source, and duration of every request.
pub struct LoggerMiddleware;

/// Header the proxy stamps on responses to say where they came from.
pub const SOURCE_HEADER: &str = "X-Offcache-Source";

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> MiddlewareFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_owned();
            let url = ctx.request().url().to_string();

            let response = next.run(ctx).await;

            let elapsed = start.elapsed();
            tracing::info!(
                %method,
                %url,
                status = response.status().as_u16(),
                source = response.headers().get(SOURCE_HEADER).unwrap_or("-"),
                ?elapsed,
                "request handled"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;

    fn ctx() -> Context {
        Context::new(Request::get(url::Url::parse("http://library.local/").unwrap()))
    }

    struct Stamp;

    impl Middleware for Stamp {
        fn handle(&self, ctx: Context, next: Next) -> MiddlewareFuture {
            Box::pin(async move { next.run(ctx).await.header("X-Stamp", "1") })
        }
    }

    struct Answer;

    impl Middleware for Answer {
        fn handle(&self, _ctx: Context, _next: Next) -> MiddlewareFuture {
            Box::pin(async { Response::new(StatusCode::Ok).body("answered") })
        }
    }

    #[tokio::test]
    async fn layers_run_in_order_and_decorate() {
        let chain: Arc<[MiddlewareHandler]> = Arc::from(vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            from_middleware(Arc::new(Stamp)),
            from_middleware(Arc::new(Answer)),
        ]);
        let response = Next::new(chain).run(ctx()).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.text(), "answered");
        assert_eq!(response.headers().get("x-stamp"), Some("1"));
    }

    #[tokio::test]
    async fn exhausted_chain_is_500() {
        let chain: Arc<[MiddlewareHandler]> = Arc::from(vec![from_middleware(Arc::new(Stamp))]);
        let response = Next::new(chain).run(ctx()).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }
}
