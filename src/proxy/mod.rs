//! The proxy service: puts a [`Registration`] in front of the network.
//!
//! Requests flow through three layers. [`LoggerMiddleware`] records the
//! outcome, [`ControlMiddleware`] answers the `/__offcache/*` endpoints that
//! stand in for the browser's message, sync, push and notification events,
//! and [`WorkerMiddleware`] hands everything else to the controlling worker,
//! forwarding to the network whatever the worker lets pass.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::context::Context;
use crate::fetch::Fetch;
use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::{
    LoggerMiddleware, Middleware, MiddlewareFuture, MiddlewareHandler, Next, SOURCE_HEADER,
    from_middleware,
};
use crate::worker::{Interception, Notification, Registration, SyncOutcome};

/// Path prefix of the control endpoints.
pub const CONTROL_PREFIX: &str = "/__offcache/";

/// Value of the source header for requests the worker did not handle.
const PASSTHROUGH_SOURCE: &str = "passthrough";

/// The full request pipeline of the proxy.
#[derive(Clone)]
pub struct ProxyService {
    pipeline: Arc<[MiddlewareHandler]>,
}

impl ProxyService {
    /// Builds the pipeline. Control endpoints are served on `origin` only.
    pub fn new(registration: Arc<Registration>, fetcher: Arc<dyn Fetch>, origin: Url) -> Self {
        let pipeline: Arc<[MiddlewareHandler]> = Arc::from(vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            from_middleware(Arc::new(ControlMiddleware {
                registration: Arc::clone(&registration),
                origin,
            })),
            from_middleware(Arc::new(WorkerMiddleware {
                registration,
                fetcher,
            })),
        ]);
        Self { pipeline }
    }

    pub async fn handle(&self, request: Request) -> Response {
        Next::new(Arc::clone(&self.pipeline))
            .run(Context::new(request))
            .await
    }
}

/// Body of `POST /__offcache/notificationclick`.
#[derive(Debug, Deserialize)]
pub struct NotificationClick {
    pub notification: Notification,
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Serialize)]
struct ClickOutcome {
    opened: bool,
}

/// Answers the control endpoints; passes every other request on.
pub struct ControlMiddleware {
    registration: Arc<Registration>,
    origin: Url,
}

impl Middleware for ControlMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> MiddlewareFuture {
        let registration = Arc::clone(&self.registration);
        let is_control = ctx.request().url().origin() == self.origin.origin()
            && ctx.request().path().starts_with(CONTROL_PREFIX);

        Box::pin(async move {
            if !is_control {
                return next.run(ctx).await;
            }
            if *ctx.request().method() != Method::Post {
                return Response::new(StatusCode::MethodNotAllowed)
                    .header("Allow", "POST")
                    .body("Method Not Allowed");
            }

            let endpoint = ctx.request().path()[CONTROL_PREFIX.len()..].to_owned();
            match endpoint.as_str() {
                "message" => post_message(&registration, &ctx).await,
                "sync" => sync(&registration, &ctx).await,
                "push" => push(&registration, &ctx).await,
                "notificationclick" => notification_click(&registration, &ctx).await,
                _ => Response::new(StatusCode::NotFound).body("Unknown control endpoint"),
            }
        })
    }
}

fn bad_request(e: impl std::fmt::Display) -> Response {
    Response::new(StatusCode::BadRequest).body(format!("Bad Request: {e}"))
}

fn no_worker() -> Response {
    Response::new(StatusCode::ServiceUnavailable).body("No active worker")
}

/// Delivers a message. `GET_VERSION` is answered with the reply the worker
/// sends back; anything else yields `204 No Content`.
async fn post_message(registration: &Registration, ctx: &Context) -> Response {
    let message: Value = match ctx.json() {
        Ok(message) => message,
        Err(e) => return bad_request(e),
    };

    let (port, reply) = oneshot::channel();
    if let Err(e) = registration.post_message(&message, Some(port)).await {
        warn!(error = %e, "message handling failed");
        return Response::new(StatusCode::InternalServerError).body(e.to_string());
    }

    match reply.await {
        Ok(version) => Response::new(StatusCode::Ok).json(&version),
        Err(_) => Response::new(StatusCode::NoContent),
    }
}

/// Fires a background sync. The body is the tag.
async fn sync(registration: &Registration, ctx: &Context) -> Response {
    let Some(worker) = registration.controller().await else {
        return no_worker();
    };
    let Ok(tag) = std::str::from_utf8(ctx.request().body()) else {
        return bad_request("sync tag is not UTF-8");
    };
    match worker.handle_sync(tag.trim()).await {
        SyncOutcome::Completed => Response::new(StatusCode::Accepted),
        SyncOutcome::Ignored => Response::new(StatusCode::NoContent),
    }
}

/// Delivers a push message and returns the notification it produced.
async fn push(registration: &Registration, ctx: &Context) -> Response {
    let Some(worker) = registration.controller().await else {
        return no_worker();
    };
    match worker.handle_push(Some(ctx.request().body().as_ref())) {
        Ok(Some(notification)) => Response::new(StatusCode::Ok).json(&notification),
        Ok(None) => Response::new(StatusCode::NoContent),
        Err(e) => bad_request(e),
    }
}

async fn notification_click(registration: &Registration, ctx: &Context) -> Response {
    let Some(worker) = registration.controller().await else {
        return no_worker();
    };
    let click: NotificationClick = match ctx.json() {
        Ok(click) => click,
        Err(e) => return bad_request(e),
    };
    let opened = worker.handle_notification_click(&click.notification, &click.action);
    Response::new(StatusCode::Ok).json(&ClickOutcome { opened })
}

/// Terminal layer: the controlling worker, then the network.
pub struct WorkerMiddleware {
    registration: Arc<Registration>,
    fetcher: Arc<dyn Fetch>,
}

impl Middleware for WorkerMiddleware {
    fn handle(&self, ctx: Context, _next: Next) -> MiddlewareFuture {
        let registration = Arc::clone(&self.registration);
        let fetcher = Arc::clone(&self.fetcher);

        Box::pin(async move {
            let request = ctx.into_request();
            if let Some(worker) = registration.controller().await {
                if let Interception::Respond { response, source } =
                    worker.handle_fetch(&request).await
                {
                    return response.header(SOURCE_HEADER, source.to_string());
                }
            }

            debug!(url = %request.url(), "forwarding to network");
            match fetcher.fetch(&request).await {
                Ok(response) => response.header(SOURCE_HEADER, PASSTHROUGH_SOURCE),
                Err(e) => {
                    warn!(url = %request.url(), error = %e, "upstream request failed");
                    Response::new(StatusCode::BadGateway)
                        .header(SOURCE_HEADER, PASSTHROUGH_SOURCE)
                        .body("Bad Gateway")
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::worker::testing::{Harness, ORIGIN, harness};

    struct Fixture {
        h: Harness,
        registration: Arc<Registration>,
        proxy: ProxyService,
    }

    async fn fixture() -> Fixture {
        let h = harness();
        h.fetcher
            .respond(&format!("{ORIGIN}/books"), StatusCode::Ok, "[]")
            .respond("https://cdn.example.com/lib.js", StatusCode::Ok, "lib()");
        let registration = Arc::new(Registration::new());
        registration.register(Arc::clone(&h.worker)).await.unwrap();
        let proxy = ProxyService::new(
            Arc::clone(&registration),
            Arc::clone(&h.fetcher) as Arc<dyn Fetch>,
            Url::parse(ORIGIN).unwrap(),
        );
        Fixture {
            h,
            registration,
            proxy,
        }
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
    }

    fn control(endpoint: &str, body: &str) -> Request {
        Request::new(
            Method::Post,
            Url::parse(ORIGIN)
                .unwrap()
                .join(&format!("{CONTROL_PREFIX}{endpoint}"))
                .unwrap(),
        )
        .with_body(body.to_owned())
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let f = fixture().await;

        let first = f.proxy.handle(get("/books")).await;
        assert_eq!(first.status(), StatusCode::Ok);
        assert_eq!(first.headers().get(SOURCE_HEADER), Some("network"));

        let second = f.proxy.handle(get("/books")).await;
        assert_eq!(second.text(), "[]");
        assert_eq!(second.headers().get(SOURCE_HEADER), Some("cache"));
        assert_eq!(f.h.fetcher.calls_to(&format!("{ORIGIN}/books")), 1);
    }

    #[tokio::test]
    async fn cross_origin_and_non_get_pass_through() {
        let f = fixture().await;

        let cdn = f
            .proxy
            .handle(Request::get(Url::parse("https://cdn.example.com/lib.js").unwrap()))
            .await;
        assert_eq!(cdn.text(), "lib()");
        assert_eq!(cdn.headers().get(SOURCE_HEADER), Some("passthrough"));

        let post = Request::new(Method::Post, Url::parse(&format!("{ORIGIN}/books")).unwrap());
        let response = f.proxy.handle(post).await;
        assert_eq!(response.headers().get(SOURCE_HEADER), Some("passthrough"));
        assert!(f.h.storage.match_request(&get("/books")).await.is_none());
    }

    #[tokio::test]
    async fn passthrough_failure_is_bad_gateway() {
        let f = fixture().await;
        f.h.fetcher.go_offline();
        let post = Request::new(Method::Post, Url::parse(&format!("{ORIGIN}/books")).unwrap());
        assert_eq!(f.proxy.handle(post).await.status(), StatusCode::BadGateway);
    }

    #[tokio::test]
    async fn offline_uncached_asset_is_503() {
        let f = fixture().await;
        f.h.fetcher.go_offline();
        let response = f.proxy.handle(get("/static/js/app.js")).await;
        assert_eq!(response.status(), StatusCode::ServiceUnavailable);
        assert_eq!(response.text(), "Offline");
        assert_eq!(response.headers().get(SOURCE_HEADER), Some("unavailable"));
    }

    #[tokio::test]
    async fn get_version_round_trip() {
        let f = fixture().await;
        let response = f
            .proxy
            .handle(control("message", r#"{"type":"GET_VERSION"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::Ok);
        let body: Value = serde_json::from_slice(response.bytes()).unwrap();
        assert_eq!(body, json!({ "version": "butha-buthe-library-v1" }));
    }

    #[tokio::test]
    async fn other_messages_get_no_content() {
        let f = fixture().await;
        let response = f
            .proxy
            .handle(control("message", r#"{"type":"SKIP_WAITING"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::NoContent);

        let garbage = f.proxy.handle(control("message", "not json")).await;
        assert_eq!(garbage.status(), StatusCode::BadRequest);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_endpoint_reports_outcome() {
        let f = fixture().await;
        let ours = f.proxy.handle(control("sync", "sync-offline-actions\n")).await;
        assert_eq!(ours.status(), StatusCode::Accepted);
        let theirs = f.proxy.handle(control("sync", "sync-reviews")).await;
        assert_eq!(theirs.status(), StatusCode::NoContent);
    }

    #[tokio::test]
    async fn push_and_click_endpoints() {
        let f = fixture().await;
        let pushed = f
            .proxy
            .handle(control("push", r#"{"title":"New arrivals","body":"5 books"}"#))
            .await;
        assert_eq!(pushed.status(), StatusCode::Ok);
        let notification: Value = serde_json::from_slice(pushed.bytes()).unwrap();
        assert_eq!(notification["title"], "New arrivals");

        let click = json!({ "notification": notification, "action": "view" }).to_string();
        let clicked = f.proxy.handle(control("notificationclick", &click)).await;
        let outcome: Value = serde_json::from_slice(clicked.bytes()).unwrap();
        assert_eq!(outcome, json!({ "opened": true }));
        assert_eq!(f.h.host.opened.lock().unwrap().len(), 1);

        let empty = f.proxy.handle(control("push", "")).await;
        assert_eq!(empty.status(), StatusCode::NoContent);
        let invalid = f.proxy.handle(control("push", r#"{"body":"no title"}"#)).await;
        assert_eq!(invalid.status(), StatusCode::BadRequest);
    }

    #[tokio::test]
    async fn control_endpoints_require_post_and_known_names() {
        let f = fixture().await;
        let response = f.proxy.handle(get("/__offcache/message")).await;
        assert_eq!(response.status(), StatusCode::MethodNotAllowed);
        let unknown = f.proxy.handle(control("reboot", "")).await;
        assert_eq!(unknown.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn without_a_worker_everything_is_forwarded() {
        let h = harness();
        h.fetcher.respond(&format!("{ORIGIN}/books"), StatusCode::Ok, "[]");
        let proxy = ProxyService::new(
            Arc::new(Registration::new()),
            Arc::clone(&h.fetcher) as Arc<dyn Fetch>,
            Url::parse(ORIGIN).unwrap(),
        );
        let response = proxy.handle(get("/books")).await;
        assert_eq!(response.headers().get(SOURCE_HEADER), Some("passthrough"));
        assert_eq!(proxy.handle(control("sync", "x")).await.status(), StatusCode::ServiceUnavailable);
    }

    #[tokio::test]
    async fn controller_is_the_registered_worker() {
        let f = fixture().await;
        let controller = f.registration.controller().await.unwrap();
        assert!(Arc::ptr_eq(&controller, &f.h.worker));
    }
}
