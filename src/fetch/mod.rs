//! Network access for the worker.
//!
//! The [`Fetch`] trait is the seam between caching policy and transport. The
//! production implementation, [`NetworkFetcher`], is backed by `reqwest`;
//! tests substitute a scripted fetcher that counts calls.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::debug;

use crate::http::{Headers, Request, Response, StatusCode};

/// Errors produced while fetching from the network.
///
/// Every variant is a total failure: no response was received. An origin
/// answering `404` or `500` is a successful fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("method {0:?} cannot be sent")]
    InvalidMethod(String),

    #[error("network unavailable")]
    Offline,
}

/// Future returned by [`Fetch::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, FetchError>> + Send + 'a>>;

/// Issues a request to the network and returns whatever the origin answered.
///
/// Implementations must be `Send + Sync`: one fetcher is shared by every
/// in-flight interception.
pub trait Fetch: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a>;
}

/// [`Fetch`] over a pooled `reqwest` client.
///
/// No timeout is configured: a hung origin blocks only the interception
/// waiting on it.
#[derive(Debug, Clone, Default)]
pub struct NetworkFetcher {
    client: reqwest::Client,
}

impl NetworkFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing client, e.g. one configured with a proxy or custom roots.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: &Request) -> Result<Response, FetchError> {
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|_| FetchError::InvalidMethod(request.method().to_string()))?;

        let mut outbound = self.client.request(method, request.url().clone());
        let mut headers = request.headers().clone();
        headers.strip_hop_by_hop();
        // reqwest negotiates compression itself and sets Host from the URL.
        headers.remove("host");
        headers.remove("accept-encoding");
        for (name, value) in headers.iter() {
            outbound = outbound.header(name, value);
        }
        if !request.body().is_empty() {
            outbound = outbound.body(request.body().clone());
        }

        let network_error = |source: reqwest::Error| FetchError::Network {
            url: request.url().to_string(),
            source,
        };

        let upstream = outbound.send().await.map_err(network_error)?;
        let status = StatusCode::from_u16(upstream.status().as_u16());

        let mut response_headers = Headers::with_capacity(upstream.headers().len());
        for (name, value) in upstream.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str(), value);
            }
        }

        let body = upstream.bytes().await.map_err(network_error)?;
        debug!(url = %request.url(), status = %status, bytes = body.len(), "network response");

        Ok(Response::from_parts(status, response_headers, body))
    }
}

impl Fetch for NetworkFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        Box::pin(self.send(request))
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! A deterministic [`Fetch`] for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone)]
    enum Reply {
        Respond(StatusCode, String),
        Fail,
    }

    /// Answers from a fixed table keyed by absolute URL and records every call.
    ///
    /// Unknown URLs answer `404`. [`ScriptedFetcher::go_offline`] makes every
    /// subsequent fetch fail.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        replies: Mutex<HashMap<String, Reply>>,
        offline: Mutex<bool>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn respond(&self, url: &str, status: StatusCode, body: &str) -> &Self {
            self.replies
                .lock()
                .unwrap()
                .insert(url.to_owned(), Reply::Respond(status, body.to_owned()));
            self
        }

        pub(crate) fn fail(&self, url: &str) -> &Self {
            self.replies
                .lock()
                .unwrap()
                .insert(url.to_owned(), Reply::Fail);
            self
        }

        pub(crate) fn go_offline(&self) {
            *self.offline.lock().unwrap() = true;
        }

        pub(crate) fn go_online(&self) {
            *self.offline.lock().unwrap() = false;
        }

        /// Number of fetches issued for `url`, any method.
        pub(crate) fn calls_to(&self, url: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, u)| u == url)
                .count()
        }

        pub(crate) fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Fetch for ScriptedFetcher {
        fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
            let url = request.url().to_string();
            self.calls
                .lock()
                .unwrap()
                .push((request.method().to_string(), url.clone()));

            let reply = if *self.offline.lock().unwrap() {
                Reply::Fail
            } else {
                self.replies
                    .lock()
                    .unwrap()
                    .get(&url)
                    .cloned()
                    .unwrap_or(Reply::Respond(StatusCode::NotFound, "Not Found".into()))
            };

            Box::pin(async move {
                match reply {
                    Reply::Respond(status, body) => Ok(Response::new(status).body(body)),
                    Reply::Fail => Err(FetchError::Offline),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedFetcher;
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn scripted_fetcher_counts_calls_and_goes_offline() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("http://library.local/", StatusCode::Ok, "home");
        let request = Request::get(Url::parse("http://library.local/").unwrap());

        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.text(), "home");

        fetcher.go_offline();
        assert!(matches!(
            fetcher.fetch(&request).await,
            Err(FetchError::Offline)
        ));
        assert_eq!(fetcher.calls_to("http://library.local/"), 2);
    }

    mod network {
        use wiremock::matchers::{body_string, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use super::*;
        use crate::http::Method;

        fn url_on(server: &MockServer, p: &str) -> Url {
            Url::parse(&format!("{}{p}", server.uri())).unwrap()
        }

        #[tokio::test]
        async fn status_headers_and_body_come_back_intact() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/teapot"))
                .respond_with(
                    ResponseTemplate::new(418)
                        .insert_header("x-library-shelf", "B12")
                        .set_body_string("short and stout"),
                )
                .mount(&server)
                .await;

            let response = NetworkFetcher::new()
                .fetch(&Request::get(url_on(&server, "/teapot")))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::Other(418));
            assert!(!response.is_success());
            assert_eq!(response.headers().get("x-library-shelf"), Some("B12"));
            assert_eq!(response.text(), "short and stout");
        }

        #[tokio::test]
        async fn client_connection_headers_are_not_forwarded() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/books"))
                .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
                .mount(&server)
                .await;

            let request = Request::get(url_on(&server, "/books"))
                .with_header("Host", "library.local")
                .with_header("Connection", "keep-alive")
                .with_header("Keep-Alive", "timeout=5")
                .with_header("Accept-Encoding", "br")
                .with_header("X-Library-Client", "web");
            let response = NetworkFetcher::new().fetch(&request).await.unwrap();
            assert_eq!(response.status(), StatusCode::Ok);

            let received = server.received_requests().await.unwrap();
            assert_eq!(received.len(), 1);
            let headers = &received[0].headers;
            let host = headers.get("host").unwrap().to_str().unwrap();
            assert_ne!(host, "library.local");
            assert!(headers.get("connection").is_none());
            assert!(headers.get("keep-alive").is_none());
            assert!(
                headers
                    .get("accept-encoding")
                    .is_none_or(|v| v.to_str().unwrap() != "br")
            );
            assert_eq!(headers.get("x-library-client").unwrap().to_str().unwrap(), "web");
        }

        #[tokio::test]
        async fn non_get_bodies_are_forwarded() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/borrow"))
                .and(body_string(r#"{"bookId":4}"#))
                .respond_with(ResponseTemplate::new(201).set_body_string("borrowed"))
                .mount(&server)
                .await;

            let request = Request::new(Method::Post, url_on(&server, "/api/borrow"))
                .with_header("Content-Type", "application/json")
                .with_body(r#"{"bookId":4}"#);
            let response = NetworkFetcher::new().fetch(&request).await.unwrap();

            assert_eq!(response.status(), StatusCode::Created);
            assert_eq!(response.text(), "borrowed");
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let fetcher = NetworkFetcher::new();
        // Port 9 (discard) on localhost is closed in test environments.
        let request = Request::get(Url::parse("http://127.0.0.1:9/").unwrap());
        let err = fetcher.fetch(&request).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
    }
}
