//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function. Request targets are resolved against a base URL, so a client
//! pointed at the proxy with plain paths (`GET /books`) addresses the backend
//! origin, while absolute-form targets (`GET https://cdn.../x.css`) keep their
//! own origin. Supports HTTP/1.1 persistent connections.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP/1.1 front end of the proxy.
///
/// # Examples
///
/// ```rust,no_run
/// use offcache::server::Server;
/// use offcache::http::{Request, Response, StatusCode};
/// use url::Url;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let origin = Url::parse("http://localhost:5000")?;
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(origin, |req: Request| async move {
///         Response::new(StatusCode::Ok).body(req.url().to_string())
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, dispatching each request to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, base: Url, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(base, handler, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops accepting once `shutdown` resolves.
    /// Connections already being served finish on their own.
    pub async fn run_until<H, F, S>(
        self,
        base: Url,
        handler: H,
        shutdown: S,
    ) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        let handler = Arc::new(handler);
        let base = Arc::new(base);
        info!(address = %self.local_addr, origin = %base, "offcache proxy listening");

        tokio::pin!(shutdown);
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let base = Arc::clone(&base);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, &base, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime, one request per loop
/// iteration, until the peer closes or signals `Connection: close`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    base: &Url,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // A pipelined connection may already hold more than one request.
        while !buf.is_empty() {
            let (request, body_offset) = match Request::parse(&buf, base) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => break,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                    let response = Response::new(StatusCode::BadRequest)
                        .body(format!("Bad Request: {e}"))
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    return Ok(());
                }
            };

            let total_needed = body_offset + request.content_length().unwrap_or(0);
            if buf.len() < total_needed {
                break;
            }

            let keep_alive = request.is_keep_alive();
            debug!(
                peer = %peer_addr,
                method = %request.method(),
                url = %request.url(),
                "dispatching request"
            );

            let response = handler(request).await.keep_alive(keep_alive);
            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            let _ = buf.split_to(total_needed);

            if !keep_alive {
                debug!(peer = %peer_addr, "Connection: close, shutting down");
                return Ok(());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    use super::*;

    async fn spawn_echo() -> (SocketAddr, oneshot::Sender<()>) {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (stop, stopped) = oneshot::channel::<()>();
        let base = Url::parse("http://library.local").unwrap();
        tokio::spawn(server.run_until(
            base,
            |req: Request| async move {
                Response::new(StatusCode::Ok).body(format!("{} {}", req.method(), req.url()))
            },
            async {
                let _ = stopped.await;
            },
        ));
        (addr, stop)
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn resolves_origin_form_against_base() {
        let (addr, _stop) = spawn_echo().await;
        let reply = exchange(
            addr,
            b"GET /books?page=2 HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("GET http://library.local/books?page=2"));
    }

    #[tokio::test]
    async fn pipelined_requests_are_all_answered() {
        let (addr, _stop) = spawn_echo().await;
        let reply = exchange(
            addr,
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(reply.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(reply.contains("http://library.local/a"));
        assert!(reply.ends_with("http://library.local/b"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (addr, _stop) = spawn_echo().await;
        let reply = exchange(addr, b"GET\x01 / HTTP/1.1\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn stops_accepting_after_shutdown() {
        let (addr, stop) = spawn_echo().await;
        stop.send(()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
