//! # offcache
//!
//! An offline-first caching proxy for the library front end. A versioned
//! worker precaches the application shell, answers requests cache-first with
//! a network fallback, serves an offline page to navigations when the network
//! is gone, and rolls old cache generations away on activation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use offcache::cache::CacheStorage;
//! use offcache::config::WorkerConfig;
//! use offcache::fetch::{Fetch, NetworkFetcher};
//! use offcache::proxy::ProxyService;
//! use offcache::server::Server;
//! use offcache::worker::{LoggingHost, Registration, Worker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkerConfig::default();
//!     let origin = config.origin_url()?;
//!     let fetcher: Arc<dyn Fetch> = Arc::new(NetworkFetcher::new());
//!     let worker = Worker::new(
//!         config,
//!         Arc::new(CacheStorage::in_memory()),
//!         Arc::clone(&fetcher),
//!         Arc::new(LoggingHost),
//!     )?;
//!
//!     let registration = Arc::new(Registration::new());
//!     registration.register(Arc::new(worker)).await?;
//!
//!     let proxy = ProxyService::new(registration, fetcher, origin.clone());
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server
//!         .run(origin, move |req| {
//!             let proxy = proxy.clone();
//!             async move { proxy.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod fetch;
pub mod http;
pub mod middleware;
pub mod proxy;
pub mod server;
pub mod telemetry;
pub mod worker;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::ProxyService;
pub use server::{Server, ServerError};
pub use worker::{Registration, Worker, WorkerError};
