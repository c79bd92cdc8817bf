//! Request interception: cache first, network second, offline fallback last.

use std::fmt;

use tracing::{debug, error, warn};

use super::{Worker, WorkerState};
use crate::cache::CachedResponse;
use crate::fetch::FetchError;
use crate::http::{Method, Request, Response, StatusCode};

/// The worker's decision for one request.
#[derive(Debug)]
pub enum Interception {
    /// Not ours: the request goes to the network untouched and is never cached.
    Passthrough,
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Served verbatim from a cache store.
    Cache,
    /// Fetched from the network (and stored, if it was a 2xx).
    Network,
    /// A cached API response past its freshness window that could not be
    /// revalidated.
    Stale,
    /// The cached offline page, served to a navigation.
    OfflinePage,
    /// Synthesized `503 Service Unavailable`.
    Unavailable,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cache => "cache",
            Self::Network => "network",
            Self::Stale => "stale",
            Self::OfflinePage => "offline-page",
            Self::Unavailable => "unavailable",
        })
    }
}

impl Interception {
    fn respond(response: Response, source: ResponseSource) -> Self {
        Self::Respond { response, source }
    }
}

impl Worker {
    /// Decides how to answer `request`.
    ///
    /// Only an activated worker intercepts. Non-GET requests and cross-origin
    /// requests (other than the pinned static URLs) pass through. Everything
    /// else is answered from the cache, then the network, then the offline
    /// fallback; a network failure is never surfaced as an error.
    pub async fn handle_fetch(&self, request: &Request) -> Interception {
        if self.state() != WorkerState::Activated {
            return Interception::Passthrough;
        }
        if *request.method() != Method::Get {
            return Interception::Passthrough;
        }
        if !self.is_eligible(request) {
            debug!(url = %request.url(), "cross-origin request passed through");
            return Interception::Passthrough;
        }

        match self.cache_first(request).await {
            Ok((response, source)) => Interception::respond(response, source),
            Err(e) => {
                error!(url = %request.url(), error = %e, "fetch failed");
                self.offline_fallback(request).await
            }
        }
    }

    /// Same-origin requests, plus exact matches of the pinned static URLs.
    fn is_eligible(&self, request: &Request) -> bool {
        request.url().origin() == self.origin().origin()
            || self.static_urls.iter().any(|u| u == request.url())
    }

    fn is_api_request(&self, request: &Request) -> bool {
        self.api_matcher.is_match(request.url().as_str())
    }

    async fn cache_first(
        &self,
        request: &Request,
    ) -> Result<(Response, ResponseSource), FetchError> {
        let Some(cached) = self.storage().match_request(request).await else {
            let response = self.fetch_and_cache(request).await?;
            return Ok((response, ResponseSource::Network));
        };

        if self.is_expired_api_response(request, &cached) {
            debug!(url = %request.url(), "revalidating expired API response");
            return match self.fetch_and_cache(request).await {
                Ok(response) if response.is_success() => Ok((response, ResponseSource::Network)),
                Ok(response) => {
                    warn!(
                        url = %request.url(),
                        status = %response.status(),
                        "revalidation answered with an error, serving stale"
                    );
                    Ok((cached.to_response(), ResponseSource::Stale))
                }
                Err(e) => {
                    warn!(url = %request.url(), error = %e, "revalidation failed, serving stale");
                    Ok((cached.to_response(), ResponseSource::Stale))
                }
            };
        }

        debug!(url = %request.url(), "cache hit");
        Ok((cached.to_response(), ResponseSource::Cache))
    }

    fn is_expired_api_response(&self, request: &Request, cached: &CachedResponse) -> bool {
        let Some(max_age) = self.api_max_age else {
            return false;
        };
        if !self.is_api_request(request) {
            return false;
        }
        match cached.age().to_std() {
            Ok(age) => age > max_age,
            // Stored "in the future" (clock moved backwards): treat as fresh.
            Err(_) => false,
        }
    }

    /// Fetches from the network and stores 2xx responses in the dynamic store.
    ///
    /// A failed cache write is logged; the caller still gets the response.
    /// Nothing is written once the worker has stopped being the active one,
    /// so a superseded generation cannot recreate stores its successor
    /// deleted.
    async fn fetch_and_cache(&self, request: &Request) -> Result<Response, FetchError> {
        let response = self.fetcher().fetch(request).await?;
        if !response.is_success() {
            debug!(url = %request.url(), status = %response.status(), "not caching error response");
            return Ok(response);
        }

        let copy = response.clone();
        let name = self.config().dynamic_cache_name();
        let live = || self.state() == WorkerState::Activated;
        let stored = match self.storage().open_if(&name, live).await {
            Ok(Some(store)) => store.put(request, copy).await,
            Ok(None) => {
                debug!(url = %request.url(), state = %self.state(), "worker superseded, not caching");
                Ok(())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            error!(url = %request.url(), cache = %name, error = %e, "failed to cache response");
        }

        Ok(response)
    }

    async fn offline_fallback(&self, request: &Request) -> Interception {
        if request.is_navigation() {
            let offline = Request::get(self.offline_url.clone());
            if let Some(page) = self.storage().match_request(&offline).await {
                return Interception::respond(page.to_response(), ResponseSource::OfflinePage);
            }
            warn!(url = %self.offline_url, "offline page is not cached");
        }

        Interception::respond(
            Response::new(StatusCode::ServiceUnavailable).body("Offline"),
            ResponseSource::Unavailable,
        )
    }
}
