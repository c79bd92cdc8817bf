//! HTTP/1.1 requests: wire parsing via [`httparse`] and a small builder for
//! requests the worker issues itself.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request target {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },
}

/// Why a request was issued, mirroring the Fetch `mode` attribute.
///
/// Only the distinction between [`RequestMode::Navigate`] and everything else
/// changes the worker's behavior: offline navigations get the fallback page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Loading a new top-level document.
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
}

impl RequestMode {
    /// Derives the mode from request headers.
    ///
    /// Browsers send `Sec-Fetch-Mode`; older clients do not, in which case a
    /// GET that accepts HTML is treated as a navigation.
    pub fn from_headers(method: &Method, headers: &Headers) -> Self {
        if let Some(mode) = headers.get("sec-fetch-mode") {
            return match mode.trim().to_ascii_lowercase().as_str() {
                "navigate" => Self::Navigate,
                "same-origin" => Self::SameOrigin,
                "cors" => Self::Cors,
                _ => Self::NoCors,
            };
        }

        let wants_html = headers
            .get("accept")
            .is_some_and(|accept| accept.contains("text/html"));
        if *method == Method::Get && wants_html {
            Self::Navigate
        } else {
            Self::NoCors
        }
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Navigate => "navigate",
            Self::SameOrigin => "same-origin",
            Self::NoCors => "no-cors",
            Self::Cors => "cors",
        })
    }
}

/// An HTTP request addressed by absolute URL.
///
/// Requests read off the wire by the proxy are created by [`Request::parse`],
/// which resolves origin-form targets (`/books?page=2`) against a base URL.
/// Requests the worker issues itself use [`Request::get`].
///
/// # Examples
///
/// ```
/// use offcache::http::{Request, RequestMode};
/// use url::Url;
///
/// let base = Url::parse("http://library.local").unwrap();
/// let raw = b"GET /books?page=2 HTTP/1.1\r\nHost: library.local\r\nSec-Fetch-Mode: navigate\r\n\r\n";
/// let (request, _offset) = Request::parse(raw, &base).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.url().as_str(), "http://library.local/books?page=2");
/// assert_eq!(request.query_param("page").as_deref(), Some("2"));
/// assert_eq!(request.mode(), RequestMode::Navigate);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
    mode: RequestMode,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a request with no headers and an empty body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
            mode: RequestMode::default(),
        }
    }

    /// Shorthand for a plain GET.
    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Absolute-form targets (`GET http://cdn.example/x.css`, as sent to a
    /// forward proxy) are taken as-is; origin-form targets are joined onto
    /// `base`. Returns the parsed `Request` and the byte offset at which the
    /// body begins in `buf`. The body itself is whatever follows the headers
    /// in `buf`; callers wait for `Content-Length` bytes before parsing.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] if the headers are not complete yet.
    /// - [`RequestError::Parse`] if the data is malformed.
    /// - [`RequestError::MissingField`] if method, path or version is absent.
    /// - [`RequestError::InvalidTarget`] if the target is not a valid URL.
    pub fn parse(buf: &[u8], base: &Url) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let name = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?;
        let Ok(method) = name.parse::<Method>();

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let url = resolve_target(target, base).map_err(|source| RequestError::InvalidTarget {
            target: target.to_owned(),
            source,
        })?;

        let mode = RequestMode::from_headers(&method, &header_map);
        let content_length = header_map
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let body_end = (body_offset + content_length).min(buf.len());
        let body = Bytes::copy_from_slice(&buf[body_offset..body_end]);

        Ok((
            Self {
                method,
                url,
                version,
                headers: header_map,
                body,
                mode,
            },
            body_offset,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the absolute request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    /// Returns `true` if this request loads a new document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

fn resolve_target(target: &str, base: &Url) -> Result<Url, url::ParseError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target)
    } else {
        base.join(target)
    }
}
