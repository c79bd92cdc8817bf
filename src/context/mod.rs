//! Per-request context handed through the middleware pipeline.

use crate::http::Request;

/// The request being handled, as seen by each middleware layer.
pub struct Context {
    request: Request,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    /// Decodes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::http::Method;

    #[test]
    fn json_body() {
        let request = Request::new(
            Method::Post,
            url::Url::parse("http://library.local/__offcache/message").unwrap(),
        )
        .with_body(r#"{"type":"GET_VERSION"}"#);
        let ctx = Context::new(request);
        let value: Value = ctx.json().unwrap();
        assert_eq!(value, json!({ "type": "GET_VERSION" }));
        assert_eq!(ctx.into_request().path(), "/__offcache/message");
    }

    #[test]
    fn json_rejects_garbage() {
        let ctx = Context::new(Request::get(url::Url::parse("http://library.local/").unwrap()));
        assert!(ctx.json::<Value>().is_err());
    }
}
