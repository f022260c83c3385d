use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    /// Lowercased header names; repeated headers are joined with ", ".
    pub headers: Vec<(String, String)>,
    /// HTTP/1.1 request line + headers + body as sent.
    pub bytes_sent: u64,
    /// HTTP/1.1 status line + headers + body as received.
    pub bytes_received: u64,
    /// Time from sending the request until the response head arrived.
    pub waiting: Duration,
    /// Time from sending the request until the whole body was read.
    pub duration: Duration,
}

impl HttpResponse {
    pub fn body_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 1xx-3xx.
    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Option<Duration>,
    /// Low-cardinality request name used as the `name` metric tag; defaults to the URL.
    pub name: Option<String>,
}

impl HttpRequest {
    pub fn new(method: http::Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: None,
            name: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(http::Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(http::Method::POST, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(http::Method::PUT, url).with_body(body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(http::Method::DELETE, url)
    }

    /// POST with a JSON body and `content-type: application/json`.
    pub fn post_json<T: serde::Serialize + ?Sized>(url: impl Into<String>, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body)?;
        Ok(Self::post(url, body).header("content-type", "application/json"))
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", format!("Bearer {token}"))
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tag_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_fill_method_body_and_name() {
        let req = HttpRequest::post("http://localhost/login", "{}")
            .bearer("abc")
            .with_name("login");
        assert_eq!(req.method, http::Method::POST);
        assert_eq!(req.body, Bytes::from_static(b"{}"));
        assert_eq!(
            req.headers,
            vec![("authorization".to_string(), "Bearer abc".to_string())]
        );
        assert_eq!(req.tag_name(), "login");
        assert_eq!(HttpRequest::get("http://x/y").tag_name(), "http://x/y");
    }

    #[test]
    fn post_json_sets_content_type() {
        let req = HttpRequest::post_json("http://x/", &serde_json::json!({"user": "a"}))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(req.body, Bytes::from_static(br#"{"user":"a"}"#));
        assert_eq!(req.headers[0].1, "application/json");
    }

    #[test]
    fn response_helpers() {
        let res = HttpResponse {
            status: 201,
            body: Bytes::from_static(br#"{"token":"t1"}"#),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            bytes_sent: 0,
            bytes_received: 0,
            waiting: Duration::ZERO,
            duration: Duration::ZERO,
        };
        assert!(res.is_success());
        assert_eq!(res.header("Content-Type"), Some("application/json"));

        #[derive(serde::Deserialize)]
        struct Token {
            token: String,
        }
        let token: Token = res.json().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(token.token, "t1");
    }
}
