//! HTTP response builder handed to application handlers.

use crate::http::types::{StatusCode, Version};
use chrono::Utc;

pub(crate) const SERVER_TOKEN: &str = concat!("nesta/", env!("CARGO_PKG_VERSION"));

/// Response under construction for one request.
///
/// Handlers set a status, add headers and append body bytes; the core
/// serializes the result after the handler returns and accounts the body
/// length for the access log. A handler that wants the connection kept open
/// after this exchange must call [`keep_alive`](Response::keep_alive);
/// otherwise the core closes it.
///
/// ```
/// use nesta::{Response, StatusCode};
///
/// fn fill(resp: &mut Response) {
///     resp.status(StatusCode::Ok)
///         .header("Content-Type", "text/html")
///         .write_body(b"<h1>hi</h1>");
/// }
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    pub(crate) fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: false,
        }
    }

    /// Sets the response status.
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Adds a response header. `Content-Length` and `Connection` are managed
    /// by the core and need not be set here.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends bytes to the response body. May be called repeatedly.
    pub fn write_body(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);
        self
    }

    /// Replaces the response body.
    pub fn body(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.body.clear();
        self.body.extend_from_slice(data.as_ref());
        self
    }

    /// Opts this exchange into connection reuse. The core still closes the
    /// connection when the client did not ask for keep-alive or the request
    /// budget is exhausted.
    pub fn keep_alive(&mut self) -> &mut Self {
        self.keep_alive = true;
        self
    }

    #[inline]
    pub(crate) fn wants_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub(crate) fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Body length, as reported to the access log.
    #[inline]
    pub(crate) fn content_bytes(&self) -> usize {
        self.body.len()
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Serializes the response. `keep_alive_window` is `Some((timeout, max))`
    /// when the connection stays open after this exchange. `head_only`
    /// suppresses the body (HEAD requests).
    pub(crate) fn finish(
        &self,
        version: Version,
        keep_alive_window: Option<(u64, u32)>,
        head_only: bool,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.status.into_first_line(version));

        if !self.has_header("date") {
            push_header(&mut out, "Date", &http_date_now());
        }
        if !self.has_header("server") {
            push_header(&mut out, "Server", SERVER_TOKEN);
        }
        for (name, value) in &self.headers {
            push_header(&mut out, name, value);
        }
        if !self.has_header("content-length") {
            push_header(&mut out, "Content-Length", &self.body.len().to_string());
        }
        match keep_alive_window {
            Some((timeout, max)) => {
                push_header(&mut out, "Keep-Alive", &format!("timeout={timeout}, max={max}"));
                push_header(&mut out, "Connection", "Keep-Alive");
            }
            None => push_header(&mut out, "Connection", "close"),
        }
        out.extend_from_slice(b"\r\n");

        if !head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

#[inline]
fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Current time as an RFC 1123 GMT date, e.g. `Tue, 01 Jul 2025 10:00:00 GMT`.
pub(crate) fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(bytes: &[u8]) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn finish_close_mode() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body("hello");

        let out = text(&resp.finish(Version::Http11, None, false));
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
        assert_eq!(resp.content_bytes(), 5);
    }

    #[test]
    fn finish_keep_alive_mode() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok).body("x");

        let out = text(&resp.finish(Version::Http11, Some((3, 5)), false));
        assert!(out.contains("Keep-Alive: timeout=3, max=5\r\n"));
        assert!(out.contains("Connection: Keep-Alive\r\n"));
    }

    #[test]
    fn head_only_omits_body_but_keeps_length() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok).body("sized");

        let out = text(&resp.finish(Version::Http11, None, true));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn write_body_appends() {
        let mut resp = Response::new();
        resp.write_body(b"ab").write_body(b"cd");
        assert_eq!(resp.content_bytes(), 4);
    }

    #[test]
    fn explicit_content_length_not_duplicated() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok)
            .header("Content-Length", "13")
            .body("ignored-count");
        let out = text(&resp.finish(Version::Http11, None, false));
        assert_eq!(out.matches("Content-Length").count(), 1);
    }
}
