use crate::{
    errors::RequestError,
    http::types::{Method, Version},
};
use memchr::memchr;
use std::{net::SocketAddr, time::Duration};
use tokio::{io::AsyncReadExt, net::TcpStream, time::timeout};

/// Upper bound on the request head (request line + headers).
const MAX_HEAD_SIZE: usize = 16 * 1024;
/// Upper bound on the request target.
const MAX_URI_SIZE: usize = 2048;
const MAX_HEADERS: usize = 64;
const MAX_BODY_SIZE: usize = 1024 * 1024;
/// How long a worker waits for the rest of a request once bytes started
/// arriving.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed HTTP request as seen by handlers.
///
/// The *content name* is the request path without its leading slash and
/// without the query string; it selects a registered handler on exact match
/// and otherwise names the file served from the document root.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: String,
    version: Version,
    content_name: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Vec<u8>,
    peer: SocketAddr,
    start_us: i64,
}

impl Request {
    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The raw request target, e.g. `/app/report?fmt=csv`.
    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[inline]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Path without the leading `/` and without the query string.
    #[inline]
    pub fn content_name(&self) -> &str {
        &self.content_name
    }

    /// First header value whose name matches case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of the query parameter `key`, if present.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[inline]
    pub fn query_count(&self) -> usize {
        self.query.len()
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Microsecond Unix timestamp taken when this request started parsing.
    /// The access log derives its elapsed-time column from it.
    #[inline]
    pub const fn start_us(&self) -> i64 {
        self.start_us
    }
}

/// Per-connection request reader. Keeps bytes that arrived beyond the end of
/// the previous request so pipelined keep-alive requests are not lost.
pub(crate) struct RequestReader {
    buf: Vec<u8>,
}

impl RequestReader {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Reads and parses exactly one request from `stream`.
    pub(crate) async fn read_request(
        &mut self,
        stream: &mut TcpStream,
        peer: SocketAddr,
    ) -> Result<Request, RequestError> {
        let head_end = loop {
            if let Some(pos) = find_head_end(&self.buf) {
                break pos;
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(RequestError::TooManyHeaders);
            }
            if self.fill(stream).await? == 0 {
                return Err(RequestError::Closed);
            }
        };

        let start_us = chrono::Utc::now().timestamp_micros();
        let mut request = parse_head(&self.buf[..head_end], peer, start_us)?;

        let mut consumed = head_end + 4;
        if let Some(len) = content_length(&request)? {
            while self.buf.len() < consumed + len {
                if self.fill(stream).await? == 0 {
                    return Err(RequestError::Closed);
                }
            }
            request.body = self.buf[consumed..consumed + len].to_vec();
            consumed += len;
        }
        self.buf.drain(..consumed);

        Ok(request)
    }

    /// Keep-alive wait: returns `true` when another request can be read,
    /// `false` on idle timeout or an orderly close.
    pub(crate) async fn wait_for_data(&self, stream: &TcpStream, wait: Duration) -> bool {
        if !self.buf.is_empty() {
            return true;
        }
        let mut probe = [0u8; 1];
        match timeout(wait, stream.peek(&mut probe)).await {
            Ok(Ok(n)) => n > 0,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    async fn fill(&mut self, stream: &mut TcpStream) -> Result<usize, RequestError> {
        let mut chunk = [0u8; 4096];
        let n = match timeout(RECV_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => return Err(RequestError::Timeout),
        };
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

#[inline]
fn find_head_end(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n\r\n")
}

fn content_length(request: &Request) -> Result<Option<usize>, RequestError> {
    let Some(value) = request.header("content-length") else {
        return Ok(None);
    };
    let len: usize = value.parse().map_err(|_| RequestError::BadHeader)?;
    if len > MAX_BODY_SIZE {
        return Err(RequestError::BodyTooLarge);
    }
    Ok(Some(len))
}

fn parse_head(head: &[u8], peer: SocketAddr, start_us: i64) -> Result<Request, RequestError> {
    // the terminating blank line is not part of `head`, so the request line
    // of a header-less request has no trailing newline
    let line_end = memchr(b'\n', head).unwrap_or(head.len());
    let line = strip_cr(&head[..line_end]);

    let (method, after_method) = Method::from_bytes(line)?;
    let rest = &line[after_method..];

    let target_end = memchr(b' ', rest).ok_or(RequestError::BadRequestLine)?;
    if target_end > MAX_URI_SIZE {
        return Err(RequestError::UriTooLong);
    }
    let target = as_str(&rest[..target_end])?;
    if !target.starts_with('/') {
        return Err(RequestError::BadRequestLine);
    }
    let version = Version::from_bytes(&rest[target_end + 1..])?;

    let (path, raw_query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };
    let content_name = path.trim_start_matches('/').to_owned();
    let query = raw_query.map(parse_query).unwrap_or_default();

    let mut headers = Vec::new();
    let mut rest = head.get(line_end + 1..).unwrap_or(b"");
    while !rest.is_empty() {
        let line_end = memchr(b'\n', rest).unwrap_or(rest.len());
        let line = strip_cr(&rest[..line_end]);
        rest = rest.get(line_end + 1..).unwrap_or(b"");

        if line.is_empty() {
            continue;
        }
        if headers.len() == MAX_HEADERS {
            return Err(RequestError::TooManyHeaders);
        }
        let colon = memchr(b':', line).ok_or(RequestError::BadHeader)?;
        let name = as_str(&line[..colon])?;
        if name.is_empty() {
            return Err(RequestError::BadHeader);
        }
        let value = as_str(&line[colon + 1..])?.trim();
        headers.push((name.to_ascii_lowercase(), value.to_owned()));
    }

    Ok(Request {
        method,
        uri: target.to_owned(),
        version,
        content_name,
        headers,
        query,
        body: Vec::new(),
        peer,
        start_us,
    })
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (part.to_owned(), String::new()),
        })
        .collect()
}

#[inline]
fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

#[inline]
fn as_str(src: &[u8]) -> Result<&str, RequestError> {
    simdutf8::basic::from_utf8(src).map_err(|_| RequestError::BadRequestLine)
}

/// Builds a request without a socket, for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn test_request(
    method: Method,
    target: &str,
    peer: SocketAddr,
    headers: &[(&str, &str)],
) -> Request {
    let mut head = format!("{} {} HTTP/1.1\r\n", method.as_str(), target);
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    let head = head.as_bytes();
    parse_head(&head[..head.len() - 2], peer, 0).expect("test request must parse")
}
