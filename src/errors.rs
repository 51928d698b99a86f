use crate::http::types::Version;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Failures raised while reading or parsing a request, before any handler
/// runs. Each variant maps to a fixed HTTP error response.
#[derive(Debug)]
pub(crate) enum RequestError {
    /// Peer closed the connection before sending a full request.
    Closed,
    BadRequestLine,
    UnknownMethod,
    UriTooLong,
    BadHeader,
    TooManyHeaders,
    UnsupportedVersion,
    BodyTooLarge,
    Timeout,
    Io(io::Error),
}

macro_rules! canned_responses {
    ($($name:ident: $status:expr, $code:expr;)*) => {
        pub(crate) const fn as_http(&self, version: Version) -> &'static [u8] {
            match (self, version) { $(
                (Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: 0\r\n",
                    "\r\n",
                ),
                (Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: 0\r\n",
                    "\r\n",
                ),
            )* }.as_bytes()
        }

        pub(crate) const fn status_code(&self) -> u16 {
            match self { $( Self::$name { .. } => $code, )* }
        }
    };
}

impl RequestError {
    canned_responses! {
        Closed: "400 Bad Request", 400;
        BadRequestLine: "400 Bad Request", 400;
        UnknownMethod: "405 Method Not Allowed", 405;
        UriTooLong: "414 URI Too Long", 414;
        BadHeader: "400 Bad Request", 400;
        TooManyHeaders: "431 Request Header Fields Too Large", 431;
        UnsupportedVersion: "505 HTTP Version Not Supported", 505;
        BodyTooLarge: "413 Payload Too Large", 413;
        Timeout: "408 Request Timeout", 408;
        Io: "400 Bad Request", 400;
    }
}

impl From<io::Error> for RequestError {
    fn from(err: io::Error) -> Self {
        RequestError::Io(err)
    }
}

/// Fatal configuration problems. Emitted on stderr by the binary, which then
/// exits nonzero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config {}:{line}: parameter name too long", .path.display())]
    NameTooLong { path: PathBuf, line: usize },
    #[error("config {}:{line}: parameter value too long", .path.display())]
    ValueTooLong { path: PathBuf, line: usize },
    #[error("config {}:{line}: undeclared application zone in `{name}`", .path.display())]
    UndeclaredZone {
        path: PathBuf,
        line: usize,
        name: String,
    },
    #[error("config {}:{line}: malformed `{option}` value: {value}", .path.display())]
    BadBinding {
        path: PathBuf,
        line: usize,
        option: String,
        value: String,
    },
    #[error("config {}:{line}: invalid number in `{name}`", .path.display())]
    BadNumber {
        path: PathBuf,
        line: usize,
        name: String,
    },
    #[error("handler provider `{provider}` ({module}) is not registered")]
    UnknownProvider { provider: String, module: String },
    #[error("hook provider `{provider}` ({module}) is not registered")]
    UnknownHook { provider: String, module: String },
}

/// Session-relay failures. Always recoverable from the caller's point of
/// view: the local state is used and the error is logged.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay io: {0}")]
    Io(#[from] io::Error),
    #[error("relay protocol: {0}")]
    Protocol(&'static str),
    #[error("relay: unknown command {0:?}")]
    UnknownCommand([u8; 2]),
    #[error("relay: unknown zone `{0}`")]
    UnknownZone(String),
    #[error("relay: no session for key")]
    NoSession,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_response_carries_status_line() {
        let bytes = RequestError::UriTooLong.as_http(Version::Http11);
        assert!(bytes.starts_with(b"HTTP/1.1 414 URI Too Long\r\n"));
        assert!(bytes.ends_with(b"\r\n\r\n"));
        assert_eq!(RequestError::UriTooLong.status_code(), 414);
    }

    #[test]
    fn http10_variant_uses_http10_prefix() {
        let bytes = RequestError::BadHeader.as_http(Version::Http10);
        assert!(bytes.starts_with(b"HTTP/1.0 400 Bad Request\r\n"));
    }
}
