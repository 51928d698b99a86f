//! Static-file delivery from the document root.

use crate::{
    cache::FileCache,
    http::{
        response::{http_date_now, SERVER_TOKEN},
        types::{StatusCode, Version},
    },
};
use chrono::{DateTime, Utc};
use std::{io, path::Path, time::SystemTime};
use tokio::{io::AsyncWriteExt, net::TcpStream};

const MIME_TABLE: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("hdml", "text/x-hdml"),
    ("css", "text/css"),
    ("txt", "text/plain"),
    ("gif", "image/gif"),
    ("jpe", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("png", "image/png"),
    ("xbm", "image/x-bitmap"),
    ("au", "audio/basic"),
    ("snd", "audio/basic"),
    ("wav", "audio/x-wav"),
    ("aif", "audio/aiff"),
    ("aiff", "audio/aiff"),
    ("mp2", "audio/x-mpeg"),
    ("mp3", "audio/mpeg"),
    ("ram", "audio/x-pn-realaudio"),
    ("rm", "audio/x-pn-realaudio"),
    ("ra", "audio/x-pn-realaudio"),
    ("qt", "video/quicktime"),
    ("mov", "video/quicktime"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("mpe", "video/mpeg"),
    ("avi", "video/x-msvideo"),
    ("pdf", "application/vnd.pdf"),
    ("fdf", "application/vnd.fdf"),
    ("json", "text/plain"),
];

/// MIME type by file extension, falling back to `application/<ext>`.
pub(crate) fn mime_type(file_name: &str) -> String {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or("");
    if ext.is_empty() {
        return "application/octet-stream".to_owned();
    }
    let lower = ext.to_ascii_lowercase();
    match MIME_TABLE.iter().find(|(e, _)| *e == lower) {
        Some((_, mime)) => (*mime).to_owned(),
        None => format!("application/{lower}"),
    }
}

/// Validates a requested path against parent-directory escapes: walking the
/// segments, each `..` must stay within the document root. Segments that are
/// empty or start with `.` neither ascend nor descend.
pub(crate) fn check_file(request_path: &str) -> bool {
    if request_path.is_empty() {
        return false;
    }
    let mut depth: i32 = 0;
    for segment in request_path.split('/') {
        if segment == ".." {
            depth -= 1;
            if depth < 0 {
                return false;
            }
        } else if segment.is_empty() || segment.starts_with('.') {
            // neither ascends nor descends
        } else {
            depth += 1;
        }
    }
    true
}

/// `mtime` rendered the way it appears in `Last-Modified`.
pub(crate) fn last_modified(mtime: SystemTime) -> String {
    let dt: DateTime<Utc> = mtime.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Canned error response with a small HTML body.
pub(crate) fn error_payload(status: StatusCode, version: Version) -> (Vec<u8>, usize) {
    let reason = status.reason();
    let code = status.as_u16();
    let body = format!(
        "<html>\n<head><title>{code} {reason}</title></head>\n\
         <body>\n<h1>{code} {reason}</h1>\n</body>\n</html>\n"
    );
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(status.into_first_line(version));
    push_common_headers(&mut out, "text/html", body.len() as u64);
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
    (out, body.len())
}

/// Header-only 200 used for `HEAD`.
pub(crate) fn head_payload(version: Version) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(StatusCode::Ok.into_first_line(version));
    push_common_headers(&mut out, "text/html", 0);
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

fn push_common_headers(out: &mut Vec<u8>, mime: &str, content_length: u64) {
    out.extend_from_slice(format!("Date: {}\r\n", http_date_now()).as_bytes());
    out.extend_from_slice(format!("Server: {SERVER_TOKEN}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Type: {mime}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Length: {content_length}\r\n").as_bytes());
}

/// Result of one static delivery, as needed by the access log and the
/// keep-alive loop.
pub(crate) struct StaticOutcome {
    pub(crate) status: u16,
    pub(crate) bytes: usize,
    pub(crate) keep_alive: bool,
}

/// Serves `content_name` from `root`, honoring `If-Modified-Since` and the
/// file cache. The caller has already vetted the path with [`check_file`].
pub(crate) async fn send_document(
    stream: &mut TcpStream,
    root: &Path,
    content_name: &str,
    if_modified_since: Option<&str>,
    cache: Option<&FileCache>,
    version: Version,
    keep_alive_window: Option<(u64, u32)>,
) -> io::Result<StaticOutcome> {
    let path = root.join(content_name);

    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            let (payload, bytes) = error_payload(StatusCode::NotFound, version);
            stream.write_all(&payload).await?;
            return Ok(StaticOutcome {
                status: 404,
                bytes,
                keep_alive: false,
            });
        }
    };

    let mtime = meta.modified()?;
    let modified = last_modified(mtime);

    if if_modified_since == Some(modified.as_str()) {
        let mut out = Vec::with_capacity(160);
        out.extend_from_slice(StatusCode::NotModified.into_first_line(version));
        out.extend_from_slice(format!("Date: {}\r\n", http_date_now()).as_bytes());
        out.extend_from_slice(format!("Server: {SERVER_TOKEN}\r\n").as_bytes());
        push_connection_headers(&mut out, keep_alive_window);
        stream.write_all(&out).await?;
        return Ok(StaticOutcome {
            status: 304,
            bytes: 0,
            keep_alive: keep_alive_window.is_some(),
        });
    }

    let size = meta.len();
    let mime = mime_type(content_name);
    let mtime_secs = DateTime::<Utc>::from(mtime).timestamp();

    let body = match cache.and_then(|c| c.get(&path, mtime_secs, size)) {
        Some(cached) => cached,
        None => {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => bytes::Bytes::from(data),
                Err(_) => {
                    let (payload, bytes) = error_payload(StatusCode::NotFound, version);
                    stream.write_all(&payload).await?;
                    return Ok(StaticOutcome {
                        status: 404,
                        bytes,
                        keep_alive: false,
                    });
                }
            };
            if let Some(cache) = cache {
                cache.set(&path, mtime_secs, data.clone());
            }
            data
        }
    };

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(StatusCode::Ok.into_first_line(version));
    push_common_headers(&mut out, &mime, size);
    out.extend_from_slice(format!("Last-Modified: {modified}\r\n").as_bytes());
    push_connection_headers(&mut out, keep_alive_window);
    out.extend_from_slice(&body);
    stream.write_all(&out).await?;

    Ok(StaticOutcome {
        status: 200,
        bytes: body.len(),
        keep_alive: keep_alive_window.is_some(),
    })
}

fn push_connection_headers(out: &mut Vec<u8>, keep_alive_window: Option<(u64, u32)>) {
    match keep_alive_window {
        Some((timeout, max)) => {
            out.extend_from_slice(
                format!("Keep-Alive: timeout={timeout}, max={max}\r\n").as_bytes(),
            );
            out.extend_from_slice(b"Connection: Keep-Alive\r\n\r\n");
        }
        None => out.extend_from_slice(b"Connection: close\r\n\r\n"),
    }
}
