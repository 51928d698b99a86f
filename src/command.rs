//! Control commands.
//!
//! The server accepts `stop`, `status` and `trace_on`/`trace_off` over its
//! own HTTP port, but only from the loopback interface and only as a request
//! with an empty content name and exactly one query parameter named `cmd`.
//! The same module carries the client side used by the CLI, which posts
//! `cmd=…` to `http://127.0.0.1:<port>/`.

use crate::{
    http::request::Request,
    server::{server_impl::ServerInner, worker::{SlotSnapshot, SLOT_RUNNING, SLOT_SLEEPING, SLOT_UNUSED}},
};
use chrono::{Local, TimeZone, Utc};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// A control command is a loopback request for `/` whose only query
/// parameter is `cmd`. Anything else is served as a normal request.
pub(crate) fn is_command(request: &Request) -> bool {
    request.peer().ip().is_loopback()
        && request.content_name().is_empty()
        && request.query_count() == 1
        && request.query("cmd").is_some()
}

/// Executes a control command and returns the response body. An unknown
/// `cmd` value yields an empty body.
pub(crate) async fn execute(inner: &Arc<ServerInner>, request: &Request) -> String {
    match request.query("cmd").unwrap_or("") {
        "stop" => {
            inner.shutdown.trigger();
            "stopped.\n".to_owned()
        }
        "status" => render_status(
            inner.start_time_us,
            inner.workers.total_requests(),
            &inner.workers.snapshot(),
        ),
        "trace_on" => {
            inner.set_trace(true);
            "trace mode on.\n".to_owned()
        }
        "trace_off" => {
            inner.set_trace(false);
            "trace mode off.\n".to_owned()
        }
        _ => String::new(),
    }
}

fn local_datetime(us: i64) -> String {
    match Utc.timestamp_micros(us).single() {
        Some(dt) => dt
            .with_timezone(&Local)
            .format("%Y/%m/%d %H:%M:%S")
            .to_string(),
        None => "N/A".to_owned(),
    }
}

/// Renders the worker table for the `status` command. The snapshot is taken
/// from atomics, so values may be slightly stale; a worker currently
/// executing this very command reports `sleep` so the command does not count
/// itself as running work.
pub(crate) fn render_status(start_us: i64, total: u64, slots: &[SlotSnapshot]) -> String {
    let mut out = format!(
        "start {}  total {} requests.\n\n",
        local_datetime(start_us),
        total
    );
    out.push_str("[thread info]\n");
    out.push_str("   No status last-access              count\n");
    out.push_str("----- ------ ------------------- ----------\n");

    for (index, slot) in slots.iter().enumerate() {
        let status = match slot.status {
            SLOT_UNUSED => "unuse",
            SLOT_SLEEPING => "sleep",
            SLOT_RUNNING if slot.command => "sleep",
            SLOT_RUNNING => "run",
            _ => "",
        };
        let last_access = if slot.status != SLOT_UNUSED && slot.last_access_us > 0 {
            local_datetime(slot.last_access_us)
        } else {
            "N/A".to_owned()
        };
        let count = if slot.status == SLOT_UNUSED {
            "         -".to_owned()
        } else {
            format!("{:>10}", slot.count)
        };
        out.push_str(&format!(
            "{:>5} {:<6} {:<19} {}\n",
            index + 1,
            status,
            last_access,
            count
        ));
    }
    out
}

/// Posts `cmd=<cmd>` to the local server and returns the response body.
/// Used by `-stop`, `-status` and `-trace`.
pub async fn post_command(port: u16, cmd: &str) -> io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!(
        "POST /?cmd={cmd} HTTP/1.1\r\n\
         Host: 127.0.0.1:{port}\r\n\
         User-Agent: nesta-cli\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let text = String::from_utf8_lossy(&raw);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("");
    Ok(body.to_owned())
}
