//! Access log: one line per completed request, single writer, optional
//! daily rotation.
//!
//! Line format:
//! `ip [YYYY/MM/DD HH:MM:SS] "METHOD URI PROTO" "UA" status bytes elapsed_us`
//!
//! With daily rotation the file name is `base_YYYY-MM-DD.ext`; the writer
//! checks the date on every line and swaps files under the same mutex that
//! serializes writes.

use chrono::Local;
use parking_lot::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
};
use tracing::warn;

pub(crate) struct AccessRecord<'a> {
    pub(crate) ip: String,
    pub(crate) method: &'a str,
    pub(crate) uri: &'a str,
    pub(crate) protocol: &'a str,
    pub(crate) user_agent: &'a str,
    pub(crate) status: u16,
    pub(crate) bytes: usize,
    pub(crate) elapsed_us: i64,
}

struct LogState {
    file: File,
    daily: bool,
    base: String,
    ext: String,
    cur_date: String,
}

pub(crate) struct AccessLog {
    state: Mutex<Option<LogState>>,
}

impl AccessLog {
    pub(crate) fn disabled() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Opens the log at `path`. An open failure disables logging and is
    /// reported once; the server keeps running.
    pub(crate) fn open(path: &Path, daily: bool) -> Self {
        let (base, ext) = split_base_ext(&path.to_string_lossy());
        let cur_date = today();
        let file_name = file_name(&base, &ext, daily, &cur_date);

        match open_append(&file_name) {
            Ok(file) => Self {
                state: Mutex::new(Some(LogState {
                    file,
                    daily,
                    base,
                    ext,
                    cur_date,
                })),
            },
            Err(err) => {
                warn!(path = %file_name, error = %err, "access log disabled");
                Self::disabled()
            }
        }
    }

    pub(crate) fn write(&self, record: &AccessRecord<'_>) {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };

        let now = Local::now();
        if state.daily {
            let date = now.format("%Y-%m-%d").to_string();
            if date != state.cur_date {
                let name = file_name(&state.base, &state.ext, true, &date);
                match open_append(&name) {
                    Ok(file) => {
                        state.file = file;
                        state.cur_date = date;
                    }
                    Err(err) => {
                        warn!(path = %name, error = %err, "access log rotation failed");
                    }
                }
            }
        }

        let line = format!(
            "{} [{}] \"{} {} {}\" \"{}\" {} {} {}\n",
            record.ip,
            now.format("%Y/%m/%d %H:%M:%S"),
            record.method,
            record.uri,
            record.protocol,
            record.user_agent,
            record.status,
            record.bytes,
            record.elapsed_us,
        );
        if let Err(err) = state.file.write_all(line.as_bytes()) {
            warn!(error = %err, "access log write failed");
        }
    }
}

fn open_append(path: &str) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Splits `access.log` into (`access`, `.log`); a name without a dot keeps
/// an empty extension.
fn split_base_ext(path: &str) -> (String, String) {
    match path.rfind('.') {
        Some(idx) if !path[idx..].contains('/') => {
            (path[..idx].to_owned(), path[idx..].to_owned())
        }
        _ => (path.to_owned(), String::new()),
    }
}

fn file_name(base: &str, ext: &str, daily: bool, date: &str) -> String {
    if daily {
        format!("{base}_{date}{ext}")
    } else {
        format!("{base}{ext}")
    }
}

/// Client address for the log line: the first comma-separated entry of
/// `X-Forwarded-For` when present, else the peer address.
pub(crate) fn client_ip(forwarded_for: Option<&str>, peer_ip: std::net::IpAddr) -> String {
    match forwarded_for {
        Some(value) => {
            let first = value.split(',').next().unwrap_or("").trim();
            if first.is_empty() {
                "unknown".to_owned()
            } else {
                first.to_owned()
            }
        }
        None => peer_ip.to_string(),
    }
}
