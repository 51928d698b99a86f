//! Configuration loader.
//!
//! The format is line-oriented text: `#` starts a comment, `=` separates the
//! option name from its value, both sides are trimmed. Recognized names are
//! matched case-insensitively; anything unrecognized lands in the
//! user-parameter map with its name preserved verbatim. `include = FILE`
//! pulls in another file recursively.
//!
//! Loading runs two passes over each file: a count-only scan used to size the
//! handler-binding tables, then the effective pass.

use crate::errors::ConfigError;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const DEFAULT_BACKLOG: i32 = 50;
pub(crate) const DEFAULT_WORKER_THREADS: usize = 10;
pub(crate) const DEFAULT_WORKER_THREAD_TIMEOUT: u64 = 600;
pub(crate) const DEFAULT_WORKER_THREAD_CHECK_INTERVAL: u64 = 1800;
pub(crate) const DEFAULT_KEEP_ALIVE_TIMEOUT: u64 = 3;
pub(crate) const DEFAULT_KEEP_ALIVE_REQUESTS: u32 = 5;

pub(crate) const DEFAULT_RELAY_PORT: u16 = 9080;
pub(crate) const DEFAULT_RELAY_BACKLOG: i32 = 5;
pub(crate) const DEFAULT_RELAY_WORKER_THREADS: usize = 1;
pub(crate) const DEFAULT_RELAY_CHECK_INTERVAL: u64 = 300;

/// Hard cap on the number of session-copy peers.
pub const MAX_COPY: usize = 16;

const MAX_NAME_SIZE: usize = 256;
const MAX_VALUE_SIZE: usize = 1024;

/// User parameters: every config line whose name the server does not
/// recognize, exposed to handlers and hooks verbatim.
pub type UserParams = HashMap<String, String>;

/// Immutable server configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port_no: u16,
    pub backlog: i32,
    /// Base worker count (`N0`).
    pub worker_threads: usize,
    /// Elastic capacity on top of `worker_threads`.
    pub extend_worker_threads: usize,
    /// Idle seconds after which an elastic worker retires.
    pub worker_thread_timeout: u64,
    /// Queue-wait timeout for elastic workers, in seconds.
    pub worker_thread_check_interval: u64,
    pub keep_alive_timeout: u64,
    pub keep_alive_requests: u32,
    pub document_root: Option<PathBuf>,
    /// File-cache capacity in bytes (0 disables the cache).
    pub file_cache_size: u64,
    pub access_log_fname: Option<PathBuf>,
    pub daily_log_flag: bool,
    pub error_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub trace_flag: bool,
    pub daemonize: bool,
    pub username: Option<String>,
    pub relay: Option<RelayConfig>,
    pub zones: Vec<ZoneConfig>,
    pub user_params: UserParams,
}

/// Session-relay settings; present when `http.session_relay.host` is set.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub worker_threads: usize,
    /// Seconds between health probes of the copy peers.
    pub check_interval: u64,
    pub copy_peers: Vec<CopyPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPeer {
    pub host: String,
    pub port: u16,
}

/// One `http.appzone` declaration plus its dotted options.
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub name: String,
    /// 0 disables the session store, -1 means unlimited.
    pub max_session: i64,
    /// Seconds, -1 disables TTL eviction.
    pub session_timeout: i64,
    pub apis: Vec<ApiBinding>,
    pub init_apis: Vec<HookBinding>,
    pub term_apis: Vec<HookBinding>,
}

/// `ZONE.api = content,provider,module`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBinding {
    pub content_name: String,
    pub provider: String,
    pub module: String,
}

/// `ZONE.init_api = provider,module` (same for `term_api`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookBinding {
    pub provider: String,
    pub module: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_no: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            worker_threads: DEFAULT_WORKER_THREADS,
            extend_worker_threads: 0,
            worker_thread_timeout: DEFAULT_WORKER_THREAD_TIMEOUT,
            worker_thread_check_interval: DEFAULT_WORKER_THREAD_CHECK_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            keep_alive_requests: DEFAULT_KEEP_ALIVE_REQUESTS,
            document_root: None,
            file_cache_size: 0,
            access_log_fname: None,
            daily_log_flag: false,
            error_file: None,
            output_file: None,
            trace_flag: false,
            daemonize: false,
            username: None,
            relay: None,
            zones: Vec::new(),
            user_params: UserParams::new(),
        }
    }
}

impl Config {
    /// Maximum worker count (`N0 + extend`).
    pub fn max_worker_threads(&self) -> usize {
        self.worker_threads + self.extend_worker_threads
    }

    /// Loads and post-processes the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let mut config = Config::default();

        // Count pass sizes the binding tables before the effective pass.
        let api_count = Self::count_option(path, ".api")?;

        let mut relay = RelayBuilder::default();
        config.apply_file(path, &mut relay, api_count)?;
        config.relay = relay.build();

        Ok(config)
    }

    /// Counts config lines (here and in included files) whose name contains
    /// `needle`.
    pub fn count_option(path: impl AsRef<Path>, needle: &str) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        let text = read_config(path)?;
        let mut count = 0;

        for raw in text.lines() {
            let Some((name, value)) = split_line(raw) else {
                continue;
            };
            if name.to_ascii_lowercase().contains(needle) {
                count += 1;
            } else if name.eq_ignore_ascii_case("include") {
                count += Self::count_option(value, needle)?;
            }
        }
        Ok(count)
    }

    fn apply_file(
        &mut self,
        path: &Path,
        relay: &mut RelayBuilder,
        api_count: usize,
    ) -> Result<(), ConfigError> {
        let text = read_config(path)?;

        for (line_no, raw) in text.lines().enumerate() {
            let line = line_no + 1;
            let trimmed = strip_comment(raw).trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some((name, value)) = split_line(raw) else {
                return Err(ConfigError::BadBinding {
                    path: path.to_owned(),
                    line,
                    option: trimmed.to_owned(),
                    value: String::new(),
                });
            };
            if name.len() > MAX_NAME_SIZE {
                return Err(ConfigError::NameTooLong {
                    path: path.to_owned(),
                    line,
                });
            }
            if value.len() > MAX_VALUE_SIZE {
                return Err(ConfigError::ValueTooLong {
                    path: path.to_owned(),
                    line,
                });
            }

            self.apply_option(path, line, name, value, relay, api_count)?;
        }
        Ok(())
    }

    fn apply_option(
        &mut self,
        path: &Path,
        line: usize,
        name: &str,
        value: &str,
        relay: &mut RelayBuilder,
        api_count: usize,
    ) -> Result<(), ConfigError> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "http.port_no" => self.port_no = parse_num(path, line, name, value)?,
            "http.backlog" => self.backlog = parse_num(path, line, name, value)?,
            "http.worker_thread" => self.worker_threads = parse_num(path, line, name, value)?,
            "http.extend_worker_thread" => {
                self.extend_worker_threads = parse_num(path, line, name, value)?
            }
            "http.worker_thread_timeout" => {
                self.worker_thread_timeout = parse_num(path, line, name, value)?
            }
            "http.worker_thread_check_interval" => {
                self.worker_thread_check_interval = parse_num(path, line, name, value)?
            }
            "http.keep_alive_timeout" => {
                self.keep_alive_timeout = parse_num(path, line, name, value)?
            }
            "http.keep_alive_requests" => {
                self.keep_alive_requests = parse_num(path, line, name, value)?
            }
            "http.document_root" => self.document_root = Some(absolutize(value)),
            "http.file_cache_size" => {
                let kib: u64 = parse_num(path, line, name, value)?;
                self.file_cache_size = kib * 1024;
            }
            "http.access_log_fname" => self.access_log_fname = Some(absolutize(value)),
            "http.daily_log_flag" => self.daily_log_flag = parse_flag(path, line, name, value)?,
            "http.error_file" => self.error_file = Some(absolutize(value)),
            "http.output_file" => self.output_file = Some(absolutize(value)),
            "http.trace_flag" => self.trace_flag = parse_flag(path, line, name, value)?,
            "http.daemon" => self.daemonize = parse_flag(path, line, name, value)?,
            "http.username" => self.username = Some(value.to_owned()),
            "http.session_relay.host" => relay.host = Some(value.to_owned()),
            "http.session_relay.port" => relay.port = Some(parse_num(path, line, name, value)?),
            "http.session_relay.backlog" => {
                relay.backlog = Some(parse_num(path, line, name, value)?)
            }
            "http.session_relay.worker_thread" => {
                relay.worker_threads = Some(parse_num(path, line, name, value)?)
            }
            "http.session_relay.check_interval_time" => {
                relay.check_interval = Some(parse_num(path, line, name, value)?)
            }
            "http.session_relay.copy.host" => relay.copy_peers.push(CopyPeer {
                host: value.to_owned(),
                port: DEFAULT_RELAY_PORT,
            }),
            "http.appzone" => {
                self.zones.push(ZoneConfig {
                    name: value.to_owned(),
                    max_session: 0,
                    session_timeout: -1,
                    apis: Vec::with_capacity(api_count),
                    init_apis: Vec::new(),
                    term_apis: Vec::new(),
                });
            }
            "include" => self.apply_file(Path::new(value), relay, api_count)?,
            _ => {
                if let Some(host) = lower.strip_suffix(".session_relay.copy.port") {
                    // The per-peer port option is keyed by the peer host name.
                    let port = parse_num(path, line, name, value)?;
                    if let Some(peer) = relay
                        .copy_peers
                        .iter_mut()
                        .find(|p| p.host.eq_ignore_ascii_case(host))
                    {
                        peer.port = port;
                    }
                } else if lower.ends_with(".max_session") {
                    let zone = self.zone_for(path, line, name)?;
                    zone.max_session = parse_num(path, line, name, value)?;
                } else if lower.ends_with(".session_timeout") {
                    let zone = self.zone_for(path, line, name)?;
                    zone.session_timeout = parse_num(path, line, name, value)?;
                } else if lower.ends_with(".init_api") || lower.ends_with(".term_api") {
                    let is_init = lower.ends_with(".init_api");
                    let zone = self.zone_for(path, line, name)?;
                    let binding = parse_hook(path, line, name, value)?;
                    if is_init {
                        zone.init_apis.push(binding);
                    } else {
                        zone.term_apis.push(binding);
                    }
                } else if lower.ends_with(".api") {
                    let zone = self.zone_for(path, line, name)?;
                    zone.apis.push(parse_api(path, line, name, value)?);
                } else {
                    self.user_params
                        .insert(name.to_owned(), value.to_owned());
                }
            }
        }
        Ok(())
    }

    /// Resolves a dotted zone option (`ZONE.xxx`) against a previously
    /// declared zone; the zone name is everything before the last dot.
    fn zone_for(
        &mut self,
        path: &Path,
        line: usize,
        name: &str,
    ) -> Result<&mut ZoneConfig, ConfigError> {
        let key = match name.rfind('.') {
            Some(idx) => &name[..idx],
            None => "",
        };
        self.zones
            .iter_mut()
            .find(|z| z.name.eq_ignore_ascii_case(key))
            .ok_or_else(|| ConfigError::UndeclaredZone {
                path: path.to_owned(),
                line,
                name: name.to_owned(),
            })
    }
}

#[derive(Default)]
struct RelayBuilder {
    host: Option<String>,
    port: Option<u16>,
    backlog: Option<i32>,
    worker_threads: Option<usize>,
    check_interval: Option<u64>,
    copy_peers: Vec<CopyPeer>,
}

impl RelayBuilder {
    fn build(mut self) -> Option<RelayConfig> {
        let host = self.host?;
        self.copy_peers.truncate(MAX_COPY);
        Some(RelayConfig {
            host,
            port: self.port.unwrap_or(DEFAULT_RELAY_PORT),
            backlog: self.backlog.unwrap_or(DEFAULT_RELAY_BACKLOG),
            worker_threads: self.worker_threads.unwrap_or(DEFAULT_RELAY_WORKER_THREADS),
            check_interval: self.check_interval.unwrap_or(DEFAULT_RELAY_CHECK_INTERVAL),
            copy_peers: self.copy_peers,
        })
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Splits a config line into `(name, value)`. Returns `None` for blank and
/// comment-only lines; a non-blank line without `=` is reported by the
/// caller.
fn split_line(raw: &str) -> Option<(&str, &str)> {
    let line = strip_comment(raw);
    if line.trim().is_empty() {
        return None;
    }
    let (name, value) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

fn parse_num<T: std::str::FromStr>(
    path: &Path,
    line: usize,
    name: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadNumber {
        path: path.to_owned(),
        line,
        name: name.to_owned(),
    })
}

fn parse_flag(path: &Path, line: usize, name: &str, value: &str) -> Result<bool, ConfigError> {
    let n: i64 = parse_num(path, line, name, value)?;
    Ok(n != 0)
}

fn parse_api(path: &Path, line: usize, name: &str, value: &str) -> Result<ApiBinding, ConfigError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [content, provider, module] if !provider.is_empty() => Ok(ApiBinding {
            content_name: (*content).to_owned(),
            provider: (*provider).to_owned(),
            module: (*module).to_owned(),
        }),
        _ => Err(ConfigError::BadBinding {
            path: path.to_owned(),
            line,
            option: name.to_owned(),
            value: value.to_owned(),
        }),
    }
}

fn parse_hook(
    path: &Path,
    line: usize,
    name: &str,
    value: &str,
) -> Result<HookBinding, ConfigError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [provider, module] if !provider.is_empty() => Ok(HookBinding {
            provider: (*provider).to_owned(),
            module: (*module).to_owned(),
        }),
        _ => Err(ConfigError::BadBinding {
            path: path.to_owned(),
            line,
            option: name.to_owned(),
            value: value.to_owned(),
        }),
    }
}

fn absolutize(value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    match fs::canonicalize(&path) {
        Ok(abs) => abs,
        Err(_) if path.is_absolute() => path,
        Err(_) => env::current_dir().map(|d| d.join(&path)).unwrap_or(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_conf(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_options() {
        let file = write_conf("# only a comment\n");
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port_no, DEFAULT_PORT);
        assert_eq!(config.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(config.keep_alive_requests, DEFAULT_KEEP_ALIVE_REQUESTS);
        assert_eq!(config.max_worker_threads(), DEFAULT_WORKER_THREADS);
        assert!(config.relay.is_none());
        assert!(config.zones.is_empty());
    }

    #[test]
    fn parses_core_options_case_insensitively() {
        let file = write_conf(
            "HTTP.Port_No = 8181\n\
             http.backlog = 10  # trailing comment\n\
             http.worker_thread = 4\n\
             http.extend_worker_thread = 6\n\
             http.keep_alive_requests = 2\n\
             http.file_cache_size = 8\n\
             http.trace_flag = 1\n",
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port_no, 8181);
        assert_eq!(config.backlog, 10);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.max_worker_threads(), 10);
        assert_eq!(config.keep_alive_requests, 2);
        assert_eq!(config.file_cache_size, 8 * 1024);
        assert!(config.trace_flag);
    }

    #[test]
    fn unknown_names_become_user_params_verbatim() {
        let file = write_conf("Db.ConnectString = scott/tiger@orcl\n");
        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.user_params.get("Db.ConnectString").map(String::as_str),
            Some("scott/tiger@orcl")
        );
        assert!(config.user_params.get("db.connectstring").is_none());
    }

    #[test]
    fn zone_declaration_and_options() {
        let file = write_conf(
            "http.appzone = shop\n\
             shop.max_session = 100\n\
             shop.session_timeout = 1800\n\
             shop.api = cart, cart_handler, libshop\n\
             shop.init_api = shop_init, libshop\n\
             shop.term_api = shop_term, libshop\n",
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.zones.len(), 1);
        let zone = &config.zones[0];
        assert_eq!(zone.name, "shop");
        assert_eq!(zone.max_session, 100);
        assert_eq!(zone.session_timeout, 1800);
        assert_eq!(
            zone.apis,
            vec![ApiBinding {
                content_name: "cart".into(),
                provider: "cart_handler".into(),
                module: "libshop".into(),
            }]
        );
        assert_eq!(zone.init_apis.len(), 1);
        assert_eq!(zone.term_apis.len(), 1);
    }

    #[test]
    fn zone_option_before_declaration_fails() {
        let file = write_conf("shop.max_session = 100\n");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::UndeclaredZone { .. })
        ));
    }

    #[test]
    fn relay_options_and_copy_peers() {
        let file = write_conf(
            "http.session_relay.host = 10.0.0.1\n\
             http.session_relay.port = 9191\n\
             http.session_relay.copy.host = 10.0.0.2\n\
             http.session_relay.copy.host = 10.0.0.3\n\
             10.0.0.3.session_relay.copy.port = 9292\n",
        );
        let config = Config::load(file.path()).unwrap();
        let relay = config.relay.unwrap();
        assert_eq!(relay.host, "10.0.0.1");
        assert_eq!(relay.port, 9191);
        assert_eq!(relay.backlog, DEFAULT_RELAY_BACKLOG);
        assert_eq!(relay.worker_threads, DEFAULT_RELAY_WORKER_THREADS);
        assert_eq!(
            relay.copy_peers,
            vec![
                CopyPeer {
                    host: "10.0.0.2".into(),
                    port: DEFAULT_RELAY_PORT
                },
                CopyPeer {
                    host: "10.0.0.3".into(),
                    port: 9292
                },
            ]
        );
    }

    #[test]
    fn include_pulls_in_other_files() {
        let inner = write_conf("http.port_no = 9999\ninner.param = yes\n");
        let outer = write_conf(&format!(
            "http.backlog = 7\ninclude = {}\n",
            inner.path().display()
        ));
        let config = Config::load(outer.path()).unwrap();
        assert_eq!(config.backlog, 7);
        assert_eq!(config.port_no, 9999);
        assert_eq!(
            config.user_params.get("inner.param").map(String::as_str),
            Some("yes")
        );
    }

    #[test]
    fn include_failure_is_fatal() {
        let file = write_conf("include = /definitely/not/here.conf\n");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn count_option_spans_includes() {
        let inner = write_conf("http.appzone = a\na.api = x, xf, lx\n");
        let outer = write_conf(&format!(
            "include = {}\nb.api = y, yf, ly\n",
            inner.path().display()
        ));
        assert_eq!(Config::count_option(outer.path(), ".api").unwrap(), 2);
    }

    #[test]
    fn malformed_binding_is_fatal() {
        let file = write_conf("http.appzone = z\nz.api = onlycontent\n");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::BadBinding { .. })
        ));
    }

    #[test]
    fn bad_number_is_fatal() {
        let file = write_conf("http.port_no = not-a-port\n");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::BadNumber { .. })
        ));
    }
}
