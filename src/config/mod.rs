//! Configuration for Palisade.
//!
//! Two text files drive the daemon: the main configuration (flat
//! `key = value` lines, `#` comments) and the zone-masters file with its
//! `master { ... }` blocks (see [`masters`]).  Command-line flags override
//! the file location and a few hot settings.

pub mod masters;

pub use masters::{MasterConfig, TransferSettings};

use std::fmt;
use std::net::SocketAddr;

use camino::Utf8PathBuf;

use crate::store::StoreLimits;

/// Where the main configuration lives unless `--config` says otherwise.
pub const DEFAULT_CONF_FILE: &str = "/etc/palisade/palisade.conf";

/// Where the zone-masters file lives unless configured otherwise.
pub const DEFAULT_MASTERS_FILE: &str = "/etc/palisade/zone-masters.conf";

//----------- Config -----------------------------------------------------------

/// The complete daemon configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the main configuration file.
    pub conf_file: Utf8PathBuf,

    /// Addresses the DNS listeners bind (UDP and TCP both).
    pub listen: Vec<SocketAddr>,

    /// The backing store coordinates, passed to the collaborator driver.
    pub db: DbConfig,

    /// Recursive forwarding; empty upstreams means authoritative-only.
    pub recursive: RecursiveConfig,

    /// The DoH frontend.
    pub doh: DohConfig,

    /// Zone-masters file location.
    pub masters_file: Utf8PathBuf,

    /// Transfer scheduling knobs from the zone-masters file globals.
    pub transfer: TransferSettings,

    /// Master definitions from the zone-masters file.
    pub masters: Vec<MasterConfig>,

    /// Zone store pool bounds.
    pub limits: StoreLimits,

    /// Daemon behavior: logging, pid file, identity.
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conf_file: DEFAULT_CONF_FILE.into(),
            listen: vec!["0.0.0.0:53".parse().unwrap()],
            db: DbConfig::default(),
            recursive: RecursiveConfig::default(),
            doh: DohConfig::default(),
            masters_file: DEFAULT_MASTERS_FILE.into(),
            transfer: TransferSettings::default(),
            masters: Vec::new(),
            limits: StoreLimits::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

/// Backing store coordinates.  The driver itself belongs to the
/// collaborator; these values are handed over verbatim.
#[derive(Clone, Debug, Default)]
pub struct DbConfig {
    pub database: String,
    pub hosts: Vec<String>,
    pub user: String,
    pub password: String,
    pub host_policy: DbHostPolicy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DbHostPolicy {
    #[default]
    Sequential,
    RoundRobin,
    LeastUsed,
}

impl DbHostPolicy {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sequential" => Self::Sequential,
            "round-robin" => Self::RoundRobin,
            "least-used" => Self::LeastUsed,
            _ => return None,
        })
    }
}

/// The caching-resolver settings.
#[derive(Clone, Debug)]
pub struct RecursiveConfig {
    /// Upstream servers to forward to.
    pub upstreams: Vec<SocketAddr>,
    /// CIDR prefixes allowed to use the cache, in addition to ACL rows.
    pub acl: Vec<String>,
    pub cache_enabled: bool,
    /// Cache memory in megabytes; converted to an entry bound.
    pub cache_size_mb: u32,
    pub ttl_min: u32,
    pub ttl_max: u32,
}

impl Default for RecursiveConfig {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            acl: Vec::new(),
            cache_enabled: true,
            cache_size_mb: 32,
            ttl_min: 60,
            ttl_max: 86400,
        }
    }
}

impl RecursiveConfig {
    /// The entry bound for the cache table.  An average entry runs around
    /// half a kilobyte.
    pub fn max_entries(&self) -> usize {
        (self.cache_size_mb as usize).saturating_mul(1024 * 1024) / 512
    }
}

/// The DNS-over-HTTPS frontend settings.
#[derive(Clone, Debug)]
pub struct DohConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
    pub cert: Utf8PathBuf,
    pub key: Utf8PathBuf,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 443,
            path: "/dns-query".into(),
            cert: "/etc/palisade/doh-cert.pem".into(),
            key: "/etc/palisade/doh-key.pem".into(),
        }
    }
}

/// Daemonization and logging.
#[derive(Clone, Debug, Default)]
pub struct DaemonConfig {
    pub daemonize: bool,
    pub pid_file: Option<Utf8PathBuf>,
    /// User and group to drop privileges to, by name.
    pub identity: Option<(String, String)>,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub target: LogTarget,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            target: LogTarget::Stderr,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warning,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
    File(Utf8PathBuf),
}

//----------- CLI integration --------------------------------------------------

impl Config {
    /// Register the configuration-related command-line arguments.
    pub fn setup_cli(cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("The configuration file to load"),
        )
        .arg(
            clap::Arg::new("log_level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Override the configured log level"),
        )
        .arg(
            clap::Arg::new("foreground")
                .short('f')
                .long("foreground")
                .action(clap::ArgAction::SetTrue)
                .help("Stay in the foreground even if configured to daemonize"),
        )
    }

    /// Build the initial configuration from command-line arguments alone.
    pub fn init(matches: &clap::ArgMatches) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = matches.get_one::<String>("config") {
            config.conf_file = path.as_str().into();
        }
        if let Some(level) = matches.get_one::<String>("log_level") {
            config.daemon.logging.level =
                LogLevel::parse(level).ok_or_else(|| ConfigError::bad_value(0, "log-level"))?;
        }
        if matches.get_flag("foreground") {
            config.daemon.daemonize = false;
        }
        Ok(config)
    }

    /// Read and apply the main configuration file, then the zone-masters
    /// file it points at (missing zone-masters is not an error; slaving is
    /// simply off).
    pub fn init_from_file(&mut self) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(&self.conf_file)
            .map_err(|err| ConfigError::Io(self.conf_file.clone(), err.kind()))?;
        self.apply_main(&text)?;

        match std::fs::read_to_string(&self.masters_file) {
            Ok(text) => {
                let parsed = masters::parse(&text)?;
                self.transfer = parsed.settings;
                self.masters = parsed.masters;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(ConfigError::Io(self.masters_file.clone(), err.kind())),
        }
        Ok(())
    }

    /// Apply the flat `key = value` option lines.
    pub fn apply_main(&mut self, text: &str) -> Result<(), ConfigError> {
        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => match line.split_once(char::is_whitespace) {
                    Some((k, v)) => (k.trim(), v.trim()),
                    None => return Err(ConfigError::Syntax(lineno)),
                },
            };

            self.apply_option(key, value)
                .map_err(|()| ConfigError::bad_value(lineno, key))?;
        }
        Ok(())
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ()> {
        match key {
            "database" => self.db.database = value.to_string(),
            "db-host" | "db-host1" | "db-host2" | "db-host3" | "db-host4" => {
                self.db.hosts.push(value.to_string());
            }
            "db-user" => self.db.user = value.to_string(),
            "db-password" => self.db.password = value.to_string(),
            "db-host-policy" => {
                self.db.host_policy = DbHostPolicy::parse(value).ok_or(())?;
            }

            "listen" => {
                self.listen = split_list(value)
                    .map(|v| parse_listen_addr(v, 53))
                    .collect::<Result<_, _>>()?;
            }

            "recursive" => {
                self.recursive.upstreams = split_list(value)
                    .map(|v| parse_listen_addr(v, 53))
                    .collect::<Result<_, _>>()?;
            }
            "recursive-acl" => {
                self.recursive.acl = split_list(value).map(str::to_string).collect();
            }
            "dns-cache-enabled" => self.recursive.cache_enabled = parse_bool(value)?,
            "dns-cache-size" => {
                self.recursive.cache_size_mb = value.parse().map_err(|_| ())?;
            }
            "dns-cache-ttl-min" => self.recursive.ttl_min = value.parse().map_err(|_| ())?,
            "dns-cache-ttl-max" => self.recursive.ttl_max = value.parse().map_err(|_| ())?,

            "doh-enabled" => self.doh.enabled = parse_bool(value)?,
            "doh-port" => self.doh.port = value.parse().map_err(|_| ())?,
            "doh-path" => {
                if !value.starts_with('/') {
                    return Err(());
                }
                self.doh.path = value.to_string();
            }
            "doh-cert" => self.doh.cert = value.into(),
            "doh-key" => self.doh.key = value.into(),

            "zone-masters-file" => self.masters_file = value.into(),
            "max-records" => {
                self.limits.max_records = value.parse().map_err(|_| ())?;
            }

            "daemonize" => self.daemon.daemonize = parse_bool(value)?,
            "pid-file" => self.daemon.pid_file = Some(value.into()),
            "user" => {
                let group = self
                    .daemon
                    .identity
                    .take()
                    .map(|(_, g)| g)
                    .unwrap_or_else(|| value.to_string());
                self.daemon.identity = Some((value.to_string(), group));
            }
            "group" => {
                let user = self
                    .daemon
                    .identity
                    .take()
                    .map(|(u, _)| u)
                    .unwrap_or_else(|| value.to_string());
                self.daemon.identity = Some((user, value.to_string()));
            }
            "log-level" => {
                self.daemon.logging.level = LogLevel::parse(value).ok_or(())?;
            }
            "log-file" => {
                self.daemon.logging.target = match value {
                    "stdout" => LogTarget::Stdout,
                    "stderr" => LogTarget::Stderr,
                    path => LogTarget::File(path.into()),
                };
            }

            // Unknown options are tolerated so that collaborator-facing
            // settings can share the file.
            _ => {}
        }
        Ok(())
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

fn parse_bool(value: &str) -> Result<bool, ()> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => Err(()),
    }
}

/// Parse an address that may leave the port implicit.
fn parse_listen_addr(value: &str, default_port: u16) -> Result<SocketAddr, ()> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = value.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(())
}

//----------- ConfigError ------------------------------------------------------

/// A configuration that cannot be used.
#[derive(Clone, Debug)]
pub enum ConfigError {
    Io(Utf8PathBuf, std::io::ErrorKind),
    /// The line could not be split into an option and a value.
    Syntax(usize),
    /// The option's value is malformed.
    BadValue { line: usize, option: String },
    /// The zone-masters file is malformed.
    Masters { line: usize, reason: &'static str },
}

impl ConfigError {
    fn bad_value(line: usize, option: &str) -> Self {
        Self::BadValue {
            line,
            option: option.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, kind) => write!(f, "cannot read '{path}': {kind}"),
            Self::Syntax(line) => write!(f, "syntax error on line {line}"),
            Self::BadValue { line, option } => {
                write!(f, "invalid value for '{option}' on line {line}")
            }
            Self::Masters { line, reason } => {
                write!(f, "zone-masters file, line {line}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
