//! Configuration for the telemetry agent
//!
//! Settings are read with the `config` crate from a file (TOML, YAML or JSON,
//! looked up by base name) layered with `HEAPWATCH_*` environment variables.
//! Every value is validated once at startup; an invalid configuration is fatal.

use crate::core::error::{Error, Result};
use crate::system::profiling::{ProfileKind, ProfileRequest, CPU_PROFILE_WINDOW};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Base name of the configuration file looked up when none is given
pub const DEFAULT_CONFIG_NAME: &str = "config";

/// Prefix of the environment variables overriding file settings
pub const ENV_PREFIX: &str = "HEAPWATCH";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Period of the scheduled profile dump
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,

    /// CPU sampling window used by `cpu` dumps
    #[serde(default = "default_cpu_window", deserialize_with = "deserialize_duration")]
    pub duration: Duration,

    /// Profile kind written on every tick
    pub profile: ProfileKind,

    /// Destination of the profile, overwritten on every tick
    #[serde(alias = "profileFile", alias = "profilefile")]
    pub profile_file: PathBuf,

    /// Log file, opened in append mode
    #[serde(alias = "logFile", alias = "logfile")]
    pub log_file: PathBuf,

    /// Basic auth user for `/stats` and `/dashboard`
    pub username: String,

    /// Basic auth password for `/stats` and `/dashboard`
    pub password: String,

    /// HTTP server bind address
    #[serde(default = "default_http_addr", alias = "httpAddr", alias = "httpaddr")]
    pub http_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "logLevel", alias = "loglevel")]
    pub log_level: String,

    /// Dashboard template file; the built-in page is served when unset
    #[serde(default, alias = "dashboardTemplate", alias = "dashboardtemplate")]
    pub dashboard_template: Option<PathBuf>,

    /// File the settings were loaded from, watched for changes
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

// Default value functions for serde
fn default_cpu_window() -> Duration { CPU_PROFILE_WINDOW }
fn default_http_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }
fn default_log_level() -> String { "info".to_string() }

impl Config {
    /// Load configuration from the named file (or `config.*` in the working
    /// directory) and the environment, then validate it
    pub fn load(path: Option<&str>) -> Result<Self> {
        let name = path.unwrap_or(DEFAULT_CONFIG_NAME);
        let mut config: Config = ::config::Config::builder()
            .add_source(::config::File::with_name(name))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        config.source = resolve_source(name);
        Ok(config)
    }

    /// Parse and validate configuration held in memory
    pub fn parse(contents: &str, format: ::config::FileFormat) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(contents, format))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Apply command line overrides, re-validating the result
    pub fn apply_overrides(&mut self, http_addr: Option<&str>, log_level: Option<&str>) -> Result<()> {
        if let Some(addr) = http_addr {
            self.http_addr = addr.parse()
                .map_err(|e| Error::config(format!("Invalid HTTP address {}: {}", addr, e)))?;
        }

        if let Some(level) = log_level {
            self.log_level = level.to_string();
        }

        self.validate()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::config("Invalid interval value"));
        }

        if self.duration.is_zero() {
            return Err(Error::config("Invalid duration value"));
        }

        if is_blank(&self.profile_file) {
            return Err(Error::config("Profile file not specified"));
        }

        if is_blank(&self.log_file) {
            return Err(Error::config("Log file not specified"));
        }

        if self.username.is_empty() || self.password.is_empty() {
            return Err(Error::config("Username or password not specified"));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            other => return Err(Error::config(format!("Invalid log level: {}", other))),
        }

        Ok(())
    }

    /// The profile written on every scheduled tick
    pub fn profile_request(&self) -> ProfileRequest {
        ProfileRequest::new(self.profile, self.profile_file.clone())
    }

    /// Warn when a CPU capture outlasts the dump interval
    ///
    /// Ticks that come due while a capture is running are skipped, so the
    /// effective cadence becomes the capture window.
    pub fn warn_on_overlap(&self) -> bool {
        let overlaps = self.profile == ProfileKind::Cpu && self.interval <= self.duration;
        if overlaps {
            warn!(
                interval = ?self.interval,
                window = ?self.duration,
                "CPU capture window is not shorter than the dump interval; overlapping ticks will be skipped"
            );
        }
        overlaps
    }
}

// The file `File::with_name` reads: the name itself, or the name plus a known extension
fn resolve_source(name: &str) -> Option<PathBuf> {
    let path = PathBuf::from(name);
    if path.is_file() {
        return Some(path);
    }

    ["toml", "json", "yaml", "yml", "ini", "ron", "json5"]
        .iter()
        .map(|ext| {
            let mut candidate = path.clone().into_os_string();
            candidate.push(".");
            candidate.push(ext);
            PathBuf::from(candidate)
        })
        .find(|candidate| candidate.is_file())
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

// Accepts either a duration string ("10s", "1m30s") or a bare number of seconds
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '30s' or '5m', or a number of seconds")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration: {}", value)))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Parse a duration such as `500ms`, `10s`, `5m`, `1h`, `1m30s` or `1.5s`
///
/// A bare integer is read as seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{}'", s));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(format!("missing unit in duration '{}'", s)),
            other => return Err(format!("unknown unit '{}' in duration '{}'", other, s)),
        };

        let part = if number.contains('.') {
            let value: f64 = number.parse()
                .map_err(|_| format!("invalid number in duration '{}'", s))?;
            Duration::try_from_secs_f64(value * unit_nanos as f64 / 1e9)
                .map_err(|e| format!("invalid duration '{}': {}", s, e))?
        } else {
            let value: u64 = number.parse()
                .map_err(|_| format!("invalid number in duration '{}'", s))?;
            value.checked_mul(unit_nanos)
                .map(Duration::from_nanos)
                .ok_or_else(|| format!("duration '{}' is too large", s))?
        };

        total = total.checked_add(part)
            .ok_or_else(|| format!("duration '{}' is too large", s))?;
        rest = tail;
    }

    Ok(total)
}
