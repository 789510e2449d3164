//! # Probe Logger
//!
//! A small always-on daemon for hosts with directly attached one-wire DS18B20
//! temperature probes. It discovers the probes the kernel exposes under
//! `/sys/bus/w1/devices`, names them through a configured alias table and
//! samples every probe on a fixed interval, appending timestamped readings to
//! per-probe log files and/or an rrdtool database.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             PROBE LOGGER                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ALIAS TABLE → PROBE REGISTRY → RECORDER (log files / rrd / stdout)  │
//! │                       ↑                ↑                             │
//! │                 SAMPLE READER ←── POLL LOOP ←── SIGHUP/SIGTERM       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Discovery runs exactly once at startup. The probe list and the recorder's
//! sink table live for the whole process; the poll loop is the only driver.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Collection Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{DateTime, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Toml};
use figment::Figment;

// ============================================================================
// SECTION 2: CONSTANTS & CONFIGURATION DEFAULTS
// ============================================================================

/// Daemon name used in CLI output and default file names
pub const DAEMON_NAME: &str = "probe-logger";

/// Daemon version
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration file read when none is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ds18b20.cfg";

/// Where the w1 bus driver exposes its slave devices
pub const DEFAULT_DEVICE_ROOT: &str = "/sys/bus/w1/devices";

/// Directory receiving the per-probe `.log` files
pub const DEFAULT_LOG_ROOT: &str = "/var/probes";

/// Directory receiving the per-probe `.rrd` databases
pub const DEFAULT_RRD_ROOT: &str = "/var/www/rrd";

/// Pid file written after daemonizing
pub const DEFAULT_PID_FILE: &str = "/var/run/probe-logger.pid";

/// Diagnostic log used once the process has detached from its terminal
pub const DEFAULT_DIAGNOSTIC_LOG: &str = "/var/log/probe-logger.log";

/// One-wire family code of the DS18B20
pub const DS18B20_FAMILY_PREFIX: &str = "28-";

/// File inside each device directory holding the two-line sample blob
pub const PROBE_DATA_FILE: &str = "w1_slave";

/// Default sampling interval (5 minutes)
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Readings carry whole-second timestamps, so two cycles may not share a second
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the sampling interval (one week)
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default cap on the number of probes kept by discovery
pub const DEFAULT_MAX_PROBES: usize = 32;

/// Hard upper bound accepted for `max_probes`
pub const MAX_PROBES_LIMIT: usize = 1024;

/// Probes stored inline before the probe list spills to the heap
pub const INLINE_PROBES: usize = 8;

/// Token preceding the milli-Celsius value on the second sample line
pub const TEMPERATURE_MARKER: &str = "t=";

/// Raw sensor units per degree Celsius
pub const MILLIDEGREES_PER_DEGREE: f64 = 1000.0;

/// DS18B20 measurement range, used as rrd data source bounds
pub const SENSOR_MIN_CELSIUS: i32 = -55;
pub const SENSOR_MAX_CELSIUS: i32 = 125;

/// Default rrd archive length (30 days of 5 minute samples)
pub const DEFAULT_RRD_ROWS: u32 = 8640;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "PROBELOG_";

// ============================================================================
// SECTION 3: CORE TYPES
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock time in whole seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    #[inline]
    pub const fn as_secs(self) -> i64 {
        self.0
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.0, 0).single()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Probe & Reading
// ----------------------------------------------------------------------------

/// A discovered temperature sensor. Immutable once discovery has produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Probe {
    /// Position in the registry; also the processing order
    pub index: usize,
    /// Identifier assigned by the w1 bus driver, e.g. `28-000005e2fdc3`
    pub raw_id: CompactString,
    /// Alias if one matched, otherwise the raw id
    pub display_name: CompactString,
    /// `<device_root>/<raw_id>/w1_slave`
    pub source: PathBuf,
    /// `<log_root>/<display_name>.log`
    pub sink_target: PathBuf,
}

impl Probe {
    pub fn is_aliased(&self) -> bool {
        self.raw_id != self.display_name
    }
}

/// One sample. Produced each cycle and handed straight to the recorder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub probe_index: usize,
    pub timestamp: Timestamp,
    pub celsius: f64,
}

impl Reading {
    pub fn new(probe_index: usize, timestamp: Timestamp, celsius: f64) -> Self {
        Self {
            probe_index,
            timestamp,
            celsius,
        }
    }

    /// Line appended to a probe's log file.
    pub fn log_line(&self) -> String {
        format!("{} {:.3}\n", self.timestamp, self.celsius)
    }

    /// Line printed in one-shot mode.
    pub fn console_line(&self, display_name: &str) -> String {
        format!("{}:\t{:.3}\n", display_name, self.celsius)
    }
}

/// Fixed, ordered probe list
pub type ProbeList = SmallVec<[Probe; INLINE_PROBES]>;

// ----------------------------------------------------------------------------
// 3.3 Modes & Policies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Sample forever on the configured interval
    Continuous,
    /// Sample every probe once, print to stdout and exit
    Once,
}

/// What a failed probe read does to the running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Terminate on the first failure
    #[default]
    Abort,
    /// Record the failure against the probe and carry on with the cycle
    Skip,
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Abort => write!(f, "abort"),
            ErrorPolicy::Skip => write!(f, "skip"),
        }
    }
}

// ============================================================================
// SECTION 4: ERROR TYPES
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-level Error
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ProbeLogError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("sample error: {0}")]
    Sample(#[from] SampleError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("system error: {0}")]
    System(#[from] SystemError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// When an error can occur, and therefore how the process reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Raised before the first cycle; the loop is never entered
    StartupFatal,
    /// Raised by a running loop; terminates it
    RuntimeFatal,
}

impl ProbeLogError {
    pub fn phase(&self) -> ErrorPhase {
        match self {
            ProbeLogError::Config(_) | ProbeLogError::Discovery(_) | ProbeLogError::System(_) => {
                ErrorPhase::StartupFatal
            }
            ProbeLogError::Sink(e) if e.is_setup() => ErrorPhase::StartupFatal,
            ProbeLogError::Sample(_) | ProbeLogError::Sink(_) | ProbeLogError::Io(_) => {
                ErrorPhase::RuntimeFatal
            }
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ProbeLogError::Config(_) => "config",
            ProbeLogError::Discovery(_) => "discovery",
            ProbeLogError::Sample(_) => "sample",
            ProbeLogError::Sink(_) => "sink",
            ProbeLogError::System(_) => "system",
            ProbeLogError::Io(_) => "io",
        }
    }

    pub fn is_startup(&self) -> bool {
        self.phase() == ErrorPhase::StartupFatal
    }
}

// ----------------------------------------------------------------------------
// 4.2 Subsystem Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("cannot read configuration file {}: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("syntax error in line {line} in file {}: {message}", origin.display())]
    Syntax {
        origin: PathBuf,
        line: usize,
        message: String,
    },

    #[error("unknown key '{key}' on line {line} in file {}", origin.display())]
    UnknownKey {
        key: String,
        line: usize,
        origin: PathBuf,
    },

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("malformed alias '{entry}': {message}")]
    MalformedAlias { entry: String, message: String },

    #[error("please use either logging (log) or rrd (rrd) output")]
    NoOutput,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error(
        "no DS18B20 compatible probes located under {}; make sure the w1-gpio and w1-therm drivers are loaded into the kernel",
        path.display()
    )]
    NoProbes { path: PathBuf },
}

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("unable to read {}: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("{} yielded {lines} line(s), expected two", path.display())]
    Truncated { path: PathBuf, lines: usize },

    #[error("no 't=' token in second line of {}", path.display())]
    MissingMarker { path: PathBuf },

    #[error("non-numeric temperature '{value}' in {}", path.display())]
    InvalidValue { path: PathBuf, value: String },
}

impl SampleError {
    pub fn path(&self) -> &Path {
        match self {
            SampleError::Unreadable { path, .. }
            | SampleError::Truncated { path, .. }
            | SampleError::MissingMarker { path }
            | SampleError::InvalidValue { path, .. } => path,
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{kind} root {} does not exist", path.display())]
    RootMissing { kind: &'static str, path: PathBuf },

    #[error("{kind} root {} is not a directory", path.display())]
    RootNotDirectory { kind: &'static str, path: PathBuf },

    #[error("unable to open '{}': {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("unable to reopen '{}': {source}", path.display())]
    Reopen { path: PathBuf, source: io::Error },

    #[error("unable to write '{}': {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("unable to close '{}': {source}", path.display())]
    Close { path: PathBuf, source: io::Error },

    #[error("unable to write to standard output: {source}")]
    Console { source: io::Error },

    #[error("{sink} sink failed for probe '{probe}': {message}")]
    TimeSeries {
        sink: &'static str,
        probe: String,
        message: String,
    },

    #[error("recorder has been shut down")]
    Closed,
}

impl SinkError {
    /// Errors raised while preparing sinks, before any reading is taken.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            SinkError::RootMissing { .. } | SinkError::RootNotDirectory { .. } | SinkError::Open { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("failed to install {signal} handler: {source}")]
    Signal { signal: &'static str, source: io::Error },

    #[error("daemonize failed at {step}: {message}")]
    Daemonize { step: &'static str, message: String },

    #[error("pid file {}: {source}", path.display())]
    PidFile { path: PathBuf, source: io::Error },

    #[error("logging setup failed: {message}")]
    Logging { message: String },

    #[error("runtime setup failed: {source}")]
    Runtime { source: io::Error },
}

// ----------------------------------------------------------------------------
// 4.3 Result Aliases
// ----------------------------------------------------------------------------

pub type ProbeLogResult<T> = Result<T, ProbeLogError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
pub type SampleResult<T> = Result<T, SampleError>;
pub type SinkResult<T> = Result<T, SinkError>;

// ============================================================================
// SECTION 5: CONFIGURATION
// ============================================================================
//
// Two on-disk formats are accepted. `*.toml` files go through figment and can
// be overridden with `PROBELOG_*` environment variables. Anything else is read
// as the classic line-oriented `/etc/ds18b20.cfg` format:
//
//   # comment            ; comment
//   LOG
//   INTERVAL 60
//   ALIAS 28-000005e2fdc3 patio
//
// Command line overrides are applied on top and can only switch features on.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Time between two sampling cycles
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// Append readings to `<log_root>/<name>.log`
    #[serde(default)]
    pub log: bool,

    /// Record readings in `<rrd_root>/<name>.rrd`
    #[serde(default)]
    pub rrd: bool,

    /// Sample once, print to stdout and exit
    #[serde(default)]
    pub once: bool,

    /// Stay attached to the terminal
    #[serde(default)]
    pub foreground: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub on_error: ErrorPolicy,

    /// Device family prefix a w1 entry must carry to qualify as a probe
    #[serde(default = "default_family_prefix")]
    pub family_prefix: String,

    #[serde(default = "default_max_probes")]
    pub max_probes: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,

    /// Ordered alias list; the first entry matching a raw id wins
    #[serde(default)]
    pub aliases: Vec<AliasEntry>,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub rrdtool: RrdtoolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_interval() -> Duration {
    Duration::from_secs(DEFAULT_INTERVAL_SECS)
}
fn default_family_prefix() -> String {
    DS18B20_FAMILY_PREFIX.to_string()
}
fn default_max_probes() -> usize {
    DEFAULT_MAX_PROBES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            log: false,
            rrd: false,
            once: false,
            foreground: false,
            verbose: false,
            on_error: ErrorPolicy::default(),
            family_prefix: default_family_prefix(),
            max_probes: default_max_probes(),
            pid_file: None,
            aliases: Vec::new(),
            paths: PathsConfig::default(),
            rrdtool: RrdtoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One `(raw id, friendly name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl AliasEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_device_root")]
    pub device_root: PathBuf,
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
    #[serde(default = "default_rrd_root")]
    pub rrd_root: PathBuf,
}

fn default_device_root() -> PathBuf {
    PathBuf::from(DEFAULT_DEVICE_ROOT)
}
fn default_log_root() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_ROOT)
}
fn default_rrd_root() -> PathBuf {
    PathBuf::from(DEFAULT_RRD_ROOT)
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            device_root: default_device_root(),
            log_root: default_log_root(),
            rrd_root: default_rrd_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrdtoolConfig {
    /// rrdtool executable, looked up on `PATH` when not absolute
    #[serde(default = "default_rrdtool_binary")]
    pub binary: PathBuf,
    /// Heartbeat as a multiple of the sampling interval
    #[serde(default = "default_heartbeat_factor")]
    pub heartbeat_factor: u32,
    /// Rows kept in the AVERAGE archive
    #[serde(default = "default_rrd_rows")]
    pub rows: u32,
}

fn default_rrdtool_binary() -> PathBuf {
    PathBuf::from("rrdtool")
}
fn default_heartbeat_factor() -> u32 {
    2
}
fn default_rrd_rows() -> u32 {
    DEFAULT_RRD_ROWS
}

impl Default for RrdtoolConfig {
    fn default() -> Self {
        Self {
            binary: default_rrdtool_binary(),
            heartbeat_factor: default_heartbeat_factor(),
            rows: default_rrd_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Diagnostic log written once daemonized
    #[serde(default = "default_diagnostic_log")]
    pub file: PathBuf,
    #[serde(default)]
    pub rotation: LogRotation,
    #[serde(default = "default_true")]
    pub colors: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_diagnostic_log() -> PathBuf {
    PathBuf::from(DEFAULT_DIAGNOSTIC_LOG)
}
fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: default_diagnostic_log(),
            rotation: LogRotation::default(),
            colors: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Command Line Overrides
// ----------------------------------------------------------------------------

/// Values given on the command line. `false`/`None` leave the file's value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub verbose: bool,
    pub foreground: bool,
    pub log: bool,
    pub rrd: bool,
    pub once: bool,
    pub interval: Option<Duration>,
    pub on_error: Option<ErrorPolicy>,
}

/// Parses an interval given either as plain seconds (`300`) or as a
/// humantime string (`5m`, `1h 30s`). Values outside
/// [`MIN_INTERVAL`]..=[`MAX_INTERVAL`] are rejected.
pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let duration = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(value).map_err(|e| format!("'{}': {}", value, e))?,
    };
    check_interval(duration)?;
    Ok(duration)
}

fn check_interval(interval: Duration) -> Result<(), String> {
    if interval.is_zero() {
        return Err("interval can not be zero".to_string());
    }
    if interval < MIN_INTERVAL {
        return Err(format!(
            "interval must be at least {}",
            humantime::format_duration(MIN_INTERVAL)
        ));
    }
    if interval > MAX_INTERVAL {
        return Err(format!(
            "interval must not exceed {}",
            humantime::format_duration(MAX_INTERVAL)
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 5.3 Loading
// ----------------------------------------------------------------------------

impl Config {
    /// Loads the file at `path`, choosing the parser from its extension.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__"))
                .extract()
                .map_err(|e| ConfigError::ParseError {
                    message: e.to_string(),
                })
        } else {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_legacy_str(&text, path)
        }
    }

    /// Loads an explicitly requested file, or the default one if it exists.
    ///
    /// A missing explicit file is an error; a missing default file yields the
    /// built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> ConfigResult<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None if Self::falls_back_to_defaults(None) => Ok(Self::default()),
            None => Self::load(Path::new(DEFAULT_CONFIG_PATH)),
        }
    }

    /// Whether `resolve` would return the built-in defaults. Callers log the
    /// fallback themselves once a subscriber is installed.
    pub fn falls_back_to_defaults(explicit: Option<&Path>) -> bool {
        explicit.is_none() && !Path::new(DEFAULT_CONFIG_PATH).exists()
    }

    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Parses the line-oriented format. `origin` is only used in error messages.
    pub fn from_legacy_str(text: &str, origin: &Path) -> ConfigResult<Self> {
        let mut config = Self::default();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            let (key, rest) = match line.split_once(char::is_whitespace) {
                Some((key, rest)) => (key, rest.trim()),
                None => (line, ""),
            };

            match key.to_ascii_uppercase().as_str() {
                "VERBOSE" => config.verbose = true,
                "LOG" => config.log = true,
                "RRD" => config.rrd = true,
                "FOREGROUND" => config.foreground = true,
                "INTERVAL" => {
                    if rest.is_empty() {
                        return Err(ConfigError::Syntax {
                            origin: origin.to_path_buf(),
                            line: line_no,
                            message: "INTERVAL requires a value in seconds".to_string(),
                        });
                    }
                    let secs: u64 = rest.parse().map_err(|_| ConfigError::Syntax {
                        origin: origin.to_path_buf(),
                        line: line_no,
                        message: format!("'{}' is not a number of seconds", rest),
                    })?;
                    let interval = Duration::from_secs(secs);
                    check_interval(interval).map_err(|message| ConfigError::Syntax {
                        origin: origin.to_path_buf(),
                        line: line_no,
                        message,
                    })?;
                    config.interval = interval;
                }
                "ALIAS" => {
                    let (id, name) = match rest.split_once(char::is_whitespace) {
                        Some((id, name)) => (id.trim(), name.trim()),
                        None => (rest, ""),
                    };
                    if id.is_empty() || name.is_empty() {
                        return Err(ConfigError::Syntax {
                            origin: origin.to_path_buf(),
                            line: line_no,
                            message: "ALIAS requires a probe id and a name".to_string(),
                        });
                    }
                    config.aliases.push(AliasEntry::new(id, name));
                }
                _ => {
                    return Err(ConfigError::UnknownKey {
                        key: key.to_string(),
                        line: line_no,
                        origin: origin.to_path_buf(),
                    })
                }
            }
        }

        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        self.verbose |= overrides.verbose;
        self.foreground |= overrides.foreground;
        self.log |= overrides.log;
        self.rrd |= overrides.rrd;
        self.once |= overrides.once;
        if let Some(interval) = overrides.interval {
            self.interval = interval;
        }
        if let Some(policy) = overrides.on_error {
            self.on_error = policy;
        }
    }

    /// Normalizes derived flags and validates the result.
    pub fn finalize(mut self) -> ConfigResult<Self> {
        if self.once {
            self.foreground = true;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_interval(self.interval).map_err(|message| ConfigError::InvalidValue {
            field: "interval".to_string(),
            message,
        })?;

        if self.max_probes == 0 || self.max_probes > MAX_PROBES_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "max_probes".to_string(),
                message: format!("must be between 1 and {}", MAX_PROBES_LIMIT),
            });
        }

        if self.family_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "family_prefix".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        if self.rrdtool.heartbeat_factor == 0 || self.rrdtool.rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rrdtool".to_string(),
                message: "heartbeat_factor and rows must be positive".to_string(),
            });
        }

        if self.logging.level.parse::<LevelFilter>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                message: format!("unknown level '{}'", self.logging.level),
            });
        }

        if !self.log && !self.rrd && !self.once {
            return Err(ConfigError::NoOutput);
        }

        Ok(())
    }

    pub fn run_mode(&self) -> RunMode {
        if self.once {
            RunMode::Once
        } else {
            RunMode::Continuous
        }
    }

    /// Sinks the recorder opens. One-shot mode never opens persistent sinks.
    pub fn recorder_outputs(&self) -> RecorderOutputs {
        match self.run_mode() {
            RunMode::Once => RecorderOutputs::console_only(),
            RunMode::Continuous => RecorderOutputs {
                log: self.log,
                rrd: self.rrd,
            },
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE))
    }

    pub fn generate_default_config() -> ConfigResult<String> {
        let config = Self {
            log: true,
            ..Self::default()
        };
        toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Drops everything from the first `#` or `;`.
fn strip_comment(line: &str) -> &str {
    match line.find(|c: char| c == '#' || c == ';') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

// ============================================================================
// SECTION 6: LOGGING
// ============================================================================
//
// Diagnostics go to stderr while the process owns a terminal. Once it
// detaches, the writer is swapped for a rolling file; the subscriber itself
// is installed only once.
// ============================================================================

enum DiagnosticTarget {
    Stderr,
    File(Mutex<RollingFileAppender>),
}

impl fmt::Debug for DiagnosticTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticTarget::Stderr => f.write_str("Stderr"),
            DiagnosticTarget::File(_) => f.write_str("File"),
        }
    }
}

/// `MakeWriter` whose destination can be switched after the subscriber is set.
#[derive(Clone)]
pub struct DiagnosticWriter {
    target: Arc<ArcSwap<DiagnosticTarget>>,
}

impl DiagnosticWriter {
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(ArcSwap::from_pointee(DiagnosticTarget::Stderr)),
        }
    }

    /// Sends every subsequent diagnostic line to `path`.
    pub fn redirect_to_file(&self, path: &Path, rotation: LogRotation) -> ProbeLogResult<()> {
        let directory = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let prefix = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| SystemError::Logging {
                message: format!("{} is not a file path", path.display()),
            })?;

        let appender = RollingFileAppender::builder()
            .rotation(rotation.into())
            .filename_prefix(prefix)
            .build(directory)
            .map_err(|e| SystemError::Logging {
                message: format!("cannot open {}: {}", path.display(), e),
            })?;

        self.target
            .store(Arc::new(DiagnosticTarget::File(Mutex::new(appender))));
        Ok(())
    }

    pub fn is_redirected(&self) -> bool {
        matches!(**self.target.load(), DiagnosticTarget::File(_))
    }
}

impl fmt::Debug for DiagnosticWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticWriter")
            .field("target", &**self.target.load())
            .finish()
    }
}

/// Writer handed out per event.
#[derive(Debug)]
pub struct DiagnosticHandle(Arc<DiagnosticTarget>);

impl Write for DiagnosticHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &*self.0 {
            DiagnosticTarget::Stderr => io::stderr().write(buf),
            DiagnosticTarget::File(appender) => appender.lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &*self.0 {
            DiagnosticTarget::Stderr => io::stderr().flush(),
            DiagnosticTarget::File(appender) => appender.lock().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for DiagnosticWriter {
    type Writer = DiagnosticHandle;

    fn make_writer(&'a self) -> Self::Writer {
        DiagnosticHandle(self.target.load_full())
    }
}

/// Installs the global subscriber and returns the writer it logs through.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> ProbeLogResult<DiagnosticWriter> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        config
            .level
            .parse::<LevelFilter>()
            .map_err(|e| SystemError::Logging {
                message: format!("invalid level '{}': {}", config.level, e),
            })?
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let writer = DiagnosticWriter::stderr();

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer.clone()),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_writer(writer.clone()),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_ansi(config.colors)
                    .with_writer(writer.clone()),
            )
            .try_init(),
    };

    installed.map_err(|e| SystemError::Logging {
        message: e.to_string(),
    })?;

    Ok(writer)
}

// ============================================================================
// SECTION 7: ALIAS TABLE
// ============================================================================

/// Raw probe id → friendly name, built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: Vec<(CompactString, CompactString)>,
}

impl AliasTable {
    /// Validates the configured entries. Duplicate ids keep the first entry;
    /// two ids sharing a name would share a log file and are rejected.
    pub fn new(entries: &[AliasEntry]) -> ConfigResult<Self> {
        let mut table: Vec<(CompactString, CompactString)> = Vec::with_capacity(entries.len());

        for entry in entries {
            let id = entry.id.trim();
            let name = entry.name.trim();

            if id.is_empty() || name.is_empty() {
                return Err(ConfigError::MalformedAlias {
                    entry: format!("{} {}", entry.id, entry.name).trim().to_string(),
                    message: "an alias needs both a probe id and a name".to_string(),
                });
            }

            if name.contains('/') || name == "." || name == ".." {
                return Err(ConfigError::MalformedAlias {
                    entry: format!("{} {}", id, name),
                    message: "the name must be usable as a file name".to_string(),
                });
            }

            if let Some((_, kept)) = table.iter().find(|(known, _)| known.eq_ignore_ascii_case(id)) {
                warn!(
                    target: "probelog::alias",
                    probe = %id,
                    kept = %kept,
                    ignored = %name,
                    "Duplicate alias ignored"
                );
                continue;
            }

            if let Some((other, _)) = table.iter().find(|(_, known)| known.as_str() == name) {
                return Err(ConfigError::MalformedAlias {
                    entry: format!("{} {}", id, name),
                    message: format!("the name is already used by {}", other),
                });
            }

            table.push((CompactString::from(id), CompactString::from(name)));
        }

        Ok(Self { entries: table })
    }

    /// First alias whose id equals `raw_id` ignoring ASCII case, else `raw_id`.
    pub fn resolve<'a>(&'a self, raw_id: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(raw_id))
            .map(|(_, name)| name.as_str())
            .unwrap_or(raw_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries.iter().map(|(id, name)| (id.as_str(), name.as_str()))
    }
}

// ============================================================================
// SECTION 8: PROBE REGISTRY
// ============================================================================

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub device_root: PathBuf,
    pub log_root: PathBuf,
    pub family_prefix: String,
    pub max_probes: usize,
}

impl DiscoveryOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_root: config.paths.device_root.clone(),
            log_root: config.paths.log_root.clone(),
            family_prefix: config.family_prefix.clone(),
            max_probes: config.max_probes,
        }
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The fixed, ordered probe list for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ProbeRegistry {
    probes: ProbeList,
    device_root: PathBuf,
}

impl ProbeRegistry {
    /// Enumerates the device root once. Entries keep the order the host
    /// returns them in. An unreadable root yields an empty registry.
    pub fn discover(options: &DiscoveryOptions, aliases: &AliasTable) -> Self {
        let mut probes = ProbeList::new();

        let entries = match fs::read_dir(&options.device_root) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    target: "probelog::discovery",
                    path = %options.device_root.display(),
                    error = %e,
                    "Cannot open device directory"
                );
                return Self {
                    probes,
                    device_root: options.device_root.clone(),
                };
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(target: "probelog::discovery", error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let file_name = entry.file_name();
            let Some(raw_id) = file_name.to_str() else {
                debug!(target: "probelog::discovery", entry = ?file_name, "Skipping non UTF-8 entry");
                continue;
            };

            if !raw_id.starts_with(options.family_prefix.as_str()) {
                trace!(target: "probelog::discovery", entry = %raw_id, "Not a DS18B20");
                continue;
            }

            if probes.len() >= options.max_probes {
                warn!(
                    target: "probelog::discovery",
                    probe = %raw_id,
                    limit = options.max_probes,
                    "Probe limit reached, ignoring probe"
                );
                continue;
            }

            let display_name = aliases.resolve(raw_id);
            if let Some(taken) = probes.iter().find(|p| p.display_name.as_str() == display_name) {
                warn!(
                    target: "probelog::discovery",
                    probe = %raw_id,
                    name = %display_name,
                    taken_by = %taken.raw_id,
                    "Display name already in use, ignoring probe"
                );
                continue;
            }

            let probe = Probe {
                index: probes.len(),
                raw_id: CompactString::from(raw_id),
                display_name: CompactString::from(display_name),
                source: options.device_root.join(raw_id).join(PROBE_DATA_FILE),
                sink_target: options.log_root.join(format!("{}.log", display_name)),
            };

            info!(
                target: "probelog::discovery",
                probe = %probe.display_name,
                device_file = %probe.source.display(),
                log_file = %probe.sink_target.display(),
                "Found DS18B20 compatible probe"
            );

            probes.push(probe);
        }

        Self {
            probes,
            device_root: options.device_root.clone(),
        }
    }

    /// Zero probes is a startup failure; the loop must never run without any.
    pub fn require_probes(self) -> DiscoveryResult<Self> {
        if self.probes.is_empty() {
            return Err(DiscoveryError::NoProbes {
                path: self.device_root,
            });
        }
        Ok(self)
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn get(&self, index: usize) -> Option<&Probe> {
        self.probes.get(index)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn device_root(&self) -> &Path {
        &self.device_root
    }
}

// ============================================================================
// SECTION 9: SAMPLE READER
// ============================================================================

/// Reads one probe. The source is opened fresh on every call since the
/// driver refreshes it between reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleReader;

impl SampleReader {
    pub fn new() -> Self {
        Self
    }

    pub async fn read(&self, source: &Path) -> SampleResult<f64> {
        let text = tokio::fs::read_to_string(source)
            .await
            .map_err(|source_err| SampleError::Unreadable {
                path: source.to_path_buf(),
                source: source_err,
            })?;
        parse_sample(&text, source)
    }
}

/// Parses the two-line `w1_slave` blob:
///
/// ```text
/// 5c 01 4b 46 7f ff 04 10 a1 : crc=a1 YES
/// 5c 01 4b 46 7f ff 04 10 a1 t=21750
/// ```
///
/// The first line is ignored. The integer after `t=` is milli-Celsius.
pub fn parse_sample(text: &str, origin: &Path) -> SampleResult<f64> {
    let mut lines = text.lines();
    let _status = lines.next();

    let data = lines.next().ok_or_else(|| SampleError::Truncated {
        path: origin.to_path_buf(),
        lines: text.lines().count(),
    })?;

    let (_, tail) = data
        .split_once(TEMPERATURE_MARKER)
        .ok_or_else(|| SampleError::MissingMarker {
            path: origin.to_path_buf(),
        })?;

    let token = tail.split_whitespace().next().unwrap_or("");
    let millidegrees: i64 = token.parse().map_err(|_| SampleError::InvalidValue {
        path: origin.to_path_buf(),
        value: token.to_string(),
    })?;

    Ok(millidegrees as f64 / MILLIDEGREES_PER_DEGREE)
}

// ============================================================================
// SECTION 10: RECORDER & SINKS
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Time-Series Sink Trait
// ----------------------------------------------------------------------------

/// External per-reading store, called after the log line has been written.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn record(&self, probe: &Probe, reading: &Reading) -> SinkResult<()>;
}

// ----------------------------------------------------------------------------
// 10.2 rrdtool Sink
// ----------------------------------------------------------------------------

/// Shells out to `rrdtool`, one database per probe under the rrd root.
#[derive(Debug, Clone)]
pub struct RrdtoolSink {
    binary: PathBuf,
    root: PathBuf,
    step_secs: u64,
    heartbeat_secs: u64,
    rows: u32,
}

impl RrdtoolSink {
    pub fn new(root: impl Into<PathBuf>, interval: Duration, settings: &RrdtoolConfig) -> Self {
        let step_secs = interval.as_secs().max(1);
        Self {
            binary: settings.binary.clone(),
            root: root.into(),
            step_secs,
            heartbeat_secs: step_secs.saturating_mul(u64::from(settings.heartbeat_factor)),
            rows: settings.rows,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.paths.rrd_root.clone(), config.interval, &config.rrdtool)
    }

    pub fn database_path(&self, probe: &Probe) -> PathBuf {
        self.root.join(format!("{}.rrd", probe.display_name))
    }

    pub fn create_args(&self, database: &Path) -> Vec<String> {
        vec![
            "create".to_string(),
            database.to_string_lossy().into_owned(),
            "--step".to_string(),
            self.step_secs.to_string(),
            format!(
                "DS:temp:GAUGE:{}:{}:{}",
                self.heartbeat_secs, SENSOR_MIN_CELSIUS, SENSOR_MAX_CELSIUS
            ),
            format!("RRA:AVERAGE:0.5:1:{}", self.rows),
        ]
    }

    pub fn update_args(&self, database: &Path, reading: &Reading) -> Vec<String> {
        vec![
            "update".to_string(),
            database.to_string_lossy().into_owned(),
            format!("{}:{:.3}", reading.timestamp, reading.celsius),
        ]
    }

    async fn run(&self, probe: &Probe, args: &[String]) -> SinkResult<()> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| SinkError::TimeSeries {
                sink: self.name(),
                probe: probe.display_name.to_string(),
                message: format!("cannot run {}: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SinkError::TimeSeries {
                sink: self.name(),
                probe: probe.display_name.to_string(),
                message: format!(
                    "{} {} exited with {}: {}",
                    self.binary.display(),
                    args.first().map(String::as_str).unwrap_or(""),
                    output.status,
                    stderr.trim()
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl TimeSeriesSink for RrdtoolSink {
    fn name(&self) -> &'static str {
        "rrdtool"
    }

    async fn record(&self, probe: &Probe, reading: &Reading) -> SinkResult<()> {
        let database = self.database_path(probe);

        if tokio::fs::metadata(&database).await.is_err() {
            info!(
                target: "probelog::rrd",
                probe = %probe.display_name,
                path = %database.display(),
                "Creating rrd database"
            );
            self.run(probe, &self.create_args(&database)).await?;
        }

        self.run(probe, &self.update_args(&database, reading)).await
    }
}

// ----------------------------------------------------------------------------
// 10.3 Log File Sink
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct LogSink {
    path: PathBuf,
    file: Option<File>,
}

impl LogSink {
    fn open(path: &Path) -> SinkResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(Self::open_file(path)?),
        })
    }

    fn open_file(path: &Path) -> SinkResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })
    }

    fn append(&mut self, line: &str) -> SinkResult<()> {
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        file.write_all(line.as_bytes())
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Installs `fresh` and closes the handle it replaces.
    fn replace(&mut self, fresh: File) -> SinkResult<()> {
        match self.file.replace(fresh) {
            Some(stale) => close_file(&self.path, stale),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> SinkResult<()> {
        match self.file.take() {
            Some(file) => close_file(&self.path, file),
            None => Ok(()),
        }
    }
}

/// Closes explicitly so a failing `close(2)` is reported instead of ignored by `Drop`.
fn close_file(path: &Path, file: File) -> SinkResult<()> {
    nix::unistd::close(file.into_raw_fd()).map_err(|errno| SinkError::Close {
        path: path.to_path_buf(),
        source: io::Error::from(errno),
    })
}

#[derive(Debug)]
struct SinkTable {
    sinks: Vec<LogSink>,
    open: bool,
}

// ----------------------------------------------------------------------------
// 10.4 Recorder
// ----------------------------------------------------------------------------

/// Which persistent sinks a recorder writes to. With neither, readings go to
/// the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecorderOutputs {
    pub log: bool,
    pub rrd: bool,
}

impl RecorderOutputs {
    pub const fn console_only() -> Self {
        Self {
            log: false,
            rrd: false,
        }
    }

    pub fn is_console_only(&self) -> bool {
        !self.log && !self.rrd
    }
}

#[derive(Debug, Default)]
struct RecorderStatsTracker {
    lines_written: AtomicU64,
    console_lines: AtomicU64,
    time_series_records: AtomicU64,
    rotations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub lines_written: u64,
    pub console_lines: u64,
    pub time_series_records: u64,
    pub rotations: u64,
}

impl RecorderStatsTracker {
    fn snapshot(&self) -> RecorderStats {
        RecorderStats {
            lines_written: self.lines_written.load(AtomicOrdering::Relaxed),
            console_lines: self.console_lines.load(AtomicOrdering::Relaxed),
            time_series_records: self.time_series_records.load(AtomicOrdering::Relaxed),
            rotations: self.rotations.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Owns every open log handle. All access goes through `persist`, `rotate`
/// and `shutdown`, serialized by the sink table lock.
pub struct Recorder {
    outputs: RecorderOutputs,
    sinks: Mutex<SinkTable>,
    time_series: Option<Arc<dyn TimeSeriesSink>>,
    console: Mutex<Box<dyn Write + Send>>,
    stats: RecorderStatsTracker,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.sinks.try_lock();
        f.debug_struct("Recorder")
            .field("outputs", &self.outputs)
            .field("open", &table.as_ref().map(|t| t.open))
            .field("sinks", &table.as_ref().map(|t| t.sinks.len()))
            .field("time_series", &self.time_series.as_ref().map(|ts| ts.name()))
            .finish()
    }
}

impl Recorder {
    /// Console-only recorder writing to stdout.
    pub fn console() -> Self {
        Self::with_console_writer(Box::new(io::stdout()))
    }

    pub fn with_console_writer(console: Box<dyn Write + Send>) -> Self {
        Self {
            outputs: RecorderOutputs::console_only(),
            sinks: Mutex::new(SinkTable {
                sinks: Vec::new(),
                open: true,
            }),
            time_series: None,
            console: Mutex::new(console),
            stats: RecorderStatsTracker::default(),
        }
    }

    /// Opens one append-mode log file per probe when `outputs.log` is set.
    pub fn open(
        registry: &ProbeRegistry,
        outputs: RecorderOutputs,
        time_series: Option<Arc<dyn TimeSeriesSink>>,
    ) -> SinkResult<Self> {
        Self::open_with_console(registry, outputs, time_series, Box::new(io::stdout()))
    }

    pub fn open_with_console(
        registry: &ProbeRegistry,
        outputs: RecorderOutputs,
        time_series: Option<Arc<dyn TimeSeriesSink>>,
        console: Box<dyn Write + Send>,
    ) -> SinkResult<Self> {
        let mut sinks = Vec::new();

        if outputs.log {
            sinks.reserve(registry.len());
            for probe in registry.probes() {
                sinks.push(LogSink::open(&probe.sink_target)?);
                debug!(
                    target: "probelog::recorder",
                    path = %probe.sink_target.display(),
                    "Successfully opened log file for writing"
                );
            }
        }

        if outputs.rrd && time_series.is_none() {
            warn!(target: "probelog::recorder", "rrd output enabled without a time-series sink");
        }

        Ok(Self {
            outputs,
            sinks: Mutex::new(SinkTable { sinks, open: true }),
            time_series: if outputs.rrd { time_series } else { None },
            console: Mutex::new(console),
            stats: RecorderStatsTracker::default(),
        })
    }

    /// Writes one reading to every enabled sink, or to the console when none is.
    pub async fn persist(&self, probe: &Probe, reading: &Reading) -> SinkResult<()> {
        if self.outputs.is_console_only() {
            let line = reading.console_line(&probe.display_name);
            let mut console = self.console.lock();
            console
                .write_all(line.as_bytes())
                .and_then(|()| console.flush())
                .map_err(|source| SinkError::Console { source })?;
            self.stats.console_lines.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(());
        }

        if self.outputs.log {
            let mut table = self.sinks.lock();
            if !table.open {
                return Err(SinkError::Closed);
            }
            let sink = table
                .sinks
                .get_mut(probe.index)
                .ok_or_else(|| SinkError::Write {
                    path: probe.sink_target.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no log file for probe"),
                })?;
            sink.append(&reading.log_line())?;
            self.stats.lines_written.fetch_add(1, AtomicOrdering::Relaxed);
        }

        if let Some(time_series) = &self.time_series {
            time_series.record(probe, reading).await?;
            self.stats
                .time_series_records
                .fetch_add(1, AtomicOrdering::Relaxed);
        }

        Ok(())
    }

    /// Reopens every log file at its path. Fresh handles are opened before
    /// any stale one is closed, so a failed open leaves the table usable.
    pub fn rotate(&self) -> SinkResult<usize> {
        let mut table = self.sinks.lock();
        if !table.open {
            return Err(SinkError::Closed);
        }

        let mut fresh = Vec::with_capacity(table.sinks.len());
        for sink in &table.sinks {
            let file = LogSink::open_file(&sink.path).map_err(|e| match e {
                SinkError::Open { path, source } => SinkError::Reopen { path, source },
                other => other,
            })?;
            fresh.push(file);
        }

        for (sink, file) in table.sinks.iter_mut().zip(fresh) {
            sink.replace(file)?;
        }

        let reopened = table.sinks.len();
        self.stats.rotations.fetch_add(1, AtomicOrdering::Relaxed);
        info!(target: "probelog::recorder", sinks = reopened, "Log files reopened");
        Ok(reopened)
    }

    /// Closes every sink. Reports the first close failure; calling it again is a no-op.
    pub fn shutdown(&self) -> SinkResult<()> {
        let mut table = self.sinks.lock();
        if !table.open {
            return Ok(());
        }
        table.open = false;

        let mut first_failure = None;
        for sink in table.sinks.iter_mut() {
            if let Err(e) = sink.close() {
                error!(target: "probelog::recorder", error = %e, "Close failed");
                first_failure.get_or_insert(e);
            }
        }

        if let Err(source) = self.console.lock().flush() {
            first_failure.get_or_insert(SinkError::Console { source });
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn outputs(&self) -> RecorderOutputs {
        self.outputs
    }

    pub fn is_open(&self) -> bool {
        self.sinks.lock().open
    }

    pub fn open_sinks(&self) -> usize {
        let table = self.sinks.lock();
        table.sinks.iter().filter(|sink| sink.file.is_some()).count()
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats.snapshot()
    }
}

// ============================================================================
// SECTION 11: POLL LOOP
// ============================================================================
//
// Idle ──start──▶ Sampling ──cycle done──▶ Sleeping ──deadline──▶ Sampling
//                    │                        │
//                    └──error / once──▶ Terminated ◀──shutdown──┘
//
// Commands are only consumed while sleeping, so a rotate never interleaves
// with a cycle. After a rotate the loop keeps sleeping until the deadline it
// had already computed.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Loop Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCommand {
    /// Reopen every log file
    Rotate,
    /// Stop at the next await point
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Sampling,
    Sleeping,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The single one-shot cycle finished
    Completed,
    /// A shutdown command stopped the loop
    Stopped,
}

/// Per-probe failure accounting used by the `skip` policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl ProbeHealth {
    fn record_success(&mut self, at: Timestamp) {
        self.consecutive_failures = 0;
        self.last_success = Some(at);
    }

    fn record_failure(&mut self, error: &SampleError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    pub readings: u64,
    pub read_failures: u64,
    pub rotations: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub persisted: usize,
    pub failed: usize,
    /// A shutdown arrived while a probe was being read.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub interval: Duration,
    pub mode: RunMode,
    pub policy: ErrorPolicy,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.interval,
            mode: config.run_mode(),
            policy: config.on_error,
        }
    }
}

enum SleepEvent {
    Elapsed,
    Command(LoopCommand),
    ChannelClosed,
}

// ----------------------------------------------------------------------------
// 11.2 Poll Loop
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct PollLoop {
    registry: Arc<ProbeRegistry>,
    recorder: Arc<Recorder>,
    reader: SampleReader,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    commands_open: bool,
    rotate_pending: bool,
    settings: LoopSettings,
    state: LoopState,
    health: Vec<ProbeHealth>,
    stats: LoopStats,
}

impl PollLoop {
    pub fn new(
        registry: Arc<ProbeRegistry>,
        recorder: Arc<Recorder>,
        commands: mpsc::UnboundedReceiver<LoopCommand>,
        settings: LoopSettings,
    ) -> Self {
        let health = vec![ProbeHealth::default(); registry.len()];
        Self {
            registry,
            recorder,
            reader: SampleReader::new(),
            commands,
            commands_open: true,
            rotate_pending: false,
            settings,
            state: LoopState::Idle,
            health,
            stats: LoopStats::default(),
        }
    }

    /// Runs until a shutdown command, an unrecoverable error or, in one-shot
    /// mode, the end of the first cycle.
    pub async fn run(&mut self) -> ProbeLogResult<LoopOutcome> {
        info!(
            target: "probelog::loop",
            probes = self.registry.len(),
            interval = %humantime::format_duration(self.settings.interval),
            mode = ?self.settings.mode,
            on_error = %self.settings.policy,
            "Poll loop starting"
        );

        loop {
            match self.run_cycle().await {
                Ok(report) if report.interrupted => {
                    self.state = LoopState::Terminated;
                    info!(
                        target: "probelog::loop",
                        cycles = self.stats.cycles,
                        "Shutdown requested while sampling"
                    );
                    return Ok(LoopOutcome::Stopped);
                }
                Ok(_) => {}
                Err(e) => {
                    self.state = LoopState::Terminated;
                    error!(
                        target: "probelog::loop",
                        category = e.category(),
                        error = %e,
                        "Cycle failed, terminating"
                    );
                    return Err(e);
                }
            }

            if self.settings.mode == RunMode::Once {
                self.state = LoopState::Terminated;
                return Ok(LoopOutcome::Completed);
            }

            self.state = LoopState::Sleeping;
            let deadline = self.next_deadline();

            match self.sleep_until_deadline(deadline).await {
                Ok(true) => continue,
                Ok(false) => {
                    self.state = LoopState::Terminated;
                    info!(target: "probelog::loop", cycles = self.stats.cycles, "Shutdown requested");
                    return Ok(LoopOutcome::Stopped);
                }
                Err(e) => {
                    self.state = LoopState::Terminated;
                    error!(target: "probelog::loop", error = %e, "Rotate failed, terminating");
                    return Err(e);
                }
            }
        }
    }

    /// Samples every probe in registry order and persists each reading.
    ///
    /// A `Shutdown` received while a probe is being read abandons the cycle
    /// at once and reports it as interrupted. A `Rotate` received meanwhile is
    /// applied after the last probe, between two persists.
    pub async fn run_cycle(&mut self) -> ProbeLogResult<CycleReport> {
        self.state = LoopState::Sampling;
        let registry = Arc::clone(&self.registry);
        let mut report = CycleReport::default();

        for probe in registry.probes() {
            let Some(sample) = self.read_unless_shutdown(&probe.source).await else {
                debug!(
                    target: "probelog::loop",
                    probe = %probe.display_name,
                    "Read abandoned for shutdown"
                );
                report.interrupted = true;
                return Ok(report);
            };

            match sample {
                Ok(celsius) => {
                    let reading = Reading::new(probe.index, Timestamp::now(), celsius);
                    self.recorder.persist(probe, &reading).await?;

                    if let Some(health) = self.health.get_mut(probe.index) {
                        health.record_success(reading.timestamp);
                    }
                    self.stats.readings += 1;
                    report.persisted += 1;

                    debug!(
                        target: "probelog::loop",
                        probe = %probe.display_name,
                        celsius = reading.celsius,
                        "Reading persisted"
                    );
                }
                Err(e) => {
                    self.stats.read_failures += 1;
                    let consecutive = match self.health.get_mut(probe.index) {
                        Some(health) => {
                            health.record_failure(&e);
                            health.consecutive_failures
                        }
                        None => 0,
                    };

                    match self.settings.policy {
                        ErrorPolicy::Abort => return Err(e.into()),
                        ErrorPolicy::Skip => {
                            warn!(
                                target: "probelog::loop",
                                probe = %probe.display_name,
                                consecutive_failures = consecutive,
                                error = %e,
                                "Probe read failed, skipping"
                            );
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        if self.rotate_pending {
            self.rotate_pending = false;
            self.rotate_sinks()?;
        }

        self.stats.cycles += 1;
        trace!(
            target: "probelog::loop",
            persisted = report.persisted,
            failed = report.failed,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Reads one probe while listening for commands. `None` means shutdown.
    async fn read_unless_shutdown(&mut self, source: &Path) -> Option<SampleResult<f64>> {
        let reader = self.reader;
        let read = reader.read(source);
        tokio::pin!(read);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(LoopCommand::Shutdown) => return None,
                    Some(LoopCommand::Rotate) => self.rotate_pending = true,
                    None => self.commands_open = false,
                },
                sample = &mut read => return Some(sample),
            }
        }
    }

    fn rotate_sinks(&mut self) -> ProbeLogResult<()> {
        self.recorder.rotate()?;
        self.stats.rotations += 1;
        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.settings.interval)
            .or_else(|| now.checked_add(MAX_INTERVAL))
            .unwrap_or(now)
    }

    /// Returns `Ok(false)` when a shutdown was requested.
    async fn sleep_until_deadline(&mut self, deadline: Instant) -> ProbeLogResult<bool> {
        loop {
            let event = if self.commands_open {
                tokio::select! {
                    biased;
                    command = self.commands.recv() => match command {
                        Some(command) => SleepEvent::Command(command),
                        None => SleepEvent::ChannelClosed,
                    },
                    _ = sleep_until(deadline) => SleepEvent::Elapsed,
                }
            } else {
                sleep_until(deadline).await;
                SleepEvent::Elapsed
            };

            match event {
                SleepEvent::Elapsed => return Ok(true),
                SleepEvent::Command(LoopCommand::Shutdown) => return Ok(false),
                SleepEvent::Command(LoopCommand::Rotate) => {
                    self.rotate_sinks()?;
                    debug!(target: "probelog::loop", "Rotate handled, resuming sleep");
                }
                SleepEvent::ChannelClosed => {
                    self.commands_open = false;
                    debug!(target: "probelog::loop", "Command channel closed");
                }
            }
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn health(&self) -> &[ProbeHealth] {
        &self.health
    }

    pub fn settings(&self) -> LoopSettings {
        self.settings
    }
}

// ----------------------------------------------------------------------------
// 11.3 Signal Forwarding
// ----------------------------------------------------------------------------

/// Turns SIGHUP into `Rotate` and SIGTERM/SIGINT into `Shutdown`. The signal
/// handlers themselves only enqueue; all I/O happens in the loop.
pub fn spawn_signal_forwarder(
    commands: mpsc::UnboundedSender<LoopCommand>,
) -> ProbeLogResult<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).map_err(|source| SystemError::Signal {
        signal: "SIGHUP",
        source,
    })?;
    let mut terminate = signal(SignalKind::terminate()).map_err(|source| SystemError::Signal {
        signal: "SIGTERM",
        source,
    })?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(|source| SystemError::Signal {
        signal: "SIGINT",
        source,
    })?;

    Ok(tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                _ = hangup.recv() => {
                    info!(target: "probelog::signal", "Received SIGHUP, reopening log files");
                    LoopCommand::Rotate
                }
                _ = terminate.recv() => {
                    info!(target: "probelog::signal", "Received SIGTERM");
                    LoopCommand::Shutdown
                }
                _ = interrupt.recv() => {
                    info!(target: "probelog::signal", "Received SIGINT");
                    LoopCommand::Shutdown
                }
            };

            if commands.send(command).is_err() || command == LoopCommand::Shutdown {
                break;
            }
        }
    }))
}

// ============================================================================
// SECTION 12: DAEMONIZATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub work_dir: PathBuf,
    pub pid_file: PathBuf,
}

/// Detaches from the terminal. Must run before any runtime or thread exists;
/// the parent exits with status 0 and only the child returns.
pub fn daemonize(options: &DaemonOptions) -> ProbeLogResult<PidFile> {
    use nix::unistd::{chdir, fork, setsid, ForkResult};

    // SAFETY: the process is still single-threaded at this point.
    let forked = unsafe { fork() }.map_err(|e| SystemError::Daemonize {
        step: "fork",
        message: e.to_string(),
    })?;

    if let ForkResult::Parent { child } = forked {
        info!(target: "probelog::daemon", pid = child.as_raw(), "Daemon started");
        std::process::exit(0);
    }

    setsid().map_err(|e| SystemError::Daemonize {
        step: "setsid",
        message: e.to_string(),
    })?;

    chdir(options.work_dir.as_path()).map_err(|e| SystemError::Daemonize {
        step: "chdir",
        message: format!("{}: {}", options.work_dir.display(), e),
    })?;

    redirect_standard_streams()?;

    PidFile::create(&options.pid_file)
}

fn redirect_standard_streams() -> ProbeLogResult<()> {
    use nix::unistd::dup2;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| SystemError::Daemonize {
            step: "open /dev/null",
            message: e.to_string(),
        })?;

    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd).map_err(|e| SystemError::Daemonize {
            step: "redirect standard streams",
            message: e.to_string(),
        })?;
    }

    Ok(())
}

/// Pid file removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> ProbeLogResult<Self> {
        fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
            SystemError::PidFile {
                path: path.to_path_buf(),
                source,
            }
        })?;
        debug!(target: "probelog::daemon", path = %path.display(), "Pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                target: "probelog::daemon",
                path = %self.path.display(),
                error = %e,
                "Could not remove pid file"
            );
        }
    }
}

// ============================================================================
// SECTION 13: DAEMON
// ============================================================================

/// Startup sequence and run loop wiring.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    log_root: PathBuf,
    registry: Arc<ProbeRegistry>,
    recorder: Arc<Recorder>,
}

impl Daemon {
    /// Performs every startup check: aliases, discovery, output roots and sink setup.
    pub fn prepare(config: Config) -> ProbeLogResult<Self> {
        Self::prepare_with_console(config, Box::new(io::stdout()))
    }

    pub fn prepare_with_console(
        config: Config,
        console: Box<dyn Write + Send>,
    ) -> ProbeLogResult<Self> {
        let aliases = AliasTable::new(&config.aliases)?;
        let outputs = config.recorder_outputs();

        let mut options = DiscoveryOptions::from_config(&config);
        if let Ok(root) = fs::canonicalize(&options.log_root) {
            options.log_root = root;
        }

        let registry = ProbeRegistry::discover(&options, &aliases).require_probes()?;

        if outputs.log {
            check_output_root("log", &options.log_root)?;
        }

        let time_series: Option<Arc<dyn TimeSeriesSink>> = if outputs.rrd {
            let rrd_root = &config.paths.rrd_root;
            check_output_root("rrd", rrd_root)?;
            let root = fs::canonicalize(rrd_root).unwrap_or_else(|_| rrd_root.clone());
            let sink: Arc<dyn TimeSeriesSink> =
                Arc::new(RrdtoolSink::new(root, config.interval, &config.rrdtool));
            Some(sink)
        } else {
            None
        };

        let recorder = Recorder::open_with_console(&registry, outputs, time_series, console)?;

        info!(
            target: "probelog::daemon",
            probes = registry.len(),
            log = outputs.log,
            rrd = outputs.rrd,
            once = config.once,
            "Startup checks passed"
        );

        Ok(Self {
            log_root: options.log_root,
            config,
            registry: Arc::new(registry),
            recorder: Arc::new(recorder),
        })
    }

    /// Runs the poll loop with signal forwarding, then shuts the recorder down.
    pub async fn run(&self) -> ProbeLogResult<LoopOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();

        let forwarder = match self.config.run_mode() {
            RunMode::Continuous => Some(spawn_signal_forwarder(tx)?),
            RunMode::Once => {
                drop(tx);
                None
            }
        };

        let result = self.run_with_commands(rx).await;

        if let Some(handle) = forwarder {
            handle.abort();
        }
        result
    }

    /// Like [`Daemon::run`] with commands supplied by the caller.
    pub async fn run_with_commands(
        &self,
        commands: mpsc::UnboundedReceiver<LoopCommand>,
    ) -> ProbeLogResult<LoopOutcome> {
        let mut poll = PollLoop::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.recorder),
            commands,
            LoopSettings::from_config(&self.config),
        );

        let outcome = poll.run().await;
        let closed = self.recorder.shutdown();

        let stats = poll.stats();
        info!(
            target: "probelog::daemon",
            cycles = stats.cycles,
            readings = stats.readings,
            read_failures = stats.read_failures,
            rotations = stats.rotations,
            "Poll loop finished"
        );

        let outcome = outcome?;
        closed?;
        Ok(outcome)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ProbeRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn daemon_options(&self) -> DaemonOptions {
        let work_dir = if self.config.log {
            self.log_root.clone()
        } else {
            PathBuf::from("/")
        };
        DaemonOptions {
            work_dir,
            pid_file: self.config.pid_file(),
        }
    }
}

/// Output directories must exist and be directories before sinks are opened.
pub fn check_output_root(kind: &'static str, path: &Path) -> SinkResult<()> {
    match fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SinkError::RootMissing {
            kind,
            path: path.to_path_buf(),
        }),
        Err(source) => Err(SinkError::Open {
            path: path.to_path_buf(),
            source,
        }),
        Ok(meta) if !meta.is_dir() => Err(SinkError::RootNotDirectory {
            kind,
            path: path.to_path_buf(),
        }),
        Ok(_) => {
            debug!(target: "probelog::daemon", kind, path = %path.display(), "Output folder is OK");
            Ok(())
        }
    }
}

// ============================================================================
// SECTION 14: TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test]
    fn test_timestamp_conversions() {
        let ts = Timestamp::from_secs(1_700_000_000);
        assert_eq!(ts.as_secs(), 1_700_000_000);
        assert_eq!(ts.to_string(), "1700000000");
        assert_eq!(Timestamp::from(ts.to_datetime().unwrap()), ts);

        let now = Timestamp::now();
        assert!(now.as_secs() > 1_600_000_000);
    }

    #[test]
    fn test_reading_line_formats() {
        let reading = Reading::new(0, Timestamp::from_secs(1_700_000_000), 21.75);
        assert_eq!(reading.log_line(), "1700000000 21.750\n");
        assert_eq!(reading.console_line("patio"), "patio:\t21.750\n");

        let cold = Reading::new(1, Timestamp::from_secs(5), -0.5);
        assert_eq!(cold.log_line(), "5 -0.500\n");
        assert_eq!(cold.console_line("freezer"), "freezer:\t-0.500\n");
    }

    #[test]
    fn test_error_phases() {
        let no_probes = ProbeLogError::from(DiscoveryError::NoProbes {
            path: PathBuf::from(DEFAULT_DEVICE_ROOT),
        });
        assert_eq!(no_probes.phase(), ErrorPhase::StartupFatal);
        assert_eq!(no_probes.category(), "discovery");
        assert!(no_probes.to_string().contains("w1-therm"));

        let missing_root = ProbeLogError::from(SinkError::RootMissing {
            kind: "log",
            path: PathBuf::from("/nowhere"),
        });
        assert_eq!(missing_root.phase(), ErrorPhase::StartupFatal);

        let bad_read = ProbeLogError::from(SampleError::MissingMarker {
            path: PathBuf::from("w1_slave"),
        });
        assert_eq!(bad_read.phase(), ErrorPhase::RuntimeFatal);
        assert_eq!(bad_read.category(), "sample");

        let close = ProbeLogError::from(SinkError::Close {
            path: PathBuf::from("patio.log"),
            source: io::Error::from_raw_os_error(5),
        });
        assert_eq!(close.phase(), ErrorPhase::RuntimeFatal);

        let reopen = ProbeLogError::from(SinkError::Reopen {
            path: PathBuf::from("patio.log"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        });
        assert!(!reopen.is_startup());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.interval, Duration::from_secs(DEFAULT_INTERVAL_SECS));
        assert_eq!(config.on_error, ErrorPolicy::Abort);
        assert_eq!(config.family_prefix, "28-");
        assert_eq!(config.paths.device_root, PathBuf::from(DEFAULT_DEVICE_ROOT));
        assert_eq!(config.pid_file(), PathBuf::from(DEFAULT_PID_FILE));
        assert!(!config.log && !config.rrd && !config.once);
    }

    #[test]
    fn test_legacy_config_parsing() {
        let text = "\
# probe logger
LOG
interval 60   ; once a minute
Foreground
ALIAS 28-000123 patio
alias 28-000456 Living Room   # inline comment
";
        let config = Config::from_legacy_str(text, Path::new("ds18b20.cfg")).unwrap();

        assert!(config.log);
        assert!(config.foreground);
        assert!(!config.rrd);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(
            config.aliases,
            vec![
                AliasEntry::new("28-000123", "patio"),
                AliasEntry::new("28-000456", "Living Room"),
            ]
        );
    }

    #[test]
    fn test_legacy_config_unknown_key_reports_line() {
        let err = Config::from_legacy_str("LOG\n\nBOGUS 1\n", Path::new("ds18b20.cfg")).unwrap_err();
        match err {
            ConfigError::UnknownKey { key, line, .. } => {
                assert_eq!(key, "BOGUS");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test_case("ALIAS 28-000123" ; "alias without name")]
    #[test_case("ALIAS" ; "alias without fields")]
    #[test_case("INTERVAL" ; "interval without value")]
    #[test_case("INTERVAL 0" ; "zero interval")]
    #[test_case("INTERVAL 18446744073709551615" ; "interval beyond a week")]
    #[test_case("INTERVAL soon" ; "non numeric interval")]
    fn test_legacy_config_syntax_errors(line: &str) {
        let text = format!("LOG\n{}\n", line);
        let err = Config::from_legacy_str(&text, Path::new("ds18b20.cfg")).unwrap_err();
        assert!(
            matches!(err, ConfigError::Syntax { line: 2, .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_toml_config_parsing() {
        let text = r#"
interval = "30s"
log = true
on_error = "skip"
max_probes = 4

[[aliases]]
id = "28-000123"
name = "patio"

[paths]
log_root = "/srv/probes"

[logging]
format = "json"
"#;
        let config = Config::from_toml_str(text).unwrap();

        assert_eq!(config.interval, Duration::from_secs(30));
        assert!(config.log);
        assert_eq!(config.on_error, ErrorPolicy::Skip);
        assert_eq!(config.max_probes, 4);
        assert_eq!(config.aliases, vec![AliasEntry::new("28-000123", "patio")]);
        assert_eq!(config.paths.log_root, PathBuf::from("/srv/probes"));
        assert_eq!(config.paths.device_root, PathBuf::from(DEFAULT_DEVICE_ROOT));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_picks_parser_by_extension() {
        let dir = TempDir::new().unwrap();

        let legacy = dir.path().join("ds18b20.cfg");
        fs::write(&legacy, "RRD\nINTERVAL 120\n").unwrap();
        let config = Config::load(&legacy).unwrap();
        assert!(config.rrd);
        assert_eq!(config.interval, Duration::from_secs(120));

        let modern = dir.path().join("probe-logger.toml");
        fs::write(&modern, "log = true\ninterval = \"2m\"\n").unwrap();
        let config = Config::load(&modern).unwrap();
        assert!(config.log);
        assert_eq!(config.interval, Duration::from_secs(120));

        let missing = dir.path().join("absent.cfg");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::FileNotFound { .. })
        ));
        assert!(Config::resolve(Some(&missing)).is_err());
    }

    #[test]
    fn test_overrides_only_switch_features_on() {
        let mut config = Config {
            log: true,
            ..Config::default()
        };
        config.apply_overrides(&Overrides {
            once: true,
            interval: Some(Duration::from_secs(10)),
            on_error: Some(ErrorPolicy::Skip),
            ..Overrides::default()
        });
        let config = config.finalize().unwrap();

        assert!(config.log);
        assert!(config.once);
        assert!(config.foreground, "once implies foreground");
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.on_error, ErrorPolicy::Skip);
        assert_eq!(config.run_mode(), RunMode::Once);
        assert_eq!(config.recorder_outputs(), RecorderOutputs::console_only());
    }

    #[test]
    fn test_validation_requires_an_output() {
        assert!(matches!(
            Config::default().finalize(),
            Err(ConfigError::NoOutput)
        ));

        let config = Config {
            rrd: true,
            ..Config::default()
        };
        let config = config.finalize().unwrap();
        assert_eq!(
            config.recorder_outputs(),
            RecorderOutputs {
                log: false,
                rrd: true
            }
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_probes = Config {
            log: true,
            max_probes: 0,
            ..Config::default()
        };
        assert!(matches!(
            zero_probes.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "max_probes"
        ));

        let mut bad_level = Config {
            log: true,
            ..Config::default()
        };
        bad_level.logging.level = "loud".to_string();
        assert!(bad_level.validate().is_err());
    }

    #[test]
    fn test_generated_config_parses_back() {
        let rendered = Config::generate_default_config().unwrap();
        assert!(rendered.contains("interval = \"5m\""));

        let config = Config::from_toml_str(&rendered).unwrap();
        assert!(config.log);
        assert_eq!(config.interval, Duration::from_secs(DEFAULT_INTERVAL_SECS));
        assert_eq!(config.rrdtool.rows, DEFAULT_RRD_ROWS);
        config.validate().unwrap();
    }

    #[test_case("300", 300 ; "plain seconds")]
    #[test_case("5m", 300 ; "humantime minutes")]
    #[test_case(" 1h 30s ", 3630 ; "compound duration")]
    fn test_parse_interval(value: &str, secs: u64) {
        assert_eq!(parse_interval(value).unwrap(), Duration::from_secs(secs));
    }

    #[test]
    fn test_parse_interval_rejects_zero_and_garbage() {
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("often").is_err());
    }

    #[test]
    fn test_resolve_defaults_only_without_explicit_file() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("probe-logger.toml");
        assert!(!Config::falls_back_to_defaults(Some(&explicit)));
        assert!(matches!(
            Config::resolve(Some(&explicit)),
            Err(ConfigError::FileNotFound { .. })
        ));

        let expected = !Path::new(DEFAULT_CONFIG_PATH).exists();
        assert_eq!(Config::falls_back_to_defaults(None), expected);
        if expected {
            let config = Config::resolve(None).unwrap();
            assert_eq!(config.interval, Duration::from_secs(DEFAULT_INTERVAL_SECS));
        }
    }

    #[test_case("500ms" ; "sub second")]
    #[test_case("18446744073709551615" ; "u64 max seconds")]
    #[test_case("8days" ; "longer than a week")]
    fn test_parse_interval_rejects_out_of_range(value: &str) {
        assert!(parse_interval(value).is_err());
    }

    #[test]
    fn test_validation_bounds_interval() {
        for interval in [
            Duration::from_millis(500),
            MAX_INTERVAL + Duration::from_secs(1),
            Duration::from_secs(u64::MAX),
        ] {
            let config = Config {
                rrd: true,
                interval,
                ..Config::default()
            };
            assert!(
                matches!(
                    config.finalize(),
                    Err(ConfigError::InvalidValue { ref field, .. }) if field == "interval"
                ),
                "{interval:?} accepted"
            );
        }

        for interval in [MIN_INTERVAL, Duration::from_millis(1500), MAX_INTERVAL] {
            let config = Config {
                log: true,
                interval,
                ..Config::default()
            };
            config.finalize().unwrap();
        }
    }

    #[test]
    fn test_diagnostic_writer_redirect() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe-logger.log");

        let writer = DiagnosticWriter::stderr();
        assert!(!writer.is_redirected());

        writer.redirect_to_file(&path, LogRotation::Never).unwrap();
        assert!(writer.is_redirected());

        let mut handle = writer.make_writer();
        handle.write_all(b"diagnostic line\n").unwrap();
        handle.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "diagnostic line\n");
    }
}

#[cfg(test)]
mod discovery_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    // ------------------------------------------------------------------------
    // Alias table
    // ------------------------------------------------------------------------

    #[test]
    fn test_alias_resolution() {
        let table = AliasTable::new(&[
            AliasEntry::new("28-000123", "patio"),
            AliasEntry::new("28-000456", "cellar"),
        ])
        .unwrap();

        assert_eq!(table.resolve("28-000123"), "patio");
        assert_eq!(table.resolve("28-000456"), "cellar");
        assert_eq!(table.resolve("28-000789"), "28-000789");
    }

    #[test]
    fn test_alias_first_match_wins() {
        let table = AliasTable::new(&[
            AliasEntry::new("28-00000ABC", "first"),
            AliasEntry::new("28-00000abc", "second"),
        ])
        .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("28-00000abc"), "first");
    }

    #[test_case("", "patio" ; "missing id")]
    #[test_case("28-000123", "  " ; "missing name")]
    #[test_case("28-000123", "a/b" ; "path separator")]
    #[test_case("28-000123", ".." ; "parent directory")]
    fn test_alias_rejects_malformed_entries(id: &str, name: &str) {
        let err = AliasTable::new(&[AliasEntry::new(id, name)]).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedAlias { .. }));
    }

    #[test]
    fn test_alias_rejects_shared_names() {
        let err = AliasTable::new(&[
            AliasEntry::new("28-000123", "patio"),
            AliasEntry::new("28-000456", "patio"),
        ])
        .unwrap_err();
        match err {
            ConfigError::MalformedAlias { entry, message } => {
                assert_eq!(entry, "28-000456 patio");
                assert!(message.contains("28-000123"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // A repeated id is ignored before its name is considered.
        let table = AliasTable::new(&[
            AliasEntry::new("28-000123", "patio"),
            AliasEntry::new("28-000123", "patio"),
        ])
        .unwrap();
        assert_eq!(table.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_alias_resolution_ignores_ascii_case(
            serial in "[0-9a-f]{12}",
            name in "[a-z][a-z0-9_]{0,15}",
        ) {
            let raw = format!("28-{}", serial);
            let table = AliasTable::new(&[AliasEntry::new(raw.to_ascii_uppercase(), name.clone())]).unwrap();

            prop_assert_eq!(table.resolve(&raw), name.as_str());

            let other = format!("10-{}", serial);
            prop_assert_eq!(table.resolve(&other), other.as_str());
        }
    }

    // ------------------------------------------------------------------------
    // Probe registry
    // ------------------------------------------------------------------------

    #[test]
    fn test_discovery_filters_and_aliases() {
        let fixture = Fixture::new();
        add_device(fixture.devices.path(), "28-000123", SAMPLE_21750);
        add_device(fixture.devices.path(), "28-000456", SAMPLE_21750);
        add_device(fixture.devices.path(), "10-000789", SAMPLE_21750);
        fs::create_dir_all(fixture.devices.path().join("w1_bus_master1")).unwrap();

        let registry = fixture.registry(&[AliasEntry::new("28-000123", "patio")]);
        assert_eq!(registry.len(), 2);

        for (position, probe) in registry.probes().iter().enumerate() {
            assert_eq!(probe.index, position);
        }

        let mut names: Vec<&str> = registry
            .probes()
            .iter()
            .map(|p| p.display_name.as_str())
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["28-000456", "patio"]);

        let patio = registry
            .probes()
            .iter()
            .find(|p| p.display_name.as_str() == "patio")
            .unwrap();
        assert_eq!(patio.raw_id.as_str(), "28-000123");
        assert!(patio.is_aliased());
        assert_eq!(
            patio.source,
            fixture.devices.path().join("28-000123").join(PROBE_DATA_FILE)
        );
        assert_eq!(patio.sink_target, fixture.logs.path().join("patio.log"));
    }

    #[test]
    fn test_discovery_keeps_display_names_unique() {
        let fixture = Fixture::new();
        add_device(fixture.devices.path(), "28-000123", SAMPLE_21750);
        add_device(fixture.devices.path(), "28-000456", SAMPLE_21750);

        // The alias claims the other probe's raw id as its name.
        let registry = fixture.registry(&[AliasEntry::new("28-000123", "28-000456")]);
        assert_eq!(registry.len(), 1);

        let expected = fixture.logs.path().join("28-000456.log");
        let targets: Vec<&Path> = registry.probes().iter().map(|p| p.sink_target.as_path()).collect();
        assert_eq!(targets, vec![expected.as_path()]);
    }

    #[test]
    fn test_discovery_of_missing_root_is_empty() {
        let options = DiscoveryOptions {
            device_root: PathBuf::from("/nonexistent/w1/devices"),
            ..DiscoveryOptions::default()
        };
        let registry = ProbeRegistry::discover(&options, &AliasTable::default());
        assert!(registry.is_empty());

        let err = registry.require_probes().unwrap_err();
        assert!(matches!(err, DiscoveryError::NoProbes { .. }));
    }

    #[test]
    fn test_discovery_respects_probe_cap() {
        let fixture = Fixture::new();
        for serial in ["000001", "000002", "000003"] {
            add_device(fixture.devices.path(), &format!("28-{}", serial), SAMPLE_21750);
        }

        let options = DiscoveryOptions {
            max_probes: 2,
            ..fixture.discovery()
        };
        let registry = ProbeRegistry::discover(&options, &AliasTable::default());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(2).is_none());
    }

    // ------------------------------------------------------------------------
    // Sample reader
    // ------------------------------------------------------------------------

    #[test_case("t=21750", 21.750 ; "room temperature")]
    #[test_case("t=0", 0.0 ; "zero")]
    #[test_case("t=-500", -0.5 ; "sub zero")]
    #[test_case("t=125000", 125.0 ; "upper range")]
    #[test_case("t=-10062 extra", -10.062 ; "trailing token")]
    fn test_parse_sample_values(token: &str, expected: f64) {
        let text = format!(
            "5c 01 4b 46 7f ff 04 10 a1 : crc=a1 YES\n5c 01 4b 46 7f ff 04 10 a1 {}\n",
            token
        );
        let celsius = parse_sample(&text, Path::new("w1_slave")).unwrap();
        assert!((celsius - expected).abs() < 1e-9, "{celsius} != {expected}");
    }

    #[test]
    fn test_parse_sample_reference_blob() {
        let celsius = parse_sample(SAMPLE_21750, Path::new("w1_slave")).unwrap();
        assert_eq!(format!("{:.3}", celsius), "21.750");
    }

    #[test]
    fn test_parse_sample_failures() {
        let origin = Path::new("w1_slave");

        assert!(matches!(
            parse_sample("", origin),
            Err(SampleError::Truncated { lines: 0, .. })
        ));
        assert!(matches!(
            parse_sample("5c 01 4b 46 7f ff 04 10 a1 : crc=a1 YES\n", origin),
            Err(SampleError::Truncated { lines: 1, .. })
        ));
        assert!(matches!(
            parse_sample("status\n5c 01 4b 46 7f ff 04 10 a1\n", origin),
            Err(SampleError::MissingMarker { .. })
        ));

        match parse_sample("status\nt=abc\n", origin) {
            Err(SampleError::InvalidValue { value, .. }) => assert_eq!(value, "abc"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            parse_sample("status\nt=\n", origin),
            Err(SampleError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_sample_reader_reads_fresh_each_time() {
        let fixture = Fixture::new();
        let data = add_device(fixture.devices.path(), "28-000123", SAMPLE_21750);
        let reader = SampleReader::new();

        assert_eq!(reader.read(&data).await.unwrap(), 21.75);

        fs::write(&data, sample_blob(-500)).unwrap();
        assert_eq!(reader.read(&data).await.unwrap(), -0.5);

        let missing = fixture.devices.path().join("28-000999").join(PROBE_DATA_FILE);
        let err = reader.read(&missing).await.unwrap_err();
        assert!(matches!(err, SampleError::Unreadable { .. }));
        assert_eq!(err.path(), missing.as_path());
    }
}
