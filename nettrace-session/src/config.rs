//! Session configuration
//!
//! One [`SessionConfig`] describes the capture defaults, scheduler timing and
//! every output of a session. [`SessionConfig::validate`] checks it once,
//! before any capture handle, file or socket is opened.

use nettrace_capture::CaptureConfig;
use nettrace_core::{CapturedRecord, Error, Result};
use nettrace_listener::{ListenAddress, DEFAULT_WRITE_TIMEOUT};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::queue::DEFAULT_MAX_QUEUED;
use crate::scheduler::{
    SchedulerConfig, DEFAULT_LAG_TOLERANCE, DEFAULT_RELEASE_INTERVAL, DEFAULT_STATS_INTERVAL,
};

/// Application name written to the section header
pub const DEFAULT_APPLICATION: &str = "nettrace";

/// Callback receiving every released record
pub type RecordCallback = Arc<dyn Fn(&CapturedRecord) + Send + Sync>;

/// What a session captures; fills the `{{Interface}}`, `{{Host}}` and
/// `{{Network}}` placeholders of a filename template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureScope {
    pub interface: Option<String>,
    pub host: Option<String>,
    pub network: Option<String>,
}

impl CaptureScope {
    pub fn interface<S: Into<String>>(name: S) -> Self {
        Self {
            interface: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn host<S: Into<String>>(name: S) -> Self {
        Self {
            host: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn network<S: Into<String>>(name: S) -> Self {
        Self {
            network: Some(name.into()),
            ..Self::default()
        }
    }

    fn variable(&self, name: &str) -> Option<Option<&str>> {
        match name {
            "Interface" => Some(self.interface.as_deref()),
            "Host" => Some(self.host.as_deref()),
            "Network" => Some(self.network.as_deref()),
            _ => None,
        }
    }

    /// Substitute `{{Name}}` placeholders in `template`
    ///
    /// Unknown placeholders and unterminated braces are rejected. Known
    /// placeholders without a value in this scope expand to nothing.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                Error::invalid_config("to_filename", format!("unterminated '{{{{' in '{}'", template))
            })?;

            let name = after[..end].trim();
            match self.variable(name) {
                Some(value) => out.push_str(value.unwrap_or_default()),
                None => {
                    return Err(Error::invalid_config(
                        "to_filename",
                        format!("unknown placeholder '{{{{{}}}}}'", name),
                    ))
                }
            }
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// Every output a session writes to
///
/// All set outputs are used at once. A session with no output still runs;
/// records are counted and discarded.
pub struct SinkConfig {
    /// Already open byte stream
    pub to_file: Option<Box<dyn Write + Send + Sync>>,
    /// File path template, see [`CaptureScope::render`]
    pub to_filename: Option<String>,
    /// Named pipe, created if missing
    pub to_pipe_name: Option<PathBuf>,
    /// Live listener address, `[tcp|tcp4|tcp6|unix:]address`
    pub to_listener_address: Option<String>,
    /// Longest a single listener write may block the scheduler before that
    /// connection is dropped
    pub listener_write_timeout: Duration,
    /// In-process channel receiving released records
    pub to_channel: Option<UnboundedSender<CapturedRecord>>,
    /// Callback receiving released records
    pub to_callback: Option<RecordCallback>,
    /// Allow key-log pipes that embed session secrets in the trace
    pub log_keys: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            to_file: None,
            to_filename: None,
            to_pipe_name: None,
            to_listener_address: None,
            listener_write_timeout: DEFAULT_WRITE_TIMEOUT,
            to_channel: None,
            to_callback: None,
            log_keys: false,
        }
    }
}

impl SinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file: Box<dyn Write + Send + Sync>) -> Self {
        self.to_file = Some(file);
        self
    }

    pub fn with_filename<S: Into<String>>(mut self, template: S) -> Self {
        self.to_filename = Some(template.into());
        self
    }

    pub fn with_pipe<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.to_pipe_name = Some(path.into());
        self
    }

    pub fn with_listener<S: Into<String>>(mut self, address: S) -> Self {
        self.to_listener_address = Some(address.into());
        self
    }

    pub fn with_listener_write_timeout(mut self, timeout: Duration) -> Self {
        self.listener_write_timeout = timeout;
        self
    }

    pub fn with_channel(mut self, channel: UnboundedSender<CapturedRecord>) -> Self {
        self.to_channel = Some(channel);
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CapturedRecord) + Send + Sync + 'static,
    {
        self.to_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_log_keys(mut self, enable: bool) -> Self {
        self.log_keys = enable;
        self
    }

    /// Parsed listener address, if one is configured
    pub fn listener_address(&self) -> Result<Option<ListenAddress>> {
        self.to_listener_address
            .as_deref()
            .map(str::parse)
            .transpose()
    }
}

impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfig")
            .field("to_file", &self.to_file.is_some())
            .field("to_filename", &self.to_filename)
            .field("to_pipe_name", &self.to_pipe_name)
            .field("to_listener_address", &self.to_listener_address)
            .field("listener_write_timeout", &self.listener_write_timeout)
            .field("to_channel", &self.to_channel.is_some())
            .field("to_callback", &self.to_callback.is_some())
            .field("log_keys", &self.log_keys)
            .finish()
    }
}

/// Configuration of one capture session
#[derive(Debug)]
pub struct SessionConfig {
    /// Defaults for every interface capture started by the session
    pub capture: CaptureConfig,
    /// Application name in the section header
    pub application: String,
    /// Free-text comment in the section header
    pub comment: Option<String>,
    /// Period of the release timer
    pub release_interval: Duration,
    /// Minimum age of a record before release
    pub lag_tolerance: Duration,
    /// Period of the statistics timer
    pub stats_interval: Duration,
    /// Bound on queued records; further records are dropped and counted
    pub max_queued: usize,
    pub scope: CaptureScope,
    pub sinks: SinkConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            application: DEFAULT_APPLICATION.to_string(),
            comment: None,
            release_interval: DEFAULT_RELEASE_INTERVAL,
            lag_tolerance: DEFAULT_LAG_TOLERANCE,
            stats_interval: DEFAULT_STATS_INTERVAL,
            max_queued: DEFAULT_MAX_QUEUED,
            scope: CaptureScope::default(),
            sinks: SinkConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_comment<S: Into<String>>(mut self, comment: S) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_application<S: Into<String>>(mut self, application: S) -> Self {
        self.application = application.into();
        self
    }

    pub fn with_release_interval(mut self, interval: Duration) -> Self {
        self.release_interval = interval;
        self
    }

    pub fn with_lag_tolerance(mut self, lag: Duration) -> Self {
        self.lag_tolerance = lag;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_max_queued(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    pub fn with_scope(mut self, scope: CaptureScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_sinks(mut self, sinks: SinkConfig) -> Self {
        self.sinks = sinks;
        self
    }

    pub(crate) fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            release_interval: self.release_interval,
            lag_tolerance: self.lag_tolerance,
            stats_interval: self.stats_interval,
        }
    }

    /// Check every setting without opening anything
    pub fn validate(&self) -> Result<()> {
        if self.capture.snaplen == 0 {
            return Err(Error::invalid_config("snaplen", "must be greater than zero"));
        }
        if self.capture.timeout_ms <= 0 {
            return Err(Error::invalid_config("timeout_ms", "must be greater than zero"));
        }
        if let Some(filter) = &self.capture.filter {
            filter.validate()?;
        }
        if self.application.trim().is_empty() {
            return Err(Error::invalid_config("application", "must not be empty"));
        }

        for (name, value) in [
            ("release_interval", self.release_interval),
            ("stats_interval", self.stats_interval),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(name, "must be greater than zero"));
            }
        }
        if self.max_queued == 0 {
            return Err(Error::invalid_config("max_queued", "must be greater than zero"));
        }

        if let Some(template) = &self.sinks.to_filename {
            let path = self.scope.render(template)?;
            if path.trim().is_empty() {
                return Err(Error::invalid_config("to_filename", "expands to an empty path"));
            }
        }
        if let Some(pipe) = &self.sinks.to_pipe_name {
            if pipe.as_os_str().is_empty() {
                return Err(Error::invalid_config("to_pipe_name", "must not be empty"));
            }
        }
        self.sinks.listener_address()?;
        if self.sinks.listener_write_timeout.is_zero() {
            return Err(Error::invalid_config(
                "listener_write_timeout",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}
