//! Proxy configuration.
//!
//! Configuration files are plain `key=value` lines. Settings are layered:
//! command-line flags override the file, which overrides the defaults.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use zbus::zvariant::ObjectPath;

use crate::context::ProxyContextSpec;
use crate::endpoint::{BusSelector, ServiceDescriptor};
use crate::error::ConfigError;

pub const DEFAULT_SOURCE_BUS_NAME: &str = "org.freedesktop.NetworkManager";
pub const DEFAULT_SOURCE_OBJECT_PATH: &str = "/org/freedesktop/NetworkManager";
pub const DEFAULT_PROXY_BUS_NAME: &str = "org.example.Proxy";

/// Settings for one proxy context plus the process-wide logging switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub source_bus_name: String,
    pub source_object_path: String,
    pub proxy_bus_name: String,
    pub source_bus: BusSelector,
    pub target_bus: BusSelector,
    pub verbose: bool,
    pub enable_logging: bool,
    /// Forwarded call timeout; 0 waits indefinitely.
    pub timeout_ms: i64,
    /// Log destination; `None` logs to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            source_bus_name: DEFAULT_SOURCE_BUS_NAME.to_string(),
            source_object_path: DEFAULT_SOURCE_OBJECT_PATH.to_string(),
            proxy_bus_name: DEFAULT_PROXY_BUS_NAME.to_string(),
            source_bus: BusSelector::System,
            target_bus: BusSelector::Session,
            verbose: false,
            enable_logging: true,
            timeout_ms: 0,
            log_file: None,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes" | "on")
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

impl ProxyConfig {
    /// Parse a configuration file's contents on top of the defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge(text)?;
        Ok(config)
    }

    /// Parse like [`ProxyConfig::parse`], returning the skipped lines instead
    /// of logging them.
    pub fn parse_with_warnings(text: &str) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let mut config = Self::default();
        let warnings = config.merge_with_warnings(text)?;
        Ok((config, warnings))
    }

    /// Apply the settings in `text` to this configuration.
    pub fn merge(&mut self, text: &str) -> Result<(), ConfigError> {
        for warning in self.merge_with_warnings(text)? {
            warning.report();
        }
        Ok(())
    }

    fn merge_with_warnings(&mut self, text: &str) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut warnings = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warnings.push(ConfigWarning::MissingSeparator {
                    line: line_number,
                    content: line.to_string(),
                });
                continue;
            };
            let key = key.trim();
            let value = unquote(value.trim());

            let invalid = || ConfigError::InvalidValue {
                line: line_number,
                key: key.to_string(),
                value: value.to_string(),
            };

            match key {
                "source_bus_name" => self.source_bus_name = value.to_string(),
                "source_object_path" => self.source_object_path = value.to_string(),
                "proxy_bus_name" => self.proxy_bus_name = value.to_string(),
                "source_bus" => self.source_bus = value.parse().map_err(|_| invalid())?,
                "target_bus" => self.target_bus = value.parse().map_err(|_| invalid())?,
                "bus_type" => {
                    let selector: BusSelector = value.parse().map_err(|_| invalid())?;
                    self.source_bus = selector.clone();
                    self.target_bus = selector;
                }
                "verbose" => self.verbose = parse_bool(value),
                "enable_logging" => self.enable_logging = parse_bool(value),
                "timeout_ms" => self.timeout_ms = value.parse().map_err(|_| invalid())?,
                "log_file" => {
                    self.log_file = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                _ => warnings.push(ConfigWarning::UnknownKey {
                    line: line_number,
                    key: key.to_string(),
                }),
            }
        }
        Ok(warnings)
    }

    /// Load a configuration file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let (config, warnings) = Self::load_with_warnings(path)?;
        for warning in &warnings {
            warning.report();
        }
        Ok(config)
    }

    /// Load like [`ProxyConfig::load`], returning the warnings instead of
    /// logging them, for callers that read configuration before logging is
    /// set up.
    pub fn load_with_warnings(path: &Path) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let loaded = Self::parse_with_warnings(&text)?;
                debug!(path = %path.display(), "Read configuration");
                Ok(loaded)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((
                Self::default(),
                vec![ConfigWarning::NotFound(path.to_path_buf())],
            )),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Check that the configuration describes a usable context.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_bus_name.is_empty() {
            return Err(ConfigError::Missing("source_bus_name"));
        }
        if self.source_object_path.is_empty() {
            return Err(ConfigError::Missing("source_object_path"));
        }
        if self.proxy_bus_name.is_empty() {
            return Err(ConfigError::Missing("proxy_bus_name"));
        }
        if ObjectPath::try_from(self.source_object_path.as_str()).is_err() {
            return Err(ConfigError::InvalidObjectPath(
                self.source_object_path.clone(),
            ));
        }
        if self.timeout_ms < 0 {
            return Err(ConfigError::InvalidValue {
                line: 0,
                key: "timeout_ms".to_string(),
                value: self.timeout_ms.to_string(),
            });
        }
        Ok(())
    }

    /// Forwarded call timeout, if any.
    pub fn call_timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Human-readable summary of the configuration.
    pub fn render(&self) -> String {
        let mut out = String::from("Configuration:\n");
        let _ = writeln!(out, "  source_bus_name: {}", self.source_bus_name);
        let _ = writeln!(out, "  source_object_path: {}", self.source_object_path);
        let _ = writeln!(out, "  proxy_bus_name: {}", self.proxy_bus_name);
        let _ = writeln!(out, "  source_bus: {}", self.source_bus);
        let _ = writeln!(out, "  target_bus: {}", self.target_bus);
        let _ = writeln!(out, "  verbose: {}", self.verbose);
        let _ = writeln!(out, "  enable_logging: {}", self.enable_logging);
        if self.timeout_ms > 0 {
            let _ = writeln!(out, "  timeout_ms: {}", self.timeout_ms);
        } else {
            let _ = writeln!(out, "  timeout_ms: {} (no timeout)", self.timeout_ms);
        }
        let _ = writeln!(
            out,
            "  log_file: {}",
            self.log_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        );
        out
    }

    /// A commented configuration file holding the current values.
    pub fn template(&self) -> String {
        let log_file = self
            .log_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!(
            "# busbridge configuration\n\
             # Lines starting with # or ; are comments\n\
             \n\
             # Source service to proxy\n\
             source_bus_name={}\n\
             source_object_path={}\n\
             \n\
             # Name the proxy claims on the target bus\n\
             proxy_bus_name={}\n\
             \n\
             # Buses: 'system', 'session', or a D-Bus address\n\
             source_bus={}\n\
             target_bus={}\n\
             \n\
             # Enable verbose output\n\
             verbose={}\n\
             \n\
             # Enable logging\n\
             enable_logging={}\n\
             \n\
             # Forwarded call timeout in milliseconds (0 for none)\n\
             timeout_ms={}\n\
             \n\
             # Log file (empty for stderr)\n\
             log_file={}\n",
            self.source_bus_name,
            self.source_object_path,
            self.proxy_bus_name,
            self.source_bus,
            self.target_bus,
            self.verbose,
            self.enable_logging,
            self.timeout_ms,
            log_file,
        )
    }

    /// Write [`ProxyConfig::template`] to `path`.
    pub fn write_template(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.template()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Configuration template written");
        Ok(())
    }

    /// The context this configuration describes.
    pub fn to_spec(&self, label: impl Into<String>) -> ProxyContextSpec {
        ProxyContextSpec {
            label: label.into(),
            service: ServiceDescriptor::new(
                self.source_bus_name.clone(),
                self.source_object_path.clone(),
            ),
            proxy_name: self.proxy_bus_name.clone(),
            source: self.source_bus.clone(),
            target: self.target_bus.clone(),
            call_timeout: self.call_timeout(),
        }
    }
}

/// A configuration problem that does not stop loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The file does not exist; the defaults are used.
    NotFound(PathBuf),
    /// A line without `=`, skipped.
    MissingSeparator { line: usize, content: String },
    /// A key busbridge does not know, skipped.
    UnknownKey { line: usize, key: String },
}

impl ConfigWarning {
    /// Log this warning.
    pub fn report(&self) {
        match self {
            ConfigWarning::NotFound(path) => {
                warn!(path = %path.display(), "Config file not found, using defaults")
            }
            ConfigWarning::MissingSeparator { line, content } => {
                warn!(line = *line, content = %content, "Ignoring config line without '='")
            }
            ConfigWarning::UnknownKey { line, key } => {
                warn!(line = *line, key = %key, "Unknown config option")
            }
        }
    }
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::NotFound(path) => {
                write!(f, "config file {} not found, using defaults", path.display())
            }
            ConfigWarning::MissingSeparator { line, content } => {
                write!(f, "line {}: ignoring '{}' without '='", line, content)
            }
            ConfigWarning::UnknownKey { line, key } => {
                write!(f, "line {}: unknown option {}", line, key)
            }
        }
    }
}

/// Settings given on the command line, applied over a loaded configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub source_bus: Option<BusSelector>,
    pub target_bus: Option<BusSelector>,
    pub source_bus_name: Option<String>,
    pub source_object_path: Option<String>,
    pub proxy_bus_name: Option<String>,
    pub timeout_ms: Option<i64>,
    /// Only ever turns verbose output on.
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(bus) = &self.source_bus {
            config.source_bus = bus.clone();
        }
        if let Some(bus) = &self.target_bus {
            config.target_bus = bus.clone();
        }
        if let Some(name) = &self.source_bus_name {
            config.source_bus_name = name.clone();
        }
        if let Some(path) = &self.source_object_path {
            config.source_object_path = path.clone();
        }
        if let Some(name) = &self.proxy_bus_name {
            config.proxy_bus_name = name.clone();
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout_ms = timeout;
        }
        if self.verbose {
            config.verbose = true;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
    }
}
