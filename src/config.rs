//! Configuration system using Figment
//!
//! Configuration is layered, lowest priority first:
//! 1. Built-in defaults (every field has one, so an empty file is valid)
//! 2. `siggen.toml` (or the file passed to [`SigGenConfig::load_from`])
//! 3. Environment variables prefixed with `SIGGEN_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SIGGEN_APPLICATION__LOG_LEVEL=debug
//! SIGGEN_CONNECTION__PORT_ROOT=/dev
//! SIGGEN_PACING__ARB_POINT_DELAY_MS=1
//! ```
//!
//! # Example
//!
//! ```toml
//! [connection]
//! protocol = "usbtmc"
//! port_root = "/dev"
//! identity_timeout_ms = 500
//!
//! [pacing]
//! settle_ms = 50
//! arb_point_factor = 2.0
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, SigGenError};
use crate::transport::TransportKind;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "siggen.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SIGGEN_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigGenConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// How instruments are found and opened
    pub connection: ConnectionConfig,
    /// Settling delays between commands
    pub pacing: PacingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty or json)
    pub log_format: String,
}

/// Transport and discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport to use; the host default is chosen when absent
    pub protocol: Option<TransportKind>,
    /// Directory scanned for `usbtmc*` device nodes
    pub port_root: PathBuf,
    /// Maximum reply length read after a query
    pub read_length: usize,
    /// Timeout for the `*IDN?` query during discovery
    pub identity_timeout_ms: u64,
    /// VISA session I/O timeout
    pub visa_timeout_ms: u64,
    /// Appended to every command written to a device node
    pub terminator: String,
    /// Program and leading arguments run to make a device node writable;
    /// the node path is appended as the last argument
    pub elevation_command: Vec<String>,
}

/// Settling delays between commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Pause after every `set_parameters` sub-command
    pub settle_ms: u64,
    /// Pause after the arbitrary mode and allocation commands
    pub arb_setup_ms: u64,
    /// Per-point delay numerator: delay = factor / sps seconds
    pub arb_point_factor: f64,
    /// Fixed per-point delay, overriding `arb_point_factor`
    pub arb_point_delay_ms: Option<u64>,
    /// Wait between `*RST;*CLS;*OPC?` and reading its reply
    pub reset_settle_ms: u64,
    /// Lowest amplitude the hardware accepts; fades start or end here
    pub fade_floor: f64,
    /// Granularity of the stimulation hold countdown
    pub hold_tick_ms: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: None,
            port_root: PathBuf::from("/dev"),
            read_length: 100,
            identity_timeout_ms: 500,
            visa_timeout_ms: 2000,
            terminator: String::new(),
            elevation_command: vec![
                "pkexec".to_string(),
                "chmod".to_string(),
                "0666".to_string(),
            ],
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 50,
            arb_setup_ms: 100,
            arb_point_factor: 2.0,
            arb_point_delay_ms: None,
            reset_settle_ms: 2000,
            fade_floor: 0.002,
            hold_tick_ms: 1000,
        }
    }
}

impl ConnectionConfig {
    /// The configured transport, or the default for this operating system.
    pub fn transport_kind(&self) -> AppResult<TransportKind> {
        match self.protocol {
            Some(kind) => Ok(kind),
            None => TransportKind::for_host(),
        }
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    pub fn visa_timeout(&self) -> Duration {
        Duration::from_millis(self.visa_timeout_ms)
    }
}

impl PacingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn arb_setup(&self) -> Duration {
        Duration::from_millis(self.arb_setup_ms)
    }

    /// Delay after each uploaded point for a waveform played at `sps`.
    pub fn arb_point_delay(&self, sps: u32) -> Duration {
        match self.arb_point_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs_f64(self.arb_point_factor / f64::from(sps.max(1))),
        }
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn hold_tick(&self) -> Duration {
        Duration::from_millis(self.hold_tick_ms)
    }

    /// Pacing with every delay set to zero, for simulated instruments.
    pub fn immediate() -> Self {
        Self {
            settle_ms: 0,
            arb_setup_ms: 0,
            arb_point_factor: 0.0,
            arb_point_delay_ms: Some(0),
            reset_settle_ms: 0,
            hold_tick_ms: 1000,
            ..Self::default()
        }
    }
}

impl SigGenConfig {
    /// Load configuration from `siggen.toml` and environment variables
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file (relative or absolute)
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack used by [`SigGenConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SigGenConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns `SigGenError::Configuration` with a descriptive message.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SigGenError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(SigGenError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.connection.read_length == 0 {
            return Err(SigGenError::Configuration(
                "read_length must be > 0".to_string(),
            ));
        }

        if self.connection.elevation_command.is_empty() {
            return Err(SigGenError::Configuration(
                "elevation_command cannot be empty".to_string(),
            ));
        }

        if !self.pacing.arb_point_factor.is_finite() || self.pacing.arb_point_factor < 0.0 {
            return Err(SigGenError::Configuration(format!(
                "Invalid arb_point_factor {}. Must be >= 0",
                self.pacing.arb_point_factor
            )));
        }

        if !(self.pacing.fade_floor.is_finite() && self.pacing.fade_floor > 0.0) {
            return Err(SigGenError::Configuration(format!(
                "Invalid fade_floor {}. Must be > 0",
                self.pacing.fade_floor
            )));
        }

        if self.pacing.hold_tick_ms == 0 {
            return Err(SigGenError::Configuration(
                "hold_tick_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SigGenError::Configuration(format!("Cannot render configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SigGenConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.port_root, PathBuf::from("/dev"));
        assert_eq!(config.pacing.settle(), Duration::from_millis(50));
        assert_eq!(config.pacing.fade_floor, 0.002);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
            [connection]
            protocol = "visa"
            read_length = 256

            [pacing]
            arb_point_delay_ms = 3
            "#,
        );

        let config = SigGenConfig::load_from(file.path()).expect("load");
        assert_eq!(config.connection.protocol, Some(TransportKind::ResourceManager));
        assert_eq!(config.connection.read_length, 256);
        assert_eq!(config.connection.identity_timeout_ms, 500);
        assert_eq!(config.pacing.arb_point_delay(1000), Duration::from_millis(3));
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = SigGenConfig::load_from("/nonexistent/siggen.toml").expect("load");
        assert_eq!(config.connection.read_length, 100);
    }

    #[test]
    fn test_arb_point_delay_scales_with_rate() {
        let pacing = PacingConfig::default();
        assert_eq!(pacing.arb_point_delay(1000), Duration::from_millis(2));
        assert_eq!(pacing.arb_point_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let file = write_config(
            r#"
            [application]
            log_level = "verbose"
            "#,
        );
        let err = SigGenConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, SigGenError::Configuration(msg) if msg.contains("verbose")));
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let file = write_config("[connection\nread_length = ");
        let err = SigGenConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, SigGenError::ConfigLoad(_)));
    }

    #[test]
    fn test_zero_fade_floor_rejected() {
        let mut config = SigGenConfig::default();
        config.pacing.fade_floor = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_render_round_trips_protocol() {
        let mut config = SigGenConfig::default();
        config.connection.protocol = Some(TransportKind::FileNode);
        let rendered = config.to_toml_string().expect("render");
        assert!(rendered.contains("protocol = \"usbtmc\""));
    }
}
