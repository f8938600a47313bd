//! Custom error types for the driver.
//!
//! This module defines the primary error type, `SigGenError`, shared by every layer
//! of the crate. Using the `thiserror` crate, it gives one consistent place for the
//! failure modes of talking to a signal generator, from a bad device path to a write
//! that failed halfway through an arbitrary-waveform upload.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`ConfigLoad`**: the caller supplied a target or a setting
//!   that cannot work (missing device node, malformed config file). Fatal; fix input.
//! - **`AccessDenied`** / **`Permission`**: the device node is not writable. The first
//!   is recoverable and triggers one elevation attempt inside the driver; the second
//!   means that attempt did not help.
//! - **`Transport`**: a read or write on an already-open transport failed.
//! - **`Communication`** / **`Cancelled`**: a multi-step sequence stopped early. Both
//!   carry the stage and the number of commands that completed, because the
//!   instrument may now be partially configured.
//! - **`SampleRange`**, **`ParameterRange`**, **`EmptyWaveform`**, **`InvalidChannel`**,
//!   **`MissingValue`**, **`UnexpectedValue`**, **`UnsupportedProtocol`**: caller misuse.
//!   These are raised before anything is sent to the instrument.

use std::fmt;

use thiserror::Error;

use crate::generator::Parameter;

/// Convenience alias for results using the driver error type.
pub type AppResult<T> = std::result::Result<T, SigGenError>;

/// Step of a multi-command sequence, reported when the sequence stops early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Dispatch of `set_parameters` sub-commands.
    ParameterSet,
    /// `:APPL:ARB` mode selection before an upload.
    ArbitraryMode,
    /// `:DATA:POIN` allocation before an upload.
    ArbitraryAllocate,
    /// Per-point `:DATA:VALue` writes.
    ArbitraryPoints,
    /// Amplitude ramp.
    Fade,
    /// Hold period of a stimulation session.
    Hold,
    /// Output toggling inside a stimulation session.
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ParameterSet => "parameter set",
            Stage::ArbitraryMode => "arbitrary mode selection",
            Stage::ArbitraryAllocate => "arbitrary point allocation",
            Stage::ArbitraryPoints => "arbitrary point upload",
            Stage::Fade => "fade",
            Stage::Hold => "hold",
            Stage::Output => "output toggle",
        };
        f.write_str(name)
    }
}

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum SigGenError {
    /// Bad target or setting supplied by the caller.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be merged.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Device node exists but is not writable.
    #[error("Access to {location} requires elevated privileges")]
    AccessDenied {
        /// Device path.
        location: String,
    },

    /// Still not writable after one elevation attempt.
    #[error("Permission denied for {location} after one elevation attempt")]
    Permission {
        /// Device path.
        location: String,
    },

    /// Read or write on an open transport failed.
    #[error("Transport error on {location}: {source}")]
    Transport {
        /// Device path or resource string.
        location: String,
        /// Underlying OS or VISA failure.
        #[source]
        source: std::io::Error,
    },

    /// A multi-command sequence failed partway.
    #[error("Communication failed during {stage} after {completed} of {total} commands; instrument may be partially configured: {source}")]
    Communication {
        /// Step that failed.
        stage: Stage,
        /// Commands sent successfully before the failure.
        completed: usize,
        /// Commands in the whole sequence.
        total: usize,
        /// The failure itself.
        #[source]
        source: Box<SigGenError>,
    },

    /// A cancellation token stopped a sequence between steps.
    #[error("{stage} cancelled after {completed} of {total} steps; instrument left in partial state")]
    Cancelled {
        /// Step that was interrupted.
        stage: Stage,
        /// Steps finished before the token fired.
        completed: usize,
        /// Steps in the whole sequence.
        total: usize,
    },

    /// Arbitrary sample outside [-2.5, 2.5] V.
    #[error("Sample {index} ({value} V) is outside the -2.5 V to 2.5 V range")]
    SampleRange {
        /// 0-based position in the sample array.
        index: usize,
        /// Offending sample.
        value: f64,
    },

    /// Numeric setting that cannot be sent.
    #[error("Parameter '{parameter}' has invalid value {value}")]
    ParameterRange {
        /// Setting name.
        parameter: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// Arbitrary waveform without samples.
    #[error("Arbitrary waveform contains no samples")]
    EmptyWaveform,

    /// Channel number other than 1 or 2.
    #[error("Invalid output channel {0}; expected 1 or 2")]
    InvalidChannel(u8),

    /// Set requested without a value.
    #[error("A value is required when setting {0}")]
    MissingValue(Parameter),

    /// Query requested with a value.
    #[error("No value may be supplied when querying {0}")]
    UnexpectedValue(Parameter),

    /// Unknown transport name, or no default for this OS.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Reply that does not parse as expected.
    #[error("Unparseable response to '{command}': {response:?}")]
    InvalidResponse {
        /// Query that was sent.
        command: String,
        /// Trimmed reply text.
        response: String,
    },

    /// No reply within the allowed time.
    #[error("Timed out after {timeout_ms}ms waiting for {location}")]
    Timeout {
        /// Device path or resource string.
        location: String,
        /// Limit that expired.
        timeout_ms: u64,
    },

    /// Transport compiled out of this build.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Filesystem or process failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed waveform file.
    #[error("Waveform file error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for SigGenError {
    fn from(err: figment::Error) -> Self {
        SigGenError::ConfigLoad(Box::new(err))
    }
}

impl SigGenError {
    /// Wrap a failure from a multi-step sequence with the progress reached so far.
    pub(crate) fn during(self, stage: Stage, completed: usize, total: usize) -> Self {
        match self {
            // Already carries progress from an inner sequence.
            err @ (SigGenError::Communication { .. } | SigGenError::Cancelled { .. }) => err,
            other => SigGenError::Communication {
                stage,
                completed,
                total,
                source: Box::new(other),
            },
        }
    }

    /// True for errors raised by input validation, before any I/O took place.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SigGenError::SampleRange { .. }
                | SigGenError::ParameterRange { .. }
                | SigGenError::EmptyWaveform
                | SigGenError::InvalidChannel(_)
                | SigGenError::MissingValue(_)
                | SigGenError::UnexpectedValue(_)
                | SigGenError::UnsupportedProtocol(_)
        )
    }
}
