//! SCPI signal-generator driver.
//!
//! Talks to a waveform generator over USBTMC device nodes (Linux) or a VISA
//! resource manager (Windows, or any host with a VISA runtime and the
//! `instrument_visa` feature). The layers, leaves first:
//!
//! - [`transport`]: one open channel to an instrument (`write`, `read`, `query`)
//! - [`driver`]: discovery, access repair and [`Driver`] connections
//! - [`generator`]: the [`SignalGenerator`] facade that formats and paces SCPI
//!   command sequences
//!
//! [`config`], [`error`] and [`logging`] are shared by all of them.

pub mod config;
pub mod driver;
pub mod error;
pub mod generator;
pub mod logging;
pub mod transport;

pub use config::{PacingConfig, SigGenConfig};
pub use driver::{
    AccessElevator, CommandElevator, Connector, DeviceDescriptor, DeviceIdentity, Driver,
    NoElevation,
};
pub use error::{AppResult, SigGenError, Stage};
pub use generator::{
    ArbitraryWaveform, Channel, ChannelState, FadeDirection, FadePlan, FadeRequest,
    OutputState, Parameter, SignalGenerator, Stimulation, WaveformMode, WaveformSetting,
};
pub use transport::{Transport, TransportHandle, TransportKind};
pub use tokio_util::sync::CancellationToken;
