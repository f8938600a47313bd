//! Signal generator facade
//!
//! [`SignalGenerator`] owns one [`Driver`] and turns parameter changes into
//! ordered, paced SCPI command sequences. It also keeps a [`ChannelState`] record
//! per output channel holding the last configuration that was successfully sent.
//!
//! Every operation that talks to the instrument holds the facade lock and the
//! device's operation lock for its full duration, so at most one command sequence
//! is in flight per instrument, even across facades opened on the same location. Long operations (arbitrary
//! upload, fade, stimulation) take a [`CancellationToken`] that is checked between
//! steps. A cancelled or failed sequence leaves the instrument in whatever state
//! its last successful command produced and reports how far it got.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::PacingConfig;
use crate::driver::Driver;
use crate::error::{AppResult, SigGenError, Stage};

/// Lowest sample voltage accepted by the arbitrary waveform memory.
pub const SAMPLE_MIN: f64 = -2.5;
/// Highest sample voltage accepted by the arbitrary waveform memory.
pub const SAMPLE_MAX: f64 = 2.5;

/// Full-scale code of the 14-bit arbitrary waveform DAC.
pub const CODE_MAX: f64 = 16383.0;

/// Most levels a single fade may have.
pub const MAX_FADE_STEPS: usize = 100_000;

/// Output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Channel {
    /// `:SOUR1`
    #[default]
    One,
    /// `:SOUR2`
    Two,
}

impl Channel {
    /// Both channels, in number order.
    pub const ALL: [Channel; 2] = [Channel::One, Channel::Two];

    /// Channel number used in SCPI headers.
    pub fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }

    fn index(self) -> usize {
        usize::from(self.number() - 1)
    }
}

impl TryFrom<u8> for Channel {
    type Error = SigGenError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Channel::One),
            2 => Ok(Channel::Two),
            other => Err(SigGenError::InvalidChannel(other)),
        }
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.number()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Single numeric setting addressable with [`SignalGenerator::set_single`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameter {
    /// Amplitude in V.
    Amplitude,
    /// DC offset in V.
    Offset,
    /// Frequency in Hz.
    Frequency,
    /// Phase in degrees.
    Phase,
}

impl Parameter {
    /// SCPI header suffix after `:SOUR<c>`.
    pub fn suffix(self) -> &'static str {
        match self {
            Parameter::Amplitude => ":VOLT",
            Parameter::Offset => ":VOLT:OFFS",
            Parameter::Frequency => ":FREQ",
            Parameter::Phase => ":PHAS",
        }
    }

    /// Lowercase name used in messages and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Parameter::Amplitude => "amplitude",
            Parameter::Offset => "offset",
            Parameter::Frequency => "frequency",
            Parameter::Phase => "phase",
        }
    }

    fn check(self, value: f64) -> AppResult<()> {
        let valid = match self {
            Parameter::Frequency => value.is_finite() && value > 0.0,
            _ => value.is_finite(),
        };
        if valid {
            Ok(())
        } else {
            Err(SigGenError::ParameterRange {
                parameter: self.name(),
                value,
            })
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Parameter {
    type Err = SigGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amp" | "amplitude" | "volt" => Ok(Parameter::Amplitude),
            "offset" | "offs" => Ok(Parameter::Offset),
            "freq" | "frequency" => Ok(Parameter::Frequency),
            "phase" | "phas" => Ok(Parameter::Phase),
            other => Err(SigGenError::Configuration(format!(
                "Unknown parameter '{other}'. Expected amplitude, offset, frequency or phase"
            ))),
        }
    }
}

/// Waveform family last applied to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveformMode {
    /// `:APPL:SIN`
    Sine,
    /// `:APPL:DC`; the level lives in the offset.
    Dc,
    /// `:APPL:NOIS`
    Noise,
    /// `:APPL:ARB` with volatile point memory.
    Arbitrary,
}

impl FromStr for WaveformMode {
    type Err = SigGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sin" | "sine" => Ok(WaveformMode::Sine),
            "dc" => Ok(WaveformMode::Dc),
            "nois" | "noise" => Ok(WaveformMode::Noise),
            "arb" | "arbitrary" => Ok(WaveformMode::Arbitrary),
            other => Err(SigGenError::Configuration(format!(
                "Unknown waveform mode '{other}'. Expected sine, dc, noise or arbitrary"
            ))),
        }
    }
}

/// Last-known output state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    /// Output switched off, or never configured.
    #[default]
    Off,
    /// Parameters were set while the output was off.
    Configuring,
    /// Output switched on.
    On,
}

/// One entry of a [`SignalGenerator::set_parameters`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveformSetting {
    /// `:APPL:SIN <freq>,<amp>,<offset>,<phase>`
    Sine {
        /// Hz
        frequency: f64,
        /// V
        amplitude: f64,
        /// V
        offset: f64,
        /// Degrees
        phase: f64,
    },
    /// `:APPL:DC 1,1,<amp>`
    Dc {
        /// Level in V
        amplitude: f64,
    },
    /// `:APPL:NOIS <amp>,<offset>`
    Noise {
        /// V
        amplitude: f64,
        /// V
        offset: f64,
    },
    /// `:VOLT:OFFS <v>`
    Offset(f64),
    /// `:<first four letters of key> <value>`, both uppercased.
    Generic {
        /// SCPI keyword, truncated to four letters.
        key: String,
        /// Argument text.
        value: String,
    },
}

impl WaveformSetting {
    /// A free-form `key value` setting.
    pub fn generic(key: impl Into<String>, value: impl Into<String>) -> Self {
        WaveformSetting::Generic {
            key: key.into(),
            value: value.into(),
        }
    }

    fn validate(&self) -> AppResult<()> {
        match *self {
            WaveformSetting::Sine {
                frequency,
                amplitude,
                offset,
                phase,
            } => {
                Parameter::Frequency.check(frequency)?;
                Parameter::Amplitude.check(amplitude)?;
                Parameter::Offset.check(offset)?;
                Parameter::Phase.check(phase)
            }
            WaveformSetting::Dc { amplitude } => Parameter::Amplitude.check(amplitude),
            WaveformSetting::Noise { amplitude, offset } => {
                Parameter::Amplitude.check(amplitude)?;
                Parameter::Offset.check(offset)
            }
            WaveformSetting::Offset(offset) => Parameter::Offset.check(offset),
            WaveformSetting::Generic { ref key, .. } => {
                if key.trim().is_empty() {
                    Err(SigGenError::Configuration(
                        "Setting key cannot be empty".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// The SCPI command for this setting on `channel`.
    pub fn command(&self, channel: Channel) -> String {
        let c = channel.number();
        match self {
            WaveformSetting::Sine {
                frequency,
                amplitude,
                offset,
                phase,
            } => format!(":SOUR{c}:APPL:SIN {frequency},{amplitude},{offset},{phase}"),
            WaveformSetting::Dc { amplitude } => format!(":SOUR{c}:APPL:DC 1,1,{amplitude}"),
            WaveformSetting::Noise { amplitude, offset } => {
                format!(":SOUR{c}:APPL:NOIS {amplitude},{offset}")
            }
            WaveformSetting::Offset(offset) => format!(":SOUR{c}:VOLT:OFFS {offset}"),
            WaveformSetting::Generic { key, value } => {
                let header: String = key.trim().chars().take(4).collect();
                format!(
                    ":SOUR{c}:{} {}",
                    header.to_uppercase(),
                    value.trim().to_uppercase()
                )
            }
        }
    }
}

/// Samples for the arbitrary waveform memory.
///
/// Stored on disk as JSON: `{"sps": 1000, "data": [0.0, 0.5, ...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitraryWaveform {
    /// Sample voltages, each within [-2.5, 2.5] V.
    #[serde(rename = "data")]
    pub samples: Vec<f64>,
    /// Playback rate.
    #[serde(rename = "sps")]
    pub samples_per_second: u32,
}

impl ArbitraryWaveform {
    /// Waveform from samples and playback rate. Not validated until upload.
    pub fn new(samples: Vec<f64>, samples_per_second: u32) -> Self {
        Self {
            samples,
            samples_per_second,
        }
    }

    /// Load and validate a waveform file.
    pub fn from_json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let waveform: Self = serde_json::from_str(&text)?;
        waveform.validate()?;
        Ok(waveform)
    }

    /// Check every sample before anything is transmitted.
    ///
    /// # Errors
    /// - `EmptyWaveform` if there are no samples
    /// - `ParameterRange` if the sample rate is zero
    /// - `SampleRange` with the position of the first sample outside
    ///   [-2.5, 2.5] V (non-finite samples included)
    pub fn validate(&self) -> AppResult<()> {
        if self.samples.is_empty() {
            return Err(SigGenError::EmptyWaveform);
        }
        if self.samples_per_second == 0 {
            return Err(SigGenError::ParameterRange {
                parameter: "samples_per_second",
                value: 0.0,
            });
        }
        if let Some((index, &value)) = self
            .samples
            .iter()
            .enumerate()
            .find(|(_, v)| !(SAMPLE_MIN..=SAMPLE_MAX).contains(*v))
        {
            return Err(SigGenError::SampleRange { index, value });
        }
        Ok(())
    }

    /// DAC codes, `round((v + 2.5) * 16383 / 5)`. Call [`validate`](Self::validate) first.
    pub fn to_codes(&self) -> Vec<u16> {
        self.samples
            .iter()
            .map(|v| ((v - SAMPLE_MIN) * CODE_MAX / (SAMPLE_MAX - SAMPLE_MIN)).round() as u16)
            .collect()
    }

    /// Playback length of one period.
    pub fn preview_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.samples_per_second.max(1)))
    }
}

/// Per-channel record of the last successful configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelState {
    /// Waveform family, `None` until one is applied.
    pub mode: Option<WaveformMode>,
    /// Output switch state.
    pub output: OutputState,
    /// V
    pub amplitude: Option<f64>,
    /// Hz
    pub frequency: Option<f64>,
    /// Degrees
    pub phase: Option<f64>,
    /// V
    pub offset: Option<f64>,
    /// Waveform held in point memory after a complete upload.
    pub arbitrary: Option<ArbitraryWaveform>,
}

impl ChannelState {
    fn configured(&mut self) {
        if self.output == OutputState::Off {
            self.output = OutputState::Configuring;
        }
    }

    fn record(&mut self, setting: &WaveformSetting) {
        match *setting {
            WaveformSetting::Sine {
                frequency,
                amplitude,
                offset,
                phase,
            } => {
                self.mode = Some(WaveformMode::Sine);
                self.frequency = Some(frequency);
                self.amplitude = Some(amplitude);
                self.offset = Some(offset);
                self.phase = Some(phase);
            }
            WaveformSetting::Dc { amplitude } => {
                self.mode = Some(WaveformMode::Dc);
                self.amplitude = Some(amplitude);
            }
            WaveformSetting::Noise { amplitude, offset } => {
                self.mode = Some(WaveformMode::Noise);
                self.amplitude = Some(amplitude);
                self.offset = Some(offset);
            }
            WaveformSetting::Offset(offset) => self.offset = Some(offset),
            WaveformSetting::Generic { .. } => {}
        }
        self.configured();
    }

    fn record_single(&mut self, parameter: Parameter, value: f64) {
        let slot = match parameter {
            Parameter::Amplitude => &mut self.amplitude,
            Parameter::Offset => &mut self.offset,
            Parameter::Frequency => &mut self.frequency,
            Parameter::Phase => &mut self.phase,
        };
        *slot = Some(value);
        self.configured();
    }
}

/// Ramp direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeDirection {
    /// Floor to target, waiting before each level.
    In,
    /// Target to floor, waiting after each level.
    Out,
}

/// Amplitude ramp on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FadeRequest {
    /// Target channel; the selected channel when `None`.
    pub channel: Option<Channel>,
    /// Level at the top of the ramp.
    pub amplitude: f64,
    /// Ramp length.
    pub duration: Duration,
    /// Level updates per second.
    pub steps_per_sec: f64,
    /// Up or down.
    pub direction: FadeDirection,
}

impl FadeRequest {
    /// Ramp from the floor up to `amplitude`.
    pub fn fade_in(amplitude: f64, duration: Duration, steps_per_sec: f64) -> Self {
        Self {
            channel: None,
            amplitude,
            duration,
            steps_per_sec,
            direction: FadeDirection::In,
        }
    }

    /// Ramp from `amplitude` down to the floor.
    pub fn fade_out(amplitude: f64, duration: Duration, steps_per_sec: f64) -> Self {
        Self {
            direction: FadeDirection::Out,
            ..Self::fade_in(amplitude, duration, steps_per_sec)
        }
    }

    /// Run on `channel` instead of the selected one.
    pub fn on(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Levels of a fade, for callers that drive the steps themselves.
///
/// Wait `interval` then call [`SignalGenerator::apply_level`] for each level when
/// fading in; apply then wait when fading out.
///
/// `round(duration * steps_per_sec)` levels are spaced evenly between the floor
/// and the amplitude, both ends included. A one-step fade jumps straight to its
/// end level: the amplitude when fading in, the floor when fading out.
#[derive(Debug, Clone, PartialEq)]
pub struct FadePlan {
    /// Resolved channel.
    pub channel: Channel,
    /// Up or down.
    pub direction: FadeDirection,
    /// Levels in the order they are applied.
    pub levels: Vec<f64>,
    /// Wait between levels, `1 / steps_per_sec`.
    pub interval: Duration,
}

impl FadePlan {
    fn build(request: &FadeRequest, channel: Channel, floor: f64) -> AppResult<Self> {
        if !(request.steps_per_sec.is_finite() && request.steps_per_sec > 0.0) {
            return Err(SigGenError::ParameterRange {
                parameter: "steps_per_sec",
                value: request.steps_per_sec,
            });
        }
        Parameter::Amplitude.check(request.amplitude)?;

        let interval = Duration::try_from_secs_f64(1.0 / request.steps_per_sec).map_err(|_| {
            SigGenError::ParameterRange {
                parameter: "steps_per_sec",
                value: request.steps_per_sec,
            }
        })?;

        let steps = (request.duration.as_secs_f64() * request.steps_per_sec).round();
        if steps < 1.0 {
            return Err(SigGenError::ParameterRange {
                parameter: "fade duration",
                value: request.duration.as_secs_f64(),
            });
        }
        // An infinite product lands here too, before anything is allocated.
        if steps > MAX_FADE_STEPS as f64 {
            return Err(SigGenError::ParameterRange {
                parameter: "fade steps",
                value: steps,
            });
        }
        let steps = steps as usize;

        let mut levels: Vec<f64> = if steps == 1 {
            match request.direction {
                FadeDirection::In => vec![request.amplitude],
                FadeDirection::Out => vec![floor],
            }
        } else {
            let span = request.amplitude - floor;
            let last = (steps - 1) as f64;
            (0..steps)
                .map(|i| {
                    if i == steps - 1 {
                        request.amplitude
                    } else {
                        floor + span * i as f64 / last
                    }
                })
                .collect()
        };
        if request.direction == FadeDirection::Out {
            levels.reverse();
        }

        Ok(Self {
            channel,
            direction: request.direction,
            levels,
            interval,
        })
    }
}

/// A stimulation session: output on, optional fade-in, hold, optional fade-out,
/// output off.
#[derive(Debug, Clone, PartialEq)]
pub struct Stimulation {
    /// Target channel; the selected channel when `None`.
    pub channel: Option<Channel>,
    /// Level held between the fades.
    pub amplitude: f64,
    /// Time spent at `amplitude`.
    pub hold: Duration,
    /// Ramp length and rate used for both fades.
    pub fade: Option<(Duration, f64)>,
}

impl Stimulation {
    /// Session without fades.
    pub fn new(amplitude: f64, hold: Duration) -> Self {
        Self {
            channel: None,
            amplitude,
            hold,
            fade: None,
        }
    }

    /// Fade in and out over `duration` at `steps_per_sec`.
    pub fn with_fade(mut self, duration: Duration, steps_per_sec: f64) -> Self {
        self.fade = Some((duration, steps_per_sec));
        self
    }

    /// Run on `channel` instead of the selected one.
    pub fn on(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns false when cancelled.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

struct Inner {
    driver: Driver,
    pacing: PacingConfig,
    selected: Channel,
    channels: [ChannelState; 2],
}

impl Inner {
    fn resolve(&self, channel: Option<Channel>) -> Channel {
        channel.unwrap_or(self.selected)
    }

    fn state_mut(&mut self, channel: Channel) -> &mut ChannelState {
        &mut self.channels[channel.index()]
    }

    async fn dispatch(&mut self, setting: &WaveformSetting, channel: Channel) -> AppResult<()> {
        self.driver.write(&setting.command(channel)).await?;
        self.state_mut(channel).record(setting);
        Ok(())
    }

    async fn set_parameters(
        &mut self,
        settings: &[WaveformSetting],
        channel: Channel,
    ) -> AppResult<()> {
        for setting in settings {
            setting.validate()?;
        }

        let total = settings.len();
        for (completed, setting) in settings.iter().enumerate() {
            self.dispatch(setting, channel)
                .await
                .map_err(|e| e.during(Stage::ParameterSet, completed, total))?;
            tokio::time::sleep(self.pacing.settle()).await;
        }
        Ok(())
    }

    async fn write_single(&mut self, parameter: Parameter, value: f64, channel: Channel) -> AppResult<()> {
        parameter.check(value)?;
        let command = format!(":SOUR{}{} {value}", channel.number(), parameter.suffix());
        self.driver.write(&command).await?;
        self.state_mut(channel).record_single(parameter, value);
        Ok(())
    }

    async fn query_single(&mut self, parameter: Parameter, channel: Channel) -> AppResult<f64> {
        let command = format!(":SOUR{}{}?", channel.number(), parameter.suffix());
        let reply = self.driver.query_text(&command).await?;
        reply
            .parse::<f64>()
            .map_err(|_| SigGenError::InvalidResponse { command, response: reply })
    }

    async fn set_output(&mut self, channel: Channel, on: bool) -> AppResult<()> {
        let command = format!(":OUTPut{} {}", channel.number(), if on { "ON" } else { "OFF" });
        self.driver.write(&command).await?;
        self.state_mut(channel).output = if on { OutputState::On } else { OutputState::Off };
        info!(channel = channel.number(), on, "Output switched");
        Ok(())
    }

    /// One live amplitude update through the path matching the channel's mode.
    async fn apply_level(&mut self, channel: Channel, level: f64) -> AppResult<()> {
        match self.channels[channel.index()].mode {
            Some(WaveformMode::Dc) => {
                self.dispatch(&WaveformSetting::Offset(level), channel).await?;
                tokio::time::sleep(self.pacing.settle()).await;
            }
            Some(WaveformMode::Noise) => {
                let offset = self.channels[channel.index()].offset.unwrap_or(0.0);
                let setting = WaveformSetting::Noise {
                    amplitude: level,
                    offset,
                };
                self.dispatch(&setting, channel).await?;
                tokio::time::sleep(self.pacing.settle()).await;
            }
            Some(WaveformMode::Sine) | Some(WaveformMode::Arbitrary) | None => {
                self.write_single(Parameter::Amplitude, level, channel).await?;
            }
        }
        Ok(())
    }

    async fn fade(&mut self, plan: &FadePlan, cancel: &CancellationToken) -> AppResult<()> {
        let total = plan.levels.len();
        debug!(
            channel = plan.channel.number(),
            direction = ?plan.direction,
            steps = total,
            interval_ms = plan.interval.as_millis() as u64,
            "Starting fade"
        );

        for (completed, &level) in plan.levels.iter().enumerate() {
            let cancelled = SigGenError::Cancelled {
                stage: Stage::Fade,
                completed,
                total,
            };
            if cancel.is_cancelled() {
                return Err(cancelled);
            }
            if plan.direction == FadeDirection::In && !pause(plan.interval, cancel).await {
                return Err(cancelled);
            }

            self.apply_level(plan.channel, level)
                .await
                .map_err(|e| e.during(Stage::Fade, completed, total))?;

            if plan.direction == FadeDirection::Out && !pause(plan.interval, cancel).await {
                return Err(SigGenError::Cancelled {
                    stage: Stage::Fade,
                    completed: completed + 1,
                    total,
                });
            }
        }
        Ok(())
    }

    async fn upload_arbitrary(
        &mut self,
        waveform: &ArbitraryWaveform,
        channel: Channel,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        waveform.validate()?;
        let codes = waveform.to_codes();
        let c = channel.number();
        let points = codes.len();
        let total = points + 2;
        let point_delay = self.pacing.arb_point_delay(waveform.samples_per_second);

        info!(
            channel = c,
            points,
            sps = waveform.samples_per_second,
            point_delay_us = point_delay.as_micros() as u64,
            "Uploading arbitrary waveform"
        );

        self.driver
            .write(&format!(":SOUR{c}:APPL:ARB {}", waveform.samples_per_second))
            .await
            .map_err(|e| e.during(Stage::ArbitraryMode, 0, total))?;
        let state = self.state_mut(channel);
        state.mode = Some(WaveformMode::Arbitrary);
        // Point memory is about to be overwritten.
        state.arbitrary = None;
        tokio::time::sleep(self.pacing.arb_setup()).await;

        self.driver
            .write(&format!(":SOUR{c}:DATA:POIN VOLATILE, {points}"))
            .await
            .map_err(|e| e.during(Stage::ArbitraryAllocate, 1, total))?;
        tokio::time::sleep(self.pacing.arb_setup()).await;

        for (i, code) in codes.iter().enumerate() {
            let completed = i + 2;
            if cancel.is_cancelled() {
                return Err(SigGenError::Cancelled {
                    stage: Stage::ArbitraryPoints,
                    completed,
                    total,
                });
            }
            self.driver
                .write(&format!(":SOUR{c}:DATA:VALue VOLATILE,{}, {code}", i + 1))
                .await
                .map_err(|e| e.during(Stage::ArbitraryPoints, completed, total))?;
            if !pause(point_delay, cancel).await {
                return Err(SigGenError::Cancelled {
                    stage: Stage::ArbitraryPoints,
                    completed: completed + 1,
                    total,
                });
            }
        }

        let state = self.state_mut(channel);
        state.arbitrary = Some(waveform.clone());
        state.configured();
        info!(channel = c, points, "Arbitrary waveform uploaded");
        Ok(())
    }

    async fn hold(&mut self, hold: Duration, cancel: &CancellationToken) -> AppResult<()> {
        let tick = self.pacing.hold_tick();
        let total = (hold.as_secs_f64() / tick.as_secs_f64()).ceil() as usize;
        let mut remaining = hold;
        let mut completed = 0;

        while !remaining.is_zero() {
            let step = remaining.min(tick);
            if !pause(step, cancel).await {
                return Err(SigGenError::Cancelled {
                    stage: Stage::Hold,
                    completed,
                    total,
                });
            }
            remaining -= step;
            completed += 1;
            info!(remaining_secs = remaining.as_secs_f64(), "Stimulation running");
        }
        Ok(())
    }
}

/// Facade state plus the device's operation lock, held for one operation.
struct Exclusive<'a> {
    inner: MutexGuard<'a, Inner>,
    _device: OwnedMutexGuard<()>,
}

impl Deref for Exclusive<'_> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.inner
    }
}

impl DerefMut for Exclusive<'_> {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.inner
    }
}

/// High-level control of one signal generator.
pub struct SignalGenerator {
    inner: Mutex<Inner>,
}

impl SignalGenerator {
    /// Facade with default pacing.
    pub fn new(driver: Driver) -> Self {
        Self::with_pacing(driver, PacingConfig::default())
    }

    /// Facade with explicit pacing delays.
    pub fn with_pacing(driver: Driver, pacing: PacingConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                driver,
                pacing,
                selected: Channel::One,
                channels: [ChannelState::default(), ChannelState::default()],
            }),
        }
    }

    /// Lock the facade, then the device it drives.
    async fn exclusive(&self) -> Exclusive<'_> {
        let inner = self.inner.lock().await;
        let device = inner.driver.operation_lock().lock_owned().await;
        Exclusive {
            inner,
            _device: device,
        }
    }

    /// Give the driver back, discarding channel state.
    pub fn into_driver(self) -> Driver {
        self.inner.into_inner().driver
    }

    /// Choose the channel used when an operation is not given one.
    pub async fn select_channel(&self, channel: u8) -> AppResult<Channel> {
        let channel = Channel::try_from(channel)?;
        self.inner.lock().await.selected = channel;
        debug!(channel = channel.number(), "Channel selected");
        Ok(channel)
    }

    /// Channel used when an operation is not given one.
    pub async fn selected_channel(&self) -> Channel {
        self.inner.lock().await.selected
    }

    /// Snapshot of the last successful configuration of `channel`.
    pub async fn channel_state(&self, channel: Option<Channel>) -> ChannelState {
        let inner = self.inner.lock().await;
        inner.channels[inner.resolve(channel).index()].clone()
    }

    /// Last-known output state of `channel`.
    pub async fn output_state(&self, channel: Option<Channel>) -> OutputState {
        self.channel_state(channel).await.output
    }

    /// Record that `channel` already runs `mode` without sending anything.
    ///
    /// Used when the instrument was configured before this facade existed, so
    /// fades pick the matching live-update path. `offset` is kept for noise
    /// updates when given.
    pub async fn assume_mode(
        &self,
        channel: Option<Channel>,
        mode: WaveformMode,
        offset: Option<f64>,
    ) {
        let mut inner = self.inner.lock().await;
        let channel = inner.resolve(channel);
        let state = inner.state_mut(channel);
        state.mode = Some(mode);
        if offset.is_some() {
            state.offset = offset;
        }
        debug!(channel = channel.number(), ?mode, "Channel mode assumed");
    }

    /// Send each setting in order, waiting the settle delay after every one.
    ///
    /// All settings are validated before the first command is sent.
    #[instrument(skip(self, settings), fields(count = settings.len()))]
    pub async fn set_parameters(
        &self,
        settings: &[WaveformSetting],
        channel: Option<Channel>,
    ) -> AppResult<()> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(channel);
        inner.set_parameters(settings, channel).await
    }

    /// Set or query one parameter.
    ///
    /// With `query` the instrument's current value is returned and `value` must
    /// be `None`; otherwise `value` is written and `Ok(None)` returned.
    pub async fn set_single(
        &self,
        parameter: Parameter,
        value: Option<f64>,
        query: bool,
        channel: Option<Channel>,
    ) -> AppResult<Option<f64>> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(channel);
        match (query, value) {
            (true, Some(_)) => Err(SigGenError::UnexpectedValue(parameter)),
            (true, None) => inner.query_single(parameter, channel).await.map(Some),
            (false, None) => Err(SigGenError::MissingValue(parameter)),
            (false, Some(value)) => {
                inner.write_single(parameter, value, channel).await?;
                Ok(None)
            }
        }
    }

    /// Switch the output on.
    pub async fn enable(&self, channel: Option<Channel>) -> AppResult<()> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(channel);
        inner.set_output(channel, true).await
    }

    /// Switch the output off.
    pub async fn disable(&self, channel: Option<Channel>) -> AppResult<()> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(channel);
        inner.set_output(channel, false).await
    }

    /// Flip the output based on its last-known state. Returns the new state.
    pub async fn toggle(&self, channel: Option<Channel>) -> AppResult<OutputState> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(channel);
        let on = inner.channels[channel.index()].output != OutputState::On;
        inner.set_output(channel, on).await?;
        Ok(inner.channels[channel.index()].output)
    }

    /// Upload `waveform` into volatile arbitrary memory, one point per command.
    pub async fn upload_arbitrary(
        &self,
        waveform: &ArbitraryWaveform,
        channel: Option<Channel>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(channel);
        inner.upload_arbitrary(waveform, channel, cancel).await
    }

    /// Levels and step interval of `request`, without sending anything.
    pub async fn fade_plan(&self, request: &FadeRequest) -> AppResult<FadePlan> {
        let inner = self.inner.lock().await;
        FadePlan::build(request, inner.resolve(request.channel), inner.pacing.fade_floor)
    }

    /// Apply one fade level through the channel's live-update path.
    pub async fn apply_level(&self, channel: Option<Channel>, level: f64) -> AppResult<()> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(channel);
        inner.apply_level(channel, level).await
    }

    /// Ramp the amplitude, blocking until the last level is applied.
    pub async fn fade(&self, request: &FadeRequest, cancel: &CancellationToken) -> AppResult<()> {
        let mut inner = self.exclusive().await;
        let plan = FadePlan::build(request, inner.resolve(request.channel), inner.pacing.fade_floor)?;
        inner.fade(&plan, cancel).await
    }

    /// Run a stimulation session.
    ///
    /// On cancellation the output is left as it was when the token fired.
    pub async fn stimulate(
        &self,
        session: &Stimulation,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let mut inner = self.exclusive().await;
        let channel = inner.resolve(session.channel);
        let floor = inner.pacing.fade_floor;
        info!(
            channel = channel.number(),
            amplitude = session.amplitude,
            hold_secs = session.hold.as_secs_f64(),
            fade = session.fade.is_some(),
            "Starting stimulation"
        );

        let ramps = match session.fade {
            Some((duration, steps_per_sec)) => {
                let request = FadeRequest::fade_in(session.amplitude, duration, steps_per_sec);
                let up = FadePlan::build(&request, channel, floor)?;
                let down = FadePlan::build(
                    &FadeRequest {
                        direction: FadeDirection::Out,
                        ..request
                    },
                    channel,
                    floor,
                )?;
                Some((up, down))
            }
            None => None,
        };

        let start_level = if ramps.is_some() { floor } else { session.amplitude };
        inner
            .apply_level(channel, start_level)
            .await
            .map_err(|e| e.during(Stage::Output, 0, 2))?;
        inner
            .set_output(channel, true)
            .await
            .map_err(|e| e.during(Stage::Output, 0, 2))?;

        if let Some((up, _)) = &ramps {
            inner.fade(up, cancel).await?;
        }
        inner.hold(session.hold, cancel).await?;
        if let Some((_, down)) = &ramps {
            inner.fade(down, cancel).await?;
        }

        inner
            .set_output(channel, false)
            .await
            .map_err(|e| e.during(Stage::Output, 1, 2))?;
        info!(channel = channel.number(), "Stimulation complete");
        Ok(())
    }

    /// Raw `:SOURce<c>:APPLy?` reply for both channels.
    pub async fn status(&self) -> AppResult<Vec<(Channel, String)>> {
        let mut inner = self.exclusive().await;
        let mut replies = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let reply = inner
                .driver
                .query_text(&format!(":SOURce{}:APPLy?", channel.number()))
                .await?;
            replies.push((channel, reply));
        }
        Ok(replies)
    }

    /// Reset the instrument; all channels return to their power-on state.
    pub async fn reset(&self) -> AppResult<String> {
        let mut inner = self.exclusive().await;
        let settle = inner.pacing.reset_settle();
        let reply = inner.driver.reset(settle).await?;
        inner.channels = [ChannelState::default(), ChannelState::default()];
        Ok(reply)
    }

    /// The instrument's `*IDN?` reply.
    pub async fn identity(&self) -> AppResult<String> {
        self.exclusive().await.driver.identity().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Connector;
    use crate::transport::{MockBackend, MockTransport, SimulatedInstrument, TransportKind};
    use std::sync::Arc;

    fn generator(pacing: PacingConfig) -> (SignalGenerator, SimulatedInstrument) {
        let instrument = SimulatedInstrument::default();
        let driver = Driver::new(
            Box::new(MockTransport::new(instrument.clone(), "sim0")),
            TransportKind::FileNode,
        );
        (SignalGenerator::with_pacing(driver, pacing), instrument)
    }

    fn sine(frequency: f64, amplitude: f64) -> WaveformSetting {
        WaveformSetting::Sine {
            frequency,
            amplitude,
            offset: 0.0,
            phase: 0.0,
        }
    }

    fn levels(commands: &[String], header: &str) -> Vec<f64> {
        commands
            .iter()
            .filter_map(|c| c.strip_prefix(header))
            .map(|v| v.trim().parse().unwrap())
            .collect()
    }

    #[test]
    fn test_command_formats() {
        assert_eq!(
            sine(1000.0, 0.5).command(Channel::Two),
            ":SOUR2:APPL:SIN 1000,0.5,0,0"
        );
        assert_eq!(
            WaveformSetting::Dc { amplitude: 1.5 }.command(Channel::One),
            ":SOUR1:APPL:DC 1,1,1.5"
        );
        assert_eq!(
            WaveformSetting::Noise {
                amplitude: 0.3,
                offset: 0.1
            }
            .command(Channel::One),
            ":SOUR1:APPL:NOIS 0.3,0.1"
        );
        assert_eq!(
            WaveformSetting::Offset(-0.25).command(Channel::One),
            ":SOUR1:VOLT:OFFS -0.25"
        );
        assert_eq!(
            WaveformSetting::generic("function", "squ").command(Channel::Two),
            ":SOUR2:FUNC SQU"
        );
    }

    #[test]
    fn test_channel_conversion() {
        assert_eq!(Channel::try_from(2).unwrap(), Channel::Two);
        assert!(matches!(
            Channel::try_from(3),
            Err(SigGenError::InvalidChannel(3))
        ));
        assert_eq!("freq".parse::<Parameter>().unwrap(), Parameter::Frequency);
    }

    #[test]
    fn test_codes_span_full_scale() {
        let waveform = ArbitraryWaveform::new(vec![-2.5, 0.0, 2.5], 1000);
        assert_eq!(waveform.to_codes(), vec![0, 8192, 16383]);
    }

    #[test]
    fn test_validate_reports_first_bad_sample() {
        let waveform = ArbitraryWaveform::new(vec![0.0, 2.6, f64::NAN, -3.0], 1000);
        assert!(matches!(
            waveform.validate(),
            Err(SigGenError::SampleRange { index: 1, .. })
        ));

        let nan = ArbitraryWaveform::new(vec![0.0, f64::NAN], 1000);
        assert!(matches!(
            nan.validate(),
            Err(SigGenError::SampleRange { index: 1, .. })
        ));

        let empty = ArbitraryWaveform::new(vec![], 1000);
        assert!(matches!(empty.validate(), Err(SigGenError::EmptyWaveform)));
    }

    #[test]
    fn test_waveform_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.json");
        std::fs::write(&path, r#"{"sps": 4, "data": [0.0, 0.5, 1.0, 0.5]}"#).unwrap();

        let waveform = ArbitraryWaveform::from_json_file(&path).unwrap();
        assert_eq!(waveform.samples_per_second, 4);
        assert_eq!(waveform.preview_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_fade_plan_levels() {
        let request = FadeRequest::fade_out(1.0, Duration::from_secs(2), 2.0);
        let plan = FadePlan::build(&request, Channel::One, 0.002).unwrap();
        assert_eq!(plan.levels.len(), 4);
        assert_eq!(plan.levels[0], 1.0);
        assert_eq!(plan.levels[3], 0.002);
        assert_eq!(plan.interval, Duration::from_millis(500));

        let too_short = FadeRequest::fade_in(1.0, Duration::from_millis(100), 2.0);
        assert!(FadePlan::build(&too_short, Channel::One, 0.002).is_err());
    }

    #[test]
    fn test_single_step_fade_lands_on_end_level() {
        let up = FadeRequest::fade_in(1.0, Duration::from_secs(1), 1.0);
        assert_eq!(FadePlan::build(&up, Channel::One, 0.002).unwrap().levels, vec![1.0]);

        let down = FadeRequest::fade_out(1.0, Duration::from_secs(1), 1.0);
        assert_eq!(FadePlan::build(&down, Channel::One, 0.002).unwrap().levels, vec![0.002]);
    }

    #[test]
    fn test_oversized_fade_is_rejected_before_allocating() {
        let fast = FadeRequest::fade_in(1.0, Duration::from_secs(2), 1e300);
        let err = FadePlan::build(&fast, Channel::One, 0.002).unwrap_err();
        assert!(matches!(
            err,
            SigGenError::ParameterRange { parameter: "fade steps", value } if value > MAX_FADE_STEPS as f64
        ));

        let long = FadeRequest::fade_in(1.0, Duration::from_secs(1_000_000), 10.0);
        let err = FadePlan::build(&long, Channel::One, 0.002).unwrap_err();
        assert!(matches!(err, SigGenError::ParameterRange { parameter: "fade steps", .. }));

        let limit = FadeRequest::fade_in(1.0, Duration::from_secs(10_000), 10.0);
        let plan = FadePlan::build(&limit, Channel::One, 0.002).unwrap();
        assert_eq!(plan.levels.len(), MAX_FADE_STEPS);
    }

    #[test]
    fn test_fade_interval_overflow_is_rejected() {
        let glacial = FadeRequest::fade_in(1.0, Duration::from_secs(1), 1e-20);
        let err = FadePlan::build(&glacial, Channel::One, 0.002).unwrap_err();
        assert!(matches!(err, SigGenError::ParameterRange { parameter: "steps_per_sec", .. }));
    }

    #[test]
    fn test_waveform_mode_parsing() {
        assert_eq!("DC".parse::<WaveformMode>().unwrap(), WaveformMode::Dc);
        assert_eq!("nois".parse::<WaveformMode>().unwrap(), WaveformMode::Noise);
        assert_eq!("sine".parse::<WaveformMode>().unwrap(), WaveformMode::Sine);
        assert!(matches!(
            "square".parse::<WaveformMode>(),
            Err(SigGenError::Configuration(msg)) if msg.contains("square")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_parameters_in_order_with_settle() {
        let (generator, instrument) = generator(PacingConfig::default());
        generator
            .set_parameters(
                &[sine(1000.0, 0.5), WaveformSetting::Offset(0.1)],
                Some(Channel::Two),
            )
            .await
            .unwrap();

        let log = instrument.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].command, ":SOUR2:APPL:SIN 1000,0.5,0,0");
        assert_eq!(log[1].command, ":SOUR2:VOLT:OFFS 0.1");
        assert!(log[1].at - log[0].at >= Duration::from_millis(50));

        let state = generator.channel_state(Some(Channel::Two)).await;
        assert_eq!(state.mode, Some(WaveformMode::Sine));
        assert_eq!(state.offset, Some(0.1));
        assert_eq!(state.output, OutputState::Configuring);
    }

    #[tokio::test]
    async fn test_invalid_setting_sends_nothing() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        let result = generator
            .set_parameters(&[sine(1000.0, 0.5), sine(-5.0, 0.5)], None)
            .await;
        assert!(matches!(
            result,
            Err(SigGenError::ParameterRange {
                parameter: "frequency",
                ..
            })
        ));
        assert!(instrument.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failure_mid_sequence_reports_progress() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        instrument.fail_after(1);
        let err = generator
            .set_parameters(
                &[sine(10.0, 1.0), WaveformSetting::Offset(0.2)],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SigGenError::Communication {
                stage: Stage::ParameterSet,
                completed: 1,
                total: 2,
                ..
            }
        ));

        let state = generator.channel_state(None).await;
        assert_eq!(state.mode, Some(WaveformMode::Sine));
        assert_eq!(state.offset, Some(0.0));
    }

    #[tokio::test]
    async fn test_single_value_rules() {
        let (generator, _instrument) = generator(PacingConfig::immediate());
        assert!(matches!(
            generator.set_single(Parameter::Phase, None, false, None).await,
            Err(SigGenError::MissingValue(Parameter::Phase))
        ));
        assert!(matches!(
            generator.set_single(Parameter::Phase, Some(1.0), true, None).await,
            Err(SigGenError::UnexpectedValue(Parameter::Phase))
        ));
    }

    #[tokio::test]
    async fn test_output_state_machine() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        assert_eq!(generator.output_state(None).await, OutputState::Off);

        generator
            .set_single(Parameter::Frequency, Some(10.0), false, None)
            .await
            .unwrap();
        assert_eq!(generator.output_state(None).await, OutputState::Configuring);

        generator.enable(None).await.unwrap();
        assert_eq!(generator.output_state(None).await, OutputState::On);

        generator
            .set_single(Parameter::Amplitude, Some(0.2), false, None)
            .await
            .unwrap();
        assert_eq!(generator.output_state(None).await, OutputState::On);

        assert_eq!(generator.toggle(None).await.unwrap(), OutputState::Off);
        assert_eq!(
            instrument.commands(),
            vec![":SOUR1:FREQ 10", ":OUTPut1 ON", ":SOUR1:VOLT 0.2", ":OUTPut1 OFF"]
        );
    }

    #[tokio::test]
    async fn test_select_channel() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        assert!(matches!(
            generator.select_channel(0).await,
            Err(SigGenError::InvalidChannel(0))
        ));
        generator.select_channel(2).await.unwrap();
        generator.enable(None).await.unwrap();
        assert_eq!(instrument.commands(), vec![":OUTPut2 ON"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arbitrary_pacing() {
        let (generator, instrument) = generator(PacingConfig::default());
        let waveform = ArbitraryWaveform::new(vec![0.0, 1.0], 100);
        generator
            .upload_arbitrary(&waveform, None, &CancellationToken::new())
            .await
            .unwrap();

        let log = instrument.log();
        assert_eq!(log.len(), 4);
        assert!(log[1].at - log[0].at >= Duration::from_millis(100));
        assert!(log[2].at - log[1].at >= Duration::from_millis(100));
        // 2 / 100 sps = 20 ms per point
        assert!(log[3].at - log[2].at >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_arbitrary_cancel_stops_between_points() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        let waveform = ArbitraryWaveform::new(vec![0.0; 5], 1000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = generator
            .upload_arbitrary(&waveform, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SigGenError::Cancelled {
                stage: Stage::ArbitraryPoints,
                completed: 2,
                total: 7
            }
        ));
        assert_eq!(instrument.commands().len(), 2);
        let state = generator.channel_state(None).await;
        assert_eq!(state.mode, Some(WaveformMode::Arbitrary));
        assert!(state.arbitrary.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_follows_channel_mode() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        let cancel = CancellationToken::new();

        generator
            .set_parameters(
                &[WaveformSetting::Noise {
                    amplitude: 0.5,
                    offset: 0.1,
                }],
                None,
            )
            .await
            .unwrap();
        instrument.clear_log();
        generator
            .fade(&FadeRequest::fade_out(0.5, Duration::from_secs(1), 2.0), &cancel)
            .await
            .unwrap();
        assert_eq!(
            instrument.commands(),
            vec![":SOUR1:APPL:NOIS 0.5,0.1", ":SOUR1:APPL:NOIS 0.002,0.1"]
        );

        generator
            .set_parameters(&[WaveformSetting::Dc { amplitude: 1.0 }], Some(Channel::Two))
            .await
            .unwrap();
        instrument.clear_log();
        generator
            .fade(
                &FadeRequest::fade_in(1.0, Duration::from_secs(1), 2.0).on(Channel::Two),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(
            levels(&instrument.commands(), ":SOUR2:VOLT:OFFS "),
            vec![0.002, 1.0]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_cancel_reports_progress() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            trigger.cancel();
        });

        let err = generator
            .fade(&FadeRequest::fade_in(1.0, Duration::from_secs(2), 2.0), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SigGenError::Cancelled {
                stage: Stage::Fade,
                completed: 2,
                total: 4
            }
        ));
        assert_eq!(instrument.commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stimulation_sequence() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        let session = Stimulation::new(1.0, Duration::from_secs(3)).with_fade(Duration::from_secs(1), 2.0);
        generator
            .stimulate(&session, &CancellationToken::new())
            .await
            .unwrap();

        let commands = instrument.commands();
        assert_eq!(commands.first().map(String::as_str), Some(":SOUR1:VOLT 0.002"));
        assert_eq!(commands[1], ":OUTPut1 ON");
        assert_eq!(commands.last().map(String::as_str), Some(":OUTPut1 OFF"));
        assert_eq!(levels(&commands, ":SOUR1:VOLT "), vec![0.002, 0.002, 1.0, 1.0, 0.002]);
        assert_eq!(generator.output_state(None).await, OutputState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stimulation_cancel_during_hold_leaves_output_on() {
        let (generator, _instrument) = generator(PacingConfig::immediate());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let err = generator
            .stimulate(&Stimulation::new(0.5, Duration::from_secs(10)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SigGenError::Cancelled {
                stage: Stage::Hold,
                completed: 2,
                total: 10
            }
        ));
        assert_eq!(generator.output_state(None).await, OutputState::On);
    }

    #[tokio::test]
    async fn test_status_and_reset() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        generator
            .set_parameters(&[sine(1000.0, 0.5)], None)
            .await
            .unwrap();

        let status = generator.status().await.unwrap();
        assert_eq!(status[0], (Channel::One, "\"SIN,1000,0.5,0,0\"".to_string()));
        assert_eq!(status[1].0, Channel::Two);

        assert_eq!(generator.reset().await.unwrap(), "1");
        assert_eq!(generator.channel_state(None).await, ChannelState::default());
        assert_eq!(instrument.commands().last().map(String::as_str), Some("*RST;*CLS;*OPC?"));
    }

    #[tokio::test]
    async fn test_failed_reupload_forgets_previous_waveform() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        let cancel = CancellationToken::new();
        let first = ArbitraryWaveform::new(vec![0.0, 1.0], 1000);
        generator
            .upload_arbitrary(&first, None, &cancel)
            .await
            .unwrap();
        assert_eq!(generator.channel_state(None).await.arbitrary, Some(first));

        // Mode switch goes through, point allocation fails.
        instrument.fail_after(1);
        let second = ArbitraryWaveform::new(vec![0.5, -0.5, 0.25], 2000);
        let err = generator
            .upload_arbitrary(&second, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SigGenError::Communication {
                stage: Stage::ArbitraryAllocate,
                ..
            }
        ));

        let state = generator.channel_state(None).await;
        assert_eq!(state.mode, Some(WaveformMode::Arbitrary));
        assert!(state.arbitrary.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_assumed_mode_picks_fade_path() {
        let (generator, instrument) = generator(PacingConfig::immediate());
        let cancel = CancellationToken::new();

        generator.assume_mode(None, WaveformMode::Dc, None).await;
        generator
            .fade(&FadeRequest::fade_in(1.0, Duration::from_secs(1), 2.0), &cancel)
            .await
            .unwrap();
        assert_eq!(
            instrument.commands(),
            vec![":SOUR1:VOLT:OFFS 0.002", ":SOUR1:VOLT:OFFS 1"]
        );

        instrument.clear_log();
        generator
            .assume_mode(Some(Channel::Two), WaveformMode::Noise, Some(0.3))
            .await;
        generator
            .fade(
                &FadeRequest::fade_out(0.4, Duration::from_secs(1), 2.0).on(Channel::Two),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(
            instrument.commands(),
            vec![":SOUR2:APPL:NOIS 0.4,0.3", ":SOUR2:APPL:NOIS 0.002,0.3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_facades_sharing_a_device_do_not_interleave() {
        let instrument = SimulatedInstrument::default();
        let backend = MockBackend::new().with_endpoint("/dev/usbtmc0", instrument.clone());
        let connector = Connector::new(Arc::new(backend));
        let first = SignalGenerator::new(connector.connect_location("/dev/usbtmc0").await.unwrap());
        let second = SignalGenerator::new(connector.connect_location("/dev/usbtmc0").await.unwrap());
        let waveform = ArbitraryWaveform::new(vec![0.0, 1.0, -1.0, 2.0], 1000);
        let cancel = CancellationToken::new();

        let (one, two) = tokio::join!(
            first.upload_arbitrary(&waveform, Some(Channel::One), &cancel),
            second.upload_arbitrary(&waveform, Some(Channel::Two), &cancel),
        );
        one.unwrap();
        two.unwrap();

        let commands = instrument.commands();
        assert_eq!(commands.len(), 12);
        let (earlier, later) = commands.split_at(6);
        let header = &earlier[0][..":SOURn".len()];
        assert!(earlier.iter().all(|c| c.starts_with(header)), "{commands:?}");
        assert!(later.iter().all(|c| !c.starts_with(header)), "{commands:?}");
    }
}
