//! Simulated instrument for testing
//!
//! [`SimulatedInstrument`] stands in for a signal generator without requiring
//! hardware. It provides:
//! - A command log with timestamps taken from tokio's clock, so paused-time tests
//!   can check pacing
//! - Echo of the last value set for any SCPI header (`:SOUR1:VOLT 0.5` then
//!   `:SOUR1:VOLT?` replies `0.5`)
//! - Controllable failure injection, reply latency and unresponsive endpoints
//!
//! [`MockBackend`] serves a fixed list of simulated endpoints for discovery tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::{Backend, DeviceLock, Transport, TransportHandle, TransportKind};
use crate::error::{AppResult, SigGenError};

/// One command received by the simulated instrument.
#[derive(Debug, Clone)]
pub struct LoggedCommand {
    /// Command text without terminator.
    pub command: String,
    /// Receive time on tokio's clock.
    pub at: Instant,
}

#[derive(Debug, Default)]
struct SimState {
    identity: Option<String>,
    log: Vec<LoggedCommand>,
    values: HashMap<String, String>,
    applied: HashMap<char, String>,
    replies: VecDeque<Vec<u8>>,
    fail_after: Option<usize>,
    reply_delay: Duration,
}

/// A simulated signal generator.
///
/// Cloning shares the same state, so a test can keep one clone for inspection
/// while the driver owns another.
#[derive(Clone, Debug)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<SimState>>,
    operation: DeviceLock,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new("RIGOL TECHNOLOGIES,DG1022Z,DG1ZA000000001,00.02.00")
    }
}

impl SimulatedInstrument {
    /// An instrument that answers `*IDN?` with `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                identity: Some(identity.into()),
                ..SimState::default()
            })),
            operation: DeviceLock::default(),
        }
    }

    /// An endpoint that accepts writes but never replies.
    pub fn unresponsive() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            operation: DeviceLock::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let `successful` more writes through, then fail every write after them.
    pub fn fail_after(&self, successful: usize) {
        let mut state = self.state();
        let already = state.log.len();
        state.fail_after = Some(already + successful);
    }

    /// Hold every read for `delay` before answering.
    pub fn with_reply_delay(self, delay: Duration) -> Self {
        self.state().reply_delay = delay;
        self
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.state().fail_after = None;
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().log.iter().map(|c| c.command.clone()).collect()
    }

    /// Every command with its receive time.
    pub fn log(&self) -> Vec<LoggedCommand> {
        self.state().log.clone()
    }

    /// Forget every logged command.
    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Last value written for a SCPI header such as `:SOUR1:VOLT`.
    pub fn value(&self, header: &str) -> Option<String> {
        self.state().values.get(header).cloned()
    }

    /// Identity shared by every clone of this instrument.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle::of(&self.state)
    }

    fn receive(&self, command: &str) -> std::io::Result<()> {
        let mut state = self.state();
        if let Some(limit) = state.fail_after {
            if state.log.len() >= limit {
                return Err(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "injected write failure",
                ));
            }
        }

        state.log.push(LoggedCommand {
            command: command.to_string(),
            at: Instant::now(),
        });

        if let Some(reply) = Self::reply_for(&mut state, command) {
            state.replies.push_back(reply.into_bytes());
        }
        Ok(())
    }

    fn reply_for(state: &mut SimState, command: &str) -> Option<String> {
        match command {
            "*IDN?" => return state.identity.as_ref().map(|id| format!("{id}\n")),
            "*RST;*CLS;*OPC?" => {
                state.values.clear();
                state.applied.clear();
                return state.identity.as_ref().map(|_| "1\n".to_string());
            }
            _ => {}
        }
        state.identity.as_ref()?;

        if let Some(header) = command.strip_suffix('?') {
            if let Some(channel) = header.strip_prefix(":SOURce").and_then(|rest| {
                rest.strip_suffix(":APPLy")
                    .and_then(|digits| digits.chars().next())
            }) {
                let applied = state.applied.get(&channel).cloned();
                return Some(format!(
                    "\"{}\"\n",
                    applied.unwrap_or_else(|| "SIN,1.000000E+03,1.000000E+00,0.000000E+00,0.000000E+00".into())
                ));
            }
            let value = state.values.get(header).cloned().unwrap_or_else(|| "0".into());
            return Some(format!("{value}\n"));
        }

        if let Some((header, value)) = command.split_once(' ') {
            state.values.insert(header.to_string(), value.to_string());
            if let Some((prefix, mode)) = header.split_once(":APPL:") {
                if let Some(channel) = prefix.chars().last() {
                    state.applied.insert(channel, format!("{mode},{value}"));
                }
            }
        }
        None
    }

    fn take_reply(&self, max_length: usize) -> std::io::Result<Vec<u8>> {
        let mut reply = self.state().replies.pop_front().ok_or_else(|| {
            std::io::Error::new(ErrorKind::TimedOut, "no reply pending")
        })?;
        reply.truncate(max_length);
        Ok(reply)
    }
}

/// Transport connected to a [`SimulatedInstrument`].
pub struct MockTransport {
    instrument: SimulatedInstrument,
    location: String,
}

impl MockTransport {
    /// Transport talking to `instrument`, reported as opened from `location`.
    pub fn new(instrument: SimulatedInstrument, location: impl Into<String>) -> Self {
        Self {
            instrument,
            location: location.into(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn location(&self) -> &str {
        &self.location
    }

    fn handle(&self) -> TransportHandle {
        self.instrument.handle()
    }

    fn operation_lock(&self) -> DeviceLock {
        Arc::clone(&self.instrument.operation)
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        trace!(location = %self.location, command, "Simulated write");
        self.instrument
            .receive(command)
            .map_err(|source| SigGenError::Transport {
                location: self.location.clone(),
                source,
            })
    }

    async fn read(&mut self, max_length: usize) -> AppResult<Vec<u8>> {
        let delay = self.instrument.state().reply_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.instrument
            .take_reply(max_length)
            .map_err(|source| SigGenError::Transport {
                location: self.location.clone(),
                source,
            })
    }
}

/// Backend serving a fixed set of simulated endpoints.
#[derive(Clone, Default)]
pub struct MockBackend {
    endpoints: Vec<(String, SimulatedInstrument)>,
    denials: Arc<Mutex<HashMap<String, usize>>>,
    opens: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockBackend {
    /// Backend without endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint at `location`.
    pub fn with_endpoint(mut self, location: impl Into<String>, instrument: SimulatedInstrument) -> Self {
        self.endpoints.push((location.into(), instrument));
        self
    }

    /// Refuse the next `times` opens of `location` with `AccessDenied`.
    pub fn deny_access(&self, location: &str, times: usize) {
        self.denials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(location.to_string(), times);
    }

    /// Number of open attempts made on `location`.
    pub fn open_attempts(&self, location: &str) -> usize {
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(location)
            .copied()
            .unwrap_or(0)
    }

    /// The instrument served at `location`.
    pub fn instrument(&self, location: &str) -> Option<SimulatedInstrument> {
        self.endpoints
            .iter()
            .find(|(loc, _)| loc == location)
            .map(|(_, instrument)| instrument.clone())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::FileNode
    }

    async fn enumerate(&self) -> AppResult<Vec<String>> {
        Ok(self.endpoints.iter().map(|(loc, _)| loc.clone()).collect())
    }

    async fn open(&self, location: &str) -> AppResult<Box<dyn Transport>> {
        *self
            .opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(location.to_string())
            .or_default() += 1;

        {
            let mut denials = self.denials.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(remaining) = denials.get_mut(location) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SigGenError::AccessDenied {
                        location: location.to_string(),
                    });
                }
            }
        }

        let instrument = self.instrument(location).ok_or_else(|| {
            SigGenError::Configuration(format!("Device path {location} does not exist"))
        })?;
        Ok(Box::new(MockTransport::new(instrument, location)))
    }

    async fn describe_access(&self, _location: &str) -> Option<String> {
        Some("600".to_string())
    }
}
