//! VISA resource-manager transport
//!
//! Supports any VISA resource string, e.g.:
//! - "USB0::0x1AB1::0x0642::DG1ZA000000001::INSTR" (USBTMC through VISA)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//! - "GPIB0::10::INSTR" (GPIB)
//!
//! VISA calls are synchronous, so they run on tokio's blocking pool. A query is
//! one write and one read performed under a single session lock, which maps to
//! VISA's ask-and-receive round trip.
//!
//! Requires the `instrument_visa` feature and a VISA runtime. Without the feature
//! every operation reports `FeatureNotEnabled`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{Backend, DeviceLock, HandleRegistry, Transport, TransportHandle, TransportKind};
use crate::error::{AppResult, SigGenError};

#[cfg(feature = "instrument_visa")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_visa")]
use std::sync::{Mutex, PoisonError};
#[cfg(feature = "instrument_visa")]
use tracing::{debug, trace};

/// Resource expression matching every instrument the resource manager knows.
pub const FIND_EXPRESSION: &str = "?*INSTR";

const FEATURE: &str = "instrument_visa";

/// An open VISA session, shared by every transport opened on the same resource.
pub struct VisaSession {
    resource: String,
    #[cfg(feature = "instrument_visa")]
    instrument: Mutex<visa_rs::Instrument>,
    operation: DeviceLock,
}

impl VisaSession {
    /// Resource string the session was opened with.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// Enumerates and opens VISA resources.
pub struct VisaBackend {
    timeout: Duration,
    terminator: String,
    registry: Arc<HandleRegistry<VisaSession>>,
}

impl VisaBackend {
    /// Create a backend with the given open timeout and `"\n"` terminator.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            terminator: "\n".to_string(),
            registry: Arc::new(HandleRegistry::new()),
        }
    }

    /// Set line terminator for commands
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Open timeout passed to the resource manager.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(feature = "instrument_visa")]
fn visa_failure(location: &str, err: impl std::fmt::Display) -> SigGenError {
    SigGenError::Transport {
        location: location.to_string(),
        source: std::io::Error::other(err.to_string()),
    }
}

#[cfg(feature = "instrument_visa")]
fn resource_id(resource: &str) -> AppResult<visa_rs::VisaString> {
    let c_string = std::ffi::CString::new(resource).map_err(|_| {
        SigGenError::Configuration(format!("Resource string {resource:?} contains NUL"))
    })?;
    Ok(visa_rs::VisaString::from(c_string))
}

#[cfg(feature = "instrument_visa")]
fn list_resources() -> AppResult<Vec<String>> {
    use visa_rs::DefaultRM;

    let rm = DefaultRM::new().map_err(|e| visa_failure("resource manager", e))?;
    let expr = resource_id(FIND_EXPRESSION)?;
    let mut list = match rm.find_res_list(&expr) {
        Ok(list) => list,
        // VISA reports "resource not found" as an error; that is an empty bus.
        Err(e) => {
            debug!(error = %e, "VISA resource search returned nothing");
            return Ok(Vec::new());
        }
    };

    let mut resources = Vec::new();
    while let Some(resource) = list
        .find_next()
        .map_err(|e| visa_failure("resource manager", e))?
    {
        resources.push(resource.to_string());
    }
    Ok(resources)
}

#[cfg(feature = "instrument_visa")]
fn open_session(
    registry: &HandleRegistry<VisaSession>,
    resource: &str,
    timeout: Duration,
) -> AppResult<Arc<VisaSession>> {
    use visa_rs::{AccessMode, DefaultRM};

    let (session, _reused) = registry.get_or_open(resource, || {
        let rm = DefaultRM::new().map_err(|e| visa_failure(resource, e))?;
        let id = resource_id(resource)?;
        let instrument = rm
            .open(&id, AccessMode::NO_LOCK, timeout)
            .map_err(|e| {
                SigGenError::Configuration(format!("Failed to open VISA resource {resource}: {e}"))
            })?;
        Ok(VisaSession {
            resource: resource.to_string(),
            instrument: Mutex::new(instrument),
            operation: DeviceLock::default(),
        })
    })?;
    Ok(session)
}

#[async_trait]
impl Backend for VisaBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::ResourceManager
    }

    #[cfg(feature = "instrument_visa")]
    async fn enumerate(&self) -> AppResult<Vec<String>> {
        let resources = tokio::task::spawn_blocking(list_resources)
            .await
            .map_err(|e| visa_failure("resource manager", e))??;
        debug!(count = resources.len(), "Enumerated VISA resources");
        Ok(resources)
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn enumerate(&self) -> AppResult<Vec<String>> {
        Err(SigGenError::FeatureNotEnabled(FEATURE.to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    async fn open(&self, location: &str) -> AppResult<Box<dyn Transport>> {
        let registry = Arc::clone(&self.registry);
        let resource = location.to_string();
        let timeout = self.timeout;
        let session =
            tokio::task::spawn_blocking(move || open_session(&registry, &resource, timeout))
                .await
                .map_err(|e| visa_failure(location, e))??;

        debug!(
            resource = location,
            timeout_ms = self.timeout.as_millis() as u64,
            "VISA resource open"
        );
        Ok(Box::new(VisaTransport {
            session,
            terminator: self.terminator.clone(),
        }))
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn open(&self, _location: &str) -> AppResult<Box<dyn Transport>> {
        Err(SigGenError::FeatureNotEnabled(FEATURE.to_string()))
    }
}

/// Transport over an open VISA session.
pub struct VisaTransport {
    session: Arc<VisaSession>,
    terminator: String,
}

#[cfg(feature = "instrument_visa")]
impl VisaTransport {
    async fn with_instrument<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&visa_rs::Instrument) -> std::io::Result<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let location = self.session.resource.clone();
        let result = tokio::task::spawn_blocking(move || {
            let instrument = session
                .instrument
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            op(&instrument)
        })
        .await
        .map_err(|e| visa_failure(&location, e))?;

        result.map_err(|source| SigGenError::Transport { location, source })
    }
}

#[cfg(feature = "instrument_visa")]
fn read_reply(mut instrument: &visa_rs::Instrument, max_length: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max_length];
    let n = instrument.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[async_trait]
impl Transport for VisaTransport {
    fn location(&self) -> &str {
        &self.session.resource
    }

    fn handle(&self) -> TransportHandle {
        TransportHandle::of(&self.session)
    }

    fn operation_lock(&self) -> DeviceLock {
        Arc::clone(&self.session.operation)
    }

    #[cfg(feature = "instrument_visa")]
    async fn write(&mut self, command: &str) -> AppResult<()> {
        trace!(resource = %self.session.resource, command, "VISA write");
        let payload = format!("{command}{}", self.terminator).into_bytes();
        self.with_instrument(move |mut instrument| instrument.write_all(&payload))
            .await
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn write(&mut self, _command: &str) -> AppResult<()> {
        let _ = &self.terminator;
        Err(SigGenError::FeatureNotEnabled(FEATURE.to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    async fn read(&mut self, max_length: usize) -> AppResult<Vec<u8>> {
        self.with_instrument(move |instrument| read_reply(instrument, max_length))
            .await
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn read(&mut self, _max_length: usize) -> AppResult<Vec<u8>> {
        Err(SigGenError::FeatureNotEnabled(FEATURE.to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    async fn query(&mut self, command: &str, max_length: usize) -> AppResult<Vec<u8>> {
        trace!(resource = %self.session.resource, command, "VISA query");
        let payload = format!("{command}{}", self.terminator).into_bytes();
        self.with_instrument(move |mut instrument| {
            instrument.write_all(&payload)?;
            read_reply(instrument, max_length)
        })
        .await
    }
}
