//! Transports to the instrument
//!
//! A [`Transport`] is one open channel to one instrument. Two real variants exist:
//! [`usbtmc`] writes SCPI text to a USBTMC character-device node, [`visa`] goes through
//! a VISA resource manager session. [`mock`] provides a simulated instrument used by
//! tests and by `siggen --protocol mock`.
//!
//! A [`Backend`] knows how to enumerate and open transports of one kind. Backends keep
//! a [`HandleRegistry`] so that opening a location that is already open returns the
//! existing handle instead of a second one.

pub mod mock;
pub mod usbtmc;
pub mod visa;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

use crate::error::{AppResult, SigGenError};

pub use mock::{MockBackend, MockTransport, SimulatedInstrument};
pub use usbtmc::{UsbtmcBackend, UsbtmcTransport};
pub use visa::{VisaBackend, VisaTransport};

/// Which transport backs a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// USBTMC character-device node, e.g. `/dev/usbtmc0`.
    #[serde(rename = "usbtmc", alias = "file_node")]
    FileNode,
    /// VISA resource manager session, e.g. `USB0::0x1AB1::0x0642::DG1ZA0000::INSTR`.
    #[serde(rename = "visa", alias = "resource_manager")]
    ResourceManager,
}

impl TransportKind {
    /// Default transport for the operating system this binary runs on.
    pub fn for_host() -> AppResult<Self> {
        if cfg!(target_os = "linux") {
            Ok(TransportKind::FileNode)
        } else if cfg!(target_os = "windows") {
            Ok(TransportKind::ResourceManager)
        } else {
            Err(SigGenError::UnsupportedProtocol(format!(
                "no default transport for operating system '{}'",
                std::env::consts::OS
            )))
        }
    }

    /// Protocol name as written in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::FileNode => "usbtmc",
            TransportKind::ResourceManager => "visa",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = SigGenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usbtmc" | "file_node" | "filenode" => Ok(TransportKind::FileNode),
            "visa" | "resource_manager" | "resourcemanager" => Ok(TransportKind::ResourceManager),
            other => Err(SigGenError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Exclusive-operation lock shared by every transport on one device.
///
/// Holding it across a multi-command sequence keeps other drivers opened on the
/// same location from interleaving their commands with it.
pub type DeviceLock = Arc<tokio::sync::Mutex<()>>;

/// Opaque identity of an open OS resource (file descriptor or VISA session).
///
/// Two transports with equal handles share the same underlying resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(usize);

impl TransportHandle {
    /// Identity of the resource owned by `shared`.
    pub fn of<T>(shared: &Arc<T>) -> Self {
        TransportHandle(Arc::as_ptr(shared) as *const () as usize)
    }
}

/// One open channel to an instrument.
///
/// Every call is a full blocking round trip from the caller's point of view;
/// commands are never pipelined.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Path or resource string this transport was opened from.
    fn location(&self) -> &str;

    /// Identity of the underlying resource.
    fn handle(&self) -> TransportHandle;

    /// Operation lock of the underlying resource, shared with every transport
    /// that has the same [`handle`](Self::handle).
    fn operation_lock(&self) -> DeviceLock;

    /// Send one SCPI command.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Read at most `max_length` bytes of reply.
    async fn read(&mut self, max_length: usize) -> AppResult<Vec<u8>>;

    /// Write `command`, then read its reply.
    async fn query(&mut self, command: &str, max_length: usize) -> AppResult<Vec<u8>> {
        self.write(command).await?;
        self.read(max_length).await
    }
}

/// Enumerates and opens transports of one kind.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Transport kind this backend opens.
    fn kind(&self) -> TransportKind;

    /// Candidate locations, in the backend's enumeration order.
    async fn enumerate(&self) -> AppResult<Vec<String>>;

    /// Open `location`, reusing a live handle to the same device if one exists.
    ///
    /// # Errors
    /// - `Configuration` if the location does not exist
    /// - `AccessDenied` if it exists but cannot be opened for read/write
    async fn open(&self, location: &str) -> AppResult<Box<dyn Transport>>;

    /// Human-readable access rights of `location`, for diagnostics.
    async fn describe_access(&self, _location: &str) -> Option<String> {
        None
    }
}

/// Map of resolved device locations to live handles.
///
/// Entries are weak: once every transport sharing a handle is dropped, the
/// resource is released and the next open creates a fresh one.
pub struct HandleRegistry<H> {
    open: Mutex<HashMap<String, Weak<H>>>,
}

impl<H> HandleRegistry<H> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live handle for `key`, or create one with `open`.
    ///
    /// The boolean is true when an existing handle was reused.
    pub fn get_or_open<F>(&self, key: &str, open: F) -> AppResult<(Arc<H>, bool)>
    where
        F: FnOnce() -> AppResult<H>,
    {
        let mut handles = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|_, handle| handle.strong_count() > 0);

        if let Some(existing) = handles.get(key).and_then(Weak::upgrade) {
            debug!(location = key, "Reusing existing device handle");
            return Ok((existing, true));
        }

        let handle = Arc::new(open()?);
        handles.insert(key.to_string(), Arc::downgrade(&handle));
        debug!(location = key, "Opened new device handle");
        Ok((handle, false))
    }

    /// Number of handles currently alive.
    pub fn live_count(&self) -> usize {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| handle.strong_count() > 0)
            .count()
    }
}

impl<H> Default for HandleRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a raw reply: lossy UTF-8, NUL padding and surrounding whitespace removed.
pub fn reply_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}
