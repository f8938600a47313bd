//! Instrument discovery and connection
//!
//! [`Connector`] enumerates the endpoints of one transport kind, asks each for
//! its identity and opens [`Driver`]s. Opening goes through a single access-repair
//! step: when a device node is not writable the connector asks its
//! [`AccessElevator`] for access once and retries the open once.
//!
//! ```no_run
//! # async fn demo() -> scpi_siggen::AppResult<()> {
//! use scpi_siggen::{Connector, SigGenConfig};
//!
//! let config = SigGenConfig::load()?;
//! let connector = Connector::from_config(&config)?;
//! let devices = connector.discover().await?;
//! let mut driver = connector.connect(&devices[0]).await?;
//! println!("{}", driver.identity().await?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ConnectionConfig, SigGenConfig};
use crate::error::{AppResult, SigGenError};
use crate::transport::{
    reply_text, Backend, DeviceLock, Transport, TransportHandle, TransportKind, UsbtmcBackend,
    VisaBackend,
};

/// Identity shown for endpoints that do not answer `*IDN?`.
pub const UNCONTROLLABLE: &str = "Uncontrollable via SCPI commands, not target device";

/// Identity query.
pub const IDENTITY_QUERY: &str = "*IDN?";

/// Reset, clear status and wait for completion.
pub const RESET_COMMAND: &str = "*RST;*CLS;*OPC?";

const DEFAULT_READ_LENGTH: usize = 100;
const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_millis(500);

/// What an endpoint reported when asked for its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceIdentity {
    /// Reply to `*IDN?`.
    Instrument(String),
    /// The endpoint could not be opened, did not reply, or replied with nothing.
    Uncontrollable,
}

impl DeviceIdentity {
    /// True when the endpoint answered with a non-empty identity.
    pub fn is_controllable(&self) -> bool {
        matches!(self, DeviceIdentity::Instrument(_))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentity::Instrument(id) => f.write_str(id),
            DeviceIdentity::Uncontrollable => f.write_str(UNCONTROLLABLE),
        }
    }
}

/// One endpoint found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Position in the discovery listing, starting at 0.
    pub display_id: usize,
    /// Device path or VISA resource string.
    pub location: String,
    /// Identity reply, or uncontrollable.
    pub identity: DeviceIdentity,
    /// Transport the endpoint was found on.
    pub kind: TransportKind,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.display_id, self.location, self.identity)
    }
}

/// Grants read/write access to a device node.
#[async_trait]
pub trait AccessElevator: Send + Sync {
    /// Make `location` accessible. Called at most once per open.
    async fn elevate(&self, location: &str) -> AppResult<()>;
}

/// Runs an OS-native elevation program with the location appended.
///
/// The default is `pkexec chmod 0666 <node>`: polkit shows its own
/// authentication dialog and no credential ever passes through this process.
#[derive(Debug, Clone)]
pub struct CommandElevator {
    argv: Vec<String>,
}

impl CommandElevator {
    /// Program and leading arguments; the device location is appended.
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Default for CommandElevator {
    fn default() -> Self {
        Self::new(ConnectionConfig::default().elevation_command)
    }
}

#[async_trait]
impl AccessElevator for CommandElevator {
    async fn elevate(&self, location: &str) -> AppResult<()> {
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            SigGenError::Configuration("elevation_command cannot be empty".to_string())
        })?;

        info!(program = %program, location, "Requesting elevated access to device node");
        let status = tokio::process::Command::new(program)
            .args(args)
            .arg(location)
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            warn!(program = %program, location, code = ?status.code(), "Elevation command failed");
            Err(SigGenError::Permission {
                location: location.to_string(),
            })
        }
    }
}

/// Elevator that never grants access.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoElevation;

#[async_trait]
impl AccessElevator for NoElevation {
    async fn elevate(&self, location: &str) -> AppResult<()> {
        Err(SigGenError::Permission {
            location: location.to_string(),
        })
    }
}

/// A connected instrument.
///
/// Owns exactly one transport; dropping the driver releases its handle once no
/// other driver shares it.
pub struct Driver {
    transport: Box<dyn Transport>,
    kind: TransportKind,
    read_length: usize,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("location", &self.transport.location())
            .field("kind", &self.kind)
            .field("handle", &self.transport.handle())
            .finish()
    }
}

impl Driver {
    /// Driver owning `transport`, reading replies of up to 100 bytes.
    pub fn new(transport: Box<dyn Transport>, kind: TransportKind) -> Self {
        Self {
            transport,
            kind,
            read_length: DEFAULT_READ_LENGTH,
        }
    }

    /// Maximum reply length read after each query.
    /// Maximum reply length of the drivers this connector opens.
    pub fn with_read_length(mut self, read_length: usize) -> Self {
        self.read_length = read_length;
        self
    }

    /// Transport kind this driver was opened over.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Device path or resource string.
    pub fn location(&self) -> &str {
        self.transport.location()
    }

    /// Identity of the shared OS resource.
    pub fn handle(&self) -> TransportHandle {
        self.transport.handle()
    }

    /// Lock serializing command sequences across every driver on this device.
    pub fn operation_lock(&self) -> DeviceLock {
        self.transport.operation_lock()
    }

    /// Send one command.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        trace!(location = %self.transport.location(), command, "SCPI write");
        self.transport.write(command).await
    }

    /// Read one raw reply.
    pub async fn read(&mut self) -> AppResult<Vec<u8>> {
        self.transport.read(self.read_length).await
    }

    /// Send `command` and read its raw reply.
    pub async fn query(&mut self, command: &str) -> AppResult<Vec<u8>> {
        trace!(location = %self.transport.location(), command, "SCPI query");
        self.transport.query(command, self.read_length).await
    }

    /// Query and decode the reply as trimmed text.
    pub async fn query_text(&mut self, command: &str) -> AppResult<String> {
        let raw = self.query(command).await?;
        Ok(reply_text(&raw))
    }

    /// The instrument's `*IDN?` reply, trimmed.
    pub async fn identity(&mut self) -> AppResult<String> {
        self.query_text(IDENTITY_QUERY).await
    }

    /// Reset the instrument and return its completion reply.
    ///
    /// The reply is read only after `settle`, since the instrument does not
    /// answer while it is resetting.
    pub async fn reset(&mut self, settle: Duration) -> AppResult<String> {
        self.write(RESET_COMMAND).await?;
        tokio::time::sleep(settle).await;
        let raw = self.read().await?;
        let reply = reply_text(&raw);
        info!(location = %self.location(), reply = %reply, "Instrument reset");
        Ok(reply)
    }
}

/// The backend matching `kind`, configured from `connection`.
pub fn backend_for(kind: TransportKind, connection: &ConnectionConfig) -> Arc<dyn Backend> {
    match kind {
        TransportKind::FileNode => Arc::new(
            UsbtmcBackend::new(connection.port_root.clone())
                .with_terminator(connection.terminator.clone()),
        ),
        TransportKind::ResourceManager => Arc::new(VisaBackend::new(connection.visa_timeout())),
    }
}

/// Finds instruments and opens drivers on one backend.
pub struct Connector {
    backend: Arc<dyn Backend>,
    elevator: Arc<dyn AccessElevator>,
    identity_timeout: Duration,
    read_length: usize,
}

impl Connector {
    /// Connector with the default elevator and timeouts.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            elevator: Arc::new(CommandElevator::default()),
            identity_timeout: DEFAULT_IDENTITY_TIMEOUT,
            read_length: DEFAULT_READ_LENGTH,
        }
    }

    /// Connector for the configured (or host default) transport.
    pub fn from_config(config: &SigGenConfig) -> AppResult<Self> {
        let connection = &config.connection;
        let kind = connection.transport_kind()?;
        debug!(protocol = %kind, "Creating connector");
        Ok(Self::new(backend_for(kind, connection))
            .with_elevator(Arc::new(CommandElevator::new(
                connection.elevation_command.clone(),
            )))
            .with_identity_timeout(connection.identity_timeout())
            .with_read_length(connection.read_length))
    }

    /// Use `elevator` when a device node is not writable.
    pub fn with_elevator(mut self, elevator: Arc<dyn AccessElevator>) -> Self {
        self.elevator = elevator;
        self
    }

    /// How long discovery waits for an `*IDN?` reply.
    pub fn with_identity_timeout(mut self, timeout: Duration) -> Self {
        self.identity_timeout = timeout;
        self
    }

    pub fn with_read_length(mut self, read_length: usize) -> Self {
        self.read_length = read_length;
        self
    }

    /// Transport kind of the backend.
    pub fn kind(&self) -> TransportKind {
        self.backend.kind()
    }

    /// Open `location`, repairing access once if the node is not writable.
    async fn open_transport(&self, location: &str) -> AppResult<Box<dyn Transport>> {
        match self.backend.open(location).await {
            Err(SigGenError::AccessDenied { .. }) => {}
            other => return other,
        }

        let mode = self.backend.describe_access(location).await;
        warn!(
            location,
            mode = mode.as_deref().unwrap_or("unknown"),
            "Device not writable, requesting elevated access"
        );

        if let Err(err) = self.elevator.elevate(location).await {
            warn!(location, error = %err, "Access elevation failed");
            return Err(SigGenError::Permission {
                location: location.to_string(),
            });
        }

        match self.backend.open(location).await {
            Err(SigGenError::AccessDenied { .. }) => Err(SigGenError::Permission {
                location: location.to_string(),
            }),
            other => other,
        }
    }

    fn driver(&self, transport: Box<dyn Transport>) -> Driver {
        Driver::new(transport, self.backend.kind()).with_read_length(self.read_length)
    }

    /// Ask one endpoint for its identity. Every failure maps to `Uncontrollable`.
    async fn identify(&self, location: &str) -> DeviceIdentity {
        let mut driver = match self.open_transport(location).await {
            Ok(transport) => self.driver(transport),
            Err(err) => {
                warn!(location, error = %err, "Cannot open endpoint");
                return DeviceIdentity::Uncontrollable;
            }
        };

        let reply = tokio::time::timeout(self.identity_timeout, driver.identity())
            .await
            .unwrap_or_else(|_| {
                Err(SigGenError::Timeout {
                    location: location.to_string(),
                    timeout_ms: self.identity_timeout.as_millis() as u64,
                })
            });

        match reply {
            Ok(id) if !id.is_empty() => DeviceIdentity::Instrument(id),
            Ok(_) => {
                warn!(location, "Endpoint returned an empty identity");
                DeviceIdentity::Uncontrollable
            }
            Err(err) => {
                warn!(location, error = %err, "Endpoint did not answer identity query");
                DeviceIdentity::Uncontrollable
            }
        }
    }

    /// List every endpoint of this connector's transport kind.
    ///
    /// Endpoints that cannot be controlled are listed as
    /// [`DeviceIdentity::Uncontrollable`], never dropped. Each endpoint's
    /// transport is released before the next one is opened.
    #[instrument(skip(self), fields(protocol = %self.backend.kind()))]
    pub async fn discover(&self) -> AppResult<Vec<DeviceDescriptor>> {
        let locations = self.backend.enumerate().await?;
        let mut devices = Vec::with_capacity(locations.len());

        for (display_id, location) in locations.into_iter().enumerate() {
            let identity = self.identify(&location).await;
            debug!(display_id, location = %location, identity = %identity, "Identified endpoint");
            devices.push(DeviceDescriptor {
                display_id,
                location,
                identity,
                kind: self.backend.kind(),
            });
        }

        info!(
            count = devices.len(),
            controllable = devices.iter().filter(|d| d.identity.is_controllable()).count(),
            "Discovery complete"
        );
        Ok(devices)
    }

    /// Connect to a discovered endpoint.
    pub async fn connect(&self, descriptor: &DeviceDescriptor) -> AppResult<Driver> {
        if descriptor.kind != self.backend.kind() {
            return Err(SigGenError::Configuration(format!(
                "{} was discovered over {}, this connector uses {}",
                descriptor.location,
                descriptor.kind,
                self.backend.kind()
            )));
        }
        self.connect_location(&descriptor.location).await
    }

    /// Connect to a device path or resource string directly.
    ///
    /// Connecting twice to the same resolved device shares one handle.
    pub async fn connect_location(&self, location: &str) -> AppResult<Driver> {
        let transport = self.open_transport(location).await?;
        let driver = self.driver(transport);
        info!(location, handle = ?driver.handle(), "Connected");
        Ok(driver)
    }

    /// Discover, let `picker` choose an index, and connect to it.
    ///
    /// # Errors
    /// `Configuration` when the picker returns `None` or an index outside the list.
    pub async fn connect_with<F>(&self, picker: F) -> AppResult<Driver>
    where
        F: FnOnce(&[DeviceDescriptor]) -> Option<usize>,
    {
        let devices = self.discover().await?;
        let choice = picker(&devices).ok_or_else(|| {
            SigGenError::Configuration("No device selected".to_string())
        })?;
        let descriptor = devices.get(choice).ok_or_else(|| {
            SigGenError::Configuration(format!(
                "Device index {choice} out of range (found {})",
                devices.len()
            ))
        })?;
        self.connect(descriptor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBackend, SimulatedInstrument};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[derive(Default)]
    struct CountingElevator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AccessElevator for CountingElevator {
        async fn elevate(&self, _location: &str) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn three_endpoints() -> MockBackend {
        MockBackend::new()
            .with_endpoint("/dev/usbtmc0", SimulatedInstrument::unresponsive())
            .with_endpoint("/dev/usbtmc1", SimulatedInstrument::default())
            .with_endpoint("/dev/usbtmc2", SimulatedInstrument::unresponsive())
    }

    #[tokio::test]
    async fn test_discovery_lists_every_endpoint() {
        let connector = Connector::new(Arc::new(three_endpoints()));
        let devices = connector.discover().await.unwrap();

        assert_eq!(devices.len(), 3);
        let controllable: Vec<_> = devices
            .iter()
            .filter(|d| d.identity.is_controllable())
            .collect();
        assert_eq!(controllable.len(), 1);
        assert_eq!(controllable[0].location, "/dev/usbtmc1");
        assert_eq!(devices[0].identity, DeviceIdentity::Uncontrollable);
        assert_eq!(devices[2].display_id, 2);
    }

    #[tokio::test]
    async fn test_empty_identity_is_uncontrollable() {
        let backend = MockBackend::new().with_endpoint("sim0", SimulatedInstrument::new(""));
        let devices = Connector::new(Arc::new(backend)).discover().await.unwrap();
        assert_eq!(devices[0].identity, DeviceIdentity::Uncontrollable);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_slow_identity_times_out_as_uncontrollable() {
        let backend = MockBackend::new()
            .with_endpoint(
                "slow",
                SimulatedInstrument::default().with_reply_delay(Duration::from_secs(2)),
            )
            .with_endpoint(
                "prompt",
                SimulatedInstrument::default().with_reply_delay(Duration::from_millis(100)),
            );
        let connector =
            Connector::new(Arc::new(backend)).with_identity_timeout(Duration::from_millis(500));

        let start = tokio::time::Instant::now();
        let devices = connector.discover().await.unwrap();

        assert_eq!(devices[0].identity, DeviceIdentity::Uncontrollable);
        assert!(devices[1].identity.is_controllable());
        assert!(logs_contain("Timed out"));
        assert!(logs_contain("500"));
        // The slow reply is abandoned at the timeout, not awaited.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_drivers_on_one_location_share_operation_lock() {
        let connector = Connector::new(Arc::new(three_endpoints()));
        let first = connector.connect_location("/dev/usbtmc1").await.unwrap();
        let second = connector.connect_location("/dev/usbtmc1").await.unwrap();
        let other = connector.connect_location("/dev/usbtmc0").await.unwrap();

        assert!(Arc::ptr_eq(&first.operation_lock(), &second.operation_lock()));
        assert!(!Arc::ptr_eq(&first.operation_lock(), &other.operation_lock()));
    }

    #[tokio::test]
    async fn test_access_repaired_once() {
        let backend = three_endpoints();
        backend.deny_access("/dev/usbtmc1", 1);
        let elevator = Arc::new(CountingElevator::default());
        let connector = Connector::new(Arc::new(backend.clone())).with_elevator(elevator.clone());

        let mut driver = connector.connect_location("/dev/usbtmc1").await.unwrap();
        assert!(driver.identity().await.unwrap().starts_with("RIGOL"));
        assert_eq!(elevator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.open_attempts("/dev/usbtmc1"), 2);
    }

    #[tokio::test]
    async fn test_second_denial_is_permission_error() {
        let backend = three_endpoints();
        backend.deny_access("/dev/usbtmc1", 2);
        let elevator = Arc::new(CountingElevator::default());
        let connector = Connector::new(Arc::new(backend.clone())).with_elevator(elevator.clone());

        let err = connector.connect_location("/dev/usbtmc1").await.unwrap_err();
        assert!(matches!(err, SigGenError::Permission { location } if location == "/dev/usbtmc1"));
        assert_eq!(elevator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.open_attempts("/dev/usbtmc1"), 2);
    }

    #[tokio::test]
    async fn test_refused_elevation_does_not_retry() {
        let backend = three_endpoints();
        backend.deny_access("/dev/usbtmc1", 1);
        let connector = Connector::new(Arc::new(backend.clone())).with_elevator(Arc::new(NoElevation));

        let err = connector.connect_location("/dev/usbtmc1").await.unwrap_err();
        assert!(matches!(err, SigGenError::Permission { .. }));
        assert_eq!(backend.open_attempts("/dev/usbtmc1"), 1);
    }

    #[tokio::test]
    async fn test_missing_location_is_configuration_error() {
        let connector = Connector::new(Arc::new(three_endpoints()));
        let err = connector.connect_location("/dev/usbtmc9").await.unwrap_err();
        assert!(matches!(err, SigGenError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_picker_out_of_range() {
        let connector = Connector::new(Arc::new(three_endpoints()));
        let err = connector.connect_with(|devices| Some(devices.len())).await.unwrap_err();
        assert!(matches!(err, SigGenError::Configuration(msg) if msg.contains("out of range")));

        let err = connector.connect_with(|_| None).await.unwrap_err();
        assert!(matches!(err, SigGenError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_picker_selects_identified_device() {
        let connector = Connector::new(Arc::new(three_endpoints()));
        let driver = connector
            .connect_with(|devices| devices.iter().position(|d| d.identity.is_controllable()))
            .await
            .unwrap();
        assert_eq!(driver.location(), "/dev/usbtmc1");
        assert_eq!(driver.kind(), TransportKind::FileNode);
    }

    #[tokio::test]
    async fn test_reset_reads_completion_after_settle() {
        let instrument = SimulatedInstrument::default();
        let backend = MockBackend::new().with_endpoint("sim0", instrument.clone());
        let mut driver = Connector::new(Arc::new(backend))
            .connect_location("sim0")
            .await
            .unwrap();

        let reply = driver.reset(Duration::ZERO).await.unwrap();
        assert_eq!(reply, "1");
        assert_eq!(instrument.commands(), vec![RESET_COMMAND]);
    }

    #[test]
    fn test_descriptor_display_marks_uncontrollable() {
        let descriptor = DeviceDescriptor {
            display_id: 0,
            location: "/dev/usbtmc0".into(),
            identity: DeviceIdentity::Uncontrollable,
            kind: TransportKind::FileNode,
        };
        assert_eq!(
            descriptor.to_string(),
            "[0] /dev/usbtmc0: Uncontrollable via SCPI commands, not target device"
        );
    }

    #[test]
    fn test_descriptor_serializes() {
        let descriptor = DeviceDescriptor {
            display_id: 1,
            location: "/dev/usbtmc1".into(),
            identity: DeviceIdentity::Instrument("RIGOL".into()),
            kind: TransportKind::FileNode,
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["identity"]["instrument"], "RIGOL");
        assert_eq!(json["kind"], "usbtmc");
    }
}
