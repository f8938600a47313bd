//! USBTMC device-node transport
//!
//! On Linux the `usbtmc` kernel driver exposes each instrument as a character
//! device (`/dev/usbtmc0`, `/dev/usbtmc1`, ...). Commands are plain bytes written
//! to the node and replies are read back from it.
//!
//! File I/O on a device node blocks, so every operation runs on tokio's blocking
//! pool, the same way the VISA adapter offloads its calls.

use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

use super::{Backend, DeviceLock, HandleRegistry, Transport, TransportHandle, TransportKind};
use crate::error::{AppResult, SigGenError};

/// Prefix of USBTMC device node names.
pub const NODE_PREFIX: &str = "usbtmc";

/// An open device node, shared by every transport opened on the same device.
#[derive(Debug)]
pub struct NodeHandle {
    path: PathBuf,
    file: Mutex<File>,
    operation: DeviceLock,
}

impl NodeHandle {
    /// Canonical path of the node.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Enumerates and opens `<port_root>/usbtmc*` nodes.
pub struct UsbtmcBackend {
    port_root: PathBuf,
    terminator: String,
    registry: Arc<HandleRegistry<NodeHandle>>,
}

impl UsbtmcBackend {
    /// Backend listing nodes under `port_root` (normally `/dev`).
    pub fn new(port_root: impl Into<PathBuf>) -> Self {
        Self {
            port_root: port_root.into(),
            terminator: String::new(),
            registry: Arc::new(HandleRegistry::new()),
        }
    }

    /// Bytes appended to every command before it is written.
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Directory scanned for device nodes.
    pub fn port_root(&self) -> &Path {
        &self.port_root
    }

    /// Open handles, keyed by canonical path.
    pub fn registry(&self) -> &HandleRegistry<NodeHandle> {
        &self.registry
    }

    /// All `usbtmc*` entries under the port root, sorted by name.
    pub fn available_ports(&self) -> AppResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.port_root).map_err(|e| {
            SigGenError::Configuration(format!(
                "Cannot list port root {}: {e}",
                self.port_root.display()
            ))
        })?;

        let mut ports = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(NODE_PREFIX)
            {
                ports.push(entry.path());
            }
        }
        ports.sort();
        Ok(ports)
    }
}

fn open_node(registry: &HandleRegistry<NodeHandle>, path: &Path) -> AppResult<Arc<NodeHandle>> {
    let location = path.display().to_string();
    if !path.exists() {
        return Err(SigGenError::Configuration(format!(
            "Device path {location} does not exist"
        )));
    }

    // Symlinks and relative paths to the same node share one handle.
    let resolved = fs::canonicalize(path)?;
    let key = resolved.display().to_string();

    let (node, _reused) = registry.get_or_open(&key, || {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&resolved)
            .map_err(|source| match source.kind() {
                ErrorKind::PermissionDenied => SigGenError::AccessDenied {
                    location: location.clone(),
                },
                ErrorKind::NotFound => SigGenError::Configuration(format!(
                    "Device path {location} does not exist"
                )),
                _ => SigGenError::Transport {
                    location: location.clone(),
                    source,
                },
            })?;
        Ok(NodeHandle {
            path: resolved.clone(),
            file: Mutex::new(file),
            operation: DeviceLock::default(),
        })
    })?;

    Ok(node)
}

#[cfg(unix)]
fn access_mode(metadata: &fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn access_mode(metadata: &fs::Metadata) -> String {
    if metadata.permissions().readonly() {
        "read-only".to_string()
    } else {
        "read-write".to_string()
    }
}

fn join_failure(location: &str, err: tokio::task::JoinError) -> SigGenError {
    SigGenError::Transport {
        location: location.to_string(),
        source: std::io::Error::other(format!("I/O task failed: {err}")),
    }
}

#[async_trait]
impl Backend for UsbtmcBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::FileNode
    }

    async fn enumerate(&self) -> AppResult<Vec<String>> {
        let ports = self.available_ports()?;
        debug!(root = %self.port_root.display(), count = ports.len(), "Enumerated USBTMC nodes");
        Ok(ports
            .into_iter()
            .map(|path| path.display().to_string())
            .collect())
    }

    async fn open(&self, location: &str) -> AppResult<Box<dyn Transport>> {
        let registry = Arc::clone(&self.registry);
        let path = PathBuf::from(location);
        let node = tokio::task::spawn_blocking(move || open_node(&registry, &path))
            .await
            .map_err(|e| join_failure(location, e))??;

        debug!(location, handle = ?TransportHandle::of(&node), "USBTMC node open");
        Ok(Box::new(UsbtmcTransport {
            node,
            location: location.to_string(),
            terminator: self.terminator.clone(),
        }))
    }

    async fn describe_access(&self, location: &str) -> Option<String> {
        fs::metadata(location).ok().map(|m| access_mode(&m))
    }
}

/// Transport over an open USBTMC device node.
pub struct UsbtmcTransport {
    node: Arc<NodeHandle>,
    location: String,
    terminator: String,
}

impl UsbtmcTransport {
    async fn with_file<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut File) -> std::io::Result<T> + Send + 'static,
    {
        let node = Arc::clone(&self.node);
        let result = tokio::task::spawn_blocking(move || {
            let mut file = node.file.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut file)
        })
        .await
        .map_err(|e| join_failure(&self.location, e))?;

        result.map_err(|source| SigGenError::Transport {
            location: self.location.clone(),
            source,
        })
    }

    fn payload(&self, command: &str) -> Vec<u8> {
        format!("{command}{}", self.terminator).into_bytes()
    }
}

fn read_reply(file: &mut File, max_length: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max_length];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

#[async_trait]
impl Transport for UsbtmcTransport {
    fn location(&self) -> &str {
        &self.location
    }

    fn handle(&self) -> TransportHandle {
        TransportHandle::of(&self.node)
    }

    fn operation_lock(&self) -> DeviceLock {
        Arc::clone(&self.node.operation)
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        trace!(location = %self.location, command, "USBTMC write");
        let payload = self.payload(command);
        self.with_file(move |file| {
            file.write_all(&payload)?;
            file.flush()
        })
        .await
    }

    async fn read(&mut self, max_length: usize) -> AppResult<Vec<u8>> {
        let reply = self
            .with_file(move |file| read_reply(file, max_length))
            .await?;
        trace!(location = %self.location, bytes = reply.len(), "USBTMC read");
        Ok(reply)
    }

    async fn query(&mut self, command: &str, max_length: usize) -> AppResult<Vec<u8>> {
        trace!(location = %self.location, command, "USBTMC query");
        let payload = self.payload(command);
        // Write and read under one lock so a shared handle cannot interleave.
        self.with_file(move |file| {
            file.write_all(&payload)?;
            file.flush()?;
            read_reply(file, max_length)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_dev(names: &[&str]) -> TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in names {
            File::create(dir.path().join(name)).expect("create node");
        }
        dir
    }

    #[test]
    fn test_available_ports_filters_and_sorts() {
        let dir = fake_dev(&["usbtmc1", "ttyS0", "usbtmc0", "null"]);
        let backend = UsbtmcBackend::new(dir.path());
        let ports = backend.available_ports().unwrap();
        assert_eq!(
            ports,
            vec![dir.path().join("usbtmc0"), dir.path().join("usbtmc1")]
        );
    }

    #[test]
    fn test_missing_port_root_is_configuration_error() {
        let backend = UsbtmcBackend::new("/nonexistent/port/root");
        assert!(matches!(
            backend.available_ports(),
            Err(SigGenError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_path_is_configuration_error() {
        let dir = fake_dev(&[]);
        let backend = UsbtmcBackend::new(dir.path());
        let missing = dir.path().join("usbtmc9");
        let result = backend.open(&missing.display().to_string()).await;
        assert!(matches!(result, Err(SigGenError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_duplicate_open_shares_handle() {
        let dir = fake_dev(&["usbtmc0"]);
        let backend = UsbtmcBackend::new(dir.path());
        let location = dir.path().join("usbtmc0").display().to_string();

        let first = backend.open(&location).await.unwrap();
        let second = backend.open(&location).await.unwrap();
        assert_eq!(first.handle(), second.handle());
        assert!(Arc::ptr_eq(&first.operation_lock(), &second.operation_lock()));
        assert_eq!(backend.registry().live_count(), 1);

        drop(first);
        drop(second);
        assert_eq!(backend.registry().live_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_resolves_to_same_handle() {
        let dir = fake_dev(&["usbtmc0"]);
        let link = dir.path().join("instrument");
        std::os::unix::fs::symlink(dir.path().join("usbtmc0"), &link).unwrap();

        let backend = UsbtmcBackend::new(dir.path());
        let direct = backend
            .open(&dir.path().join("usbtmc0").display().to_string())
            .await
            .unwrap();
        let linked = backend.open(&link.display().to_string()).await.unwrap();
        assert_eq!(direct.handle(), linked.handle());
    }

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let dir = fake_dev(&["usbtmc0"]);
        let backend = UsbtmcBackend::new(dir.path()).with_terminator("\n");
        let path = dir.path().join("usbtmc0");

        let mut transport = backend.open(&path.display().to_string()).await.unwrap();
        transport.write(":OUTPut1 ON").await.unwrap();
        transport.write(":OUTPut1 OFF").await.unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, ":OUTPut1 ON\n:OUTPut1 OFF\n");
    }

    #[tokio::test]
    async fn test_query_on_silent_node_returns_empty_reply() {
        let dir = fake_dev(&["usbtmc0"]);
        let backend = UsbtmcBackend::new(dir.path());
        let mut transport = backend
            .open(&dir.path().join("usbtmc0").display().to_string())
            .await
            .unwrap();
        let reply = transport.query("*IDN?", 100).await.unwrap();
        assert!(reply.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_describe_access_reports_octal_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = fake_dev(&["usbtmc0"]);
        let path = dir.path().join("usbtmc0");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        let backend = UsbtmcBackend::new(dir.path());
        let mode = backend.describe_access(&path.display().to_string()).await;
        assert_eq!(mode.as_deref(), Some("640"));
    }
}
