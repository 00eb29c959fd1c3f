//! Locating and launching kernels
//!
//! Running kernels are described by connection files in a Jupyter runtime
//! directory, named `kernel-<id>.json`. The proxy can either attach to one of
//! those or launch a kernel process itself.

use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionInfo;
use crate::error::{ProxyError, Result};
use crate::socket::SocketType;

/// A way of naming the kernel to proxy to
#[derive(Debug, Clone, PartialEq)]
pub enum KernelRef {
    /// Kernel id, resolved through a runtime directory
    Id(String),
    /// Path to a connection file
    File(PathBuf),
    Info(ConnectionInfo),
}

impl fmt::Display for KernelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelRef::Id(id) => write!(f, "{}", id),
            KernelRef::File(path) => write!(f, "{}", path.display()),
            KernelRef::Info(info) => write!(f, "{}", info.endpoint(SocketType::Shell)),
        }
    }
}

impl From<&str> for KernelRef {
    fn from(s: &str) -> Self {
        if s.ends_with(".json") {
            KernelRef::File(PathBuf::from(s))
        } else {
            KernelRef::Id(s.to_string())
        }
    }
}

impl From<ConnectionInfo> for KernelRef {
    fn from(info: ConnectionInfo) -> Self {
        KernelRef::Info(info)
    }
}

/// Resolves kernel references to connection details
pub trait KernelDirectory: Send + Sync {
    /// `Ok(None)` when the reference does not name a known kernel
    fn resolve(&self, kernel_ref: &KernelRef) -> Result<Option<ConnectionInfo>>;

    /// Ids of the kernels this directory knows about
    fn list(&self) -> Result<Vec<String>>;
}

/// Jupyter runtime directory
#[derive(Debug, Clone)]
pub struct RuntimeDirectory {
    root: PathBuf,
}

impl RuntimeDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn connection_file(&self, id: &str) -> PathBuf {
        self.root.join(format!("kernel-{}.json", id))
    }
}

fn read_if_exists(path: &Path) -> Result<Option<ConnectionInfo>> {
    if !path.is_file() {
        return Ok(None);
    }
    ConnectionInfo::from_file(path).map(Some)
}

impl KernelDirectory for RuntimeDirectory {
    fn resolve(&self, kernel_ref: &KernelRef) -> Result<Option<ConnectionInfo>> {
        match kernel_ref {
            KernelRef::Info(info) => Ok(Some(info.clone())),
            KernelRef::File(path) => read_if_exists(path),
            KernelRef::Id(id) => read_if_exists(&self.connection_file(id)),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_prefix("kernel-")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// A kernel process started by the proxy
#[derive(Debug)]
pub struct LaunchedKernel {
    pub id: String,
    pub info: ConnectionInfo,
    pub connection_file: PathBuf,
    child: Child,
}

impl LaunchedKernel {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    /// The connection file is removed either way.
    pub async fn terminate(mut self, grace: Duration) -> Result<()> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => info!(kernel = %self.id, "kernel exited: {}", status?),
            Err(_) => {
                warn!(kernel = %self.id, "kernel did not exit after shutdown; killing it");
                self.child.kill().await?;
            }
        }
        if let Err(e) = tokio::fs::remove_file(&self.connection_file).await {
            debug!("could not remove {}: {}", self.connection_file.display(), e);
        }
        Ok(())
    }
}

/// Starts kernel processes from an argv template
#[derive(Debug, Clone)]
pub struct KernelLauncher {
    runtime: RuntimeDirectory,
}

impl KernelLauncher {
    pub fn new(runtime: RuntimeDirectory) -> Self {
        Self { runtime }
    }

    /// Write a fresh connection file and spawn `argv`, substituting
    /// `{connection_file}` with its path
    pub async fn launch(&self, argv: &[String], kernel_name: &str) -> Result<LaunchedKernel> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ProxyError::Config("empty kernel command line".to_string()));
        };

        tokio::fs::create_dir_all(self.runtime.root()).await?;
        let id = Uuid::new_v4().to_string();
        let mut info = ConnectionInfo::local(Uuid::new_v4().to_string());
        info.kernel_name = kernel_name.to_string();
        assign_free_ports(&mut info)?;

        let connection_file = self.runtime.connection_file(&id);
        tokio::fs::write(&connection_file, serde_json::to_string_pretty(&info)?).await?;

        let path = connection_file.to_string_lossy().to_string();
        let args: Vec<String> = args
            .iter()
            .map(|arg| arg.replace("{connection_file}", &path))
            .collect();

        debug!(kernel = %id, "starting kernel: {} {:?}", program, args);
        let mut child = Command::new(program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            log_output(id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            log_output(id.clone(), "stderr", stderr);
        }

        info!(kernel = %id, pid = ?child.id(), "kernel process started");
        Ok(LaunchedKernel {
            id,
            info,
            connection_file,
            child,
        })
    }
}

/// Reserve five distinct ports by binding them all at once, then release them
/// for the kernel to use
fn assign_free_ports(info: &mut ConnectionInfo) -> Result<()> {
    let listeners = SocketType::ALL
        .iter()
        .map(|_| TcpListener::bind((info.ip.as_str(), 0)))
        .collect::<std::io::Result<Vec<_>>>()?;
    for (socket, listener) in SocketType::ALL.iter().zip(&listeners) {
        info.set_port(*socket, listener.local_addr()?.port());
    }
    Ok(())
}

fn log_output<R>(kernel: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(kernel = %kernel, stream, "{}", line);
        }
    });
}
