//! Connection files
//!
//! A Jupyter connection file names the transport, address and five ports a
//! kernel listens on, plus the shared key used to sign messages.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ProxyError, Result};
use crate::socket::SocketType;
use crate::wire::SigningKey;

/// The only signature scheme the wire protocol defines
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Connection information from the connection file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub shell_port: u16,
    #[serde(default)]
    pub iopub_port: u16,
    #[serde(default)]
    pub stdin_port: u16,
    #[serde(default)]
    pub control_port: u16,
    #[serde(default)]
    pub hb_port: u16,
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: String,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_scheme() -> String {
    SIGNATURE_SCHEME.to_string()
}

impl ConnectionInfo {
    /// Loopback TCP endpoints with OS-assigned ports
    pub fn local(key: impl Into<String>) -> Self {
        Self {
            shell_port: 0,
            iopub_port: 0,
            stdin_port: 0,
            control_port: 0,
            hb_port: 0,
            ip: default_ip(),
            key: key.into(),
            transport: default_transport(),
            signature_scheme: default_scheme(),
            kernel_name: String::new(),
        }
    }

    /// Load connection info from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let info: Self = serde_json::from_str(&content)?;
        info.validate()?;
        Ok(info)
    }

    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.key.is_empty() && self.signature_scheme != SIGNATURE_SCHEME {
            return Err(ProxyError::Config(format!(
                "unsupported signature scheme '{}'",
                self.signature_scheme
            )));
        }
        if self.transport != "tcp" && self.transport != "ipc" {
            return Err(ProxyError::Config(format!(
                "unsupported transport '{}'",
                self.transport
            )));
        }
        Ok(())
    }

    /// Build address string for a port
    pub fn address(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }

    pub fn port(&self, socket: SocketType) -> u16 {
        match socket {
            SocketType::Heartbeat => self.hb_port,
            SocketType::Iopub => self.iopub_port,
            SocketType::Control => self.control_port,
            SocketType::Stdin => self.stdin_port,
            SocketType::Shell => self.shell_port,
        }
    }

    pub fn set_port(&mut self, socket: SocketType, port: u16) {
        match socket {
            SocketType::Heartbeat => self.hb_port = port,
            SocketType::Iopub => self.iopub_port = port,
            SocketType::Control => self.control_port = port,
            SocketType::Stdin => self.stdin_port = port,
            SocketType::Shell => self.shell_port = port,
        }
    }

    pub fn endpoint(&self, socket: SocketType) -> String {
        self.address(self.port(socket))
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::new(self.key.as_bytes())
    }

    /// Whether any endpoint of `self` is also an endpoint of `other`, on any
    /// socket role.
    ///
    /// Wildcard and loopback addresses are treated as the same host. Unassigned
    /// ports never match.
    pub fn shares_endpoint(&self, other: &ConnectionInfo) -> bool {
        fn host(ip: &str) -> &str {
            match ip {
                "0.0.0.0" | "localhost" | "*" => "127.0.0.1",
                other => other,
            }
        }
        if self.transport != other.transport || host(&self.ip) != host(&other.ip) {
            return false;
        }
        SocketType::ALL.iter().any(|s| {
            let port = self.port(*s);
            port != 0 && SocketType::ALL.iter().any(|o| other.port(*o) == port)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_connection_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kernel-abc.json");
        std::fs::write(
            &path,
            r#"{
                "shell_port": 5001, "iopub_port": 5002, "stdin_port": 5003,
                "control_port": 5004, "hb_port": 5005, "ip": "127.0.0.1",
                "key": "secret", "transport": "tcp",
                "signature_scheme": "hmac-sha256", "kernel_name": "python3"
            }"#,
        )
        .unwrap();

        let info = ConnectionInfo::from_file(&path).unwrap();
        assert_eq!(info.port(SocketType::Shell), 5001);
        assert_eq!(info.port(SocketType::Heartbeat), 5005);
        assert_eq!(info.endpoint(SocketType::Iopub), "tcp://127.0.0.1:5002");
        assert_eq!(info.kernel_name, "python3");
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let mut info = ConnectionInfo::local("k");
        info.signature_scheme = "hmac-md5".to_string();
        assert!(matches!(info.validate(), Err(ProxyError::Config(_))));

        // Unsigned connections do not care about the scheme
        info.key.clear();
        assert!(info.validate().is_ok());
    }

    fn with_ports(base: u16) -> ConnectionInfo {
        let mut info = ConnectionInfo::local("k");
        for (i, s) in SocketType::ALL.iter().enumerate() {
            info.set_port(*s, base + i as u16);
        }
        info
    }

    #[test]
    fn test_shares_endpoint() {
        let a = with_ports(6000);
        let mut b = a.clone();
        b.ip = "0.0.0.0".to_string();
        b.key = "other".to_string();
        assert!(a.shares_endpoint(&b));

        let c = with_ports(7000);
        assert!(!a.shares_endpoint(&c));

        b.ip = "10.0.0.2".to_string();
        assert!(!a.shares_endpoint(&b));

        // Unassigned ports never compare equal
        let d = ConnectionInfo::local("k");
        assert!(!d.shares_endpoint(&d.clone()));
    }

    #[test]
    fn test_single_shared_port_counts() {
        let server = with_ports(6000);
        let mut kernel = with_ports(7000);
        assert!(!kernel.shares_endpoint(&server));

        // Kernel control lands on the proxy's heartbeat port
        kernel.control_port = server.hb_port;
        assert!(kernel.shares_endpoint(&server));
        assert!(server.shares_endpoint(&kernel));
    }
}
