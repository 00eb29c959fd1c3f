//! Beaker kernel proxy
//!
//! Sits between a Jupyter frontend and a real kernel, speaking the Jupyter
//! wire protocol on both sides.
//!
//! # Architecture
//!
//! The proxy binds the five server-role sockets a frontend expects and
//! connects matching client-role sockets to the kernel:
//! - Shell, Control, Stdin: ROUTER facing the frontend, DEALER facing the kernel
//! - IOPub: PUB facing the frontend, SUB facing the kernel
//! - Heartbeat: REP facing the frontend, REQ facing the kernel
//!
//! Messages in either direction pass through an interception registry where
//! handlers can inspect, rewrite or drop them. On top of that the
//! [`KernelProxyManager`] retargets the proxy between kernels and answers for
//! a missing one, and the [`ExecutionCorrelator`] runs code on the kernel on
//! the proxy's own behalf.

pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod kernels;
pub mod manager;
pub mod parsers;
pub mod registry;
pub mod relay;
pub mod socket;
pub mod wire;

pub use config::ProxyConfig;
pub use connection::ConnectionInfo;
pub use error::{ProxyError, Result};
pub use execution::{ExecutionCorrelator, ExecutionError, ExecutionResult};
pub use kernels::{KernelDirectory, KernelLauncher, KernelRef, RuntimeDirectory};
pub use manager::{KernelInfoState, KernelProxyManager};
pub use parsers::{ReturnParser, ReturnParsers};
pub use registry::{handler, Handler, InterceptionRegistry, InterceptorId, Target};
pub use relay::ProxyRelay;
pub use socket::{Side, SocketType};
pub use wire::{Frames, Header, SigningKey, WireMessage};

// Re-export for integration tests and embedders
pub use zeromq;
