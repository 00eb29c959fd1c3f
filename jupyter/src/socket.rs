//! Socket endpoints
//!
//! Each of the five Jupyter channels is served by a task that owns its ZeroMQ
//! socket. Other tasks talk to it through an unbounded outbox, and whatever the
//! socket receives is pushed, in order, onto that socket's inbound channel.
//! This keeps socket ownership in one place while letting interceptors send on
//! any socket as a side effect.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use zeromq::util::PeerIdentity;
use zeromq::{Endpoint, Socket, SocketOptions, SocketRecv, SocketSend, ZmqMessage};

use crate::connection::ConnectionInfo;
use crate::error::{ProxyError, Result};
use crate::wire::Frames;

/// The five Jupyter channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SocketType {
    #[serde(rename = "hb")]
    Heartbeat,
    #[serde(rename = "iopub")]
    Iopub,
    #[serde(rename = "control")]
    Control,
    #[serde(rename = "stdin")]
    Stdin,
    #[serde(rename = "shell")]
    Shell,
}

/// ZeroMQ messaging pattern of one end of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Router,
    Dealer,
    Pub,
    Sub,
    Rep,
    Req,
}

/// Which socket group a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Bound sockets facing the notebook frontend
    Server,
    /// Connected sockets facing the real kernel
    Client,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Server => Side::Client,
            Side::Client => Side::Server,
        }
    }
}

impl SocketType {
    pub const ALL: [SocketType; 5] = [
        SocketType::Heartbeat,
        SocketType::Iopub,
        SocketType::Control,
        SocketType::Stdin,
        SocketType::Shell,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SocketType::Heartbeat => "hb",
            SocketType::Iopub => "iopub",
            SocketType::Control => "control",
            SocketType::Stdin => "stdin",
            SocketType::Shell => "shell",
        }
    }

    /// Heartbeats are opaque pings; everything else is a signed message
    pub fn requires_signing(self) -> bool {
        self != SocketType::Heartbeat
    }

    pub fn server_pattern(self) -> Pattern {
        match self {
            SocketType::Heartbeat => Pattern::Rep,
            SocketType::Iopub => Pattern::Pub,
            SocketType::Control | SocketType::Stdin | SocketType::Shell => Pattern::Router,
        }
    }

    pub fn client_pattern(self) -> Pattern {
        match self {
            SocketType::Heartbeat => Pattern::Req,
            SocketType::Iopub => Pattern::Sub,
            SocketType::Control | SocketType::Stdin | SocketType::Shell => Pattern::Dealer,
        }
    }

    pub fn pattern(self, side: Side) -> Pattern {
        match side {
            Side::Server => self.server_pattern(),
            Side::Client => self.client_pattern(),
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SocketType {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hb" | "heartbeat" => Ok(SocketType::Heartbeat),
            "iopub" => Ok(SocketType::Iopub),
            "control" => Ok(SocketType::Control),
            "stdin" => Ok(SocketType::Stdin),
            "shell" => Ok(SocketType::Shell),
            other => Err(ProxyError::Config(format!("unknown socket type '{}'", other))),
        }
    }
}

/// Sending half of a socket task
#[derive(Debug, Clone)]
pub struct SocketHandle {
    socket: SocketType,
    outbox: mpsc::UnboundedSender<Frames>,
}

impl SocketHandle {
    pub fn socket(&self) -> SocketType {
        self.socket
    }

    /// Queue frames for sending; the socket task flushes each message as soon
    /// as it is dequeued
    pub fn send(&self, frames: Frames) -> Result<()> {
        self.outbox
            .send(frames)
            .map_err(|_| ProxyError::ChannelClosed(self.socket.name()))
    }
}

/// Frames received on one socket, in receipt order
pub type Inbound = Vec<(SocketType, mpsc::UnboundedReceiver<Frames>)>;

/// Outboxes of a group built without ZeroMQ sockets
pub type Outboxes = HashMap<SocketType, mpsc::UnboundedReceiver<Frames>>;

/// One socket per channel, all bound (server) or all connected (client)
#[derive(Debug)]
pub struct SocketGroup {
    handles: HashMap<SocketType, SocketHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketGroup {
    /// Bind server-role sockets. Ports left at `0` are assigned by the OS and
    /// written into the returned connection info.
    pub async fn bind(info: &ConnectionInfo) -> Result<(Self, Inbound, ConnectionInfo)> {
        let mut bound = info.clone();
        let mut group = Self::empty();
        let mut inbound = Vec::new();

        for socket in SocketType::ALL {
            let endpoint = info.endpoint(socket);
            let (handle, rx, task, port) = match socket.server_pattern() {
                Pattern::Rep => {
                    let mut s = zeromq::RepSocket::new();
                    let port = bound_port(s.bind(endpoint.as_str()).await?);
                    let (h, rx, t) = spawn_actor(socket, s, Mode::Duplex);
                    (h, rx, t, port)
                }
                Pattern::Pub => {
                    let mut s = zeromq::PubSocket::new();
                    let port = bound_port(s.bind(endpoint.as_str()).await?);
                    let (h, rx, t) = spawn_send_only(socket, s);
                    (h, rx, t, port)
                }
                _ => {
                    let mut s = zeromq::RouterSocket::new();
                    let port = bound_port(s.bind(endpoint.as_str()).await?);
                    let (h, rx, t) = spawn_actor(socket, s, Mode::Duplex);
                    (h, rx, t, port)
                }
            };
            if let Some(port) = port {
                bound.set_port(socket, port);
            }
            debug!(socket = %socket, endpoint = %bound.endpoint(socket), "bound server socket");
            group.handles.insert(socket, handle);
            group.tasks.push(task);
            inbound.push((socket, rx));
        }

        Ok((group, inbound, bound))
    }

    /// Connect client-role sockets to a running kernel.
    ///
    /// Shell, control and stdin share `identity`: a kernel routes
    /// `input_request` on stdin using the identities of the shell request that
    /// prompted it.
    pub async fn connect(info: &ConnectionInfo, identity: &str) -> Result<(Self, Inbound)> {
        let mut group = Self::empty();
        let mut inbound = Vec::new();
        let peer_id = PeerIdentity::try_from(identity.as_bytes())?;

        for socket in SocketType::ALL {
            let endpoint = info.endpoint(socket);
            let (handle, rx, task) = match socket.client_pattern() {
                Pattern::Req => {
                    let mut s = zeromq::ReqSocket::new();
                    s.connect(endpoint.as_str()).await?;
                    spawn_actor(socket, s, Mode::RequestReply)
                }
                Pattern::Sub => {
                    let mut s = zeromq::SubSocket::new();
                    s.connect(endpoint.as_str()).await?;
                    s.subscribe("").await?;
                    spawn_recv_only(socket, s)
                }
                _ => {
                    let mut options = SocketOptions::default();
                    options.peer_identity(peer_id.clone());
                    let mut s = zeromq::DealerSocket::with_options(options);
                    s.connect(endpoint.as_str()).await?;
                    spawn_actor(socket, s, Mode::Duplex)
                }
            };
            debug!(socket = %socket, endpoint = %endpoint, "connected client socket");
            group.handles.insert(socket, handle);
            group.tasks.push(task);
            inbound.push((socket, rx));
        }

        Ok((group, inbound))
    }

    /// A group whose outboxes are plain channels instead of sockets
    pub fn detached() -> (Self, Outboxes) {
        let mut group = Self::empty();
        let mut outboxes = HashMap::new();
        for socket in SocketType::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            group.handles.insert(socket, SocketHandle { socket, outbox: tx });
            outboxes.insert(socket, rx);
        }
        (group, outboxes)
    }

    fn empty() -> Self {
        Self {
            handles: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    pub fn handle(&self, socket: SocketType) -> Result<&SocketHandle> {
        self.handles
            .get(&socket)
            .ok_or(ProxyError::ChannelClosed(socket.name()))
    }

    pub fn send(&self, socket: SocketType, frames: Frames) -> Result<()> {
        self.handle(socket)?.send(frames)
    }

    /// Stop every socket task and wait until they are gone
    pub async fn close(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SocketGroup {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn bound_port(endpoint: Endpoint) -> Option<u16> {
    match endpoint {
        Endpoint::Tcp(_, port) => Some(port),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Mode {
    /// Send and receive independently (ROUTER, DEALER, REP)
    Duplex,
    /// Every send is followed by exactly one receive (REQ)
    RequestReply,
}

type Spawned = (
    SocketHandle,
    mpsc::UnboundedReceiver<Frames>,
    JoinHandle<()>,
);

fn to_zmq(socket: SocketType, frames: Frames) -> Option<ZmqMessage> {
    match ZmqMessage::try_from(frames) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(socket = %socket, "refusing to send message: {}", e);
            None
        }
    }
}

async fn send_frames<S: SocketSend>(socket_type: SocketType, socket: &mut S, frames: Frames) {
    if let Some(msg) = to_zmq(socket_type, frames) {
        if let Err(e) = socket.send(msg).await {
            warn!(socket = %socket_type, "send error: {}", e);
        }
    }
}

fn deliver(socket: SocketType, inbound: &mpsc::UnboundedSender<Frames>, msg: ZmqMessage) -> bool {
    let frames: Vec<Bytes> = msg.into_vec();
    trace!(socket = %socket, frames = frames.len(), "received");
    inbound.send(frames).is_ok()
}

/// Back off briefly after a receive error so a broken socket does not spin
async fn recv_failed(socket: SocketType, err: zeromq::ZmqError) {
    warn!(socket = %socket, "recv error: {}", err);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn spawn_actor<S>(socket_type: SocketType, mut socket: S, mode: Mode) -> Spawned
where
    S: SocketSend + SocketRecv + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frames>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frames>();

    let task = tokio::spawn(async move {
        match mode {
            Mode::Duplex => loop {
                tokio::select! {
                    received = socket.recv() => match received {
                        Ok(msg) => {
                            if !deliver(socket_type, &in_tx, msg) {
                                break;
                            }
                        }
                        Err(e) => recv_failed(socket_type, e).await,
                    },
                    outgoing = out_rx.recv() => match outgoing {
                        Some(frames) => send_frames(socket_type, &mut socket, frames).await,
                        None => break,
                    },
                }
            },
            Mode::RequestReply => {
                while let Some(frames) = out_rx.recv().await {
                    let Some(msg) = to_zmq(socket_type, frames) else {
                        continue;
                    };
                    if let Err(e) = socket.send(msg).await {
                        warn!(socket = %socket_type, "send error: {}", e);
                        continue;
                    }
                    match socket.recv().await {
                        Ok(reply) => {
                            if !deliver(socket_type, &in_tx, reply) {
                                break;
                            }
                        }
                        Err(e) => recv_failed(socket_type, e).await,
                    }
                }
            }
        }
        debug!(socket = %socket_type, "socket task finished");
    });

    (
        SocketHandle {
            socket: socket_type,
            outbox: out_tx,
        },
        in_rx,
        task,
    )
}

fn spawn_send_only<S>(socket_type: SocketType, mut socket: S) -> Spawned
where
    S: SocketSend + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frames>();
    let (_, in_rx) = mpsc::unbounded_channel::<Frames>();

    let task = tokio::spawn(async move {
        while let Some(frames) = out_rx.recv().await {
            send_frames(socket_type, &mut socket, frames).await;
        }
    });

    (
        SocketHandle {
            socket: socket_type,
            outbox: out_tx,
        },
        in_rx,
        task,
    )
}

fn spawn_recv_only<S>(socket_type: SocketType, mut socket: S) -> Spawned
where
    S: SocketRecv + Send + 'static,
{
    // Nothing is ever sent on a subscriber; the outbox only exists so every
    // socket in a group has a handle.
    let (out_tx, _) = mpsc::unbounded_channel::<Frames>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frames>();

    let task = tokio::spawn(async move {
        loop {
            match socket.recv().await {
                Ok(msg) => {
                    if !deliver(socket_type, &in_tx, msg) {
                        break;
                    }
                }
                Err(e) => recv_failed(socket_type, e).await,
            }
        }
    });

    (
        SocketHandle {
            socket: socket_type,
            outbox: out_tx,
        },
        in_rx,
        task,
    )
}
