//! Proxy relay
//!
//! Shuttles frames between the server socket group (bound, facing the
//! notebook frontend) and an optional client socket group (connected to the
//! real kernel). Every signed frame is verified with the key of the side it
//! arrived on, run through the interceptors registered for its socket and
//! message type, re-signed with the key of the side it is headed to and sent.
//!
//! Each socket of each group has its own dispatch task, so frames on one
//! socket are handled strictly in receipt order while different sockets
//! interleave freely.

use bytes::Bytes;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::connection::ConnectionInfo;
use crate::error::{ProxyError, Result};
use crate::registry::{InterceptionRegistry, Target};
use crate::socket::{Inbound, Side, SocketGroup, SocketHandle, SocketType};
use crate::wire::{Frames, SigningKey, WireMessage};

struct ClientLink {
    group: SocketGroup,
    info: ConnectionInfo,
    key: SigningKey,
    dispatchers: Vec<JoinHandle<()>>,
}

impl ClientLink {
    /// Stop receiving from the kernel and wait until nothing of this link is
    /// still running
    async fn close(self) {
        for task in self.dispatchers {
            task.abort();
            let _ = task.await;
        }
        self.group.close().await;
    }
}

pub struct ProxyRelay {
    server: SocketGroup,
    server_info: ConnectionInfo,
    server_key: SigningKey,
    /// Session id stamped on messages the proxy generates itself
    session: String,
    client: RwLock<Option<ClientLink>>,
    registry: InterceptionRegistry,
    server_dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyRelay {
    /// Build a relay around an existing server group without starting any
    /// dispatch tasks
    pub fn new(server: SocketGroup, server_info: ConnectionInfo) -> Arc<Self> {
        Arc::new(Self {
            server_key: server_info.signing_key(),
            server,
            server_info,
            session: Uuid::new_v4().to_string(),
            client: RwLock::new(None),
            registry: InterceptionRegistry::new(),
            server_dispatchers: Mutex::new(Vec::new()),
        })
    }

    /// Bind the server sockets described by `info` and start relaying
    pub async fn bind(info: &ConnectionInfo) -> Result<Arc<Self>> {
        info.validate()?;
        let (group, inbound, bound) = SocketGroup::bind(info).await?;
        let relay = Self::new(group, bound);
        let dispatchers = relay.spawn_dispatchers(Side::Server, inbound);
        relay
            .server_dispatchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(dispatchers);
        info!(
            shell = relay.server_info.shell_port,
            iopub = relay.server_info.iopub_port,
            "proxy relay listening"
        );
        Ok(relay)
    }

    pub fn registry(&self) -> &InterceptionRegistry {
        &self.registry
    }

    /// Connection info of the bound server sockets, with real port numbers
    pub fn server_info(&self) -> &ConnectionInfo {
        &self.server_info
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub async fn client_info(&self) -> Option<ConnectionInfo> {
        self.client.read().await.as_ref().map(|link| link.info.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    /// Connect to a kernel, replacing any previous one
    pub async fn connect_client(self: &Arc<Self>, info: ConnectionInfo) -> Result<()> {
        info.validate()?;
        let (group, inbound) = SocketGroup::connect(&info, &self.session).await?;
        self.attach_client(group, inbound, info).await;
        Ok(())
    }

    /// Install a client group. The previous group's receive tasks are fully
    /// stopped before the new ones start.
    pub async fn attach_client(
        self: &Arc<Self>,
        group: SocketGroup,
        inbound: Inbound,
        info: ConnectionInfo,
    ) {
        let mut client = self.client.write().await;
        if let Some(old) = client.take() {
            debug!(kernel = %old.info.kernel_name, "detaching previous kernel");
            old.close().await;
        }
        let dispatchers = self.spawn_dispatchers(Side::Client, inbound);
        info!(
            kernel = %info.kernel_name,
            shell = %info.endpoint(SocketType::Shell),
            "attached kernel"
        );
        *client = Some(ClientLink {
            group,
            key: info.signing_key(),
            info,
            dispatchers,
        });
    }

    /// Disconnect from the current kernel, returning its connection info
    pub async fn detach_client(&self) -> Option<ConnectionInfo> {
        let link = self.client.write().await.take()?;
        let info = link.info.clone();
        link.close().await;
        info!(kernel = %info.kernel_name, "detached kernel");
        Some(info)
    }

    /// Stop all relaying
    pub async fn shutdown(&self) {
        self.detach_client().await;
        let tasks: Vec<_> = self
            .server_dispatchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    fn spawn_dispatchers(self: &Arc<Self>, side: Side, inbound: Inbound) -> Vec<JoinHandle<()>> {
        inbound
            .into_iter()
            .map(|(socket, mut rx)| {
                let relay: Weak<Self> = Arc::downgrade(self);
                tokio::spawn(async move {
                    while let Some(frames) = rx.recv().await {
                        let Some(relay) = relay.upgrade() else {
                            break;
                        };
                        if let Err(e) = relay.handle_inbound(side, socket, frames).await {
                            if e.is_fatal() {
                                error!(socket = %socket, ?side, "stopping relay: {}", e);
                                break;
                            }
                            warn!(socket = %socket, ?side, "relay error: {}", e);
                        }
                    }
                })
            })
            .collect()
    }

    async fn key(&self, side: Side) -> Option<SigningKey> {
        match side {
            Side::Server => Some(self.server_key.clone()),
            Side::Client => self.client.read().await.as_ref().map(|l| l.key.clone()),
        }
    }

    async fn handle(&self, side: Side, socket: SocketType) -> Result<SocketHandle> {
        match side {
            Side::Server => Ok(self.server.handle(socket)?.clone()),
            Side::Client => match self.client.read().await.as_ref() {
                Some(link) => Ok(link.group.handle(socket)?.clone()),
                None => Err(ProxyError::NotConnected),
            },
        }
    }

    /// Process one frame list received on `socket` of the `source` group.
    ///
    /// Malformed or unverifiable frames and failing interceptors drop the
    /// message; only fatal protocol errors are returned.
    pub async fn handle_inbound(
        self: &Arc<Self>,
        source: Side,
        socket: SocketType,
        frames: Frames,
    ) -> Result<()> {
        if socket == SocketType::Heartbeat {
            return self.relay_heartbeat(source, frames).await;
        }

        let Some(source_key) = self.key(source).await else {
            debug!(socket = %socket, "frame from a detached kernel; dropping");
            return Ok(());
        };

        let mut msg = match WireMessage::parse(frames, Some(&source_key)) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(socket = %socket, ?source, "dropping message: {}", e);
                return Ok(());
            }
        };
        let header = match msg.header() {
            Ok(header) => header,
            Err(e) => {
                warn!(socket = %socket, ?source, "dropping message with bad header: {}", e);
                return Ok(());
            }
        };
        trace!(socket = %socket, ?source, msg_type = %header.msg_type, msg_id = %header.msg_id, "relaying");

        if source == Side::Client
            && matches!(socket, SocketType::Shell | SocketType::Control)
            && header.msg_type.ends_with("_reply")
        {
            restore_session_identity(&mut msg);
        }

        let target = Target {
            side: source.opposite(),
            socket,
        };
        let frames = msg.serialize()?;
        match self.intercept(target, &header.msg_type, frames).await? {
            Some(frames) => self.forward(target, frames).await,
            None => {
                debug!(socket = %socket, msg_type = %header.msg_type, "message dropped by interceptor");
                Ok(())
            }
        }
    }

    /// Run the interceptor chain for one message
    async fn intercept(
        self: &Arc<Self>,
        target: Target,
        msg_type: &str,
        mut frames: Frames,
    ) -> Result<Option<Frames>> {
        for handler in self.registry.matching(target.socket, msg_type) {
            let call = handler(self.clone(), target, frames);
            frames = match tokio::spawn(call).await {
                Ok(Ok(Some(frames))) => frames,
                Ok(Ok(None)) => return Ok(None),
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) => {
                    error!(socket = %target.socket, msg_type, "interceptor failed: {}", e);
                    return Ok(None);
                }
                Err(e) => {
                    error!(socket = %target.socket, msg_type, "interceptor panicked: {}", e);
                    return Ok(None);
                }
            };
        }
        Ok(Some(frames))
    }

    /// Re-sign for the destination side and send
    async fn forward(&self, target: Target, frames: Frames) -> Result<()> {
        let handle = match self.handle(target.side, target.socket).await {
            Ok(handle) => handle,
            Err(ProxyError::NotConnected) => {
                debug!(socket = %target.socket, "no kernel connected; dropping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(key) = self.key(target.side).await else {
            return Ok(());
        };
        let msg = match WireMessage::parse(frames, None) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(socket = %target.socket, "interceptor produced invalid frames: {}", e);
                return Ok(());
            }
        };
        handle.send(msg.sign(&key)?.serialize()?)
    }

    async fn relay_heartbeat(&self, source: Side, frames: Frames) -> Result<()> {
        match source {
            Side::Server => match self.handle(Side::Client, SocketType::Heartbeat).await {
                Ok(client_hb) => client_hb.send(frames),
                // Without a kernel the proxy answers for itself
                Err(ProxyError::NotConnected) => self.server.send(SocketType::Heartbeat, frames),
                Err(e) => Err(e),
            },
            Side::Client => self.server.send(SocketType::Heartbeat, frames),
        }
    }

    /// Sign `msg` with the key of `side` and send it there, bypassing the
    /// interceptors
    pub async fn send_message(&self, side: Side, socket: SocketType, msg: &WireMessage) -> Result<()> {
        let key = self.key(side).await.ok_or(ProxyError::NotConnected)?;
        let frames = msg.sign(&key)?.serialize()?;
        self.send_frames(side, socket, frames).await
    }

    /// Send frames verbatim, bypassing the interceptors
    pub async fn send_frames(&self, side: Side, socket: SocketType, frames: Frames) -> Result<()> {
        self.handle(side, socket).await?.send(frames)
    }
}

/// Replies must carry the frontend's routing identity. Some kernels drop it;
/// Jupyter clients use their session id as identity, so it can be rebuilt from
/// the parent header.
fn restore_session_identity(msg: &mut WireMessage) {
    let session = msg
        .parent_header_value()
        .ok()
        .and_then(|parent| parent.get("session").and_then(Value::as_str).map(str::to_string));
    if let Some(session) = session.filter(|s| !s.is_empty()) {
        let identity = Bytes::from(session.into_bytes());
        if !msg.identities.contains(&identity) {
            debug!("restoring session identity on reply");
            msg.identities.push(identity);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::handler;
    use crate::socket::Outboxes;
    use crate::wire::Header;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) const SERVER_KEY: &str = "server-key";
    pub(crate) const KERNEL_KEY: &str = "kernel-key";

    pub(crate) struct Harness {
        pub relay: Arc<ProxyRelay>,
        pub server: Outboxes,
        pub kernel: Outboxes,
    }

    impl Harness {
        pub async fn new() -> Self {
            let (server_group, server) = SocketGroup::detached();
            let relay = ProxyRelay::new(server_group, ConnectionInfo::local(SERVER_KEY));
            let (kernel_group, kernel) = SocketGroup::detached();
            let mut info = ConnectionInfo::local(KERNEL_KEY);
            info.kernel_name = "python3".to_string();
            relay.attach_client(kernel_group, Vec::new(), info).await;
            Self {
                relay,
                server,
                kernel,
            }
        }

        pub fn outbox(&mut self, side: Side, socket: SocketType) -> &mut UnboundedReceiver<Frames> {
            match side {
                Side::Server => self.server.get_mut(&socket).unwrap(),
                Side::Client => self.kernel.get_mut(&socket).unwrap(),
            }
        }

        pub async fn next(&mut self, side: Side, socket: SocketType) -> WireMessage {
            let frames = tokio::time::timeout(Duration::from_secs(2), self.outbox(side, socket).recv())
                .await
                .expect("timed out waiting for frames")
                .expect("outbox closed");
            WireMessage::parse(frames, None).unwrap()
        }

        pub fn assert_empty(&mut self, side: Side, socket: SocketType) {
            assert!(self.outbox(side, socket).try_recv().is_err());
        }
    }

    pub(crate) fn message(msg_type: &str, parent: Value, content: Value, key: &str) -> Frames {
        let mut msg = WireMessage::new(Header::new(msg_type, "frontend-session"), parent, content)
            .unwrap();
        msg.identities = vec![Bytes::from_static(b"frontend-session")];
        msg.sign(&SigningKey::new(key)).unwrap().serialize().unwrap()
    }

    fn tag_content(tag: &'static str) -> crate::registry::Handler {
        handler(move |_relay, _target, frames| async move {
            let mut msg = WireMessage::parse(frames, None)?;
            let mut content = msg.content_value()?;
            let seen = content["seen"].as_str().unwrap_or("").to_string();
            content["seen"] = json!(format!("{}{}", seen, tag));
            msg.content = content.into();
            Ok(Some(msg.serialize()?))
        })
    }

    #[tokio::test]
    async fn test_forwards_and_resigns_with_destination_key() {
        let mut h = Harness::new().await;
        let frames = message("execute_request", json!({}), json!({"code": "2+2"}), SERVER_KEY);
        h.relay
            .handle_inbound(Side::Server, SocketType::Shell, frames)
            .await
            .unwrap();

        let forwarded = h.next(Side::Client, SocketType::Shell).await;
        assert!(forwarded.verify(&SigningKey::new(KERNEL_KEY)).is_ok());
        assert!(forwarded.verify(&SigningKey::new(SERVER_KEY)).is_err());
        assert_eq!(forwarded.content_value().unwrap()["code"], "2+2");
        h.assert_empty(Side::Server, SocketType::Shell);
    }

    #[tokio::test]
    async fn test_interceptors_chain_in_order() {
        let mut h = Harness::new().await;
        let registry = h.relay.registry();
        registry.add(SocketType::Shell, "execute_request", tag_content("1"));
        registry.add(SocketType::Shell, "execute_request", tag_content("2"));
        registry.add(SocketType::Shell, "execute_request", tag_content("3"));

        let frames = message("execute_request", json!({}), json!({}), SERVER_KEY);
        h.relay
            .handle_inbound(Side::Server, SocketType::Shell, frames)
            .await
            .unwrap();

        let forwarded = h.next(Side::Client, SocketType::Shell).await;
        assert_eq!(forwarded.content_value().unwrap()["seen"], "123");
    }

    #[tokio::test]
    async fn test_dropping_interceptor_short_circuits() {
        let mut h = Harness::new().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = h.relay.registry();
        registry.add(SocketType::Shell, "execute_request", tag_content("1"));
        registry.add(
            SocketType::Shell,
            "execute_request",
            handler(|_relay, _target, _frames| async { Ok(None) }),
        );
        let counter = calls.clone();
        registry.add(
            SocketType::Shell,
            "execute_request",
            handler(move |_relay, _target, frames| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Some(frames)) }
            }),
        );

        let frames = message("execute_request", json!({}), json!({}), SERVER_KEY);
        h.relay
            .handle_inbound(Side::Server, SocketType::Shell, frames)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        h.assert_empty(Side::Client, SocketType::Shell);
        h.assert_empty(Side::Server, SocketType::Shell);
    }

    #[tokio::test]
    async fn test_failing_interceptor_drops_message() {
        let mut h = Harness::new().await;
        h.relay.registry().add(
            SocketType::Shell,
            "execute_request",
            handler(|_relay, _target, _frames| async {
                Err(ProxyError::Interceptor("boom".to_string()))
            }),
        );
        h.relay.registry().add(
            SocketType::Shell,
            "complete_request",
            handler(|_relay, _target, _frames| async { panic!("handler bug") }),
        );

        for msg_type in ["execute_request", "complete_request"] {
            let frames = message(msg_type, json!({}), json!({}), SERVER_KEY);
            assert!(h
                .relay
                .handle_inbound(Side::Server, SocketType::Shell, frames)
                .await
                .is_ok());
        }
        h.assert_empty(Side::Client, SocketType::Shell);
    }

    #[tokio::test]
    async fn test_fatal_interceptor_error_propagates() {
        let h = Harness::new().await;
        h.relay.registry().add(
            SocketType::Control,
            "interrupt_request",
            handler(|_relay, _target, _frames| async {
                Err(ProxyError::FatalProtocol("unrecoverable".to_string()))
            }),
        );
        let frames = message("interrupt_request", json!({}), json!({}), SERVER_KEY);
        let err = h
            .relay
            .handle_inbound(Side::Server, SocketType::Control, frames)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_bad_signature_never_forwarded() {
        let mut h = Harness::new().await;
        let mut frames = message("execute_request", json!({}), json!({"code": "1"}), SERVER_KEY);
        let content = frames.len() - 1;
        frames[content] = Bytes::from_static(br#"{"code":"import os"}"#);
        h.relay
            .handle_inbound(Side::Server, SocketType::Shell, frames)
            .await
            .unwrap();

        // Signed with the wrong key
        let frames = message("execute_request", json!({}), json!({}), KERNEL_KEY);
        h.relay
            .handle_inbound(Side::Server, SocketType::Shell, frames)
            .await
            .unwrap();

        h.assert_empty(Side::Client, SocketType::Shell);
    }

    #[tokio::test]
    async fn test_malformed_frames_dropped() {
        let mut h = Harness::new().await;
        let frames = vec![Bytes::from_static(b"no"), Bytes::from_static(b"delimiter")];
        h.relay
            .handle_inbound(Side::Server, SocketType::Shell, frames)
            .await
            .unwrap();
        h.assert_empty(Side::Client, SocketType::Shell);
    }

    #[tokio::test]
    async fn test_reply_gets_session_identity() {
        let mut h = Harness::new().await;
        let parent = serde_json::to_value(Header::new("execute_request", "frontend-session")).unwrap();
        let mut reply = WireMessage::new(
            Header::new("execute_reply", "kernel-session"),
            parent,
            json!({"status": "ok"}),
        )
        .unwrap();
        reply.identities.clear();
        let frames = reply
            .sign(&SigningKey::new(KERNEL_KEY))
            .unwrap()
            .serialize()
            .unwrap();
        h.relay
            .handle_inbound(Side::Client, SocketType::Shell, frames)
            .await
            .unwrap();

        let forwarded = h.next(Side::Server, SocketType::Shell).await;
        assert_eq!(forwarded.identities, vec![Bytes::from_static(b"frontend-session")]);
        assert!(forwarded.verify(&SigningKey::new(SERVER_KEY)).is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_echo_without_kernel() {
        let (server_group, mut server) = SocketGroup::detached();
        let relay = ProxyRelay::new(server_group, ConnectionInfo::local(SERVER_KEY));
        let ping = vec![Bytes::from_static(b"ping")];
        relay
            .handle_inbound(Side::Server, SocketType::Heartbeat, ping.clone())
            .await
            .unwrap();
        let hb = server.get_mut(&SocketType::Heartbeat).unwrap();
        assert_eq!(hb.recv().await.unwrap(), ping);
    }

    #[tokio::test]
    async fn test_detach_drops_requests() {
        let mut h = Harness::new().await;
        assert_eq!(h.relay.detach_client().await.unwrap().kernel_name, "python3");
        assert!(!h.relay.is_connected().await);

        let frames = message("execute_request", json!({}), json!({}), SERVER_KEY);
        h.relay
            .handle_inbound(Side::Server, SocketType::Shell, frames)
            .await
            .unwrap();
        h.assert_empty(Side::Server, SocketType::Shell);
    }
}
