//! Kernel proxy manager
//!
//! Owns the relay, decides which kernel it forwards to and offers the
//! registration API used by higher layers (contexts, agents, subkernels).
//!
//! The manager also keeps the frontend responsive while no kernel answers:
//! every `kernel_info_request` starts a timer, and if no real
//! `kernel_info_reply` has been relayed when it fires, the manager answers with
//! a placeholder reply plus a stderr notice. A real reply arriving after that
//! is swallowed so the frontend never sees two replies.
//!
//! Settled requests are forgotten: a real reply in time drops the entry at
//! once, a placeholder answer keeps it for `kernel_info_grace` so a late reply
//! can still be recognized.

use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::connection::ConnectionInfo;
use crate::error::{ProxyError, Result};
use crate::kernels::{KernelDirectory, KernelLauncher, KernelRef, LaunchedKernel, RuntimeDirectory};
use crate::registry::{handler, Handler, InterceptorId};
use crate::relay::ProxyRelay;
use crate::socket::{Side, SocketType};
use crate::wire::{Header, WireMessage, PROTOCOL_VERSION};

/// Progress of one `kernel_info_request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelInfoState {
    AwaitingRequest,
    WaitingForRealReply,
    Resolved,
    FallbackSent,
}

#[derive(Default)]
struct KernelInfoTracker {
    states: Mutex<HashMap<String, KernelInfoState>>,
}

impl KernelInfoTracker {
    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<String, KernelInfoState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self, msg_id: &str) -> KernelInfoState {
        self.states()
            .get(msg_id)
            .copied()
            .unwrap_or(KernelInfoState::AwaitingRequest)
    }

    fn request_seen(&self, msg_id: &str) {
        self.states()
            .insert(msg_id.to_string(), KernelInfoState::WaitingForRealReply);
    }

    /// Move from waiting to `next`; false if the request already settled.
    /// `Resolved` requests are not remembered.
    fn settle(&self, msg_id: &str, next: KernelInfoState) -> bool {
        let mut states = self.states();
        if states.get(msg_id) != Some(&KernelInfoState::WaitingForRealReply) {
            return false;
        }
        if next == KernelInfoState::Resolved {
            states.remove(msg_id);
        } else {
            states.insert(msg_id.to_string(), next);
        }
        true
    }

    /// Drop a request answered with the placeholder; false if it was not
    fn forget_fallback(&self, msg_id: &str) -> bool {
        let mut states = self.states();
        if states.get(msg_id) == Some(&KernelInfoState::FallbackSent) {
            states.remove(msg_id);
            true
        } else {
            false
        }
    }
}

const FALLBACK_NOTICE: &str =
    "No kernel is connected to this notebook. Reconnect or restart the kernel to continue.\n";

pub struct KernelProxyManager {
    relay: Arc<ProxyRelay>,
    config: ProxyConfig,
    directory: Arc<dyn KernelDirectory>,
    launcher: KernelLauncher,
    kernel_info: Arc<KernelInfoTracker>,
    internal_executions: Mutex<HashSet<String>>,
    launched: tokio::sync::Mutex<Option<LaunchedKernel>>,
}

impl KernelProxyManager {
    /// Bind the server sockets from `server_info` and start proxying
    pub async fn start(server_info: &ConnectionInfo, config: ProxyConfig) -> Result<Arc<Self>> {
        let relay = ProxyRelay::bind(server_info).await?;
        let directory = Arc::new(RuntimeDirectory::new(&config.runtime_dir));
        Ok(Self::new(relay, config, directory))
    }

    pub fn new(
        relay: Arc<ProxyRelay>,
        config: ProxyConfig,
        directory: Arc<dyn KernelDirectory>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            launcher: KernelLauncher::new(RuntimeDirectory::new(&config.runtime_dir)),
            relay,
            config,
            directory,
            kernel_info: Arc::new(KernelInfoTracker::default()),
            internal_executions: Mutex::new(HashSet::new()),
            launched: tokio::sync::Mutex::new(None),
        });
        manager.install_kernel_info_fallback();
        manager
    }

    pub fn relay(&self) -> &Arc<ProxyRelay> {
        &self.relay
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Register `handler` for messages of `msg_type` on `socket`
    pub fn intercept_message(&self, socket: SocketType, msg_type: &str, handler: Handler) -> InterceptorId {
        self.relay.registry().add(socket, msg_type, handler)
    }

    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        self.relay.registry().remove(id)
    }

    /// Send a message to the frontend as if the kernel had sent it
    pub async fn send_response(
        &self,
        socket: SocketType,
        msg_type: &str,
        content: Value,
        parent_header: Value,
    ) -> Result<()> {
        let session = parent_header
            .get("session")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut msg = WireMessage::new(
            Header::new(msg_type, self.relay.session()),
            parent_header,
            content,
        )?;
        // Routed replies go to the frontend whose session asked
        if socket != SocketType::Iopub && !session.is_empty() {
            msg.identities.push(Bytes::from(session.into_bytes()));
        }
        self.relay.send_message(Side::Server, socket, &msg).await
    }

    pub fn is_internal_execution(&self, msg_id: &str) -> bool {
        self.internal_executions().contains(msg_id)
    }

    pub(crate) fn register_internal_execution(&self, msg_id: &str) {
        self.internal_executions().insert(msg_id.to_string());
    }

    pub(crate) fn unregister_internal_execution(&self, msg_id: &str) {
        self.internal_executions().remove(msg_id);
    }

    fn internal_executions(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.internal_executions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn kernel_info_state(&self, msg_id: &str) -> KernelInfoState {
        self.kernel_info.state(msg_id)
    }

    /// Kernel name of the currently proxied kernel
    pub async fn kernel_name(&self) -> Option<String> {
        self.relay.client_info().await.map(|info| info.kernel_name)
    }

    pub async fn known_kernels(&self) -> Result<Vec<String>> {
        self.with_directory(|directory| directory.list()).await
    }

    /// Run a directory lookup on the blocking pool; it reads files
    async fn with_directory<T, F>(&self, lookup: F) -> Result<T>
    where
        F: FnOnce(&dyn KernelDirectory) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || lookup(directory.as_ref()))
            .await
            .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
    }

    /// Retarget the proxy at another running kernel.
    ///
    /// On error the current connection is left untouched.
    pub async fn connect_to(&self, kernel_ref: impl Into<KernelRef>) -> Result<()> {
        let kernel_ref = kernel_ref.into();
        let lookup = kernel_ref.clone();
        let info = self
            .with_directory(move |directory| directory.resolve(&lookup))
            .await?
            .ok_or_else(|| ProxyError::UnknownKernel(kernel_ref.to_string()))?;
        // Sharing even one port would feed our own traffic back to us
        if info.shares_endpoint(self.relay.server_info()) {
            return Err(ProxyError::Loopback(kernel_ref.to_string()));
        }
        self.relay.connect_client(info).await
    }

    /// Launch a kernel process and proxy to it
    pub async fn start_kernel(&self, argv: &[String], kernel_name: &str) -> Result<ConnectionInfo> {
        let kernel = self.launcher.launch(argv, kernel_name).await?;
        let info = kernel.info.clone();
        let connect = tokio::time::timeout(
            self.config.kernel_start_timeout,
            self.connect_to(info.clone()),
        )
        .await;
        match connect {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                kernel.terminate(Duration::ZERO).await?;
                return Err(e);
            }
            Err(_) => {
                kernel.terminate(Duration::ZERO).await?;
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "kernel did not start listening in time",
                )));
            }
        }

        if let Some(previous) = self.launched.lock().await.replace(kernel) {
            debug!(kernel = %previous.id, "replacing previously launched kernel");
            previous.terminate(Duration::ZERO).await?;
        }
        Ok(info)
    }

    /// Ask the current kernel to shut down and stop proxying to it
    pub async fn shutdown_current_kernel(&self) -> Result<()> {
        let Some(info) = self.relay.client_info().await else {
            debug!("shutdown requested with no kernel connected");
            return Ok(());
        };

        let request = WireMessage::new(
            Header::new("shutdown_request", self.relay.session()),
            json!({}),
            json!({ "restart": false }),
        )?;
        let request_id = request.header()?.msg_id;

        // The reply answers our own request, so it must not reach the frontend
        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let ack = self.relay.registry().add_tagged(
            SocketType::Control,
            "shutdown_reply",
            &request_id,
            reply_to(&request_id, move |_| {
                if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(());
                }
            }),
        );

        let sent = self
            .relay
            .send_message(Side::Client, SocketType::Control, &request)
            .await;
        if sent.is_ok() && tokio::time::timeout(self.config.shutdown_grace, rx).await.is_err() {
            warn!(kernel = %info.kernel_name, "no shutdown_reply from kernel");
        }
        self.relay.registry().remove(ack);
        self.relay.detach_client().await;

        if let Some(kernel) = self.launched.lock().await.take() {
            kernel.terminate(self.config.shutdown_grace).await?;
        }
        info!(kernel = %info.kernel_name, "kernel shut down");
        sent
    }

    fn install_kernel_info_fallback(&self) {
        let tracker = self.kernel_info.clone();
        let timeout = self.config.kernel_info_timeout;
        let grace = self.config.kernel_info_grace;
        self.relay.registry().add(
            SocketType::Shell,
            "kernel_info_request",
            handler(move |relay, _target, frames| {
                let tracker = tracker.clone();
                async move {
                    let request = WireMessage::parse(frames.clone(), None)?;
                    let msg_id = request.header()?.msg_id;
                    tracker.request_seen(&msg_id);
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if !tracker.settle(&msg_id, KernelInfoState::FallbackSent) {
                            return;
                        }
                        warn!(msg_id = %msg_id, "no kernel_info_reply from kernel; answering for it");
                        if let Err(e) = send_fallback(&relay, &request).await {
                            warn!("could not send fallback kernel_info_reply: {}", e);
                        }
                        tokio::time::sleep(grace).await;
                        if tracker.forget_fallback(&msg_id) {
                            debug!(msg_id = %msg_id, "kernel never answered kernel_info_request");
                        }
                    });
                    Ok(Some(frames))
                }
            }),
        );

        let tracker = self.kernel_info.clone();
        self.relay.registry().add(
            SocketType::Shell,
            "kernel_info_reply",
            handler(move |_relay, _target, frames| {
                let tracker = tracker.clone();
                async move {
                    let reply = WireMessage::parse(frames.clone(), None)?;
                    let Some(parent_id) = reply.parent_msg_id()? else {
                        return Ok(Some(frames));
                    };
                    if tracker.settle(&parent_id, KernelInfoState::Resolved) {
                        return Ok(Some(frames));
                    }
                    if tracker.forget_fallback(&parent_id) {
                        debug!(msg_id = %parent_id, "dropping late kernel_info_reply");
                        return Ok(None);
                    }
                    Ok(Some(frames))
                }
            }),
        );
    }
}

async fn send_fallback(relay: &ProxyRelay, request: &WireMessage) -> Result<()> {
    let reply = request.reply(
        "kernel_info_reply",
        json!({
            "status": "ok",
            "protocol_version": PROTOCOL_VERSION,
            "implementation": "beaker",
            "implementation_version": env!("CARGO_PKG_VERSION"),
            "language_info": {
                "name": "unknown",
                "version": "",
                "mimetype": "text/plain",
                "file_extension": ".txt"
            },
            "banner": format!("Beaker kernel proxy: kernel not connected. {}", FALLBACK_NOTICE.trim_end()),
            "help_links": []
        }),
    )?;
    relay.send_message(Side::Server, SocketType::Shell, &reply).await?;

    let mut notice = request.reply(
        "stream",
        json!({ "name": "stderr", "text": FALLBACK_NOTICE }),
    )?;
    notice.identities = vec![Bytes::from_static(b"stream.stderr")];
    relay.send_message(Side::Server, SocketType::Iopub, &notice).await
}

/// Handler that consumes the reply to `request_id`, calling `on_reply` with
/// its content, and passes every other message through
fn reply_to<F>(request_id: &str, on_reply: F) -> Handler
where
    F: Fn(Value) + Send + Sync + 'static,
{
    let request_id = request_id.to_string();
    let on_reply = Arc::new(on_reply);
    handler(move |_relay, _target, frames| {
        let request_id = request_id.clone();
        let on_reply = on_reply.clone();
        async move {
            let msg = WireMessage::parse(frames.clone(), None)?;
            if msg.parent_msg_id()?.as_deref() != Some(request_id.as_str()) {
                return Ok(Some(frames));
            }
            on_reply(msg.content_value()?);
            Ok(None)
        }
    })
}
