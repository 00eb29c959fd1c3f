//! Internal executions
//!
//! Runs code on the proxied kernel on behalf of the proxy itself (agents,
//! contexts) and collects what it prints and returns. The wire protocol has no
//! request/response primitive, so each execution gets a fresh message id and a
//! set of short-lived interceptors that only react to messages whose
//! `parent_header.msg_id` is that id.
//!
//! An execution is complete once its `execute_reply` has been seen. Output on
//! iopub is not ordered with respect to shell, so the wait then continues until
//! the request's `status: idle` arrives or the drain interval elapses.
//!
//! Without a timeout an execution whose kernel never replies waits forever;
//! use [`ExecutionCorrelator::execute_with_timeout`] to bound it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use crate::manager::KernelProxyManager;
use crate::parsers::ReturnParsers;
use crate::registry::{handler, Handler, InterceptorId};
use crate::socket::{Side, SocketType};
use crate::wire::{Frames, Header, WireMessage};

/// Error raised by the executed code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Everything collected for one internal execution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub msg_id: String,
    pub stdout_list: Vec<String>,
    pub stderr_list: Vec<String>,
    /// `text/plain` of the `execute_result`, if any
    #[serde(rename = "return")]
    pub return_value: Option<String>,
    pub display_data: Vec<Value>,
    pub error: Option<ExecutionError>,
    /// Content of the terminal `execute_reply`
    pub reply: Option<Value>,
    pub done: bool,
    /// Return value decoded by `evaluate`
    pub parsed_return: Option<Value>,
}

impl ExecutionResult {
    pub fn stdout(&self) -> String {
        self.stdout_list.concat()
    }

    pub fn stderr(&self) -> String {
        self.stderr_list.concat()
    }
}

/// Removes an execution's interceptors and bookkeeping when dropped
struct Teardown<'a> {
    correlator: &'a ExecutionCorrelator,
    msg_id: &'a str,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.correlator.teardown(self.msg_id);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    reply_seen: bool,
    idle_seen: bool,
}

type Record = Arc<Mutex<ExecutionResult>>;

fn lock(record: &Record) -> std::sync::MutexGuard<'_, ExecutionResult> {
    record.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ExecutionCorrelator {
    manager: Arc<KernelProxyManager>,
    parsers: ReturnParsers,
    pending: Mutex<HashSet<String>>,
    drain_interval: Duration,
}

impl ExecutionCorrelator {
    pub fn new(manager: Arc<KernelProxyManager>) -> Self {
        Self::with_parsers(manager, ReturnParsers::builtin())
    }

    pub fn with_parsers(manager: Arc<KernelProxyManager>, parsers: ReturnParsers) -> Self {
        let drain_interval = manager.config().drain_interval;
        Self {
            manager,
            parsers,
            pending: Mutex::new(HashSet::new()),
            drain_interval,
        }
    }

    pub fn manager(&self) -> &Arc<KernelProxyManager> {
        &self.manager
    }

    /// Number of executions still waiting for their reply
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `code` on the kernel and wait for it to finish.
    ///
    /// `response_handler` is installed as an extra `stream` interceptor for
    /// this execution's output while it runs.
    pub async fn execute(
        &self,
        code: &str,
        response_handler: Option<Handler>,
        parent_header: Value,
    ) -> Result<ExecutionResult> {
        let timeout = self.manager.config().execute_timeout;
        self.run(code, response_handler, parent_header, timeout).await
    }

    /// Like [`execute`](Self::execute), giving up after `timeout`
    pub async fn execute_with_timeout(
        &self,
        code: &str,
        response_handler: Option<Handler>,
        parent_header: Value,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.run(code, response_handler, parent_header, Some(timeout))
            .await
    }

    /// Execute `code` and decode its result with the parser for the current
    /// kernel's language. Parse failures are logged; the raw result is still
    /// returned.
    pub async fn evaluate(&self, code: &str, parent_header: Value) -> Result<ExecutionResult> {
        let mut result = self.execute(code, None, parent_header).await?;
        let kernel = self.manager.kernel_name().await.unwrap_or_default();
        match self.parsers.for_kernel(&kernel) {
            Some(parser) => match parser.parse_return(&result) {
                Ok(value) => result.parsed_return = Some(value),
                Err(e) => warn!(msg_id = %result.msg_id, kernel = %kernel, "{}", e),
            },
            None => warn!(kernel = %kernel, "no return parser for kernel"),
        }
        Ok(result)
    }

    async fn run(
        &self,
        code: &str,
        response_handler: Option<Handler>,
        parent_header: Value,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let msg_id = Uuid::new_v4().to_string();
        if !self.pending().insert(msg_id.clone()) {
            return Err(ProxyError::DuplicateExecution(msg_id));
        }

        let record: Record = Arc::new(Mutex::new(ExecutionResult {
            msg_id: msg_id.clone(),
            ..ExecutionResult::default()
        }));
        let relay = self.manager.relay();
        let request = WireMessage::new(
            Header::with_id(&msg_id, "execute_request", relay.session()),
            parent_header,
            json!({
                "code": code,
                "silent": false,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": true,
                "stop_on_error": false
            }),
        );
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                self.pending().remove(&msg_id);
                return Err(e);
            }
        };

        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        self.install(&msg_id, &record, Arc::new(progress_tx), response_handler);
        self.manager.register_internal_execution(&msg_id);
        // Also runs when the caller drops this future
        let _teardown = Teardown {
            correlator: self,
            msg_id: &msg_id,
        };

        debug!(msg_id = %msg_id, "sending internal execute_request");
        relay.send_message(Side::Client, SocketType::Shell, &request).await?;

        let finished = Self::wait(progress_rx, self.drain_interval);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.map_err(|_| {
                warn!(msg_id = %msg_id, "internal execution timed out");
                ProxyError::ExecutionTimeout {
                    msg_id: msg_id.clone(),
                }
            }),
            None => {
                finished.await;
                Ok(())
            }
        };
        outcome?;

        let mut result = lock(&record).clone();
        result.done = true;
        Ok(result)
    }

    async fn wait(mut progress: watch::Receiver<Progress>, drain: Duration) {
        let replied = progress.wait_for(|p| p.reply_seen).await.is_ok();
        if !replied {
            return;
        }
        let idle = tokio::time::timeout(drain, progress.wait_for(|p| p.idle_seen))
            .await
            .is_ok();
        if !idle {
            debug!("no idle status within the drain interval");
        }
    }

    fn teardown(&self, msg_id: &str) {
        let removed = self.manager.relay().registry().remove_tagged(msg_id);
        self.manager.unregister_internal_execution(msg_id);
        self.pending().remove(msg_id);
        debug!(msg_id, removed, "internal execution finished");
    }

    /// Install the interceptors belonging to one execution, all tagged with its
    /// message id
    fn install(
        &self,
        msg_id: &str,
        record: &Record,
        progress: Arc<watch::Sender<Progress>>,
        response_handler: Option<Handler>,
    ) {
        let registry = self.manager.relay().registry();
        let add = |socket: SocketType, msg_type: &str, h: Handler| {
            registry.add_tagged(socket, msg_type, msg_id, scoped(msg_id, h))
        };

        // Internal code is never echoed to the frontend
        add(SocketType::Iopub, "execute_input", drop_message());
        add(SocketType::Iopub, "execute_request", drop_message());

        // A request has at most one result, so its collector retires itself
        let result_id = Arc::new(OnceLock::<InterceptorId>::new());
        let capture = collect(record, |record, content| {
            record.return_value = content["data"]["text/plain"]
                .as_str()
                .map(str::to_string);
        });
        let slot = result_id.clone();
        let id = add(
            SocketType::Iopub,
            "execute_result",
            handler(move |relay, target, frames| {
                let capture = capture.clone();
                let slot = slot.clone();
                async move {
                    if let Some(id) = slot.get() {
                        relay.registry().remove(*id);
                    }
                    capture(relay, target, frames).await
                }
            }),
        );
        let _ = result_id.set(id);

        add(
            SocketType::Iopub,
            "stream",
            collect(record, |record, content| {
                let text = content["text"].as_str().unwrap_or_default().to_string();
                match content["name"].as_str() {
                    Some("stderr") => record.stderr_list.push(text),
                    _ => record.stdout_list.push(text),
                }
            }),
        );
        add(
            SocketType::Iopub,
            "error",
            collect(record, |record, content| {
                record.error = serde_json::from_value(content).ok();
            }),
        );
        add(
            SocketType::Iopub,
            "display_data",
            collect(record, |record, content| {
                record.display_data.push(content["data"].clone());
            }),
        );

        if let Some(response_handler) = response_handler {
            add(SocketType::Iopub, "stream", response_handler);
        }

        let idle = progress.clone();
        add(
            SocketType::Iopub,
            "status",
            handler(move |_relay, _target, frames| {
                let idle = idle.clone();
                async move {
                    let msg = WireMessage::parse(frames.clone(), None)?;
                    if msg.content_value()?["execution_state"] == "idle" {
                        idle.send_modify(|p| p.idle_seen = true);
                    }
                    Ok(Some(frames))
                }
            }),
        );

        // The reply answers our own request; the frontend never asked for it
        let record = record.clone();
        add(
            SocketType::Shell,
            "execute_reply",
            handler(move |_relay, _target, frames| {
                let record = record.clone();
                let progress = progress.clone();
                async move {
                    let content = WireMessage::parse(frames, None)?.content_value()?;
                    {
                        let mut record = lock(&record);
                        if record.error.is_none() && content["status"] == "error" {
                            record.error = serde_json::from_value(content.clone()).ok();
                        }
                        record.reply = Some(content);
                    }
                    progress.send_modify(|p| p.reply_seen = true);
                    Ok(None)
                }
            }),
        );
    }
}

/// Restrict `inner` to messages whose parent is `msg_id`; everything else
/// passes through untouched
fn scoped(msg_id: &str, inner: Handler) -> Handler {
    let msg_id = msg_id.to_string();
    handler(move |relay, target, frames| {
        let inner = inner.clone();
        let ours = belongs_to(&frames, &msg_id);
        async move {
            if ours {
                inner(relay, target, frames).await
            } else {
                Ok(Some(frames))
            }
        }
    })
}

fn belongs_to(frames: &Frames, msg_id: &str) -> bool {
    WireMessage::parse(frames.clone(), None)
        .and_then(|msg| msg.parent_msg_id())
        .ok()
        .flatten()
        .as_deref()
        == Some(msg_id)
}

fn drop_message() -> Handler {
    handler(|_relay, _target, _frames| async { Ok(None) })
}

/// Record something from the message content and pass the message on
fn collect<F>(record: &Record, apply: F) -> Handler
where
    F: Fn(&mut ExecutionResult, Value) + Send + Sync + 'static,
{
    let record = record.clone();
    let apply = Arc::new(apply);
    handler(move |_relay, _target, frames| {
        let record = record.clone();
        let apply = apply.clone();
        async move {
            let content = WireMessage::parse(frames.clone(), None)?.content_value()?;
            apply(&mut lock(&record), content);
            Ok(Some(frames))
        }
    })
}
