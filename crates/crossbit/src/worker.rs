//! Worker-side request handling.
//!
//! [`Dispatcher`] owns the handler and executes one request at a time.
//! [`WorkerService`] wraps it for the async control server: every request
//! takes the dispatcher lock on a blocking thread and holds it until the
//! response is in the bulk-data file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;

use crate::bridge::channel::BulkChannel;
use crate::bridge::codec::FormatVersion;
use crate::bridge::protocol::{Fault, Handshake, Metadata};
use crate::handler::Invoke;
use crate::value::{Call, Value};

/// Lifecycle of the worker's serve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct Dispatcher {
    handler: Box<dyn Invoke>,
    metadata: Metadata,
    channel: Option<BulkChannel>,
    state: WorkerState,
}

impl Dispatcher {
    pub fn new(handler: Box<dyn Invoke>, metadata: Metadata) -> Self {
        Self {
            handler,
            metadata,
            channel: None,
            state: WorkerState::Starting,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn channel(&self) -> Option<&BulkChannel> {
        self.channel.as_ref()
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler.type_name()
    }

    /// The listener is up; requests may arrive.
    pub fn serve(&mut self) {
        if self.state == WorkerState::Starting {
            self.state = WorkerState::Serving;
        }
    }

    /// Negotiate the bulk-data format and remember the channel path.
    ///
    /// Happens once per session; a second configure replaces the first.
    pub fn configure(&mut self, requested: u8, path: PathBuf) -> Result<FormatVersion, Fault> {
        let version = FormatVersion::negotiate(requested)
            .map_err(|e| Fault::protocol_error(e.to_string()))?;
        tracing::debug!(requested, negotiated = %version, path = %path.display(), "Configured bulk-data channel");
        self.channel = Some(BulkChannel::new(path, version));
        Ok(version)
    }

    /// Read the request for `member`, invoke it, write the result.
    pub fn dispatch(&mut self, member: &str) -> Result<(), Fault> {
        if self.state != WorkerState::Serving {
            return Err(Fault::protocol_error(format!(
                "worker is {}, cannot handle '{member}'",
                self.state
            )));
        }
        let Some(channel) = self.channel.as_ref() else {
            return Err(Fault::protocol_error(
                "the bulk-data channel has not been configured",
            ));
        };

        let call: Call = channel
            .read()
            .map_err(|e| Fault::protocol_error(format!("cannot read request: {e}")))?;
        tracing::debug!(member, args = call.args.len(), kwargs = call.kwargs.len(), "Dispatching");

        let value: Value = self
            .handler
            .invoke(member, call)
            .map_err(|fault| fault.in_member(member))?;

        channel
            .write(&value)
            .map_err(|e| Fault::protocol_error(format!("cannot write response: {e}")))?;
        Ok(())
    }

    /// Run the handler's shutdown hook. Returns `false` if it already ran.
    pub fn begin_shutdown(&mut self) -> bool {
        match self.state {
            WorkerState::ShuttingDown | WorkerState::Stopped => false,
            WorkerState::Starting | WorkerState::Serving => {
                self.state = WorkerState::ShuttingDown;
                self.handler.shutdown_handler();
                true
            }
        }
    }

    pub fn stop(&mut self) {
        self.state = WorkerState::Stopped;
    }
}

/// Async wrapper over the dispatcher used by the control routes.
pub struct WorkerService {
    dispatcher: Arc<Mutex<Dispatcher>>,
    metadata: Metadata,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let metadata = dispatcher.metadata().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            metadata,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Run `f` with the dispatcher locked, on a blocking thread.
    async fn with_dispatcher<R, F>(&self, f: F) -> Result<R, Fault>
    where
        F: FnOnce(&mut Dispatcher) -> R + Send + 'static,
        R: Send + 'static,
    {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_dispatcher(&dispatcher);
            f(&mut guard)
        })
        .await
        .map_err(|e| Fault::bare(Fault::PANIC, format!("request task failed: {e}")))
    }

    pub async fn serve(&self) -> Result<(), Fault> {
        self.with_dispatcher(|d| d.serve()).await
    }

    pub async fn configure(&self, protocol: u8, path: PathBuf) -> Result<Handshake, Fault> {
        let version = self
            .with_dispatcher(move |d| d.configure(protocol, path))
            .await??;
        Ok(Handshake {
            protocol: version.as_u8(),
        })
    }

    /// Metadata never changes after startup, so it is answered without
    /// waiting for the dispatcher.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub async fn invoke(&self, member: String) -> Result<(), Fault> {
        self.with_dispatcher(move |d| d.dispatch(&member)).await?
    }

    /// Run the shutdown hook, then signal the serve loop from a separate task
    /// so the caller's response goes out first.
    pub async fn shutdown(&self) -> Result<(), Fault> {
        let first = self.with_dispatcher(|d| d.begin_shutdown()).await?;
        if first {
            tracing::info!("Shutdown requested by controller");
        }
        let tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(true);
        });
        Ok(())
    }

    pub async fn stop(&self) {
        if let Err(fault) = self.with_dispatcher(|d| d.stop()).await {
            tracing::warn!(%fault, "Failed to mark worker stopped");
        }
    }

    pub async fn state(&self) -> Option<WorkerState> {
        self.with_dispatcher(|d| d.state()).await.ok()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

/// Handler panics are caught inside `invoke`, so a poisoned lock only means a
/// panic in the dispatcher itself. Keep serving with the inner value.
fn lock_dispatcher(dispatcher: &Mutex<Dispatcher>) -> MutexGuard<'_, Dispatcher> {
    dispatcher.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Dispatcher mutex poisoned, continuing with inner state");
        poisoned.into_inner()
    })
}
