//! Controller side: start a worker, talk to it, tear it down.
//!
//! ```no_run
//! # async fn demo() -> Result<(), crossbit::BridgeError> {
//! use crossbit::{SessionConfig, Value, Kwargs};
//!
//! let mut session = crossbit::open(SessionConfig::new("calculator")).await?;
//! let sum = session.call("add", vec![Value::from(2), Value::from(3)], Kwargs::new()).await?;
//! assert_eq!(sum, Value::Int(5));
//! let output = session.close(crossbit::DEFAULT_KILL_TIMEOUT).await;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::bootstrap::{DEFAULT_HOST, LaunchArgs, ModuleRef, search_path};
use crate::bridge::channel::{
    BulkChannel, RecoveryRecord, SessionFiles, remove_dir_if_exists, remove_file_if_exists,
};
use crate::bridge::codec::FormatVersion;
use crate::bridge::protocol::{self, Fault, Handshake, METADATA, Metadata, SHUTDOWN};
use crate::capture::{CapturedOutput, OutputCapture};
use crate::error::BridgeError;
use crate::handler::{HandlerRegistry, display_paths};
use crate::mock::MockSession;
use crate::platform::PlatformInfo;
use crate::transport::http::ServerConfig;
use crate::value::{Call, Kwargs, Value};

/// File name stem of the worker executable.
pub const SERVER_NAME: &str = "crossbit-server";

/// Environment variable naming the worker executable or its directory.
pub const SERVER_ENV: &str = "CROSSBIT_SERVER";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] io::Error),

    #[error("cannot find {name} (searched {})", display_paths(.searched))]
    NotFound { name: String, searched: Vec<PathBuf> },
}

/// Extension point for starting the worker process.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &LaunchArgs, platform: &PlatformInfo) -> Result<Child, SpawnError>;
}

/// Spawns the `crossbit-server` executable.
///
/// Lookup order: an explicit path, else an explicit directory, else
/// `CROSSBIT_SERVER`, else the directory of the running executable and its
/// parent.
#[derive(Debug, Clone, Default)]
pub struct ExecutableSpawner {
    exe: Option<PathBuf>,
    dir: Option<PathBuf>,
}

impl ExecutableSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(exe: impl Into<PathBuf>) -> Self {
        Self {
            exe: Some(exe.into()),
            dir: None,
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            exe: None,
            dir: Some(dir.into()),
        }
    }

    pub fn locate(&self, platform: &PlatformInfo) -> Result<PathBuf, SpawnError> {
        let name = platform.executable_name(SERVER_NAME);
        if let Some(exe) = &self.exe {
            return if exe.is_file() {
                Ok(exe.clone())
            } else {
                Err(SpawnError::NotFound {
                    name: exe.display().to_string(),
                    searched: Vec::new(),
                })
            };
        }

        let mut searched = Vec::new();
        if let Some(dir) = &self.dir {
            searched.push(dir.clone());
        } else {
            if let Some(value) = std::env::var_os(SERVER_ENV) {
                let path = PathBuf::from(value);
                if path.is_file() {
                    return Ok(path);
                }
                searched.push(path);
            }
            if let Ok(exe) = std::env::current_exe()
                && let Some(dir) = exe.parent()
            {
                searched.push(dir.to_path_buf());
                if let Some(parent) = dir.parent() {
                    searched.push(parent.to_path_buf());
                }
            }
        }

        let found = searched
            .iter()
            .map(|dir| dir.join(&name))
            .find(|candidate| candidate.is_file());
        found.ok_or(SpawnError::NotFound { name, searched })
    }
}

impl WorkerSpawner for ExecutableSpawner {
    fn spawn(&self, launch: &LaunchArgs, platform: &PlatformInfo) -> Result<Child, SpawnError> {
        let exe = self.locate(platform)?;
        tracing::debug!(exe = %exe.display(), args = ?launch.to_command_line(), "Spawning worker");
        let mut command = Command::new(&exe);
        command
            .args(launch.to_command_line())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        Ok(command.spawn()?)
    }
}

/// How to start and talk to a worker.
pub struct SessionConfig {
    pub module: String,
    /// `None` runs the handler in-process (see [`MockSession`]).
    pub host: Option<String>,
    /// `None` picks a free port.
    pub port: Option<u16>,
    pub format: FormatVersion,
    pub connect_timeout: Duration,
    /// `None` waits forever.
    pub response_timeout: Option<Duration>,
    pub append_sys_path: Vec<PathBuf>,
    pub append_environ_path: Vec<PathBuf>,
    pub add_dll_directory: Vec<PathBuf>,
    pub kwargs: Kwargs,
    pub platform: PlatformInfo,
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Handlers available to a mocked session.
    pub registry: Option<Arc<HandlerRegistry>>,
}

impl SessionConfig {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            host: Some(DEFAULT_HOST.to_string()),
            port: None,
            format: FormatVersion::LATEST,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: None,
            append_sys_path: Vec::new(),
            append_environ_path: Vec::new(),
            add_dll_directory: Vec::new(),
            kwargs: Kwargs::new(),
            platform: PlatformInfo::current(),
            spawner: Arc::new(ExecutableSpawner::new()),
            registry: None,
        }
    }

    /// A session that constructs the handler in this process.
    pub fn mocked(module: impl Into<String>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            host: None,
            registry: Some(registry),
            ..Self::new(module)
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_format(mut self, format: FormatVersion) -> Self {
        self.format = format;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_sys_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.append_sys_path.push(dir.into());
        self
    }

    pub fn with_environ_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.append_environ_path.push(dir.into());
        self
    }

    pub fn with_dll_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.add_dll_directory.push(dir.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_server_exe(self, exe: impl Into<PathBuf>) -> Self {
        self.with_spawner(Arc::new(ExecutableSpawner::at(exe)))
    }

    pub fn with_server_dir(self, dir: impl Into<PathBuf>) -> Self {
        self.with_spawner(Arc::new(ExecutableSpawner::in_dir(dir)))
    }

    pub fn is_mocked(&self) -> bool {
        self.host.is_none()
    }

    /// Constructor kwargs as they arrive on the worker.
    pub fn stringified_kwargs(&self) -> BTreeMap<String, String> {
        self.kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }

    /// Search path a worker started from this process would use.
    pub fn search_path(&self) -> Result<Vec<PathBuf>, BridgeError> {
        let module = ModuleRef::parse(&self.module).map_err(|e| BridgeError::Spawn(e.to_string()))?;
        let cwd = std::env::current_dir()?;
        Ok(search_path(&cwd, module.dir.as_deref(), &self.append_sys_path))
    }

    pub fn launch_args(&self, host: &str, port: u16) -> LaunchArgs {
        LaunchArgs {
            module: Some(self.module.clone()),
            host: host.to_string(),
            port,
            append_sys_path: absolutize(&self.append_sys_path),
            append_environ_path: absolutize(&self.append_environ_path),
            add_dll_directory: absolutize(&self.add_dll_directory),
            kwargs: self.stringified_kwargs(),
            ..Default::default()
        }
    }
}

fn absolutize(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| std::path::absolute(p).unwrap_or_else(|_| p.clone()))
        .collect()
}

/// A live connection to a handler, in another process or mocked in this one.
#[async_trait]
pub trait Session: Send {
    /// `None` when mocked.
    fn host(&self) -> Option<&str>;

    /// `-1` when mocked.
    fn port(&self) -> i32;

    fn library_path(&self) -> &Path;

    fn is_closed(&self) -> bool;

    /// Invoke `name` and wait for its result.
    async fn call(&mut self, name: &str, args: Vec<Value>, kwargs: Kwargs)
    -> Result<Value, BridgeError>;

    /// Stop the worker and return what it printed. Idempotent.
    async fn close(&mut self, kill_timeout: Duration) -> CapturedOutput;
}

/// Open a session: mocked when `config.host` is `None`, otherwise backed by a
/// worker process.
pub async fn open(config: SessionConfig) -> Result<Box<dyn Session>, BridgeError> {
    if config.is_mocked() {
        Ok(Box::new(MockSession::open(config)?))
    } else {
        Ok(Box::new(WorkerSession::open(config).await?))
    }
}

/// Session backed by a worker subprocess.
pub struct WorkerSession {
    module: String,
    host: String,
    port: u16,
    files: SessionFiles,
    child: Child,
    child_pid: Option<u32>,
    capture: Option<OutputCapture>,
    http: Option<reqwest::Client>,
    base: Url,
    channel: Option<BulkChannel>,
    metadata: Option<Metadata>,
    response_timeout: Option<Duration>,
    /// Member whose response timed out. Its late result may still land in the
    /// bulk file, so no further request can share it.
    stalled: Option<String>,
    closed: Option<CapturedOutput>,
}

impl WorkerSession {
    pub async fn open(config: SessionConfig) -> Result<Self, BridgeError> {
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match config.port {
            Some(port) => port,
            None => free_port(&host)?,
        };
        let files = SessionFiles::for_address(&host, port);
        let launch = config.launch_args(&host, port);

        tracing::info!(module = %config.module, %host, port, "Starting worker");
        let mut child = config
            .spawner
            .spawn(&launch, &config.platform)
            .map_err(|e| BridgeError::Spawn(e.to_string()))?;
        let child_pid = child.id();
        let capture = OutputCapture::start(&mut child);

        if let Err(message) = wait_for_port(&host, port, config.connect_timeout, &mut child).await {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Worker already gone");
            }
            let _ = child.wait().await;
            let output = capture.finish(OUTPUT_GRACE).await;
            cleanup(&files, None, child_pid);
            return Err(BridgeError::ConnectionTimeout {
                message,
                reason: describe_output(&config.module, &output),
            });
        }

        let http = reqwest::Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()?;
        let address = ServerConfig {
            host: host.clone(),
            port,
        }
        .address();
        let base = Url::parse(&format!("http://{address}/"))
            .map_err(|e| BridgeError::Protocol(format!("invalid worker address {address}: {e}")))?;

        let mut session = Self {
            module: config.module.clone(),
            host,
            port,
            files,
            child,
            child_pid,
            capture: Some(capture),
            http: Some(http),
            base,
            channel: None,
            metadata: None,
            response_timeout: config.response_timeout,
            stalled: None,
            closed: None,
        };
        session.configure(config.format).await?;
        let metadata = session.fetch_metadata().await?;
        tracing::info!(
            module = %session.module,
            pid = metadata.pid,
            library = %metadata.library_path.display(),
            "Worker ready"
        );
        session.metadata = Some(metadata);
        Ok(session)
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn files(&self) -> &SessionFiles {
        &self.files
    }

    /// Negotiated bulk-data format.
    pub fn format(&self) -> Option<FormatVersion> {
        self.channel.as_ref().map(BulkChannel::version)
    }

    /// Current output of the worker, without closing.
    pub fn output(&self) -> CapturedOutput {
        match (&self.closed, &self.capture) {
            (Some(output), _) => output.clone(),
            (None, Some(capture)) => capture.snapshot(),
            (None, None) => CapturedOutput::default(),
        }
    }

    /// Exit status of the worker process, `None` while it still runs.
    pub fn try_wait(&mut self) -> io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    fn client(&self) -> Result<&reqwest::Client, BridgeError> {
        self.http
            .as_ref()
            .ok_or_else(|| BridgeError::Protocol("the connection to the worker is closed".into()))
    }

    fn control_url(&self, name: &str) -> Result<Url, BridgeError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| BridgeError::Protocol(format!("cannot build a URL from {}", self.base)))?
            .clear()
            .push(name);
        Ok(url)
    }

    async fn configure(&mut self, format: FormatVersion) -> Result<(), BridgeError> {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("protocol", &format.as_u8().to_string())
            .append_pair("path", &self.files.bulk.to_string_lossy());

        let response = self.client()?.post(url).send().await?;
        match response.status().as_u16() {
            protocol::OK => {
                let handshake: Handshake = response.json().await?;
                let negotiated = FormatVersion::from_u8(handshake.protocol)?;
                if negotiated > format {
                    return Err(BridgeError::Protocol(format!(
                        "worker answered format {negotiated} to a request for {format}"
                    )));
                }
                tracing::debug!(requested = %format, %negotiated, "Bulk-data channel configured");
                self.channel = Some(BulkChannel::new(self.files.bulk.clone(), negotiated));
                Ok(())
            }
            protocol::ERROR => {
                let fault: Fault = response.json().await?;
                Err(BridgeError::Protocol(format!(
                    "cannot configure the bulk-data channel: {fault}"
                )))
            }
            status => Err(BridgeError::Protocol(format!(
                "unexpected status {status} while configuring the bulk-data channel"
            ))),
        }
    }

    async fn fetch_metadata(&self) -> Result<Metadata, BridgeError> {
        let response = self.client()?.get(self.control_url(METADATA)?).send().await?;
        match response.status().as_u16() {
            protocol::OK => Ok(response.json().await?),
            status => Err(BridgeError::Protocol(format!(
                "unexpected status {status} for {METADATA}"
            ))),
        }
    }

    /// Write the request, invoke `name` and read the response.
    async fn round_trip(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, BridgeError> {
        let client = self.client()?;
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| BridgeError::Protocol("the bulk-data channel is not configured".into()))?;

        channel.write(&Call::new(args, kwargs))?;
        let mut request = client.get(self.control_url(name)?);
        if let Some(timeout) = self.response_timeout {
            request = request.timeout(timeout);
        }
        tracing::debug!(member = name, "Sending request");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(BridgeError::ResponseTimeout {
                    name: name.to_string(),
                    timeout: self.response_timeout.unwrap_or_default(),
                });
            }
            Err(e) => return Err(BridgeError::Protocol(format!("request '{name}' failed: {e}"))),
        };

        match response.status().as_u16() {
            protocol::OK => Ok(channel.read()?),
            protocol::ERROR => {
                let fault: Fault = match response.json().await {
                    Ok(fault) => fault,
                    Err(e) if e.is_timeout() => {
                        return Err(BridgeError::ResponseTimeout {
                            name: name.to_string(),
                            timeout: self.response_timeout.unwrap_or_default(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                Err(BridgeError::Fault(fault))
            }
            status => Err(BridgeError::Protocol(format!(
                "unexpected status {status} for '{name}'"
            ))),
        }
    }
}

#[async_trait]
impl Session for WorkerSession {
    fn host(&self) -> Option<&str> {
        Some(&self.host)
    }

    fn port(&self) -> i32 {
        i32::from(self.port)
    }

    fn library_path(&self) -> &Path {
        self.metadata
            .as_ref()
            .map(|m| m.library_path.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    async fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, BridgeError> {
        if let Some(stalled) = &self.stalled {
            return Err(BridgeError::Protocol(format!(
                "the worker is still busy with '{stalled}', which timed out; close the session"
            )));
        }
        let result = self.round_trip(name, args, kwargs).await;
        if let Err(BridgeError::ResponseTimeout { .. }) = &result {
            self.stalled = Some(name.to_string());
        }
        result
    }

    async fn close(&mut self, kill_timeout: Duration) -> CapturedOutput {
        if let Some(output) = &self.closed {
            return output.clone();
        }

        if let Some(http) = self.http.take() {
            let url = self.control_url(SHUTDOWN);
            let child = &mut self.child;
            let stopped = tokio::time::timeout(kill_timeout, async {
                match url {
                    Ok(url) => {
                        if let Err(e) = http.post(url).send().await {
                            tracing::debug!(error = %e, "Shutdown request failed");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "Cannot build shutdown URL"),
                }
                child.wait().await
            })
            .await;
            match stopped {
                Ok(Ok(status)) => tracing::info!(%status, "Worker exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for the worker"),
                Err(_) => tracing::warn!(
                    timeout_secs = kill_timeout.as_secs_f64(),
                    "Worker did not stop after the shutdown request, killing it"
                ),
            }
        }
        if let Ok(None) = self.child.try_wait()
            && let Err(e) = self.child.kill().await
        {
            tracing::warn!(error = %e, "Failed to kill the worker");
        }

        cleanup(&self.files, self.metadata.as_ref(), self.child_pid);
        let output = match self.capture.take() {
            Some(capture) => capture.finish(OUTPUT_GRACE).await,
            None => CapturedOutput::default(),
        };
        self.closed = Some(output.clone());
        output
    }
}

impl fmt::Display for WorkerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<WorkerSession lib={} address={}:{}>",
            self.library_path().display(),
            self.host,
            self.port
        )
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        if self.closed.is_none() {
            tracing::debug!(module = %self.module, "Session dropped without close, killing worker");
            let _ = self.child.start_kill();
            cleanup(&self.files, self.metadata.as_ref(), self.child_pid);
        }
    }
}

fn free_port(host: &str) -> Result<u16, BridgeError> {
    let listener = std::net::TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Poll until the worker accepts connections, it exits, or `timeout` passes.
async fn wait_for_port(
    host: &str,
    port: u16,
    timeout: Duration,
    child: &mut Child,
) -> Result<(), String> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(format!(
                    "The worker exited ({status}) before {host}:{port} accepted connections"
                ));
            }
            Ok(None) => {}
            Err(e) => return Err(format!("Cannot poll the worker process: {e}")),
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(format!(
                "Timeout after {:.1} second(s). Could not connect to {host}:{port}",
                timeout.as_secs_f64()
            ));
        }
        if let Ok(Ok(_)) = tokio::time::timeout(remaining, TcpStream::connect((host, port))).await {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
    }
}

fn describe_output(module: &str, output: &CapturedOutput) -> String {
    let mut parts = Vec::new();
    if !output.stderr.is_empty() {
        parts.push(format!(
            "stderr from '{module}' is:\n{}",
            output.stderr_lossy().trim_end()
        ));
    }
    if !output.stdout.is_empty() {
        parts.push(format!(
            "stdout from '{module}' is:\n{}",
            output.stdout_lossy().trim_end()
        ));
    }
    if parts.is_empty() {
        format!(
            "The worker for '{module}' printed nothing. Diagnostics it prints while the handler \
             is constructed are shown here."
        )
    } else {
        parts.join("\n")
    }
}

/// Remove the session files and kill a worker that is not our direct child.
fn cleanup(files: &SessionFiles, metadata: Option<&Metadata>, child_pid: Option<u32>) {
    let pid = metadata
        .map(|m| m.pid)
        .or_else(|| RecoveryRecord::read(&files.recovery).ok().map(|r| r.pid));
    if let Some(pid) = pid
        && Some(pid) != child_pid
    {
        reap(pid);
    }

    if let Err(e) = remove_dir_if_exists(&files.resources) {
        tracing::warn!(path = %files.resources.display(), error = %e, "Failed to remove resource directory");
    }
    for path in [&files.bulk, &files.recovery] {
        if let Err(e) = remove_file_if_exists(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove session file");
        }
    }
}

#[cfg(unix)]
fn reap(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => tracing::info!(pid, "Killed orphaned worker process"),
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "Failed to kill orphaned worker process"),
    }
}

#[cfg(windows)]
fn reap(pid: u32) {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        tracing::warn!(pid, error = %e, "Failed to kill orphaned worker process");
    }
}

#[cfg(not(any(unix, windows)))]
fn reap(_pid: u32) {}
