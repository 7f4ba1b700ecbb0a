//! Server management - an ephemeral development server owned by one test
//!
//! Lifecycle: `NotStarted -> Starting -> Ready -> InUse -> Stopping -> Stopped`.
//! A server only counts as ready once its own log proves that the probe
//! reached this invocation, and it is stopped on every exit path.

use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ServerSettings;
use crate::error::{RegressError, RegressResult};
use crate::process_tree::{platform_terminator, TreeTerminator};

/// Startup banner of the development server
pub const DEFAULT_BANNER: &str = "Watching for file changes with StatReloader";

/// Wait after SIGKILL before the final liveness check
const KILL_WAIT: Duration = Duration::from_secs(2);

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Server log file written into the project directory
pub const RUNSERVER_LOG: &str = "runserver_log.txt";

/// Logged when another process already holds the port
pub const PORT_IN_USE_MARKER: &str = "Error: That port is already in use";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotStarted,
    Starting,
    Ready,
    InUse,
    Stopping,
    Stopped,
}

/// How readiness is established and confirmed
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Path requested during polling
    pub path: String,
    pub max_attempts: usize,
    pub interval: Duration,
    /// Pause between the first success and reading the log
    pub settle: Duration,
    pub banner: String,
    pub port_in_use_marker: String,
}

impl ReadinessProbe {
    /// Log line the server writes for a successful probe
    pub fn request_marker(&self) -> String {
        format!("GET {} HTTP/1.1\" 200", self.path)
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            max_attempts: 50,
            interval: Duration::from_millis(200),
            settle: Duration::from_secs(1),
            banner: DEFAULT_BANNER.to_string(),
            port_in_use_marker: PORT_IN_USE_MARKER.to_string(),
        }
    }
}

/// Configuration for spawning a server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: BTreeMap<String, String>,

    /// Combined stdout and stderr of the server
    pub log_path: PathBuf,

    pub port: u16,
    pub probe: ReadinessProbe,

    /// How long to wait for a graceful exit before killing the tree
    pub stop_grace: Duration,
}

impl ServerConfig {
    /// `<python> manage.py runserver <port>` in `project_dir`
    pub fn runserver(python: &Path, project_dir: &Path, settings: &ServerSettings) -> Self {
        let mut envs = BTreeMap::new();
        envs.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            program: python.to_path_buf(),
            args: vec![
                "manage.py".to_string(),
                "runserver".to_string(),
                settings.port.to_string(),
            ],
            cwd: project_dir.to_path_buf(),
            envs,
            log_path: project_dir.join(RUNSERVER_LOG),
            port: settings.port,
            probe: ReadinessProbe {
                max_attempts: settings.max_attempts,
                interval: Duration::from_millis(settings.poll_interval_ms),
                settle: Duration::from_millis(settings.settle_ms),
                ..ReadinessProbe::default()
            },
            stop_grace: Duration::from_millis(settings.stop_grace_ms),
        }
    }
}

/// What happened when a server was stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReport {
    pub pid: u32,
    pub strategy: String,
    /// Graceful termination was not enough and the tree was killed
    pub escalated: bool,
    /// Nothing of the process tree is running any more
    pub terminated: bool,
}

/// Handle to a running server process
pub struct ServerHandle {
    child: Child,
    pid: u32,
    state: ServerState,
    base_url: String,
    log_path: PathBuf,
    stop_grace: Duration,
    terminator: Box<dyn TreeTerminator>,
    report: Option<StopReport>,
}

impl ServerHandle {
    /// Spawn the server in its own process group and wait until it is
    /// confirmed ready. On any failure the server is stopped before the
    /// error is returned.
    pub async fn spawn(config: ServerConfig) -> RegressResult<Self> {
        let mut handle = Self::start(&config)?;

        match handle.wait_until_ready(&config.probe).await {
            Ok(()) => {
                handle.state = ServerState::Ready;
                info!("Server is ready at {}", handle.base_url);
                Ok(handle)
            }
            Err(e) => {
                handle.shutdown().await;
                Err(e)
            }
        }
    }

    /// NotStarted -> Starting
    fn start(config: &ServerConfig) -> RegressResult<Self> {
        info!("Starting server on port {}...", config.port);

        let log = File::create(&config.log_path)?;
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(&config.cwd)
            .envs(&config.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        new_process_group(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            RegressError::ServerStartup(format!("failed to spawn {}: {}", config.program.display(), e))
        })?;
        let pid = child.id();
        info!("Server PID: {} (log: {})", pid, config.log_path.display());

        Ok(Self {
            child,
            pid,
            state: ServerState::Starting,
            base_url: format!("http://localhost:{}", config.port),
            log_path: config.log_path.clone(),
            stop_grace: config.stop_grace,
            terminator: platform_terminator(),
            report: None,
        })
    }

    /// Starting -> Ready: poll until the server answers 200, then confirm
    /// from the log that the answer came from this invocation.
    async fn wait_until_ready(&mut self, probe: &ReadinessProbe) -> RegressResult<()> {
        let url = format!("{}{}", self.base_url, probe.path);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let mut connected = false;
        let mut attempts = 0;
        while attempts < probe.max_attempts {
            attempts += 1;

            match client.get(&url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    connected = true;
                    break;
                }
                Ok(resp) => {
                    warn!("Readiness probe returned {}", resp.status());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for server to start...");
                    }
                    if !e.is_connect() {
                        warn!("Readiness probe error: {}", e);
                    }
                }
            }

            if let Some(status) = self.child.try_wait()? {
                let log = self.read_log();
                if log.contains(&probe.port_in_use_marker) {
                    return Err(RegressError::StaleServer(format!(
                        "port already in use; server exited with {}",
                        status
                    )));
                }
                return Err(RegressError::ServerStartup(format!(
                    "server exited with {} before becoming ready; see {}",
                    status,
                    self.log_path.display()
                )));
            }

            sleep(probe.interval).await;
        }

        if !connected {
            return Err(RegressError::ServerHealthCheck(attempts));
        }

        // Give the server a moment to flush the request line
        sleep(probe.settle).await;
        confirm_ownership(&self.read_log(), probe)
    }

    fn read_log(&self) -> String {
        std::fs::read(&self.log_path)
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Ready -> InUse
    pub fn mark_in_use(&mut self) {
        if self.state == ServerState::Ready {
            self.state = ServerState::InUse;
        }
    }

    /// Whether the server's process tree is still running
    pub fn is_running(&mut self) -> bool {
        let root_running = matches!(self.child.try_wait(), Ok(None));
        root_running || self.terminator.tree_alive(self.pid)
    }

    /// Stopping -> Stopped. Terminates the whole process tree, escalates
    /// after the grace period and reports whether anything survived.
    /// Calling it again returns the first report.
    ///
    /// Blocks the calling thread while waiting; async callers use
    /// [`ServerHandle::shutdown`].
    pub fn stop(&mut self) -> StopReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        self.begin_stop();
        let mut escalated = false;
        if !self.wait_for_exit(self.stop_grace) {
            escalated = true;
            self.escalate();
            self.wait_for_exit(KILL_WAIT);
        }
        self.finish_stop(escalated)
    }

    /// Same as [`ServerHandle::stop`], waiting on the runtime timer
    pub async fn shutdown(&mut self) -> StopReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        self.begin_stop();
        let mut escalated = false;
        if !self.exited_within(self.stop_grace).await {
            escalated = true;
            self.escalate();
            self.exited_within(KILL_WAIT).await;
        }
        self.finish_stop(escalated)
    }

    fn begin_stop(&mut self) {
        self.state = ServerState::Stopping;
        info!("Stopping server (pid: {})", self.pid);

        if let Err(e) = self.terminator.terminate_tree(self.pid) {
            warn!("Terminating process tree failed: {}", e);
        }
    }

    fn escalate(&mut self) {
        warn!("Server did not exit within {:?}; killing process tree", self.stop_grace);
        if let Err(e) = self.terminator.kill_tree(self.pid) {
            warn!("Killing process tree failed: {}", e);
        }
        let _ = self.child.kill();
    }

    fn finish_stop(&mut self, escalated: bool) -> StopReport {
        let terminated = !self.is_running();
        if terminated {
            info!("Server process terminated.");
        } else {
            error!(
                "Server still running after stop (pid: {}); terminate it manually before the next run",
                self.pid
            );
        }

        self.state = ServerState::Stopped;
        let report = StopReport {
            pid: self.pid,
            strategy: self.terminator.name().to_string(),
            escalated,
            terminated,
        };
        self.report = Some(report.clone());
        report
    }

    fn wait_for_exit(&mut self, grace: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_running() {
                return true;
            }
            if start.elapsed() >= grace {
                return false;
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    async fn exited_within(&mut self, grace: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_running() {
                return true;
            }
            if start.elapsed() >= grace {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.report.is_none() {
            let _ = self.stop();
        }
    }
}

/// Verify from the server log that the successful probe was answered by
/// this invocation and not by a stale server still holding the port.
pub fn confirm_ownership(log_text: &str, probe: &ReadinessProbe) -> RegressResult<()> {
    if log_text.contains(&probe.port_in_use_marker) {
        return Err(RegressError::StaleServer(
            "log reports the port was already in use".to_string(),
        ));
    }
    if !log_text.contains(&probe.banner) {
        return Err(RegressError::StaleServer(format!(
            "startup banner {:?} missing from log",
            probe.banner
        )));
    }
    let marker = probe.request_marker();
    if !log_text.contains(&marker) {
        return Err(RegressError::StaleServer(format!(
            "probe request {:?} missing from log",
            marker
        )));
    }
    debug!("Server log confirms ownership of the connection");
    Ok(())
}

/// Run `body` against a freshly started server. The server is stopped on
/// every exit path; a cleanup failure is reported but never replaces the
/// body's own result.
pub async fn with_server<F, Fut, T>(config: ServerConfig, body: F) -> RegressResult<(T, StopReport)>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = RegressResult<T>>,
{
    let mut server = ServerHandle::spawn(config).await?;
    server.mark_in_use();

    let result = body(server.base_url().to_string()).await;
    let report = server.shutdown().await;

    result.map(|value| (value, report))
}

#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn new_process_group(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}
