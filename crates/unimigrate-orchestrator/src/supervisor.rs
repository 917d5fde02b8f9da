//! Worker process supervision.
//!
//! Before the orchestrator dispatches a migration it asks the supervisor
//! to guarantee the worker is alive: probe the health endpoint, and if the
//! worker is down, launch it and poll until healthy. Process state lives
//! behind one mutex so there is never more than one starting process.
//!
//! Captured stdout/stderr from a spawned worker is kept so that a worker
//! that dies during startup surfaces its output in the operation's error
//! message.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};

/// Supervisor's view of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Failed,
}

/// Bookkeeping entry for the supervised worker.
#[derive(Default)]
struct ServiceProcess {
    state: ProcessState,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_health_ok_at: Option<DateTime<Utc>>,
    child: Option<Child>,
    captured_output: Option<Arc<std::sync::Mutex<String>>>,
}

pub struct WorkerSupervisor {
    http: reqwest::Client,
    health_url: String,
    launch_command: Option<String>,
    startup_timeout: Duration,
    health_timeout: Duration,
    process: Mutex<ServiceProcess>,
}

impl WorkerSupervisor {
    pub fn new(
        health_url: String,
        launch_command: Option<String>,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            health_url,
            launch_command,
            startup_timeout,
            health_timeout: Duration::from_secs(5),
            process: Mutex::new(ServiceProcess::default()),
        }
    }

    /// Guarantee a healthy worker, launching one if necessary.
    pub async fn ensure_worker(&self) -> Result<()> {
        if self.probe_health().await {
            let mut process = self.process.lock().await;
            process.state = ProcessState::Running;
            process.last_health_ok_at = Some(Utc::now());
            return Ok(());
        }

        // The mutex makes this the only starting attempt; a concurrent
        // caller blocks here and sees the result of this launch.
        let mut process = self.process.lock().await;
        if self.probe_health().await {
            process.state = ProcessState::Running;
            process.last_health_ok_at = Some(Utc::now());
            return Ok(());
        }

        let Some(command) = &self.launch_command else {
            process.state = ProcessState::Failed;
            return Err(OrchestratorError::WorkerUnavailable(
                "worker is not responding and no launch command is configured".to_string(),
            ));
        };

        info!("Worker not responding; launching: {}", command);
        process.state = ProcessState::Starting;
        process.started_at = Some(Utc::now());

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::WorkerUnavailable(format!("failed to spawn worker: {}", e))
            })?;
        process.pid = child.id();

        let captured = Arc::new(std::sync::Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            spawn_capture(stdout, Arc::clone(&captured));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture(stderr, Arc::clone(&captured));
        }
        process.captured_output = Some(Arc::clone(&captured));

        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            // The spawned process dying before health means a startup
            // failure; surface what it printed.
            match child.try_wait() {
                Ok(Some(status)) => {
                    process.state = ProcessState::Failed;
                    process.pid = None;
                    // Give the capture tasks a moment to drain the pipes.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let output = captured.lock().unwrap().clone();
                    return Err(OrchestratorError::WorkerUnavailable(format!(
                        "worker exited during startup ({}): {}",
                        status,
                        output.trim()
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Could not poll worker process: {}", e);
                }
            }

            if self.probe_health().await {
                info!("Worker became healthy (pid {:?})", process.pid);
                process.state = ProcessState::Running;
                process.last_health_ok_at = Some(Utc::now());
                process.child = Some(child);
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                process.state = ProcessState::Failed;
                let output = captured.lock().unwrap().clone();
                child.start_kill().ok();
                return Err(OrchestratorError::WorkerUnavailable(format!(
                    "worker did not become healthy within {:?}: {}",
                    self.startup_timeout,
                    output.trim()
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// One health probe with a short timeout.
    async fn probe_health(&self) -> bool {
        match self
            .http
            .get(&self.health_url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Current process state, for diagnostics.
    pub async fn state(&self) -> ProcessState {
        self.process.lock().await.state
    }
}

fn spawn_capture<R>(reader: R, sink: Arc<std::sync::Mutex<String>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buffer = sink.lock().unwrap();
            // Keep the tail; startup errors are at the end.
            if buffer.len() > 16 * 1024 {
                let cut = buffer.len() - 8 * 1024;
                buffer.drain(..cut);
            }
            buffer.push_str(&line);
            buffer.push('\n');
        }
    });
}
