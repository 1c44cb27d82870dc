//! Subprocess transport: one JSON message per line over stdin/stdout.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::Transport;
use super::env::EnvPolicy;
use crate::error::{ConduitError, Result};
use crate::rpc::{Correlator, Outbound, RpcResponse};

/// Build the child command with an explicit, fully specified environment
pub fn build_command(command: &str, args: &[String], env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// A tool server running as a child process
pub struct StdioTransport {
    label: String,
    pid: Option<u32>,
    open: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    correlator: Arc<Correlator>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("open", &self.is_open())
            .finish()
    }
}

impl StdioTransport {
    /// Spawn the server and start pumping messages.
    ///
    /// The child sees the host environment filtered through `policy`, with
    /// `overrides` applied last.
    pub fn spawn(
        command: &str,
        args: &[String],
        overrides: &HashMap<String, String>,
        policy: &EnvPolicy,
        correlator: Arc<Correlator>,
        outbound: Outbound,
    ) -> Result<Self> {
        let env = policy.build_from_process(overrides);
        let mut child = build_command(command, args, &env)
            .spawn()
            .map_err(|e| ConduitError::Transport(format!("failed to spawn '{}': {}", command, e)))?;

        let pid = child.id();
        let label = match pid {
            Some(pid) => format!("{} (pid {})", command, pid),
            None => command.to_string(),
        };
        log::info!("spawned tool server {}", label);

        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ConduitError::Transport(format!("'{}' was spawned without piped stdio", command)));
        };

        let open = Arc::new(AtomicBool::new(true));
        let tasks = vec![
            tokio::spawn(read_responses(stdout, Arc::clone(&correlator), Arc::clone(&open), label.clone())),
            tokio::spawn(write_requests(stdin, outbound, Arc::clone(&correlator), Arc::clone(&open), label.clone())),
            tokio::spawn(forward_stderr(stderr, label.clone())),
        ];

        Ok(Self {
            label,
            pid,
            open,
            child: Mutex::new(Some(child)),
            tasks: Mutex::new(tasks),
            correlator,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                log::debug!("kill {} failed: {}", self.label, e);
            }
            log::info!("stopped tool server {}", self.label);
        }
        self.correlator.reject_all(&format!("transport to {} closed", self.label));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!("stdio {}", self.label)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // The writer task holds the correlator and waits on its queue; abort it
        // or neither is ever released. The child goes with `kill_on_drop`.
        self.open.store(false, Ordering::SeqCst);
        for task in self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        self.correlator.reject_all(&format!("transport to {} dropped", self.label));
    }
}

async fn read_responses(stdout: ChildStdout, correlator: Arc<Correlator>, open: Arc<AtomicBool>, label: String) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match RpcResponse::parse(line) {
                    Ok(Some(response)) => {
                        correlator.dispatch(response);
                    }
                    Ok(None) => log::trace!("notification from {}: {}", label, line),
                    Err(e) => log::debug!("ignoring non-protocol output from {}: {}", label, e),
                }
            }
            Ok(None) => {
                log::info!("{} closed its output", label);
                break;
            }
            Err(e) => {
                log::warn!("reading from {} failed: {}", label, e);
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    correlator.reject_all(&format!("{} exited", label));
}

async fn write_requests(
    mut stdin: ChildStdin,
    mut outbound: Outbound,
    correlator: Arc<Correlator>,
    open: Arc<AtomicBool>,
    label: String,
) {
    while let Some(request) = outbound.recv().await {
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                correlator.reject_request(&request.id, e);
                continue;
            }
        };
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            log::warn!("writing to {} failed: {}", label, e);
            correlator.reject_request(
                &request.id,
                ConduitError::ConnectionClosed(format!("{} is not accepting input: {}", label, e)),
            );
            break;
        }
    }
    open.store(false, Ordering::SeqCst);
    correlator.reject_all(&format!("input to {} closed", label));
}

async fn forward_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[{}] {}", label, line);
    }
}
