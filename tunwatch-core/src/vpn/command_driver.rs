//! Process-backed tunnel driver
//!
//! Runs one external tunnel client per session (openconnect, wg-quick
//! wrappers, vendor CLIs). Each protocol maps to a command line with
//! `{address}`, `{port}`, `{protocol}` and `{server_id}` placeholders.
//! The client must stay in the foreground: the tunnel is considered up once
//! the process has survived the startup grace period, and down as soon as
//! it exits.

use crate::error::TunnelError;
use crate::types::{Protocol, ServerDescriptor};
use crate::vpn::driver::{DropNotifier, TunnelDriver};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `[driver]` section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Command line per protocol, split on whitespace
    #[serde(default)]
    pub commands: BTreeMap<Protocol, String>,

    /// How long a freshly spawned client must stay alive to count as connected
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Wait after SIGTERM before escalating to SIGKILL
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_startup_grace_ms() -> u64 {
    1500
}
fn default_stop_grace_secs() -> u64 {
    5
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
            startup_grace_ms: default_startup_grace_ms(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

/// A running tunnel client
struct ActiveTunnel {
    pid: Pid,
    session: u64,
    closing: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

/// [`TunnelDriver`] that spawns one client process per tunnel
pub struct CommandTunnelDriver {
    commands: BTreeMap<Protocol, Vec<String>>,
    startup_grace: Duration,
    stop_grace: Duration,
    active: Mutex<Option<ActiveTunnel>>,
}

impl CommandTunnelDriver {
    /// Build a driver from settings
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::ProcessSpawnError` if a command line is empty or
    /// its program cannot be found on `PATH`.
    pub fn new(settings: &DriverSettings) -> Result<Self, TunnelError> {
        let mut commands = BTreeMap::new();
        for (protocol, line) in &settings.commands {
            let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            let Some(program) = argv.first() else {
                return Err(TunnelError::ProcessSpawnError {
                    reason: format!("empty command line for {}", protocol),
                });
            };
            which::which(program).map_err(|e| TunnelError::ProcessSpawnError {
                reason: format!("{} command {}: {}", protocol, program, e),
            })?;
            commands.insert(*protocol, argv);
        }

        Ok(Self {
            commands,
            startup_grace: Duration::from_millis(settings.startup_grace_ms),
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
            active: Mutex::new(None),
        })
    }

    /// Protocols this driver has a command for
    pub fn protocols(&self) -> Vec<Protocol> {
        self.commands.keys().copied().collect()
    }

    fn command_line(
        &self,
        server: &ServerDescriptor,
        protocol: Protocol,
    ) -> Result<Vec<String>, TunnelError> {
        let template = self
            .commands
            .get(&protocol)
            .ok_or(TunnelError::Unsupported { protocol })?;
        Ok(template
            .iter()
            .map(|arg| expand(arg, server, protocol))
            .collect())
    }

    fn spawn_client(&self, argv: &[String], protocol: Protocol) -> Result<Child, TunnelError> {
        let (program, args) = argv.split_first().ok_or(TunnelError::Unsupported { protocol })?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| TunnelError::ProcessSpawnError {
            reason: format!("Failed to spawn {}: {}", program, e),
        })?;
        debug!(program = %program, pid = ?child.id(), "Tunnel client spawned");
        Ok(child)
    }

    async fn terminate(&self, tunnel: ActiveTunnel) -> Result<(), TunnelError> {
        let ActiveTunnel {
            pid,
            session,
            closing,
            mut watcher,
        } = tunnel;
        closing.store(true, Ordering::Release);

        if watcher.is_finished() {
            debug!(%pid, session, "Tunnel client already exited");
            return Ok(());
        }

        info!(%pid, session, "Sending SIGTERM to tunnel client");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            watcher.abort();
            return Err(TunnelError::CloseFailed {
                reason: format!("Failed to send SIGTERM to {}: {}", pid, e),
            });
        }

        if tokio::time::timeout(self.stop_grace, &mut watcher).await.is_ok() {
            info!(%pid, "Tunnel client terminated gracefully");
            return Ok(());
        }

        warn!(%pid, "Graceful shutdown timed out, sending SIGKILL");
        // Dropping the child inside the aborted watcher also kills it
        let result = kill(pid, Signal::SIGKILL).map_err(|e| TunnelError::CloseFailed {
            reason: format!("Failed to send SIGKILL to {}: {}", pid, e),
        });
        watcher.abort();
        result
    }
}

fn expand(arg: &str, server: &ServerDescriptor, protocol: Protocol) -> String {
    arg.replace("{address}", &server.address)
        .replace("{port}", &server.port.to_string())
        .replace("{protocol}", protocol.as_str())
        .replace("{server_id}", &server.id)
}

async fn forward_stderr(stderr: ChildStderr, pid: Pid) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%pid, "tunnel client: {}", line);
    }
}

#[async_trait]
impl TunnelDriver for CommandTunnelDriver {
    #[tracing::instrument(
        skip(self, server, drops),
        fields(server = %server.id, session = drops.session())
    )]
    async fn open(
        &self,
        server: &ServerDescriptor,
        protocol: Protocol,
        drops: DropNotifier,
    ) -> Result<(), TunnelError> {
        let argv = self.command_line(server, protocol)?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!(session = previous.session, "Replacing previous tunnel client");
            if let Err(e) = self.terminate(previous).await {
                warn!("Failed to stop previous tunnel client: {}", e);
            }
        }

        let mut child = self.spawn_client(&argv, protocol)?;
        let raw_pid = child.id().ok_or_else(|| TunnelError::OpenFailed {
            protocol,
            reason: "client exited before its pid could be read".to_string(),
        })?;
        let pid = Pid::from_raw(raw_pid as i32);
        let stderr = child.stderr.take();

        match tokio::time::timeout(self.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(TunnelError::OpenFailed {
                    protocol,
                    reason: format!("client exited during startup ({})", status),
                });
            }
            Ok(Err(e)) => {
                return Err(TunnelError::OpenFailed {
                    protocol,
                    reason: e.to_string(),
                });
            }
            Err(_) => {}
        }

        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        let session = drops.session();
        let closing = Arc::new(AtomicBool::new(false));
        let watcher = {
            let closing = Arc::clone(&closing);
            tokio::spawn(async move {
                let reason = match child.wait().await {
                    Ok(status) => format!("tunnel client exited ({})", status),
                    Err(e) => format!("tunnel client lost: {}", e),
                };
                if closing.load(Ordering::Acquire) {
                    return;
                }
                warn!(%pid, session, "{}", reason);
                drops.notify(reason);
            })
        };

        info!(%pid, protocol = %protocol, "Tunnel client running");
        *active = Some(ActiveTunnel {
            pid,
            session,
            closing,
            watcher,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        let tunnel = self.active.lock().await.take();
        match tunnel {
            Some(tunnel) => self.terminate(tunnel).await,
            None => {
                debug!("No tunnel client to stop");
                Ok(())
            }
        }
    }
}
