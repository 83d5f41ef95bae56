// Launching the remote process
//
// The bridge owns both endpoints: it binds loopback-only listeners for the
// debug connection and the agent channel, spawns the JVM pointed at them,
// and refuses to come up if either side fails to connect in time.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, info};

use crate::agent::AgentChannel;
use crate::bridge::ExecutionBridge;
use crate::error::{ExecError, ExecResult};
use crate::jdwp::DebugLink;
use crate::pipe::Pipe;

/// Entry-point class the spawned JVM runs; must be present on the
/// configured classpath.
pub const DEFAULT_AGENT_CLASS: &str = "replbridge.RemoteAgent";

/// How long to wait for the spawned VM to connect back.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub java_command: PathBuf,
    pub classpath: Vec<PathBuf>,
    pub vm_options: Vec<String>,
    pub agent_class: String,
    pub accept_timeout: Duration,
}

impl LaunchConfig {
    pub fn new() -> Self {
        Self {
            java_command: PathBuf::from("java"),
            classpath: Vec::new(),
            vm_options: Vec::new(),
            agent_class: DEFAULT_AGENT_CLASS.to_string(),
            accept_timeout: ACCEPT_TIMEOUT,
        }
    }

    pub fn java_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.java_command = command.into();
        self
    }

    pub fn classpath_entry(mut self, entry: impl Into<PathBuf>) -> Self {
        self.classpath.push(entry.into());
        self
    }

    pub fn vm_option(mut self, option: impl Into<String>) -> Self {
        self.vm_options.push(option.into());
        self
    }

    pub fn agent_class(mut self, class: impl Into<String>) -> Self {
        self.agent_class = class.into();
        self
    }

    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    fn classpath_arg(&self) -> Option<String> {
        if self.classpath.is_empty() {
            return None;
        }
        let separator = if cfg!(windows) { ";" } else { ":" };
        Some(
            self.classpath
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(separator),
        )
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the remote VM and build the execution bridge over it.
/// Construction fails outright on spawn errors, accept timeout, or a bad
/// handshake on either connection; the spawned process is reaped on every
/// failure path.
pub async fn launch(config: &LaunchConfig) -> ExecResult<ExecutionBridge> {
    let jdwp_listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let agent_listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let jdwp_port = jdwp_listener.local_addr()?.port();
    let agent_port = agent_listener.local_addr()?.port();

    let mut child = spawn_vm(config, jdwp_port, agent_port)?;
    info!(jdwp_port, agent_port, "remote VM spawned");

    let timeout = config.accept_timeout;
    let established = async {
        // The JDWP transport attaches during VM startup; the agent
        // connects from its main method afterwards.
        let jdwp_stream = accept_one(&jdwp_listener, "debug", timeout).await?;
        let debug_link = DebugLink::from_stream(jdwp_stream)
            .await
            .map_err(ExecError::from)?;

        let agent_stream = accept_one(&agent_listener, "agent", timeout).await?;
        let stdout = Arc::new(Pipe::new());
        let stderr = Arc::new(Pipe::new());
        let channel =
            AgentChannel::establish(agent_stream, Arc::clone(&stdout), Arc::clone(&stderr)).await?;

        Ok::<_, ExecError>((debug_link, channel, stdout, stderr))
    };

    let (debug_link, channel, stdout, stderr) = match established.await {
        Ok(connections) => connections,
        Err(e) => {
            child.start_kill().ok();
            return Err(e);
        }
    };

    ExecutionBridge::new(channel, debug_link, child, stdout, stderr).await
}

fn spawn_vm(config: &LaunchConfig, jdwp_port: u16, agent_port: u16) -> ExecResult<Child> {
    let mut command = Command::new(&config.java_command);
    command.arg(format!(
        "-agentlib:jdwp=transport=dt_socket,server=n,suspend=n,address=127.0.0.1:{jdwp_port}"
    ));
    command.args(&config.vm_options);
    if let Some(classpath) = config.classpath_arg() {
        command.arg("-cp").arg(classpath);
    }
    command.arg(&config.agent_class);
    command.arg(agent_port.to_string());

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    debug!(java = %config.java_command.display(), agent = %config.agent_class, "spawning remote VM");
    Ok(command.spawn()?)
}

async fn accept_one(
    listener: &TcpListener,
    what: &str,
    timeout: Duration,
) -> ExecResult<TcpStream> {
    match time::timeout(timeout, listener.accept()).await {
        Ok(Ok((stream, addr))) => {
            debug!(%addr, what, "connection accepted");
            Ok(stream)
        }
        Ok(Err(e)) => Err(ExecError::Transport(e)),
        Err(_) => Err(ExecError::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no {what} connection within {timeout:?}"),
        ))),
    }
}
