//! SSH transport implementation using system ssh/scp commands
//!
//! Uses system SSH for reliability and to leverage the user's existing SSH
//! config. The remote side is a `dirdiff-agent daemon` process speaking the
//! framed protocol over the SSH channel's stdin/stdout.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dirdiff_core::protocol::{HEADER_LEN, MAX_WRITE_LEN, parse_message, payload_len};
use dirdiff_core::{Message, ProtocolWriter, ScanOptions, Snapshot, Transport, TransportError};

use crate::Platform;
use crate::agent::{AGENT_BINARY, AgentBundle};

/// How long to wait for the agent to exit after a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Quote a string for a POSIX shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// SSH transport for communicating with remote hosts
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    port: u16,
    user: String,
    platform: Platform,
    agent_path: Option<PathBuf>,
}

impl SshTransport {
    /// Connect to a remote host via SSH
    ///
    /// # Errors
    /// Returns an error if connection or platform detection fails
    pub async fn connect(host: &str, port: u16, user: &str) -> Result<Self> {
        info!("Connecting to {user}@{host}:{port}");

        let platform = Self::detect_platform_static(host, port, user).await?;
        info!("Remote platform: {:?}", platform);

        Ok(Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            platform,
            agent_path: None,
        })
    }

    /// Detect remote platform via uname
    async fn detect_platform_static(host: &str, port: u16, user: &str) -> Result<Platform> {
        let output = Command::new("ssh")
            .args([
                "-p",
                &port.to_string(),
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                &format!("{user}@{host}"),
                "uname -s && uname -m",
            ])
            .output()
            .await?;

        if !output.status.success() {
            bail!(
                "SSH connection failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let (Some(os), Some(arch)) = (lines.next(), lines.next()) else {
            bail!("Failed to detect platform: unexpected uname output: {stdout}");
        };

        Platform::from_uname(os, arch).ok_or_else(|| eyre!("Unsupported platform: {os} {arch}"))
    }

    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Build SSH destination string
    fn ssh_dest(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn ssh_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command.args([
            "-p",
            &self.port.to_string(),
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=10",
            &self.ssh_dest(),
        ]);
        command
    }

    /// Use an agent already installed on the remote `PATH`
    pub fn use_installed_agent(&mut self) {
        self.agent_path = Some(PathBuf::from(AGENT_BINARY));
    }

    /// Ensure the agent for this version is deployed to the remote host
    ///
    /// # Errors
    /// Returns an error if agent deployment fails
    pub async fn ensure_agent(&mut self, bundle: &AgentBundle) -> Result<PathBuf> {
        if let Some(path) = &self.agent_path {
            return Ok(path.clone());
        }

        let version = env!("CARGO_PKG_VERSION");
        let remote_dir = format!(".dirdiff/agents/{version}");
        let remote_path = format!("{remote_dir}/{AGENT_BINARY}");

        let (stdout, _, _) = self
            .execute(&format!("test -x ~/{remote_path} && echo exists"))
            .await?;
        let home = self.get_home_dir().await?;
        let full_path = format!("{home}/{remote_path}");

        if stdout.contains("exists") {
            debug!("Agent already deployed at {full_path}");
            self.agent_path = Some(PathBuf::from(&full_path));
            return Ok(PathBuf::from(full_path));
        }

        info!("Deploying agent to remote host...");
        let (_, stderr, code) = self.execute(&format!("mkdir -p ~/{remote_dir}")).await?;
        if code != 0 {
            bail!("Could not create {remote_dir} on remote: {stderr}");
        }

        let agent_data = bundle
            .get(self.platform)
            .ok_or_else(|| eyre!("No agent binary for platform {:?}", self.platform))?;
        self.upload_bytes(agent_data, &full_path).await?;

        let (_, stderr, code) = self
            .execute(&format!("chmod +x {}", shell_quote(&full_path)))
            .await?;
        if code != 0 {
            bail!("Could not mark agent executable: {stderr}");
        }

        info!("Agent deployed to {full_path}");
        self.agent_path = Some(PathBuf::from(&full_path));
        Ok(PathBuf::from(full_path))
    }

    /// Get remote home directory
    async fn get_home_dir(&self) -> Result<String> {
        let (stdout, _, _) = self.execute("echo $HOME").await?;
        Ok(stdout.trim().to_string())
    }

    /// Execute a command on the remote host, returning (stdout, stderr, exit code)
    ///
    /// # Errors
    /// Returns an error if ssh cannot be run
    pub async fn execute(&self, command: &str) -> Result<(String, String, i32)> {
        let output = self.ssh_command().arg(command).output().await?;

        Ok((
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code().unwrap_or(-1),
        ))
    }

    /// Upload a local file to the remote host
    ///
    /// # Errors
    /// Returns an error if upload fails
    pub async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let local = local_path
            .to_str()
            .ok_or_else(|| eyre!("Path is not UTF-8: {}", local_path.display()))?;
        let status = Command::new("scp")
            .args([
                "-P",
                &self.port.to_string(),
                "-o",
                "BatchMode=yes",
                local,
                &format!("{}:{}", self.ssh_dest(), remote_path),
            ])
            .status()
            .await?;

        if !status.success() {
            bail!("SCP upload failed");
        }
        Ok(())
    }

    /// Upload bytes directly to a remote path
    ///
    /// # Errors
    /// Returns an error if upload fails
    pub async fn upload_bytes(&self, data: &[u8], remote_path: &str) -> Result<()> {
        let temp_file = tempfile::NamedTempFile::new()?;
        tokio::fs::write(temp_file.path(), data).await?;
        self.upload(temp_file.path(), remote_path).await
    }

    /// Start the agent process on the remote host
    ///
    /// # Errors
    /// Returns an error if the agent is not deployed or ssh cannot be spawned
    pub fn start_agent(&self, root: &str) -> Result<Child> {
        let agent_path = self
            .agent_path
            .as_ref()
            .ok_or_else(|| eyre!("Agent not deployed - call ensure_agent first"))?;

        let child = self
            .ssh_command()
            .arg(format!(
                "{} daemon --root {}",
                shell_quote(&agent_path.to_string_lossy()),
                shell_quote(root)
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Ok(child)
    }

    /// Open an agent session on `root`
    ///
    /// # Errors
    /// Returns an error if the agent cannot be started
    pub fn open_session(&self, root: &str) -> Result<AgentSession> {
        let connection = AgentConnection::spawn(self, root)?;
        Ok(AgentSession {
            ssh: self.clone(),
            root: root.to_string(),
            connection: Mutex::new(Some(connection)),
        })
    }
}

/// A running agent process
struct AgentConnection {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl AgentConnection {
    fn spawn(ssh: &SshTransport, root: &str) -> Result<Self> {
        let mut child = ssh.start_agent(root)?;
        let stdin = child.stdin.take().ok_or_else(|| eyre!("agent stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("agent stdout not piped"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "dirdiff::agent", "{line}");
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn round_trip(&mut self, frame: &[u8]) -> io::Result<(u8, Vec<u8>)> {
        self.stdin.write_all(frame).await?;
        self.stdin.flush().await?;

        let mut header = [0u8; HEADER_LEN];
        self.stdout.read_exact(&mut header).await?;
        let mut payload = vec![0u8; payload_len(&header)];
        self.stdout.read_exact(&mut payload).await?;
        Ok((header[0], payload))
    }
}

/// Session with a remote agent, implementing [`Transport`].
///
/// Requests are serialized over one SSH channel. A channel that fails
/// mid-request is dropped and the next request starts a fresh agent, so
/// transient failures can be retried.
pub struct AgentSession {
    ssh: SshTransport,
    root: String,
    connection: Mutex<Option<AgentConnection>>,
}

fn encode(
    build: impl FnOnce(&mut ProtocolWriter<&mut Vec<u8>>) -> Result<()>,
) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    build(&mut ProtocolWriter::new(&mut buf))
        .map_err(|e| TransportError::Protocol(format!("{e:#}")))?;
    Ok(buf)
}

impl AgentSession {
    async fn request(&self, frame: Vec<u8>) -> Result<Message, TransportError> {
        let mut guard = self.connection.lock().await;

        if guard.is_none() {
            info!("Reconnecting agent session to {}", self.ssh.host);
            let connection = AgentConnection::spawn(&self.ssh, &self.root)
                .map_err(|e| TransportError::Connection(format!("{e:#}")))?;
            *guard = Some(connection);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(TransportError::Connection("agent not connected".into()));
        };

        match connection.round_trip(&frame).await {
            Ok((msg_type, payload)) => parse_message(msg_type, payload)
                .map_err(|e| TransportError::Protocol(format!("{e:#}"))),
            Err(e) => {
                warn!("Agent channel failed: {e}");
                if let Some(mut dead) = guard.take() {
                    let _ = dead.child.start_kill();
                }
                Err(TransportError::Connection(e.to_string()))
            }
        }
    }

    async fn expect_ok(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self.request(frame).await? {
            Message::Ok => Ok(()),
            Message::Error(message) => Err(TransportError::Remote(message)),
            other => Err(TransportError::Protocol(format!(
                "expected Ok, got {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl Transport for AgentSession {
    fn describe(&self) -> String {
        format!(
            "ssh:{}@{}:{}:{}",
            self.ssh.user, self.ssh.host, self.ssh.port, self.root
        )
    }

    async fn list_snapshot(&self, options: &ScanOptions) -> Result<Snapshot, TransportError> {
        let frame = encode(|w| w.send_snapshot_req(options))?;
        match self.request(frame).await? {
            Message::SnapshotResp(snapshot) => Ok(snapshot),
            Message::Error(message) => Err(TransportError::Remote(message)),
            other => Err(TransportError::Protocol(format!(
                "expected snapshot, got {other:?}"
            ))),
        }
    }

    async fn move_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError> {
        self.expect_ok(encode(|w| w.send_move_file(src, dst))?).await
    }

    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError> {
        self.expect_ok(encode(|w| w.send_copy_file(src, dst))?).await
    }

    async fn write_bytes(&self, dst: &Path, data: Bytes, mode: u32) -> Result<(), TransportError> {
        self.expect_ok(encode(|w| w.send_write_file(dst, &data, mode))?)
            .await
    }

    async fn delete(&self, path: &Path) -> Result<(), TransportError> {
        self.expect_ok(encode(|w| w.send_delete_file(path))?).await
    }

    fn max_write_len(&self) -> Option<u64> {
        Some(MAX_WRITE_LEN)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        let Some(mut connection) = guard.take() else {
            return Ok(());
        };

        let frame = encode(|w| w.send_shutdown())?;
        if let Err(e) = connection.round_trip(&frame).await {
            debug!("Agent closed before acknowledging shutdown: {e}");
        }
        drop(connection.stdin);

        match tokio::time::timeout(SHUTDOWN_GRACE, connection.child.wait()).await {
            Ok(status) => {
                debug!("Agent exited with {:?}", status?);
            }
            Err(_) => {
                warn!("Agent did not exit, killing it");
                connection.child.kill().await?;
            }
        }
        Ok(())
    }
}
