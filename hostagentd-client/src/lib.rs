//! Control-plane client for the host agent daemon.
//!
//! The client owns the channel directory: it binds the control socket
//! the agent connects to, delivers the bootstrap configuration, and
//! opens one fresh task socket per dispatched request. Task requests
//! are sealed under the shared host identity; shortcut commands travel
//! in the clear.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use hostagent_proto::envelope::{
    current_timestamp, decrypt_request, encrypt_response, EnvelopeError, HostIdentity, NONCE_LEN,
};
use hostagent_proto::frame::{read_framed, write_framed, FrameError};
use hostagent_proto::SENTINEL_DONE;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use hostagent_proto::{SHORTCUT_HEALTHCHECK, SHORTCUT_STATUSCHECK, SHORTCUT_VERSIONCHECK};

pub const DEFAULT_CHANNEL_DIR: &str = "/tmp/hostagent";

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("channel i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("request rejected by the agent")]
    Rejected,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("agent not connected")]
    NotConnected,
    #[error("timed out waiting for the agent")]
    Timeout,
}

struct ControlChannel {
    // Held so the agent's read end stays open; the control channel only
    // carries frames toward the agent.
    _reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One deployment's control plane: a control socket plus per-request
/// task sockets, all inside the channel directory.
pub struct ControlPlane {
    channel_dir: PathBuf,
    control_path: PathBuf,
    identity: HostIdentity,
    listener: UnixListener,
    control: Option<ControlChannel>,
}

impl ControlPlane {
    /// Bind the control socket `<channel_dir>/<deployment_id>.sock`.
    pub fn bind(
        channel_dir: impl AsRef<Path>,
        deployment_id: &str,
        identity: HostIdentity,
    ) -> Result<Self, ClientError> {
        let channel_dir = channel_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&channel_dir)?;

        let control_path = channel_dir.join(format!("{deployment_id}.sock"));
        let _ = std::fs::remove_file(&control_path);
        let listener = UnixListener::bind(&control_path)?;
        info!(path = %control_path.display(), "control socket bound");

        Ok(Self {
            channel_dir,
            control_path,
            identity,
            listener,
            control: None,
        })
    }

    /// Wait for the agent to connect, then deliver the bootstrap
    /// configuration as the first frame.
    pub async fn accept_agent(&mut self, bootstrap_config: &str) -> Result<(), ClientError> {
        let (stream, _) = timeout(ACCEPT_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| ClientError::Timeout)??;
        info!("agent connected to control channel");

        let (read_half, mut writer) = stream.into_split();
        write_framed(&mut writer, bootstrap_config).await?;
        self.control = Some(ControlChannel {
            _reader: BufReader::new(read_half),
            writer,
        });
        Ok(())
    }

    /// Send one raw value over a fresh task channel and return the raw
    /// reply. The task socket is bound before its name is announced so
    /// the agent can never race the bind.
    pub async fn dispatch_raw(&mut self, value: &str) -> Result<String, ClientError> {
        let control = self.control.as_mut().ok_or(ClientError::NotConnected)?;

        let name = format!("task-{}", Uuid::new_v4());
        let path = self.channel_dir.join(&name);
        let task_listener = UnixListener::bind(&path)?;
        debug!(channel = %name, "task channel bound");

        write_framed(&mut control.writer, &name).await?;

        let result = Self::exchange(&task_listener, value).await;
        let _ = std::fs::remove_file(&path);
        result
    }

    async fn exchange(listener: &UnixListener, value: &str) -> Result<String, ClientError> {
        let (stream, _) = timeout(ACCEPT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| ClientError::Timeout)??;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_framed(&mut writer, value).await?;
        Ok(read_framed(&mut reader).await?)
    }

    /// Run one named task and return its parsed response envelope.
    pub async fn run_task(&mut self, name: &str, parameters: Value) -> Result<Value, ClientError> {
        let descriptor = json!({"name": name, "parameters": parameters}).to_string();
        let nonce: [u8; NONCE_LEN] = rand::random();
        let sealed = encrypt_response(&descriptor, &nonce, &current_timestamp(), &self.identity)?;

        let raw = self.dispatch_raw(&sealed).await?;
        if raw.is_empty() {
            warn!(task = %name, "agent rejected the request");
            return Err(ClientError::Rejected);
        }

        let opened = decrypt_request(&raw, &self.identity, Utc::now())?;
        serde_json::from_str(&opened.payload)
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Run an unencrypted shortcut command.
    pub async fn shortcut(&mut self, command: &str) -> Result<String, ClientError> {
        self.dispatch_raw(command).await
    }

    /// Tell the agent to stop accepting work and drain.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        let control = self.control.as_mut().ok_or(ClientError::NotConnected)?;
        write_framed(&mut control.writer, SENTINEL_DONE).await?;
        Ok(())
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.control_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dispatch_before_accept_is_not_connected() {
        let dir = TempDir::new().unwrap();
        let mut plane =
            ControlPlane::bind(dir.path(), "test", HostIdentity::new("i-1", "r-1")).unwrap();
        let err = plane.dispatch_raw("statuscheck").await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn control_socket_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = {
            let plane =
                ControlPlane::bind(dir.path(), "test", HostIdentity::new("i-1", "r-1")).unwrap();
            plane.control_path.clone()
        };
        assert!(!path.exists());
    }
}
