//! Control channel: supervisor-to-strategy command protocol.
//!
//! One JSON object per line over a Unix domain socket. Every request gets
//! exactly one reply line:
//!
//! ```text
//! → {"op":"start_strategy","credential":{..},"strategy_kind":"grid",..}
//! ← {"ok":true}
//! → {"op":"exec","params":{"rebalance":true}}
//! ← {"ok":false,"error":"no strategy running"}
//! ```
//!
//! The client connects per request, so it works against a child that has
//! not bound its endpoint yet: the call simply fails and the caller retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strat_core::{Credential, DesiredTask, StrategyKind, TaskKey};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::host::StrategyHost;

/// Largest accepted line, newline excluded.
pub(crate) const MAX_FRAME: usize = 1024 * 1024;

// ── Messages ──────────────────────────────────────────────────────

/// Everything a child needs to run one strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub credential: Credential,
    pub strategy_kind: StrategyKind,
    pub instrument_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StrategySpec {
    pub fn task_key(&self) -> TaskKey {
        TaskKey::new(&self.credential.account, &self.strategy_kind, &self.instrument_id)
    }
}

impl From<&DesiredTask> for StrategySpec {
    fn from(task: &DesiredTask) -> Self {
        Self {
            credential: task.credential.clone(),
            strategy_kind: task.strategy_kind.clone(),
            instrument_id: task.instrument_id.clone(),
            endpoint: task.endpoint.clone(),
            params: task.params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    StartStrategy(StrategySpec),
    StopStrategy,
    Exec {
        #[serde(default)]
        params: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn ack() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }

    fn into_result(self) -> ControlResult<()> {
        if self.ok {
            Ok(())
        } else {
            Err(ControlError::Rejected(
                self.error.unwrap_or_else(|| "unspecified".to_string()),
            ))
        }
    }
}

// ── Client ────────────────────────────────────────────────────────

/// Issues commands to the child listening on one endpoint.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    /// `timeout` bounds each round trip, connect included.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn start_strategy(&self, spec: &StrategySpec) -> ControlResult<()> {
        self.call(&ControlRequest::StartStrategy(spec.clone())).await
    }

    pub async fn stop_strategy(&self) -> ControlResult<()> {
        self.call(&ControlRequest::StopStrategy).await
    }

    pub async fn exec(&self, params: serde_json::Value) -> ControlResult<()> {
        self.call(&ControlRequest::Exec { params }).await
    }

    async fn call(&self, request: &ControlRequest) -> ControlResult<()> {
        match tokio::time::timeout(self.timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout(self.timeout)),
        }
    }

    async fn round_trip(&self, request: &ControlRequest) -> ControlResult<()> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| ControlError::Connect {
                path: self.path.clone(),
                source,
            })?;
        let (read, mut write) = stream.into_split();

        let mut line =
            serde_json::to_vec(request).map_err(|e| ControlError::Protocol(e.to_string()))?;
        line.push(b'\n');
        write.write_all(&line).await?;

        let Some(reply) = read_frame(&mut BufReader::new(read)).await? else {
            return Err(ControlError::Protocol(
                "connection closed before reply".to_string(),
            ));
        };
        let reply: ControlReply =
            serde_json::from_slice(&reply).map_err(|e| ControlError::Protocol(e.to_string()))?;
        reply.into_result()
    }
}

// ── Server ────────────────────────────────────────────────────────

/// The child side of the channel.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind `path`, replacing a socket left behind by a previous process.
    pub fn bind(path: &Path) -> ControlResult<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control endpoint"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ControlError::Bind {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
        let listener = UnixListener::bind(path).map_err(|source| ControlError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires, then remove the endpoint.
    pub async fn serve(
        self,
        host: Arc<dyn StrategyHost>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ControlResult<()> {
        info!(path = %self.path.display(), "control channel listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let host = host.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, host).await {
                            debug!(error = %e, "control connection ended with error");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove control endpoint");
        }
        info!("control channel closed");
        Ok(())
    }
}

async fn handle_connection(stream: UnixStream, host: Arc<dyn StrategyHost>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Some(frame) = read_frame(&mut reader).await? {
        let reply = match serde_json::from_slice::<ControlRequest>(&frame) {
            Ok(request) => dispatch(host.as_ref(), request).await,
            Err(e) => ControlReply::failed(format!("malformed request: {e}")),
        };
        let mut bytes = serde_json::to_vec(&reply)?;
        bytes.push(b'\n');
        write.write_all(&bytes).await?;
    }
    Ok(())
}

/// Read one line of at most [`MAX_FRAME`] bytes. `None` at end of stream.
async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let read = (&mut *reader)
        .take(MAX_FRAME as u64 + 1)
        .read_until(b'\n', &mut frame)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if frame.last() == Some(&b'\n') {
        frame.pop();
    } else if frame.len() > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "control frame too large",
        ));
    }
    Ok(Some(frame))
}

async fn dispatch(host: &dyn StrategyHost, request: ControlRequest) -> ControlReply {
    let result = match request {
        ControlRequest::StartStrategy(spec) => {
            debug!(task_key = %spec.task_key(), "start strategy requested");
            host.start(spec).await
        }
        ControlRequest::StopStrategy => host.stop().await,
        ControlRequest::Exec { params } => host.exec(params).await,
    };
    match result {
        Ok(()) => ControlReply::ack(),
        Err(e) => ControlReply::failed(format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;

    fn spec(instrument: &str) -> StrategySpec {
        StrategySpec {
            credential: Credential {
                account: "acct".to_string(),
                api_key: "k".to_string(),
                secret: "s".to_string(),
                passphrase: None,
            },
            strategy_kind: "grid".to_string(),
            instrument_id: instrument.to_string(),
            endpoint: "wss://exchange".to_string(),
            params: serde_json::json!({"levels": 5}),
        }
    }

    struct Running {
        _dir: tempfile::TempDir,
        host: Arc<RecordingHost>,
        client: ControlClient,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<ControlResult<()>>,
    }

    fn serve() -> Running {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let host = Arc::new(RecordingHost::default());
        let server = ControlServer::bind(&path).unwrap();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(server.serve(host.clone(), rx));
        Running {
            _dir: dir,
            host,
            client: ControlClient::new(path, Duration::from_secs(2)),
            shutdown,
            task,
        }
    }

    #[test]
    fn requests_are_tagged_by_op() {
        let json = serde_json::to_value(ControlRequest::StopStrategy).unwrap();
        assert_eq!(json, serde_json::json!({"op": "stop_strategy"}));

        let json = serde_json::to_value(ControlRequest::StartStrategy(spec("BTC"))).unwrap();
        assert_eq!(json["op"], "start_strategy");
        assert_eq!(json["instrument_id"], "BTC");
    }

    #[tokio::test]
    async fn commands_reach_the_host() {
        let running = serve();
        running.client.start_strategy(&spec("BTC")).await.unwrap();
        running
            .client
            .exec(serde_json::json!({"rebalance": true}))
            .await
            .unwrap();

        let state = running.host.snapshot().await;
        assert_eq!(state.active, Some(spec("BTC")));
        assert_eq!(state.commands, vec![serde_json::json!({"rebalance": true})]);

        running.client.stop_strategy().await.unwrap();
        assert!(running.host.snapshot().await.active.is_none());
    }

    #[tokio::test]
    async fn host_rejection_is_reported() {
        let running = serve();
        let err = running.client.exec(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ControlError::Rejected(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_endpoint_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(dir.path().join("absent.sock"), Duration::from_secs(1));
        let err = client.stop_strategy().await.unwrap_err();
        assert!(matches!(err, ControlError::Connect { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn shutdown_removes_endpoint() {
        let running = serve();
        let path = running.client.path().to_path_buf();
        assert!(path.exists());

        running.shutdown.send(true).unwrap();
        running.task.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn oversized_request_closes_only_its_connection() {
        let running = serve();
        let stream = tokio::net::UnixStream::connect(running.client.path()).await.unwrap();
        let (mut read, mut write) = stream.into_split();
        // The server may hang up mid-write.
        let _ = write.write_all(&vec![b'x'; MAX_FRAME + 64]).await;

        let mut reply = Vec::new();
        let _ = read.read_to_end(&mut reply).await;
        assert!(reply.is_empty(), "got {:?}", String::from_utf8_lossy(&reply));

        running.client.start_strategy(&spec("BTC")).await.unwrap();
        assert_eq!(running.host.snapshot().await.active, Some(spec("BTC")));
    }

    #[tokio::test]
    async fn frame_at_the_limit_is_read() {
        let mut line = vec![b'x'; MAX_FRAME];
        line.push(b'\n');
        line.extend_from_slice(b"next\n");
        let mut reader = BufReader::new(line.as_slice());
        assert_eq!(read_frame(&mut reader).await.unwrap().map(|f| f.len()), Some(MAX_FRAME));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(b"next".to_vec()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let first = ControlServer::bind(&path).unwrap();
        drop(first);
        assert!(path.exists());

        let server = ControlServer::bind(&path).unwrap();
        assert_eq!(server.path(), path);
    }
}
