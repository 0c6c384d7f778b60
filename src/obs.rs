// ─────────────────────────────────────────────────────────────────
//  obs.rs — Recording controller client (obs-websocket v5)
//
//  Hello → Identify (optional SHA-256 challenge auth) → Identified,
//  then request/response pairs matched by requestId.
// ─────────────────────────────────────────────────────────────────

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::ObsConfig;

const RPC_VERSION: u64 = 1;

const OP_HELLO: u64 = 0;
const OP_IDENTIFY: u64 = 1;
const OP_IDENTIFIED: u64 = 2;
const OP_REQUEST: u64 = 6;
const OP_REQUEST_RESPONSE: u64 = 7;

/// Opens sessions to the recording controller.
pub trait RecorderConnector: Send + Sync {
    fn connect(&self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Box<dyn RecordingSession>>>;
}

/// A live connection to the recording controller.
pub trait RecordingSession: Send {
    /// Cheap request proving the connection still works.
    fn probe(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;
    fn is_recording(&mut self) -> BoxFuture<'_, anyhow::Result<bool>>;
    fn stop_recording(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Connects to OBS over obs-websocket.
pub struct ObsConnector {
    host: String,
    port: u16,
    password: Option<String>,
}

impl ObsConnector {
    /// `None` when the integration is not configured.
    pub fn from_config(cfg: &ObsConfig) -> Option<Self> {
        Some(Self {
            host: cfg.host.clone()?,
            port: cfg.port?,
            password: cfg.password.clone(),
        })
    }
}

impl RecorderConnector for ObsConnector {
    fn connect(&self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Box<dyn RecordingSession>>> {
        Box::pin(async move {
            let url = format!("ws://{}:{}", self.host, self.port);
            let session = tokio::time::timeout(
                timeout,
                ObsSession::open(&url, self.password.as_deref(), timeout),
            )
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {url}"))??;
            Ok(Box::new(session) as Box<dyn RecordingSession>)
        })
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct ObsSession {
    ws: Socket,
    next_id: u64,
    timeout: Duration,
}

impl ObsSession {
    async fn open(url: &str, password: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let (ws, _response) = connect_async(url).await?;
        let mut session = Self {
            ws,
            next_id: 0,
            timeout,
        };

        let hello = session.read_op(OP_HELLO).await?;
        let mut identify = json!({
            "rpcVersion": RPC_VERSION,
            "eventSubscriptions": 0,
        });

        if let Some(auth) = hello.get("authentication") {
            let challenge = auth.get("challenge").and_then(Value::as_str).unwrap_or_default();
            let salt = auth.get("salt").and_then(Value::as_str).unwrap_or_default();
            let password = password
                .ok_or_else(|| anyhow::anyhow!("OBS requires a password but none is configured"))?;
            identify["authentication"] = Value::String(auth_response(password, salt, challenge));
        }

        session.send_op(OP_IDENTIFY, identify).await?;
        session.read_op(OP_IDENTIFIED).await?;
        debug!("Identified with OBS at {url}");
        Ok(session)
    }

    async fn send_op(&mut self, op: u64, d: Value) -> anyhow::Result<()> {
        let frame = json!({ "op": op, "d": d });
        self.ws.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Read frames until one with opcode `op` arrives; returns its `d`.
    async fn read_op(&mut self, op: u64) -> anyhow::Result<Value> {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .ok_or_else(|| anyhow::anyhow!("OBS closed the connection"))??;

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(frame) => anyhow::bail!("OBS closed the connection: {frame:?}"),
                _ => continue,
            };

            let mut value: Value = serde_json::from_str(&text)?;
            if value.get("op").and_then(Value::as_u64) == Some(op) {
                return Ok(value["d"].take());
            }
        }
    }

    /// One request/response round trip. Returns `responseData` (or null).
    async fn request(&mut self, request_type: &str) -> anyhow::Result<Value> {
        self.next_id += 1;
        let id = self.next_id.to_string();

        self.send_op(
            OP_REQUEST,
            json!({ "requestType": request_type, "requestId": id }),
        )
        .await?;

        let timeout = self.timeout;
        tokio::time::timeout(timeout, async {
            loop {
                let mut d = self.read_op(OP_REQUEST_RESPONSE).await?;
                if d.get("requestId").and_then(Value::as_str) != Some(id.as_str()) {
                    continue;
                }

                let status = &d["requestStatus"];
                if status.get("result").and_then(Value::as_bool) != Some(true) {
                    anyhow::bail!(
                        "{request_type} failed (code {}): {}",
                        status.get("code").and_then(Value::as_i64).unwrap_or_default(),
                        status.get("comment").and_then(Value::as_str).unwrap_or("no comment")
                    );
                }
                return Ok(d["responseData"].take());
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("{request_type} timed out"))?
    }
}

impl RecordingSession for ObsSession {
    fn probe(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.request("GetVersion").await?;
            Ok(())
        })
    }

    fn is_recording(&mut self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async move {
            let data = self.request("GetRecordStatus").await?;
            Ok(data.get("outputActive").and_then(Value::as_bool).unwrap_or(false))
        })
    }

    fn stop_recording(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.request("StopRecord").await?;
            Ok(())
        })
    }
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = general_purpose::STANDARD.encode(Sha256::digest(format!("{password}{salt}")));
    general_purpose::STANDARD.encode(Sha256::digest(format!("{secret}{challenge}")))
}
