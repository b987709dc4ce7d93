use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::WebSocketStream;

use crate::app::Application;
use crate::identity;
use crate::logging::LogLevel;
use crate::router::{PushCommand, PUSH_ENDPOINT_ARG};
use crate::wire::{
    is_ping_frame, AckRequest, FlushReply, HelloRequest, PingReply, RegisterReply,
    RegisterRequest, RequestHeader, UnregisterReply, UnregisterRequest, Update, WorkerError,
    NOTIFICATION_MESSAGE_TYPE,
};

#[derive(Debug)]
pub enum ConnectionError {
    Serialize(serde_json::Error),
    Socket(tungstenite::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(source) => write!(f, "failed to serialize outbound frame: {source}"),
            Self::Socket(source) => write!(f, "websocket send failed: {source}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

// One live client socket plus the device identity bound to it. The socket is
// owned exclusively by the worker driving this connection.
pub struct Connection<S> {
    ws: WebSocketStream<S>,
    device_id: String,
    peer: String,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>, peer: String) -> Self {
        Self {
            ws,
            device_id: String::new(),
            peer,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn set_device_id(&mut self, device_id: String) {
        self.device_id = device_id;
    }

    // Next text or binary payload; control frames are skipped, a close frame
    // ends the stream.
    async fn next_message(&mut self) -> Option<Result<Vec<u8>, tungstenite::Error>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_bytes().to_vec())),
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(error) => return Some(Err(error)),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.ws
            .send(Message::text(text))
            .await
            .map_err(ConnectionError::Socket)
    }

    async fn send_json<T: Serialize>(&mut self, reply: &T) -> Result<(), ConnectionError> {
        let rendered = serde_json::to_string(reply).map_err(ConnectionError::Serialize)?;
        self.send_text(rendered).await
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Inactive,
    Active,
}

// Per-connection protocol driver: owns device identity assignment, command
// dispatch, and the outbound flush path.
pub struct Worker {
    app: Arc<Application>,
    rid: String,
    state: WorkerState,
    stopped: bool,
    max_channels: usize,
    last_ping: Option<Instant>,
    ping_interval: std::time::Duration,
    hello_timeout: std::time::Duration,
}

impl Worker {
    pub fn new(app: Arc<Application>, rid: String) -> Self {
        let max_channels = app.store().max_channels();
        let ping_interval = app.client_min_ping();
        let hello_timeout = app.client_hello_timeout();
        Self {
            app,
            rid,
            state: WorkerState::Inactive,
            stopped: false,
            max_channels,
            last_ping: None,
            ping_interval,
            hello_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_hello_timeout(&mut self, hello_timeout: std::time::Duration) {
        self.hello_timeout = hello_timeout;
    }

    // Receive loop. Frames are processed strictly in receive order; a flush
    // triggered by hello or ack completes before the next frame is read.
    pub async fn run<S>(mut self, mut conn: Connection<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hello_deadline = tokio::time::sleep(self.hello_timeout);
        tokio::pin!(hello_deadline);

        loop {
            if self.stopped {
                break;
            }

            let received = tokio::select! {
                // Fires only while the connection is still anonymous.
                () = hello_deadline.as_mut(), if self.state == WorkerState::Inactive => {
                    self.app.logger().log(
                        LogLevel::Debug,
                        Some("worker"),
                        "Idle connection, closing socket",
                        Some(json!({"rid": self.rid})),
                    );
                    break;
                }
                received = conn.next_message() => received,
            };

            let raw = match received {
                Some(Ok(raw)) => raw,
                Some(Err(error)) => {
                    self.stopped = true;
                    if self.app.logger().should_log(LogLevel::Error) {
                        self.app.logger().log(
                            LogLevel::Error,
                            Some("worker"),
                            "Websocket receive failed",
                            Some(json!({"rid": self.rid, "error": error.to_string()})),
                        );
                    }
                    continue;
                }
                None => {
                    self.stopped = true;
                    continue;
                }
            };

            if raw.is_empty() {
                continue;
            }

            // Heartbeats stay out of the receive log.
            if raw.len() > 5 && self.app.logger().should_log(LogLevel::Info) {
                self.app.logger().log(
                    LogLevel::Info,
                    Some("worker"),
                    "Socket receive",
                    Some(json!({
                        "rid": self.rid,
                        "raw": String::from_utf8_lossy(&raw),
                    })),
                );
            }

            let is_ping = match is_ping_frame(&raw) {
                Ok(is_ping) => is_ping,
                Err(error) => {
                    self.app.logger().log(
                        LogLevel::Warn,
                        Some("worker"),
                        "Malformed request payload",
                        Some(json!({
                            "rid": self.rid,
                            "raw": String::from_utf8_lossy(&raw),
                            "error": error.to_string(),
                        })),
                    );
                    self.stopped = true;
                    continue;
                }
            };

            let message_type = if is_ping {
                "ping".to_owned()
            } else {
                match serde_json::from_slice::<RequestHeader>(&raw) {
                    Ok(header) => header.message_type,
                    Err(error) => {
                        self.reject_undecodable_header(&mut conn, &raw, &error).await;
                        self.stopped = true;
                        continue;
                    }
                }
            };

            let result = match message_type.to_lowercase().as_str() {
                "ping" => self.handle_ping(&mut conn, &message_type).await,
                "hello" => self.handle_hello(&mut conn, &message_type, &raw).await,
                "ack" => self.handle_ack(&mut conn, &raw).await,
                "register" => self.handle_register(&mut conn, &message_type, &raw).await,
                "unregister" => self.handle_unregister(&mut conn, &message_type, &raw).await,
                "purge" => self.handle_purge(&mut conn).await,
                other => {
                    self.app.logger().log(
                        LogLevel::Warn,
                        Some("worker"),
                        "Bad command",
                        Some(json!({"rid": self.rid, "cmd": other})),
                    );
                    Err(WorkerError::UnknownCommand)
                }
            };

            if let Err(error) = result {
                if self.app.logger().should_log(LogLevel::Debug) {
                    self.app.logger().log(
                        LogLevel::Debug,
                        Some("worker"),
                        "Command returned error",
                        Some(json!({
                            "rid": self.rid,
                            "cmd": message_type,
                            "error": error.to_string(),
                        })),
                    );
                }
                self.handle_error(&mut conn, &raw, &error).await;
                self.stopped = true;
            }
        }

        if !conn.device_id().is_empty() {
            self.app.remove_client(conn.device_id());
        }
        conn.close().await;
        self.app.logger().log(
            LogLevel::Info,
            Some("worker"),
            "Connection loop has completed a shut-down",
            Some(json!({"rid": self.rid})),
        );
    }

    async fn reject_undecodable_header<S>(
        &mut self,
        conn: &mut Connection<S>,
        raw: &[u8],
        error: &serde_json::Error,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match error.classify() {
            serde_json::error::Category::Data => {
                self.app.logger().log(
                    LogLevel::Warn,
                    Some("worker"),
                    "Mismatched header field types",
                    Some(json!({"rid": self.rid, "error": error.to_string()})),
                );
                self.handle_error(conn, raw, &WorkerError::UnknownCommand).await;
            }
            serde_json::error::Category::Syntax => {
                self.app.logger().log(
                    LogLevel::Warn,
                    Some("worker"),
                    "Malformed request payload",
                    Some(json!({
                        "rid": self.rid,
                        "line": error.line(),
                        "column": error.column(),
                        "error": error.to_string(),
                    })),
                );
            }
            _ => {
                self.app.logger().log(
                    LogLevel::Warn,
                    Some("worker"),
                    "Error parsing request payload",
                    Some(json!({"rid": self.rid, "error": error.to_string()})),
                );
            }
        }
    }

    // Standardized error reporting back to the client: the original message
    // overlaid with status and error, so client correlation fields survive.
    async fn handle_error<S>(&mut self, conn: &mut Connection<S>, raw: &[u8], error: &WorkerError)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.app.logger().should_log(LogLevel::Info) {
            self.app.logger().log(
                LogLevel::Info,
                Some("worker"),
                "Sending error",
                Some(json!({"rid": self.rid, "error": error.to_string()})),
            );
        }

        let Ok(Value::Object(mut reply)) = serde_json::from_slice::<Value>(raw) else {
            return;
        };
        let (status, message) = error.to_status();
        reply.insert("status".to_owned(), json!(status));
        reply.insert("error".to_owned(), json!(message));
        let _ = conn.send_json(&Value::Object(reply)).await;
    }

    // Binds the device identity for this socket and flushes anything pending
    // under it.
    async fn handle_hello<S>(
        &mut self,
        conn: &mut Connection<S>,
        header_type: &str,
        raw: &[u8],
    ) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request: HelloRequest =
            serde_json::from_slice(raw).map_err(|_| WorkerError::InvalidParams)?;
        let Some(suggested) = request.device_id else {
            return Err(WorkerError::InvalidParams);
        };
        // channelIDs must be present, even if empty.
        let Some(channel_ids) = request.channel_ids else {
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Missing channelIDs in handshake",
                Some(json!({"rid": self.rid})),
            );
            return Err(WorkerError::NoParams);
        };

        let mut force_reset = false;
        if !conn.device_id().is_empty() {
            if !suggested.is_empty() && suggested != conn.device_id() {
                self.app.logger().log(
                    LogLevel::Debug,
                    Some("worker"),
                    "Conflicting device ids in repeated handshake",
                    Some(json!({"rid": self.rid})),
                );
                return Err(WorkerError::ExistingId);
            }
            // Duplicate handshake with an omitted or identical device id.
        } else if suggested.is_empty() {
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Generating new device id",
                Some(json!({"rid": self.rid})),
            );
            force_reset = true;
        } else if !identity::valid(&suggested) {
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Invalid suggested device id",
                Some(json!({"rid": self.rid})),
            );
            return Err(WorkerError::InvalidId);
        } else if self.app.client_exists(&suggested) {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Device id collision; resetting device id",
                Some(json!({"rid": self.rid, "uaid": suggested})),
            );
            force_reset = true;
        } else if channel_ids.len() > self.max_channels {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Too many channels in handshake; resetting device id",
                Some(json!({
                    "rid": self.rid,
                    "uaid": suggested,
                    "channels": channel_ids.len(),
                    "maxChannels": self.max_channels,
                })),
            );
            if let Err(error) = self.app.store().drop_all(&suggested) {
                self.app.logger().log(
                    LogLevel::Warn,
                    Some("worker"),
                    "Failed to drop records for oversubscribed device id",
                    Some(json!({"rid": self.rid, "error": error.to_string()})),
                );
            }
            force_reset = true;
        } else if !self.app.store().exists(&suggested) && !channel_ids.is_empty() {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Channels in handshake for unknown device id; resetting",
                Some(json!({"rid": self.rid, "uaid": suggested})),
            );
            force_reset = true;
        } else {
            conn.set_device_id(suggested.clone());
        }

        if force_reset {
            let fresh = identity::generate().map_err(|_| WorkerError::InvalidParams)?;
            conn.set_device_id(fresh);
        }

        let (status, _args) = self.app.router().handle_command(PushCommand::Hello {
            device_id: conn.device_id().to_owned(),
            channel_ids,
            connect: request.connect,
        });

        if self.app.logger().should_log(LogLevel::Debug) {
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Sending handshake response",
                Some(json!({"rid": self.rid, "cmd": "hello", "uaid": conn.device_id()})),
            );
        }

        // Formatted directly rather than through the JSON encoder.
        let reply = format!(
            "{{\"messageType\":\"{}\",\"status\":{},\"uaid\":\"{}\"}}",
            header_type,
            status,
            conn.device_id()
        );
        let write_result = conn.send_text(reply).await;
        self.app.metrics().increment("updates.client.hello");
        self.app.logger().log(
            LogLevel::Info,
            Some("worker"),
            "Client successfully connected",
            Some(json!({"rid": self.rid})),
        );
        self.state = WorkerState::Active;
        self.app.add_client(conn.device_id());

        if let Err(error) = write_result {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Failed to write handshake response",
                Some(json!({"rid": self.rid, "error": error.to_string()})),
            );
            self.stopped = true;
            return Ok(());
        }
        self.flush(conn, 0, "", 0).await
    }

    // Clears acknowledged updates, then re-flushes anything still pending.
    async fn handle_ack<S>(
        &mut self,
        conn: &mut Connection<S>,
        raw: &[u8],
    ) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if conn.device_id().is_empty() {
            return Err(WorkerError::InvalidCommand);
        }
        let request: AckRequest =
            serde_json::from_slice(raw).map_err(|_| WorkerError::InvalidParams)?;
        if request.updates.is_empty() {
            return Err(WorkerError::NoParams);
        }
        self.app.metrics().increment("updates.client.ack");

        for update in &request.updates {
            if let Err(error) = self
                .app
                .store()
                .drop_update(conn.device_id(), &update.channel_id)
            {
                return Err(self.log_ack_failure(error));
            }
        }
        for channel_id in &request.expired {
            if let Err(error) = self.app.store().drop_update(conn.device_id(), channel_id) {
                return Err(self.log_ack_failure(error));
            }
        }

        if self.app.logger().should_log(LogLevel::Debug) {
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Ack accepted",
                Some(json!({"rid": self.rid, "cmd": "ack"})),
            );
        }
        self.flush(conn, 0, "", 0).await
    }

    fn log_ack_failure(&self, error: crate::store::StoreError) -> WorkerError {
        self.app.logger().log(
            LogLevel::Warn,
            Some("worker"),
            "Ack failed, error updating backing store",
            Some(json!({"rid": self.rid, "cmd": "ack", "error": error.to_string()})),
        );
        WorkerError::Store(error)
    }

    async fn handle_register<S>(
        &mut self,
        conn: &mut Connection<S>,
        header_type: &str,
        raw: &[u8],
    ) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if conn.device_id().is_empty() {
            return Err(WorkerError::InvalidCommand);
        }
        let request: RegisterRequest =
            serde_json::from_slice(raw).map_err(|_| WorkerError::InvalidParams)?;
        if !identity::valid(&request.channel_id) {
            return Err(WorkerError::InvalidParams);
        }

        if let Err(error) = self
            .app
            .store()
            .register(conn.device_id(), &request.channel_id, 0)
        {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Register failed, error updating backing store",
                Some(json!({
                    "rid": self.rid,
                    "cmd": "register",
                    "error": error.to_string(),
                })),
            );
            return Err(WorkerError::Store(error));
        }

        // The routing layer mints the callback URL for this channel.
        let (status, args) = self.app.router().handle_command(PushCommand::Register {
            channel_id: request.channel_id.clone(),
        });
        let endpoint = args
            .get(PUSH_ENDPOINT_ARG)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if self.app.logger().should_log(LogLevel::Debug) {
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Router returned endpoint",
                Some(json!({
                    "rid": self.rid,
                    "cmd": "register",
                    "code": status,
                    "chid": request.channel_id,
                    "pushEndpoint": endpoint,
                })),
            );
        }

        let _ = conn
            .send_json(&RegisterReply {
                message_type: header_type.to_owned(),
                device_id: conn.device_id().to_owned(),
                status: 200,
                channel_id: request.channel_id,
                push_endpoint: endpoint,
            })
            .await;
        self.app.metrics().increment("updates.client.register");
        Ok(())
    }

    // Client-visible unregister is idempotent: store failures are logged and
    // the reply is 200 regardless.
    async fn handle_unregister<S>(
        &mut self,
        conn: &mut Connection<S>,
        header_type: &str,
        raw: &[u8],
    ) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if conn.device_id().is_empty() {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Unregister failed, no device id bound",
                Some(json!({"rid": self.rid})),
            );
            return Err(WorkerError::InvalidCommand);
        }
        let request: UnregisterRequest =
            serde_json::from_slice(raw).map_err(|_| WorkerError::InvalidParams)?;
        if request.channel_id.is_empty() {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Unregister failed, missing channelID",
                Some(json!({"rid": self.rid})),
            );
            return Err(WorkerError::NoParams);
        }

        if let Err(error) = self
            .app
            .store()
            .unregister(conn.device_id(), &request.channel_id)
        {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "Unregister failed, error updating backing store",
                Some(json!({"rid": self.rid, "error": error.to_string()})),
            );
        } else if self.app.logger().should_log(LogLevel::Debug) {
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Unregister accepted",
                Some(json!({"rid": self.rid, "cmd": "unregister"})),
            );
        }

        let _ = conn
            .send_json(&UnregisterReply {
                message_type: header_type.to_owned(),
                status: 200,
                channel_id: request.channel_id,
            })
            .await;
        self.app.metrics().increment("updates.client.unregister");
        Ok(())
    }

    async fn handle_ping<S>(
        &mut self,
        conn: &mut Connection<S>,
        header_type: &str,
    ) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let now = Instant::now();
        if !self.ping_interval.is_zero() {
            if let Some(last_ping) = self.last_ping {
                if now.duration_since(last_ping) < self.ping_interval {
                    self.app.logger().log(
                        LogLevel::Warn,
                        Some("worker"),
                        "Client sending too many pings",
                        Some(json!({"rid": self.rid, "source": conn.peer})),
                    );
                    self.stopped = true;
                    self.app.metrics().increment("updates.client.too_many_pings");
                    return Err(WorkerError::TooManyPings);
                }
            }
        }

        self.last_ping = Some(now);
        if self.app.push_long_pongs() {
            let _ = conn
                .send_json(&PingReply {
                    message_type: header_type.to_owned(),
                    status: 200,
                })
                .await;
        } else {
            let _ = conn.send_text("{}".to_owned()).await;
        }
        self.app.metrics().increment("updates.client.ping");
        Ok(())
    }

    // Testing hook: drops nothing, confirms liveness.
    async fn handle_purge<S>(&mut self, conn: &mut Connection<S>) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _ = conn.send_text("{}".to_owned()).await;
        Ok(())
    }

    // Sends pending updates as one notification frame. An empty channel means
    // a bulk flush from the store; a non-empty channel sends that single
    // update without touching the store.
    async fn flush<S>(
        &mut self,
        conn: &mut Connection<S>,
        last_accessed: i64,
        channel: &str,
        version: u64,
    ) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let result = self.flush_pending(conn, last_accessed, channel, version).await;
        let elapsed = started.elapsed();

        if self.app.logger().should_log(LogLevel::Info) {
            self.app.logger().log(
                LogLevel::Info,
                Some("worker"),
                "Client flush completed",
                Some(json!({
                    "rid": self.rid,
                    "uaid": conn.device_id(),
                    "duration_us": elapsed.as_micros() as u64,
                })),
            );
        }
        self.app.metrics().timer("client.flush", elapsed);
        result
    }

    async fn flush_pending<S>(
        &mut self,
        conn: &mut Connection<S>,
        last_accessed: i64,
        channel: &str,
        version: u64,
    ) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if conn.device_id().is_empty() {
            self.app.logger().log(
                LogLevel::Warn,
                Some("worker"),
                "No device id bound to socket, aborting flush",
                Some(json!({"rid": self.rid})),
            );
            self.stopped = true;
            return Ok(());
        }

        let (updates, expired) = if channel.is_empty() {
            let since =
                DateTime::from_timestamp(last_accessed, 0).unwrap_or(DateTime::UNIX_EPOCH);
            match self.app.store().fetch_all(conn.device_id(), since) {
                Ok(pending) => pending,
                Err(error) => {
                    self.app.logger().log(
                        LogLevel::Warn,
                        Some("worker"),
                        "Failed to fetch pending updates",
                        Some(json!({
                            "rid": self.rid,
                            "uaid": conn.device_id(),
                            "error": error.to_string(),
                        })),
                    );
                    return Err(WorkerError::Store(error));
                }
            }
        } else {
            let updates = vec![Update {
                channel_id: channel.to_owned(),
                version,
            }];
            for _ in &updates {
                self.app.metrics().increment("updates.sent");
            }
            (updates, Vec::new())
        };

        if updates.is_empty() && expired.is_empty() {
            return Ok(());
        }

        if self.app.logger().should_log(LogLevel::Debug) {
            let rendered: Vec<String> = updates
                .iter()
                .map(|update| {
                    format!(
                        "{}.{} = {}",
                        conn.device_id(),
                        update.channel_id,
                        update.version
                    )
                })
                .collect();
            self.app.logger().log(
                LogLevel::Debug,
                Some("worker"),
                "Flushing data back to socket",
                Some(json!({"rid": self.rid, "updates": rendered, "expired": expired})),
            );
        }

        let _ = conn
            .send_json(&FlushReply {
                message_type: NOTIFICATION_MESSAGE_TYPE.to_owned(),
                updates,
                expired,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::{Message, Role};
    use tokio_tungstenite::WebSocketStream;

    use crate::app::Application;
    use crate::config::ClientConfig;
    use crate::logging::{LogLevel, Logger, LoggerConfig};
    use crate::metrics::{MemorySink, Metrics};
    use crate::router::{CommandArgs, PushCommand, Router, PUSH_ENDPOINT_ARG};
    use crate::store::{MemoryStore, Store, StoreError};
    use crate::wire::Update;

    use super::{Connection, Worker};

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn valid_uaid() -> String {
        "123e4567e89b12d3a456426614174000".to_owned()
    }

    fn other_uaid() -> String {
        "00000000000000000000000000000042".to_owned()
    }

    fn valid_chid() -> String {
        "deadbeefdeadbeefdeadbeefdeadbeef".to_owned()
    }

    struct RecordingRouter {
        commands: Mutex<Vec<PushCommand>>,
    }

    impl RecordingRouter {
        fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<PushCommand> {
            self.commands
                .lock()
                .expect("router command log lock poisoned")
                .clone()
        }
    }

    impl Router for RecordingRouter {
        fn handle_command(&self, command: PushCommand) -> (u16, CommandArgs) {
            self.commands
                .lock()
                .expect("router command log lock poisoned")
                .push(command.clone());
            match command {
                PushCommand::Hello { .. } => (200, CommandArgs::new()),
                PushCommand::Register { channel_id } => {
                    let mut args = CommandArgs::new();
                    args.insert(
                        PUSH_ENDPOINT_ARG.to_owned(),
                        Value::String(format!("http://push.test/update/{channel_id}")),
                    );
                    (200, args)
                }
            }
        }
    }

    // Every store call succeeds except unregister.
    struct UnregisterFailsStore {
        inner: MemoryStore,
    }

    impl Store for UnregisterFailsStore {
        fn register(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError> {
            self.inner.register(device_id, channel_id, version)
        }

        fn unregister(&self, _device_id: &str, _channel_id: &str) -> Result<(), StoreError> {
            Err(StoreError::ChannelCeilingExceeded { limit: 0 })
        }

        fn update(&self, device_id: &str, channel_id: &str, version: u64) -> Result<(), StoreError> {
            self.inner.update(device_id, channel_id, version)
        }

        fn drop_update(&self, device_id: &str, channel_id: &str) -> Result<(), StoreError> {
            self.inner.drop_update(device_id, channel_id)
        }

        fn drop_all(&self, device_id: &str) -> Result<(), StoreError> {
            self.inner.drop_all(device_id)
        }

        fn exists(&self, device_id: &str) -> bool {
            self.inner.exists(device_id)
        }

        fn fetch_all(
            &self,
            device_id: &str,
            since: DateTime<Utc>,
        ) -> Result<(Vec<Update>, Vec<String>), StoreError> {
            self.inner.fetch_all(device_id, since)
        }

        fn max_channels(&self) -> usize {
            self.inner.max_channels()
        }
    }

    struct Harness {
        app: Arc<Application>,
        metrics: Arc<MemorySink>,
        store: Arc<MemoryStore>,
        router: Arc<RecordingRouter>,
    }

    fn quiet_logger() -> Arc<Logger> {
        Arc::new(Logger::new(LoggerConfig {
            min_level: LogLevel::Error,
            human_friendly: false,
        }))
    }

    fn harness_with(client_config: ClientConfig, max_channels: usize) -> Harness {
        let metrics = Arc::new(MemorySink::default());
        let store = Arc::new(MemoryStore::new(max_channels, Duration::ZERO));
        let router = Arc::new(RecordingRouter::new());
        let app = Arc::new(Application::new(
            quiet_logger(),
            Arc::new(Metrics::new(metrics.clone())),
            store.clone(),
            router.clone(),
            &client_config,
        ));
        Harness {
            app,
            metrics,
            store,
            router,
        }
    }

    fn harness() -> Harness {
        harness_with(ClientConfig::default(), 200)
    }

    async fn spawn_worker(harness: &Harness) -> (WebSocketStream<DuplexStream>, JoinHandle<()>) {
        spawn_worker_with(harness, None).await
    }

    async fn spawn_worker_with(
        harness: &Harness,
        hello_timeout: Option<Duration>,
    ) -> (WebSocketStream<DuplexStream>, JoinHandle<()>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let mut worker = Worker::new(harness.app.clone(), "rid-test".to_owned());
        if let Some(hello_timeout) = hello_timeout {
            worker.set_hello_timeout(hello_timeout);
        }
        let conn = Connection::new(server_ws, "test-peer".to_owned());
        let handle = tokio::spawn(worker.run(conn));
        (client_ws, handle)
    }

    async fn send(client: &mut WebSocketStream<DuplexStream>, text: &str) {
        client
            .send(Message::text(text.to_owned()))
            .await
            .expect("client send should pass");
    }

    async fn recv_text(client: &mut WebSocketStream<DuplexStream>) -> String {
        loop {
            let message = timeout(RECV_TIMEOUT, client.next())
                .await
                .expect("server reply should arrive in time")
                .expect("socket should stay open")
                .expect("frame should decode");
            match message {
                Message::Text(text) => return text.as_str().to_owned(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn recv_json(client: &mut WebSocketStream<DuplexStream>) -> Value {
        let raw = recv_text(client).await;
        serde_json::from_str(&raw).expect("server reply should be JSON")
    }

    async fn expect_closed(client: &mut WebSocketStream<DuplexStream>) {
        loop {
            match timeout(RECV_TIMEOUT, client.next())
                .await
                .expect("close should arrive in time")
            {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn hello(client: &mut WebSocketStream<DuplexStream>, uaid: &str) -> Value {
        send(
            client,
            &format!(r#"{{"messageType":"hello","uaid":"{uaid}","channelIDs":[]}}"#),
        )
        .await;
        recv_json(client).await
    }

    #[tokio::test]
    async fn anonymous_hello_assigns_fresh_device_id() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        let reply = hello(&mut client, "").await;
        assert_eq!(reply["messageType"], "hello");
        assert_eq!(reply["status"], 200);
        let uaid = reply["uaid"].as_str().expect("uaid should be a string");
        assert_eq!(uaid.len(), 32);
        assert!(uaid.chars().all(|c| c.is_ascii_hexdigit()));

        // Nothing was pending, so the next frame the client sees is its own
        // ping echo, not a notification.
        send(&mut client, "{}").await;
        assert_eq!(recv_text(&mut client).await, "{}");

        assert_eq!(harness.metrics.counter_value("updates.client.hello"), 1);
        assert!(harness.app.client_exists(uaid));
        assert!(matches!(
            harness.router.commands().first(),
            Some(PushCommand::Hello { .. })
        ));
    }

    #[tokio::test]
    async fn repeated_hello_keeps_the_assigned_device_id() {
        let harness = harness();
        let (mut client, handle) = spawn_worker(&harness).await;

        let first = hello(&mut client, "").await;
        let assigned = first["uaid"].as_str().expect("uaid should be a string").to_owned();

        let repeat_empty = hello(&mut client, "").await;
        assert_eq!(repeat_empty["uaid"], assigned.as_str());
        assert_eq!(repeat_empty["status"], 200);

        let repeat_same = hello(&mut client, &assigned).await;
        assert_eq!(repeat_same["uaid"], assigned.as_str());

        // A different non-empty id is a conflict and ends the connection.
        let conflict = hello(&mut client, &other_uaid()).await;
        assert_eq!(conflict["status"], 401);
        assert_eq!(conflict["error"], "Existing Identifier");
        expect_closed(&mut client).await;
        handle.await.expect("worker task should finish");
    }

    #[tokio::test]
    async fn hello_requires_uaid_field() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(&mut client, r#"{"messageType":"hello","channelIDs":[]}"#).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Invalid Parameters");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn hello_requires_channel_ids_field() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(&mut client, r#"{"messageType":"hello","uaid":""}"#).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Missing Parameters");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn hello_rejects_malformed_device_id() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        let reply = hello(&mut client, "not-a-uuid").await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Invalid Identifier");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn hello_resets_device_id_on_same_process_collision() {
        let harness = harness();
        harness.app.add_client(&valid_uaid());
        let (mut client, _handle) = spawn_worker(&harness).await;

        let reply = hello(&mut client, &valid_uaid()).await;
        assert_eq!(reply["status"], 200);
        assert_ne!(reply["uaid"], valid_uaid().as_str());
    }

    #[tokio::test]
    async fn hello_with_too_many_channels_resets_and_drops_records() {
        let harness = harness_with(ClientConfig::default(), 2);
        harness
            .store
            .register(&valid_uaid(), &valid_chid(), 0)
            .expect("seed register should pass");
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(
            &mut client,
            &format!(
                r#"{{"messageType":"hello","uaid":"{}","channelIDs":["c1","c2","c3"]}}"#,
                valid_uaid()
            ),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 200);
        assert_ne!(reply["uaid"], valid_uaid().as_str());
        assert!(!harness.store.exists(&valid_uaid()));
    }

    #[tokio::test]
    async fn hello_with_channels_for_unknown_device_id_resets() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(
            &mut client,
            &format!(
                r#"{{"messageType":"hello","uaid":"{}","channelIDs":["c1"]}}"#,
                valid_uaid()
            ),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 200);
        assert_ne!(reply["uaid"], valid_uaid().as_str());
    }

    #[tokio::test]
    async fn hello_flushes_pending_updates_and_ack_reflushes_the_rest() {
        let harness = harness();
        let uaid = valid_uaid();
        harness.store.register(&uaid, "chA", 0).expect("register should pass");
        harness.store.register(&uaid, "chB", 0).expect("register should pass");
        harness.store.update(&uaid, "chA", 7).expect("update should pass");
        harness.store.update(&uaid, "chB", 3).expect("update should pass");

        let (mut client, _handle) = spawn_worker(&harness).await;

        let reply = hello(&mut client, &uaid).await;
        assert_eq!(reply["uaid"], uaid.as_str());

        let notification = recv_json(&mut client).await;
        assert_eq!(notification["messageType"], "notification");
        assert_eq!(
            notification["updates"],
            serde_json::json!([
                {"channelID": "chA", "version": 7},
                {"channelID": "chB", "version": 3}
            ])
        );

        send(
            &mut client,
            r#"{"messageType":"ack","update":[{"channelID":"chA","version":7}]}"#,
        )
        .await;
        let reflushed = recv_json(&mut client).await;
        assert_eq!(reflushed["messageType"], "notification");
        assert_eq!(
            reflushed["updates"],
            serde_json::json!([{"channelID": "chB", "version": 3}])
        );

        assert_eq!(harness.metrics.counter_value("updates.client.ack"), 1);
    }

    #[tokio::test]
    async fn commands_before_hello_are_invalid() {
        let harness = harness();
        let (mut client, handle) = spawn_worker(&harness).await;

        send(
            &mut client,
            r#"{"messageType":"register","channelID":"ch1"}"#,
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Invalid Command");
        // Client-supplied correlation fields survive in the error envelope.
        assert_eq!(reply["channelID"], "ch1");

        expect_closed(&mut client).await;
        handle.await.expect("worker task should finish");
    }

    #[tokio::test]
    async fn register_returns_the_routed_push_endpoint() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        let uaid = hello(&mut client, "").await["uaid"]
            .as_str()
            .expect("uaid should be a string")
            .to_owned();

        let chid = valid_chid();
        send(
            &mut client,
            &format!(r#"{{"messageType":"register","channelID":"{chid}"}}"#),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["messageType"], "register");
        assert_eq!(reply["status"], 200);
        assert_eq!(reply["uaid"], uaid.as_str());
        assert_eq!(reply["channelID"], chid.as_str());
        assert_eq!(
            reply["pushEndpoint"],
            format!("http://push.test/update/{chid}").as_str()
        );

        assert!(harness.store.exists(&uaid));
        assert_eq!(harness.metrics.counter_value("updates.client.register"), 1);
        assert!(harness
            .router
            .commands()
            .iter()
            .any(|command| matches!(command, PushCommand::Register { .. })));
    }

    #[tokio::test]
    async fn register_rejects_malformed_channel_id() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        hello(&mut client, "").await;
        send(&mut client, r#"{"messageType":"register","channelID":"bogus"}"#).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Invalid Parameters");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn unregister_replies_200_even_when_the_store_fails() {
        let metrics = Arc::new(MemorySink::default());
        let router = Arc::new(RecordingRouter::new());
        let app = Arc::new(Application::new(
            quiet_logger(),
            Arc::new(Metrics::new(metrics.clone())),
            Arc::new(UnregisterFailsStore {
                inner: MemoryStore::new(200, Duration::ZERO),
            }),
            router.clone(),
            &ClientConfig::default(),
        ));
        let harness = Harness {
            app,
            metrics,
            store: Arc::new(MemoryStore::new(200, Duration::ZERO)),
            router,
        };

        let (mut client, _handle) = spawn_worker(&harness).await;
        hello(&mut client, "").await;

        send(
            &mut client,
            &format!(r#"{{"messageType":"unregister","channelID":"{}"}}"#, valid_chid()),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["messageType"], "unregister");
        assert_eq!(reply["status"], 200);
        assert_eq!(reply["channelID"], valid_chid().as_str());

        // The store failure was swallowed; the connection stays usable.
        send(&mut client, "{}").await;
        assert_eq!(recv_text(&mut client).await, "{}");
        assert_eq!(
            harness.metrics.counter_value("updates.client.unregister"),
            1
        );
    }

    #[tokio::test]
    async fn unregister_of_a_never_registered_channel_is_200() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        hello(&mut client, "").await;
        send(
            &mut client,
            &format!(r#"{{"messageType":"unregister","channelID":"{}"}}"#, valid_chid()),
        )
        .await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 200);
    }

    #[tokio::test]
    async fn unregister_requires_a_channel_id() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        hello(&mut client, "").await;
        send(&mut client, r#"{"messageType":"unregister"}"#).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Missing Parameters");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn ack_requires_a_non_empty_updates_array() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        hello(&mut client, "").await;
        send(&mut client, r#"{"messageType":"ack","update":[]}"#).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Missing Parameters");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn ping_storm_disconnects_the_client() {
        let harness = harness_with(
            ClientConfig {
                min_ping_secs: 1,
                ..ClientConfig::default()
            },
            200,
        );
        let (mut client, handle) = spawn_worker(&harness).await;

        send(&mut client, "{}").await;
        assert_eq!(recv_text(&mut client).await, "{}");

        send(&mut client, "{}").await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Too Many Pings");

        expect_closed(&mut client).await;
        handle.await.expect("worker task should finish");
        assert_eq!(harness.metrics.counter_value("updates.client.ping"), 1);
        assert_eq!(
            harness
                .metrics
                .counter_value("updates.client.too_many_pings"),
            1
        );
    }

    #[tokio::test]
    async fn long_pongs_reply_with_a_status_envelope() {
        let harness = harness_with(
            ClientConfig {
                long_pongs: true,
                ..ClientConfig::default()
            },
            200,
        );
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(&mut client, "{}").await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["messageType"], "ping");
        assert_eq!(reply["status"], 200);
    }

    #[tokio::test]
    async fn whitespace_padded_heartbeat_is_a_ping() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(&mut client, "  {} \r\n").await;
        assert_eq!(recv_text(&mut client).await, "{}");
    }

    #[tokio::test]
    async fn unknown_commands_get_an_error_envelope() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(&mut client, r#"{"messageType":"poke"}"#).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Unknown Command");
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn mismatched_header_field_types_get_unknown_command() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(&mut client, r#"{"messageType":5}"#).await;
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["status"], 401);
        assert_eq!(reply["error"], "Unknown Command");
        assert_eq!(reply["messageType"], 5);
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn syntax_errors_close_without_a_reply() {
        let harness = harness();
        let (mut client, handle) = spawn_worker(&harness).await;

        send(&mut client, r#"{"messageType" "hello"}"#).await;
        expect_closed(&mut client).await;
        handle.await.expect("worker task should finish");
    }

    #[tokio::test]
    async fn brace_garbage_closes_the_socket() {
        let harness = harness();
        let (mut client, handle) = spawn_worker(&harness).await;

        send(&mut client, "{}}").await;
        expect_closed(&mut client).await;
        handle.await.expect("worker task should finish");
    }

    #[tokio::test]
    async fn purge_replies_with_an_empty_object() {
        let harness = harness();
        let (mut client, _handle) = spawn_worker(&harness).await;

        send(&mut client, r#"{"messageType":"purge"}"#).await;
        assert_eq!(recv_text(&mut client).await, "{}");
    }

    #[tokio::test]
    async fn idle_anonymous_sockets_are_reaped() {
        let harness = harness();
        let (mut client, handle) =
            spawn_worker_with(&harness, Some(Duration::from_millis(100))).await;

        expect_closed(&mut client).await;
        handle.await.expect("worker task should finish");
    }

    #[tokio::test]
    async fn hello_disarms_the_idle_watchdog() {
        let harness = harness();
        let (mut client, _handle) =
            spawn_worker_with(&harness, Some(Duration::from_millis(150))).await;

        hello(&mut client, "").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        send(&mut client, "{}").await;
        assert_eq!(recv_text(&mut client).await, "{}");
    }

    #[tokio::test]
    async fn targeted_flush_sends_a_single_update_without_touching_the_store() {
        let harness = harness();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let mut worker = Worker::new(harness.app.clone(), "rid-test".to_owned());
        let mut conn = Connection::new(server_ws, "test-peer".to_owned());
        conn.set_device_id(valid_uaid());

        worker
            .flush(&mut conn, 0, "chT", 9)
            .await
            .expect("targeted flush should pass");

        let notification = recv_json(&mut client).await;
        assert_eq!(notification["messageType"], "notification");
        assert_eq!(
            notification["updates"],
            serde_json::json!([{"channelID": "chT", "version": 9}])
        );
        assert_eq!(harness.metrics.counter_value("updates.sent"), 1);
        assert_eq!(harness.metrics.timer_samples("client.flush").len(), 1);
    }

    #[tokio::test]
    async fn client_registry_entry_is_removed_on_disconnect() {
        let harness = harness();
        let (mut client, handle) = spawn_worker(&harness).await;

        let uaid = hello(&mut client, "").await["uaid"]
            .as_str()
            .expect("uaid should be a string")
            .to_owned();
        assert!(harness.app.client_exists(&uaid));

        client.close(None).await.expect("client close should pass");
        handle.await.expect("worker task should finish");
        assert!(!harness.app.client_exists(&uaid));
        assert_eq!(harness.app.client_count(), 0);
    }
}
