//! JSON control-protocol client (QMP dialect) over a Unix socket.
//!
//! One connection per running VM. After the server greeting and capability
//! negotiation, requests carry a monotonically unique `id` used to route the
//! matching response back through a oneshot channel; asynchronous events are
//! fanned out over an unbounded channel to whichever handler attached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use infinivirt_core::error::VmError;

#[derive(Debug, Clone)]
pub struct QmpOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Extra connect attempts after the first failure.
    pub connect_retries: u32,
    pub reconnect_delay: Duration,
}

impl Default for QmpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            connect_retries: 0,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// Asynchronous guest/hypervisor events the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QmpEventKind {
    Shutdown,
    Powerdown,
    Reset,
    Stop,
    Resume,
    Suspend,
    Wakeup,
    DeviceDeleted,
    BlockJobCompleted,
    Other(String),
}

impl QmpEventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "SHUTDOWN" => Self::Shutdown,
            "POWERDOWN" => Self::Powerdown,
            "RESET" => Self::Reset,
            "STOP" => Self::Stop,
            "RESUME" => Self::Resume,
            "SUSPEND" => Self::Suspend,
            "WAKEUP" => Self::Wakeup,
            "DEVICE_DELETED" => Self::DeviceDeleted,
            "BLOCK_JOB_COMPLETED" => Self::BlockJobCompleted,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QmpEvent {
    pub kind: QmpEventKind,
    pub timestamp: Option<Value>,
    pub data: Option<Value>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, VmError>>>>>;

#[derive(Debug)]
pub struct QmpClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    events: Mutex<Option<mpsc::UnboundedReceiver<QmpEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    command_timeout: Duration,
}

impl QmpClient {
    /// Connect, read the greeting, and negotiate capabilities.
    pub async fn connect(socket: &Path, options: QmpOptions) -> Result<Self, VmError> {
        let mut attempt = 0u32;
        let stream = loop {
            match timeout(options.connect_timeout, UnixStream::connect(socket)).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => {
                    if attempt >= options.connect_retries {
                        return Err(VmError::Qmp(format!(
                            "connect to {} failed: {}",
                            socket.display(),
                            e
                        )));
                    }
                    attempt += 1;
                    debug!(socket = %socket.display(), attempt, "control connect retry");
                    tokio::time::sleep(options.reconnect_delay).await;
                }
                Err(_) => {
                    return Err(VmError::Timeout(format!(
                        "connect to {} timed out after {:?}",
                        socket.display(),
                        options.connect_timeout
                    )));
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = timeout(options.connect_timeout, lines.next_line())
            .await
            .map_err(|_| VmError::Timeout("control greeting timed out".to_string()))?
            .map_err(|e| VmError::Qmp(format!("greeting read failed: {}", e)))?
            .ok_or_else(|| VmError::Qmp("connection closed before greeting".to_string()))?;

        let greeting: Value = serde_json::from_str(&greeting)
            .map_err(|e| VmError::Qmp(format!("malformed greeting: {}", e)))?;
        if greeting.get("QMP").is_none() {
            return Err(VmError::Qmp("unexpected greeting payload".to_string()));
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(lines, pending.clone(), event_tx));

        let client = Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            events: Mutex::new(Some(event_rx)),
            reader: Mutex::new(Some(reader)),
            command_timeout: options.command_timeout,
        };

        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Issue one command and await its routed response.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, VmError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut request = serde_json::json!({ "execute": command, "id": id });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }
        let line = format!("{}\n", request);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&id);
                return Err(VmError::Qmp(format!("{} write failed: {}", command, e)));
            }
        }

        match timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VmError::Qmp(format!(
                "connection closed while waiting for {}",
                command
            ))),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(VmError::Timeout(format!(
                    "{} timed out after {:?}",
                    command, self.command_timeout
                )))
            }
        }
    }

    /// Guest run state, e.g. "running", "paused", "shutdown".
    pub async fn query_status(&self) -> Result<String, VmError> {
        let value = self.execute("query-status", None).await?;
        value
            .get("status")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| VmError::Qmp("query-status returned no status".to_string()))
    }

    /// Graceful ACPI power-down request.
    pub async fn system_powerdown(&self) -> Result<(), VmError> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    /// Pause vCPUs.
    pub async fn stop(&self) -> Result<(), VmError> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// Resume vCPUs.
    pub async fn cont(&self) -> Result<(), VmError> {
        self.execute("cont", None).await.map(|_| ())
    }

    /// Hard reset the guest.
    pub async fn system_reset(&self) -> Result<(), VmError> {
        self.execute("system_reset", None).await.map(|_| ())
    }

    /// Current balloon size in bytes.
    pub async fn query_balloon(&self) -> Result<u64, VmError> {
        let value = self.execute("query-balloon", None).await?;
        value
            .get("actual")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| VmError::Qmp("query-balloon returned no size".to_string()))
    }

    /// Take the event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<QmpEvent>> {
        self.events.lock().unwrap().take()
    }

    /// Stop the reader task and release the connection. Safe to call twice.
    pub fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        self.pending.lock().unwrap().clear();
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn read_loop(
    mut lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    pending: Pending,
    event_tx: mpsc::UnboundedSender<QmpEvent>,
) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "control socket read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "discarding malformed control message");
                continue;
            }
        };

        if let Some(event) = value.get("event").and_then(|e| e.as_str()) {
            let event = QmpEvent {
                kind: QmpEventKind::from_name(event),
                timestamp: value.get("timestamp").cloned(),
                data: value.get("data").cloned(),
            };
            if event_tx.send(event).is_err() {
                // Handler detached; keep draining so responses still route.
                debug!("control event dropped, no handler attached");
            }
            continue;
        }

        match value.get("id").and_then(|i| i.as_u64()) {
            Some(id) => {
                let sender = pending.lock().unwrap().remove(&id);
                match sender {
                    Some(tx) => {
                        let result = if let Some(error) = value.get("error") {
                            let desc = error
                                .get("desc")
                                .and_then(|d| d.as_str())
                                .unwrap_or("unknown control error");
                            Err(VmError::Qmp(desc.to_string()))
                        } else {
                            Ok(value.get("return").cloned().unwrap_or(Value::Null))
                        };
                        let _ = tx.send(result);
                    }
                    None => warn!(id, "discarding unmatched control response"),
                }
            }
            None => warn!("discarding control response without id"),
        }
    }

    // Connection gone: dropping the senders wakes every in-flight execute.
    pending.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    const GREETING: &str =
        "{\"QMP\": {\"version\": {\"qemu\": {\"major\": 8}}, \"capabilities\": []}}";

    /// Minimal scripted QMP server: greets, acks capabilities, then answers
    /// from a fixed command → response map, pushing `events` after the
    /// capabilities ack.
    async fn serve(
        listener: UnixListener,
        responses: Vec<(&'static str, &'static str)>,
        events: Vec<&'static str>,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(format!("{}\n", GREETING).as_bytes())
            .await
            .unwrap();

        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let id = request["id"].as_u64().unwrap();
            let command = request["execute"].as_str().unwrap().to_string();

            if command == "qmp_capabilities" {
                let reply = format!("{{\"return\": {{}}, \"id\": {}}}\n", id);
                write_half.write_all(reply.as_bytes()).await.unwrap();
                for event in &events {
                    write_half
                        .write_all(format!("{}\n", event).as_bytes())
                        .await
                        .unwrap();
                }
                continue;
            }

            let body = responses
                .iter()
                .find(|(cmd, _)| *cmd == command)
                .map(|(_, body)| *body)
                .unwrap_or("{\"return\": {}}");
            let mut reply: Value = serde_json::from_str(body).unwrap();
            reply["id"] = id.into();
            write_half
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        }
    }

    fn socket_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("qmp.sock")
    }

    #[tokio::test]
    async fn test_connect_negotiates_and_queries_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![("query-status", "{\"return\": {\"status\": \"running\"}}")],
            vec![],
        ));

        let client = QmpClient::connect(&path, QmpOptions::default()).await.unwrap();
        assert_eq!(client.query_status().await.unwrap(), "running");

        client.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_qmp_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![(
                "system_reset",
                "{\"error\": {\"class\": \"GenericError\", \"desc\": \"reset refused\"}}",
            )],
            vec![],
        ));

        let client = QmpClient::connect(&path, QmpOptions::default()).await.unwrap();
        let err = client.system_reset().await.unwrap_err();
        assert!(matches!(err, VmError::Qmp(ref msg) if msg.contains("reset refused")));

        client.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![],
            vec![
                "{\"event\": \"POWERDOWN\", \"timestamp\": {\"seconds\": 1}}",
                "{\"event\": \"SHUTDOWN\", \"timestamp\": {\"seconds\": 2}, \"data\": {\"guest\": true}}",
            ],
        ));

        let client = QmpClient::connect(&path, QmpOptions::default()).await.unwrap();
        let mut events = client.take_events().unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, QmpEventKind::Powerdown);
        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, QmpEventKind::Shutdown);
        assert!(second.data.is_some());

        // The stream can only be taken once.
        assert!(client.take_events().is_none());

        client.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn test_query_balloon() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir);
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve(
            listener,
            vec![("query-balloon", "{\"return\": {\"actual\": 8589934592}}")],
            vec![],
        ));

        let client = QmpClient::connect(&path, QmpOptions::default()).await.unwrap();
        assert_eq!(client.query_balloon().await.unwrap(), 8_589_934_592);

        client.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = QmpClient::connect(&socket_path(&dir), QmpOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Qmp(_)));
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(QmpEventKind::from_name("SHUTDOWN"), QmpEventKind::Shutdown);
        assert_eq!(
            QmpEventKind::from_name("BLOCK_JOB_COMPLETED"),
            QmpEventKind::BlockJobCompleted
        );
        assert_eq!(
            QmpEventKind::from_name("SPICE_CONNECTED"),
            QmpEventKind::Other("SPICE_CONNECTED".to_string())
        );
    }
}
