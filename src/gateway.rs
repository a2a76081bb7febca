use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::protocol::{
    classify_close, with_protocol_params, ClosePolicy, ConnectionProperties, GatewayPayload,
    HelloPayload, IdentifyPayload, ReadyPayload, ResumePayload, API_ENCODING, API_VERSION,
    EVENT_READY, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK, OP_HELLO, OP_IDENTIFY,
    OP_INVALID_SESSION, OP_RECONNECT, OP_RESUME,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    /// Reported as browser/device in the IDENTIFY connection properties.
    pub client_name: String,
    /// Intent bitmask declaring which event families the session wants.
    pub intents: u64,
}

/// Resolves the websocket URL for a fresh gateway connection. The REST client
/// implements this against the backend's gateway discovery endpoint; tests
/// substitute a fixed URL.
#[async_trait]
pub trait ConnectUrlSource: Send + Sync {
    async fn resolve_connect_url(&self) -> Result<String>;
}

/// Receives every dispatch event the gateway delivers. Invoked on its own
/// task per event, so a slow handler never stalls the read loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_dispatch(&self, event: String, data: Value);
}

/// An active gateway connection. Dropping the handle abandons the connection;
/// [`GatewayHandle::disconnect`] is the sanctioned shutdown path. All
/// reconnect and resume churn between connect and shutdown is internal.
pub struct GatewayHandle {
    done: oneshot::Receiver<Result<()>>,
    disconnect_tx: mpsc::Sender<()>,
    send_tx: mpsc::UnboundedSender<String>,
}

impl GatewayHandle {
    /// Queues a payload on the outbound writer. The queue outlives individual
    /// sockets, so payloads queued during a reconnect are delivered by the
    /// next attempt.
    pub fn send(&self, payload: &GatewayPayload) -> Result<()> {
        let encoded = encode_payload(payload)?;
        self.send_tx
            .send(encoded)
            .map_err(|_| GatewayError::Internal("gateway supervisor is gone".to_owned()))
    }

    /// Requests a graceful close and waits for the engine to finish.
    pub async fn disconnect(self) -> Result<()> {
        let _ = self.disconnect_tx.send(()).await;
        self.wait().await
    }

    /// Resolves when the connection has closed: `Ok(())` after a
    /// caller-requested disconnect, the error otherwise.
    pub async fn wait(self) -> Result<()> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

pub struct Gateway;

impl Gateway {
    /// Starts the gateway engine: resolves a connect URL, opens the socket,
    /// performs the handshake and keeps the session alive across reconnects
    /// until an unrecoverable error or a disconnect request.
    pub fn connect(
        config: GatewayConfig,
        urls: Arc<dyn ConnectUrlSource>,
        handler: Arc<dyn EventHandler>,
    ) -> GatewayHandle {
        info!("initializing gateway connection");
        let (done_tx, done_rx) = oneshot::channel();
        let (disconnect_tx, mut disconnect_rx) = mpsc::channel(1);
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            config,
            urls,
            handler,
            send_tx: send_tx.clone(),
            send_rx: Some(send_rx),
            sequence: Arc::new(AtomicI64::new(0)),
            heartbeat_acked: Arc::new(AtomicBool::new(true)),
            connect_url: None,
            resume_url: None,
            session_id: None,
            resuming: false,
        };
        tokio::spawn(async move {
            let result = supervisor.run(&mut disconnect_rx).await;
            let _ = done_tx.send(result);
        });

        GatewayHandle {
            done: done_rx,
            disconnect_tx,
            send_tx,
        }
    }
}

/// How a single connect attempt ended, and what the supervisor loop should do
/// about it.
enum AttemptEnd {
    /// The caller asked for a shutdown.
    Disconnected,
    /// Reconnect; the flag says whether the next attempt resumes.
    Reconnect(bool),
    Fatal(GatewayError),
}

/// Why the read-dispatch loop stopped.
enum ReadEnd {
    Disconnect,
    /// Explicit signal from RECONNECT, INVALID_SESSION or heartbeat death.
    Signal(bool),
    Closed(Option<u16>),
    Protocol(String),
    Transport(tungstenite::Error),
}

enum Handshake {
    Hello(HelloPayload),
    InvalidSession(bool),
}

/// Owns the session state across connect attempts. Each attempt builds its
/// child tasks fresh; the send queue, sequence counter and resume details are
/// the only state that survives a reconnect.
struct Supervisor {
    config: GatewayConfig,
    urls: Arc<dyn ConnectUrlSource>,
    handler: Arc<dyn EventHandler>,
    send_tx: mpsc::UnboundedSender<String>,
    send_rx: Option<mpsc::UnboundedReceiver<String>>,
    sequence: Arc<AtomicI64>,
    heartbeat_acked: Arc<AtomicBool>,
    connect_url: Option<String>,
    resume_url: Option<String>,
    session_id: Option<String>,
    resuming: bool,
}

impl Supervisor {
    async fn run(mut self, disconnect: &mut mpsc::Receiver<()>) -> Result<()> {
        loop {
            match self.attempt(disconnect).await {
                AttemptEnd::Disconnected => {
                    info!("gateway disconnected");
                    return Ok(());
                }
                AttemptEnd::Reconnect(resume) => {
                    self.resuming = resume;
                    if !resume {
                        // A fresh identify starts a new session; the old
                        // sequence is meaningless against it.
                        self.sequence.store(0, Ordering::SeqCst);
                        self.session_id = None;
                        self.resume_url = None;
                    }
                    info!("reconnecting to gateway (resume={resume})");
                }
                AttemptEnd::Fatal(err) => {
                    warn!("gateway connection failed: {err}");
                    return Err(err);
                }
            }
            // The caller may have requested a disconnect while the attempt
            // was tearing down.
            if disconnect.try_recv().is_ok() {
                info!("gateway disconnected");
                return Ok(());
            }
        }
    }

    async fn attempt(&mut self, disconnect: &mut mpsc::Receiver<()>) -> AttemptEnd {
        let url = match self.resolve_url().await {
            Ok(url) => url,
            Err(err) => return AttemptEnd::Fatal(err),
        };

        debug!("attempting gateway connection (v={API_VERSION}, encoding={API_ENCODING})");
        let ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => return self.dial_failure(err),
        };
        info!("gateway websocket established");

        let (sink, mut stream) = ws.split();

        // The first frame must be HELLO; the read-dispatch loop does not
        // start until it is consumed. A server that accepts the socket and
        // then goes silent must not be able to stall a disconnect, so the
        // handshake read races the disconnect channel.
        let hello = tokio::select! {
            _ = disconnect.recv() => {
                debug!("disconnect requested during handshake");
                return AttemptEnd::Disconnected;
            }
            handshake = await_hello(&mut stream) => match handshake {
                Ok(Handshake::Hello(hello)) => hello,
                Ok(Handshake::InvalidSession(resume)) => {
                    warn!("server invalidated the session during handshake");
                    return AttemptEnd::Reconnect(resume);
                }
                Err(err) => {
                    warn!("gateway handshake failed: {err}");
                    return AttemptEnd::Reconnect(false);
                }
            },
        };

        let resuming = self.resuming;
        let Some(send_rx) = self.send_rx.take() else {
            return AttemptEnd::Fatal(GatewayError::Internal(
                "send queue receiver missing".to_owned(),
            ));
        };

        // IDENTIFY/RESUME is queued before the heartbeat task exists, so it
        // precedes every beat; payloads left over from an earlier socket
        // drain ahead of it.
        if let Err(err) = self.queue_handshake(resuming) {
            self.send_rx = Some(send_rx);
            return AttemptEnd::Fatal(err);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (death_tx, mut death_rx) = mpsc::channel(1);
        let abort_close = Arc::new(AtomicBool::new(false));
        self.heartbeat_acked.store(true, Ordering::SeqCst);

        let writer = tokio::spawn(write_loop(
            sink,
            send_rx,
            stop_rx.clone(),
            Arc::clone(&abort_close),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            hello.heartbeat_interval,
            self.send_tx.clone(),
            Arc::clone(&self.sequence),
            Arc::clone(&self.heartbeat_acked),
            stop_rx,
            Arc::clone(&abort_close),
            death_tx,
        ));

        // Handshake success is observed asynchronously through whatever the
        // server sends next, so enter the read loop immediately.
        let outcome = self
            .read_until_closed(&mut stream, disconnect, &mut death_rx)
            .await;

        // Teardown: stop the children and wait for both before the next
        // attempt, so no task ever outlives its socket.
        let _ = stop_tx.send(true);
        let _ = heartbeat.await;
        match writer.await {
            Ok(queue) => self.send_rx = Some(queue),
            Err(_) => {
                return AttemptEnd::Fatal(GatewayError::Internal(
                    "gateway writer task panicked".to_owned(),
                ))
            }
        }
        drop(stream);

        match outcome {
            ReadEnd::Disconnect => AttemptEnd::Disconnected,
            ReadEnd::Signal(resume) => AttemptEnd::Reconnect(resume),
            ReadEnd::Protocol(reason) => {
                warn!("gateway protocol fault: {reason}");
                AttemptEnd::Reconnect(false)
            }
            ReadEnd::Transport(err) => {
                warn!("gateway read failed: {err}");
                AttemptEnd::Reconnect(false)
            }
            ReadEnd::Closed(None) => AttemptEnd::Reconnect(false),
            ReadEnd::Closed(Some(code)) => match classify_close(code) {
                ClosePolicy::Resume => AttemptEnd::Reconnect(true),
                ClosePolicy::Fresh => AttemptEnd::Reconnect(false),
                ClosePolicy::Fatal => AttemptEnd::Fatal(GatewayError::Closed(code)),
            },
        }
    }

    /// A dial timeout means the cached url likely went stale: discard it and
    /// retry, keeping any resume intent so a transient timeout never costs
    /// the session. Any other dial failure is unrecoverable.
    fn dial_failure(&mut self, err: tungstenite::Error) -> AttemptEnd {
        if is_timeout(&err) {
            warn!("gateway dial timed out, discarding cached connect url");
            self.connect_url = None;
            AttemptEnd::Reconnect(self.resuming)
        } else {
            AttemptEnd::Fatal(err.into())
        }
    }

    /// Resolves the URL for this attempt: the resume URL when resuming, else
    /// the cached connect URL, else a fresh fetch. A resume request without a
    /// stored session demotes to a fresh identify rather than failing.
    async fn resolve_url(&mut self) -> Result<String> {
        if self.resuming {
            match (&self.resume_url, &self.session_id) {
                (Some(url), Some(_)) => return Ok(url.clone()),
                _ => {
                    debug!("resume requested without a stored session, identifying instead");
                    self.resuming = false;
                    self.sequence.store(0, Ordering::SeqCst);
                }
            }
        }
        if let Some(url) = &self.connect_url {
            return Ok(url.clone());
        }
        let url = self.urls.resolve_connect_url().await?;
        self.connect_url = Some(url.clone());
        Ok(url)
    }

    fn queue_handshake(&self, resuming: bool) -> Result<()> {
        let payload = if resuming {
            let Some(session_id) = self.session_id.clone() else {
                return Err(GatewayError::Internal(
                    "resume attempted without a session id".to_owned(),
                ));
            };
            info!("resuming gateway session");
            let resume = ResumePayload {
                token: self.config.token.clone(),
                session_id,
                seq: self.sequence.load(Ordering::SeqCst),
            };
            GatewayPayload::new(OP_RESUME, Some(encode_internal(&resume)?))
        } else {
            info!("identifying gateway session");
            let identify = IdentifyPayload {
                token: self.config.token.clone(),
                properties: ConnectionProperties {
                    os: std::env::consts::OS.to_owned(),
                    browser: self.config.client_name.clone(),
                    device: self.config.client_name.clone(),
                },
                intents: self.config.intents,
            };
            GatewayPayload::new(OP_IDENTIFY, Some(encode_internal(&identify)?))
        };
        self.queue_payload(&payload)
    }

    fn queue_payload(&self, payload: &GatewayPayload) -> Result<()> {
        self.send_tx
            .send(encode_payload(payload)?)
            .map_err(|_| GatewayError::Internal("send queue closed".to_owned()))
    }

    /// Reads frames and dispatches them by opcode until the socket closes,
    /// the heartbeat task declares the connection dead, or the caller asks
    /// for a disconnect.
    async fn read_until_closed(
        &mut self,
        stream: &mut SplitStream<WsStream>,
        disconnect: &mut mpsc::Receiver<()>,
        death: &mut mpsc::Receiver<()>,
    ) -> ReadEnd {
        loop {
            tokio::select! {
                _ = disconnect.recv() => return ReadEnd::Disconnect,
                _ = death.recv() => return ReadEnd::Signal(true),
                frame = stream.next() => match frame {
                    None => return ReadEnd::Closed(None),
                    Some(Err(err)) => return ReadEnd::Transport(err),
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        info!("server closed the gateway connection: {code:?}");
                        return ReadEnd::Closed(code);
                    }
                    Some(Ok(Message::Text(text))) => {
                        let payload: GatewayPayload = match serde_json::from_str(&text) {
                            Ok(payload) => payload,
                            Err(err) => return ReadEnd::Protocol(format!("malformed envelope: {err}")),
                        };
                        if let Some(end) = self.handle_payload(payload) {
                            return end;
                        }
                    }
                    // Pings are answered by tungstenite itself; binary frames
                    // are not part of the json encoding.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    fn handle_payload(&mut self, payload: GatewayPayload) -> Option<ReadEnd> {
        match payload.op {
            OP_DISPATCH => {
                if let Some(seq) = payload.s {
                    self.sequence.store(seq, Ordering::SeqCst);
                }
                let Some(name) = payload.t else {
                    warn!("dispatch frame without an event name");
                    return None;
                };
                let data = payload.d.unwrap_or(Value::Null);
                if name == EVENT_READY {
                    self.capture_ready(&data);
                }
                debug!("received event: {name}");
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move { handler.on_dispatch(name, data).await });
                None
            }
            OP_HEARTBEAT => {
                debug!("server requested an immediate heartbeat");
                queue_heartbeat(&self.send_tx, &self.sequence, &self.heartbeat_acked);
                None
            }
            OP_HEARTBEAT_ACK => {
                self.heartbeat_acked.store(true, Ordering::SeqCst);
                None
            }
            OP_RECONNECT => {
                info!("server requested a reconnect");
                Some(ReadEnd::Signal(true))
            }
            OP_INVALID_SESSION => {
                warn!("server invalidated the session");
                // The boolean payload dictates whether the next attempt may
                // resume; an unreadable payload gets a new session.
                let resume = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                Some(ReadEnd::Signal(resume))
            }
            OP_HELLO => {
                warn!("unexpected HELLO after handshake");
                None
            }
            other => {
                debug!("ignoring unknown gateway opcode {other}");
                None
            }
        }
    }

    fn capture_ready(&mut self, data: &Value) {
        match serde_json::from_value::<ReadyPayload>(data.clone()) {
            Ok(ready) => {
                debug!("session ready, resume armed");
                self.session_id = Some(ready.session_id);
                self.resume_url = Some(with_protocol_params(&ready.resume_gateway_url));
            }
            Err(err) => warn!("failed to parse READY payload: {err}"),
        }
    }
}

async fn await_hello(stream: &mut SplitStream<WsStream>) -> Result<Handshake> {
    loop {
        let message = stream
            .next()
            .await
            .ok_or_else(|| GatewayError::Protocol("connection closed before HELLO".to_owned()))??;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                return Err(GatewayError::Protocol(format!(
                    "closed during handshake: {frame:?}"
                )))
            }
            _ => continue,
        };
        let payload: GatewayPayload = serde_json::from_str(&text)?;
        return match payload.op {
            OP_HELLO => {
                let data = payload
                    .d
                    .ok_or_else(|| GatewayError::Protocol("HELLO without payload".to_owned()))?;
                Ok(Handshake::Hello(serde_json::from_value(data)?))
            }
            // Undocumented, but the server will sometimes answer a fresh
            // connection with INVALID_SESSION instead of HELLO.
            OP_INVALID_SESSION => Ok(Handshake::InvalidSession(
                payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false),
            )),
            other => Err(GatewayError::Protocol(format!(
                "expected HELLO as first frame, got opcode {other}"
            ))),
        };
    }
}

/// The only task permitted to write to the socket: drains the outbound queue
/// and writes each payload as a single text frame, so heartbeats, handshakes
/// and application sends are always serialized correctly.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::UnboundedReceiver<String>,
    mut stop: watch::Receiver<bool>,
    abort_close: Arc<AtomicBool>,
) -> mpsc::UnboundedReceiver<String> {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if !abort_close.load(Ordering::SeqCst) {
                    // A graceful close ends the session server-side; an
                    // aborted close leaves it resumable.
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })))
                        .await;
                }
                return queue;
            }
            payload = queue.recv() => {
                let Some(payload) = payload else { return queue };
                if let Err(err) = sink.send(Message::Text(payload)).await {
                    warn!("failed write to gateway connection: {err}");
                }
            }
        }
    }
}

/// Sends the first heartbeat immediately, then one per interval tick. A tick
/// that finds the previous beat unacknowledged declares the connection dead
/// and requests a reconnect-with-resume.
async fn heartbeat_loop(
    interval_ms: u64,
    send_tx: mpsc::UnboundedSender<String>,
    sequence: Arc<AtomicI64>,
    acked: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
    abort_close: Arc<AtomicBool>,
    death: mpsc::Sender<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    debug!("starting heartbeats every {interval_ms}ms");
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {
                if !acked.load(Ordering::SeqCst) {
                    warn!("heartbeat not acknowledged, terminating connection for resume");
                    abort_close.store(true, Ordering::SeqCst);
                    let _ = death.send(()).await;
                    return;
                }
                queue_heartbeat(&send_tx, &sequence, &acked);
            }
        }
    }
}

fn queue_heartbeat(
    send_tx: &mpsc::UnboundedSender<String>,
    sequence: &AtomicI64,
    acked: &AtomicBool,
) {
    let payload = GatewayPayload::new(
        OP_HEARTBEAT,
        Some(Value::from(sequence.load(Ordering::SeqCst))),
    );
    match encode_payload(&payload) {
        Ok(text) => {
            if send_tx.send(text).is_ok() {
                acked.store(false, Ordering::SeqCst);
            }
        }
        Err(err) => warn!("{err}"),
    }
}

fn encode_payload(payload: &GatewayPayload) -> Result<String> {
    serde_json::to_string(payload)
        .map_err(|err| GatewayError::Internal(format!("gateway payload failed to encode: {err}")))
}

fn encode_internal<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| GatewayError::Internal(format!("handshake payload failed to encode: {err}")))
}

fn is_timeout(err: &tungstenite::Error) -> bool {
    matches!(err, tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use std::sync::atomic::{AtomicBool, AtomicI64};

    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite;

    use super::{
        AttemptEnd, ConnectUrlSource, EventHandler, Gateway, GatewayConfig, GatewayHandle,
        Supervisor,
    };
    use crate::error::{GatewayError, Result};
    use crate::protocol::{GatewayPayload, OP_HEARTBEAT, OP_IDENTIFY, OP_RESUME};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    struct StaticUrls(String);

    #[async_trait]
    impl ConnectUrlSource for StaticUrls {
        async fn resolve_connect_url(&self) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn on_dispatch(&self, event: String, data: Value) {
            self.events.lock().await.push((event, data));
        }
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            token: "t0k".to_owned(),
            client_name: "chatwire-test".to_owned(),
            intents: 513,
        }
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        (listener, url)
    }

    fn start(listener_url: &str) -> (GatewayHandle, Arc<RecordingHandler>) {
        init_tracing();
        let handler = Arc::new(RecordingHandler::default());
        let handle = Gateway::connect(
            test_config(),
            Arc::new(StaticUrls(listener_url.to_owned())),
            handler.clone(),
        );
        (handle, handler)
    }

    async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.expect("accept");
        tokio_tungstenite::accept_async(stream).await.expect("ws handshake")
    }

    async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(Message::Text(value.to_string())).await.expect("send");
    }

    async fn send_hello(ws: &mut WebSocketStream<TcpStream>, interval_ms: u64) {
        send_json(ws, json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})).await;
    }

    async fn next_payload(ws: &mut WebSocketStream<TcpStream>) -> GatewayPayload {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for client frame")
                .expect("connection ended")
                .expect("read");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).expect("payload");
            }
        }
    }

    async fn next_non_heartbeat(ws: &mut WebSocketStream<TcpStream>) -> GatewayPayload {
        loop {
            let payload = next_payload(ws).await;
            if payload.op != OP_HEARTBEAT {
                return payload;
            }
        }
    }

    async fn send_ready(ws: &mut WebSocketStream<TcpStream>, session: &str, resume_base: &str) {
        send_json(
            ws,
            json!({
                "op": 0,
                "s": 1,
                "t": "READY",
                "d": {"session_id": session, "resume_gateway_url": resume_base}
            }),
        )
        .await;
    }

    async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: u16) {
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        })))
        .await
        .expect("close");
    }

    #[tokio::test]
    async fn identify_is_first_write_and_carries_intents() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        let identify = next_payload(&mut ws).await;
        assert_eq!(identify.op, OP_IDENTIFY);
        let d = identify.d.expect("identify payload");
        assert_eq!(d.get("token"), Some(&json!("t0k")));
        assert_eq!(d.get("intents"), Some(&json!(513)));
        assert_eq!(
            d.pointer("/properties/browser"),
            Some(&json!("chatwire-test"))
        );

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn resumes_with_last_sequence_after_timed_out_close() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        let identify = next_non_heartbeat(&mut ws).await;
        assert_eq!(identify.op, OP_IDENTIFY);
        // The resume url has the protocol params appended by the client, so
        // hand out the bare listener address.
        send_ready(&mut ws, "sess-1", &url).await;
        send_json(&mut ws, json!({"op": 0, "s": 5, "t": "MESSAGE_CREATE", "d": {}})).await;
        close_with(&mut ws, 4009).await;

        let mut ws2 = accept_ws(&listener).await;
        send_hello(&mut ws2, 60_000).await;
        let resume = next_non_heartbeat(&mut ws2).await;
        assert_eq!(resume.op, OP_RESUME);
        let d = resume.d.expect("resume payload");
        assert_eq!(d.get("session_id"), Some(&json!("sess-1")));
        assert_eq!(d.get("seq"), Some(&json!(5)));
        assert_eq!(d.get("token"), Some(&json!("t0k")));

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn invalid_session_without_resume_identifies_from_scratch() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);
        send_ready(&mut ws, "sess-1", &url).await;
        send_json(&mut ws, json!({"op": 0, "s": 9, "t": "MESSAGE_CREATE", "d": {}})).await;
        send_json(&mut ws, json!({"op": 9, "d": false})).await;

        // Despite having a resumable session, the explicit false demotes the
        // next attempt to a fresh identify with the sequence reset.
        let mut ws2 = accept_ws(&listener).await;
        send_hello(&mut ws2, 60_000).await;
        let identify = next_non_heartbeat(&mut ws2).await;
        assert_eq!(identify.op, OP_IDENTIFY);
        let beat = next_payload(&mut ws2).await;
        assert_eq!(beat.op, OP_HEARTBEAT);
        assert_eq!(beat.d, Some(json!(0)));

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn reconnect_request_resumes_the_session() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);
        send_ready(&mut ws, "sess-2", &url).await;
        send_json(&mut ws, json!({"op": 7})).await;

        let mut ws2 = accept_ws(&listener).await;
        send_hello(&mut ws2, 60_000).await;
        let resume = next_non_heartbeat(&mut ws2).await;
        assert_eq!(resume.op, OP_RESUME);

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn missed_heartbeat_ack_tears_down_and_resumes() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 100).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);
        send_ready(&mut ws, "sess-3", &url).await;
        // Never acknowledge any heartbeat; the second tick declares the
        // connection dead and the engine resumes.

        let mut ws2 = accept_ws(&listener).await;
        send_hello(&mut ws2, 60_000).await;
        let resume = next_non_heartbeat(&mut ws2).await;
        assert_eq!(resume.op, OP_RESUME);
        let d = resume.d.expect("resume payload");
        assert_eq!(d.get("session_id"), Some(&json!("sess-3")));

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn heartbeats_start_immediately_and_carry_latest_sequence() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);
        let started = Instant::now();

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 100).await;

        let mut beats = Vec::new();
        let mut dispatched = false;
        while beats.len() < 3 {
            let payload = next_payload(&mut ws).await;
            if payload.op != OP_HEARTBEAT {
                continue;
            }
            if beats.is_empty() {
                // First beat goes out before the first full interval elapses.
                assert!(
                    started.elapsed() < Duration::from_millis(100),
                    "first heartbeat arrived after {:?}",
                    started.elapsed()
                );
            }
            beats.push(payload.d.clone());
            send_json(&mut ws, json!({"op": 11})).await;
            if !dispatched {
                send_json(&mut ws, json!({"op": 0, "s": 7, "t": "MESSAGE_CREATE", "d": {}}))
                    .await;
                dispatched = true;
            }
        }
        assert_eq!(beats[0], Some(json!(0)));
        assert_eq!(beats[2], Some(json!(7)), "beats carry the latest sequence");

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn server_heartbeat_request_gets_an_immediate_beat() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);
        // Drain the immediate first beat, then request one out of band.
        let beat = next_payload(&mut ws).await;
        assert_eq!(beat.op, OP_HEARTBEAT);
        send_json(&mut ws, json!({"op": 1})).await;
        let beat = next_payload(&mut ws).await;
        assert_eq!(beat.op, OP_HEARTBEAT);

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn dispatch_events_reach_the_handler_without_blocking_the_loop() {
        let (listener, url) = bind().await;
        let (handle, handler) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);
        send_json(&mut ws, json!({"op": 0, "s": 1, "t": "MESSAGE_CREATE", "d": {"id": "1"}}))
            .await;
        send_json(&mut ws, json!({"op": 0, "s": 2, "t": "MESSAGE_DELETE", "d": {"id": "2"}}))
            .await;

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if handler.events.lock().await.len() >= 2 {
                break;
            }
            assert!(Instant::now() < deadline, "events never reached handler");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = handler.events.lock().await;
        assert_eq!(events[0].0, "MESSAGE_CREATE");
        assert_eq!(events[1].0, "MESSAGE_DELETE");
        drop(events);

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn disconnect_sends_a_graceful_close_frame() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);

        let disconnect = tokio::spawn(handle.disconnect());
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for close")
                .expect("connection ended")
                .expect("read");
            if let Message::Close(frame) = message {
                let code = frame.map(|f| u16::from(f.code));
                assert_eq!(code, Some(1000));
                break;
            }
        }
        disconnect.await.expect("join").expect("clean shutdown");
    }

    #[tokio::test]
    async fn non_hello_first_frame_fails_the_attempt_and_reconnects_fresh() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        // Protocol violation: dispatch before HELLO.
        send_json(&mut ws, json!({"op": 0, "s": 1, "t": "MESSAGE_CREATE", "d": {}})).await;
        drop(ws);

        // The engine treats it as a failed attempt and identifies fresh.
        let mut ws2 = accept_ws(&listener).await;
        send_hello(&mut ws2, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws2).await.op, OP_IDENTIFY);

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn disconnect_interrupts_a_stalled_handshake() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        // The server accepts the websocket but never sends HELLO.
        let ws = accept_ws(&listener).await;

        tokio::time::timeout(Duration::from_secs(2), handle.disconnect())
            .await
            .expect("disconnect must not hang on a silent server")
            .expect("clean shutdown");
        drop(ws);
    }

    #[test]
    fn dial_timeout_refetches_the_url_but_keeps_resume_intent() {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor {
            config: test_config(),
            urls: Arc::new(StaticUrls("ws://unused".to_owned())),
            handler: Arc::new(RecordingHandler::default()),
            send_tx,
            send_rx: Some(send_rx),
            sequence: Arc::new(AtomicI64::new(11)),
            heartbeat_acked: Arc::new(AtomicBool::new(true)),
            connect_url: Some("ws://stale".to_owned()),
            resume_url: Some("ws://resume".to_owned()),
            session_id: Some("sess-9".to_owned()),
            resuming: true,
        };

        let timed_out = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "dial",
        ));
        assert!(matches!(
            supervisor.dial_failure(timed_out),
            AttemptEnd::Reconnect(true)
        ));
        assert!(supervisor.connect_url.is_none(), "stale url must go");
        assert_eq!(supervisor.session_id.as_deref(), Some("sess-9"));
        assert_eq!(supervisor.resume_url.as_deref(), Some("ws://resume"));

        let refused = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "dial",
        ));
        assert!(matches!(
            supervisor.dial_failure(refused),
            AttemptEnd::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn payloads_queued_between_attempts_are_delivered_by_the_next_socket() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);
        send_ready(&mut ws, "sess-4", &url).await;
        close_with(&mut ws, 4009).await;

        // Once the second socket is accepted the first attempt has fully
        // torn down, so this payload sits in the queue until the next
        // writer starts.
        let mut ws2 = accept_ws(&listener).await;
        handle
            .send(&GatewayPayload::new(
                3,
                Some(json!({"status": "online"})),
            ))
            .expect("queued while between sockets");
        send_hello(&mut ws2, 60_000).await;

        let queued = next_non_heartbeat(&mut ws2).await;
        assert_eq!(queued.op, 3);
        assert_eq!(queued.d, Some(json!({"status": "online"})));
        let resume = next_non_heartbeat(&mut ws2).await;
        assert_eq!(resume.op, OP_RESUME);

        handle.disconnect().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn authentication_failure_close_is_fatal() {
        let (listener, url) = bind().await;
        let (handle, _) = start(&url);

        let mut ws = accept_ws(&listener).await;
        send_hello(&mut ws, 60_000).await;
        assert_eq!(next_non_heartbeat(&mut ws).await.op, OP_IDENTIFY);
        close_with(&mut ws, 4004).await;

        let err = handle.wait().await.expect_err("auth failure is fatal");
        assert!(matches!(err, GatewayError::Closed(4004)));
    }
}
