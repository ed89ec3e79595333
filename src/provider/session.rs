//! One WebSocket session with explicit lifecycle.
//!
//! `SocketSession` owns the socket, the outbound queue, and the IO task.
//! What the frames mean is left to a [`Dialect`]. The session guarantees:
//!
//! * frames sent while `Connecting` are delivered after the handshake, in
//!   order, ahead of anything sent later;
//! * exactly one close event per opened session;
//! * a connect attempt abandoned by `disconnect` never resurrects the session
//!   (every attempt carries a generation number that is checked before any
//!   state transition).

use super::{loggable_url, ConnectionConfig};
use crate::error::{AgentError, AgentResult};
use crate::events::{Emitter, Subscription};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Interprets frames for one wire protocol.
pub trait Dialect: Send + Sync + 'static {
    type Event: Clone + Send + 'static;

    fn name(&self) -> &str;
    /// Decode one inbound text frame. Malformed frames yield nothing.
    fn translate(&self, text: &str) -> Vec<Self::Event>;
    fn is_setup_ack(&self, text: &str) -> bool {
        let _ = text;
        false
    }
    fn opened(&self) -> Self::Event;
    fn closed(&self) -> Self::Event;
    fn failed(&self, message: String) -> Self::Event;
}

/// What happens to frames sent before the socket is writable.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub capacity: usize,
    /// Also queue while `Disconnected`, for delivery on the next connect.
    pub while_idle: bool,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            capacity: 256,
            while_idle: false,
        }
    }
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: VecDeque<String>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    /// Wakes an in-flight handshake when the attempt is abandoned.
    cancel: Option<Arc<Notify>>,
}

pub struct SocketSession<D: Dialect> {
    dialect: Arc<D>,
    policy: QueuePolicy,
    inner: Arc<Mutex<Inner>>,
    events: Emitter<D::Event>,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl<D: Dialect> SocketSession<D> {
    pub fn new(dialect: D, policy: QueuePolicy) -> Self {
        Self {
            dialect: Arc::new(dialect),
            policy,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                pending: VecDeque::new(),
                shutdown: None,
                task: None,
                cancel: None,
            })),
            events: Emitter::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<D::Event> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Discard frames held for a session that has not opened yet. Returns the
    /// number dropped.
    pub fn clear_pending(&self) -> usize {
        let mut inner = lock(&self.inner);
        let dropped = inner.pending.len();
        inner.pending.clear();
        dropped
    }

    /// Open the socket and run the handshake. `Ok(false)` means the call was
    /// a no-op: already active, or superseded by a `disconnect` mid-attempt.
    pub async fn connect(&self, config: ConnectionConfig) -> AgentResult<bool> {
        let cancel = Arc::new(Notify::new());
        let generation = {
            let mut inner = lock(&self.inner);
            if inner.state != ConnectionState::Disconnected {
                log::warn!(
                    "[{}] connect ignored ({:?}): {}",
                    self.dialect.name(),
                    inner.state,
                    AgentError::AlreadyConnected
                );
                return Ok(false);
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            inner.cancel = Some(cancel.clone());
            inner.generation
        };

        log::info!("[{}] connecting: {}", self.dialect.name(), loggable_url(&config.url));
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, self.handshake(&config));
        let handshake = tokio::select! {
            result = attempt => result,
            _ = cancel.notified() => {
                log::info!("[{}] handshake abandoned", self.dialect.name());
                return Ok(false);
            }
        };
        let ws = match handshake {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return self.abort_connect(generation, e),
            Err(_) => {
                return self.abort_connect(
                    generation,
                    AgentError::Transport(format!("timed out after {}s", CONNECT_TIMEOUT.as_secs())),
                )
            }
        };

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut parts = Some((sink, stream, out_rx, shutdown_rx));

        let flushed = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                None
            } else {
                let flushed = inner.pending.len();
                for frame in inner.pending.drain(..) {
                    let _ = out_tx.send(frame);
                }
                inner.outbound = Some(out_tx);
                inner.shutdown = Some(shutdown_tx);
                inner.cancel = None;
                inner.state = ConnectionState::Connected;
                self.events.emit(self.dialect.opened());

                if let Some((sink, stream, out_rx, shutdown_rx)) = parts.take() {
                    let io = IoTask {
                        dialect: self.dialect.clone(),
                        inner: self.inner.clone(),
                        events: self.events.clone(),
                        generation,
                    };
                    inner.task = Some(tokio::spawn(io.run(sink, stream, out_rx, shutdown_rx)));
                }
                Some(flushed)
            }
        };

        match flushed {
            Some(flushed) => {
                log::info!("[{}] connected (flushed {} queued frames)", self.dialect.name(), flushed);
                Ok(true)
            }
            None => {
                log::info!("[{}] connect superseded; dropping socket", self.dialect.name());
                if let Some((sink, stream, _, _)) = parts.take() {
                    if let Ok(mut ws) = sink.reunite(stream) {
                        let _ = ws.close(None).await;
                    }
                }
                Ok(false)
            }
        }
    }

    async fn handshake(&self, config: &ConnectionConfig) -> AgentResult<WsStream> {
        let request = build_ws_request(config)?;
        let (mut ws, _) = connect_async(request).await?;

        for message in &config.init_messages {
            ws.send(tungstenite::Message::Text(message.to_string().into()))
                .await?;
        }

        if config.await_setup {
            loop {
                let text = match ws.next().await {
                    Some(Ok(tungstenite::Message::Text(t))) => t.to_string(),
                    Some(Ok(tungstenite::Message::Binary(b))) => {
                        String::from_utf8_lossy(&b).into_owned()
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", f.code, f.reason))
                            .unwrap_or_default();
                        return Err(AgentError::Transport(format!(
                            "closed during setup {}",
                            reason
                        )));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(AgentError::Transport("closed during setup".into())),
                };
                if self.dialect.is_setup_ack(&text) {
                    break;
                }
                log::debug!("[{}] frame before setup ack ignored", self.dialect.name());
            }
        }
        Ok(ws)
    }

    fn abort_connect(&self, generation: u64, error: AgentError) -> AgentResult<bool> {
        let mut inner = lock(&self.inner);
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            return Ok(false);
        }
        inner.state = ConnectionState::Disconnected;
        inner.pending.clear();
        inner.cancel = None;
        drop(inner);
        log::error!("[{}] connect failed: {}", self.dialect.name(), error);
        self.events.emit(self.dialect.failed(error.to_string()));
        Err(error)
    }

    /// Queue or transmit one text frame. Returns false when dropped.
    pub fn send(&self, frame: String) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            ConnectionState::Connected => match inner.outbound.as_ref() {
                Some(tx) => tx.send(frame).is_ok(),
                None => false,
            },
            ConnectionState::Connecting => self.enqueue(&mut inner, frame),
            ConnectionState::Disconnected if self.policy.while_idle => {
                self.enqueue(&mut inner, frame)
            }
            _ => false,
        }
    }

    /// Transmit only if the socket is open.
    pub fn send_now(&self, frame: String) -> bool {
        let inner = lock(&self.inner);
        match (inner.state, inner.outbound.as_ref()) {
            (ConnectionState::Connected, Some(tx)) => tx.send(frame).is_ok(),
            _ => {
                log::debug!("[{}] frame dropped: {}", self.dialect.name(), AgentError::NotConnected);
                false
            }
        }
    }

    fn enqueue(&self, inner: &mut Inner, frame: String) -> bool {
        if self.policy.capacity == 0 {
            return false;
        }
        if inner.pending.len() >= self.policy.capacity {
            inner.pending.pop_front();
            log::warn!(
                "[{}] outbound queue full ({}); dropped oldest frame",
                self.dialect.name(),
                self.policy.capacity
            );
        }
        inner.pending.push_back(frame);
        true
    }

    /// Close the session. Idempotent: returns false if there was nothing to
    /// close. Returns after the close event has been emitted.
    pub async fn disconnect(&self) -> bool {
        let (generation, shutdown, task) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                ConnectionState::Disconnected | ConnectionState::Closing => return false,
                ConnectionState::Connecting => {
                    inner.generation += 1;
                    inner.state = ConnectionState::Disconnected;
                    inner.pending.clear();
                    if let Some(cancel) = inner.cancel.take() {
                        cancel.notify_one();
                    }
                    drop(inner);
                    log::info!("[{}] connect cancelled", self.dialect.name());
                    self.events.emit(self.dialect.closed());
                    return true;
                }
                ConnectionState::Connected => {
                    inner.state = ConnectionState::Closing;
                    inner.outbound = None;
                    (inner.generation, inner.shutdown.take(), inner.task.take())
                }
            }
        };

        log::info!("[{}] disconnecting", self.dialect.name());
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                log::warn!("[{}] io task did not stop in time; aborting", self.dialect.name());
                task.abort();
            }
        }
        if finish(&self.inner, generation) {
            self.events.emit(self.dialect.closed());
        }
        true
    }
}

impl<D: Dialect> Drop for SocketSession<D> {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if let Some(tx) = inner.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Move a session of `generation` to `Disconnected`. True for exactly one
/// caller per session.
fn finish(inner: &Mutex<Inner>, generation: u64) -> bool {
    let mut inner = lock(inner);
    if inner.generation != generation || inner.state == ConnectionState::Disconnected {
        return false;
    }
    inner.state = ConnectionState::Disconnected;
    inner.outbound = None;
    inner.shutdown = None;
    inner.task = None;
    inner.pending.clear();
    true
}

struct IoTask<D: Dialect> {
    dialect: Arc<D>,
    inner: Arc<Mutex<Inner>>,
    events: Emitter<D::Event>,
    generation: u64,
}

impl<D: Dialect> IoTask<D> {
    async fn run(
        self,
        mut sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
        mut stream: futures_util::stream::SplitStream<WsStream>,
        mut out_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let name = self.dialect.name().to_string();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = sink.send(tungstenite::Message::Close(None)).await;
                    break;
                }
                frame = out_rx.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = sink.send(tungstenite::Message::Text(text.into())).await {
                            log::error!("[{}] send failed: {}", name, e);
                            self.events.emit(self.dialect.failed(e.to_string()));
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(tungstenite::Message::Close(None)).await;
                        break;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(tungstenite::Message::Text(t))) => self.dispatch(&t),
                    Some(Ok(tungstenite::Message::Binary(b))) => match std::str::from_utf8(&b) {
                        Ok(text) => self.dispatch(text),
                        Err(_) => log::debug!("[{}] dropping non-utf8 binary frame", name),
                    },
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        match frame {
                            Some(frame) => log::info!("[{}] closed by peer: {} {}", name, frame.code, frame.reason),
                            None => log::info!("[{}] closed by peer", name),
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("[{}] websocket error: {}", name, e);
                        self.events.emit(self.dialect.failed(e.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }

        let _ = sink.close().await;
        if finish(&self.inner, self.generation) {
            log::info!("[{}] disconnected", name);
            self.events.emit(self.dialect.closed());
        }
    }

    fn dispatch(&self, text: &str) {
        for event in self.dialect.translate(text) {
            self.events.emit(event);
        }
    }
}

fn build_ws_request(config: &ConnectionConfig) -> AgentResult<tungstenite::http::Request<()>> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::Config(format!("invalid endpoint: {}", e)))?;

    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AgentError::Config(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AgentError::Config(format!("invalid header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Loopback WebSocket peers for exercising sessions without a backend.

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{broadcast, mpsc};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;

    #[derive(Clone)]
    pub enum Reply {
        Text(String),
        Close,
    }

    /// A peer that reports every text frame it receives and sends whatever is
    /// pushed through `say` to every connected client.
    pub struct Peer {
        pub url: String,
        pub received: mpsc::UnboundedReceiver<String>,
        pub reply: broadcast::Sender<Reply>,
        pub headers: mpsc::UnboundedReceiver<Vec<(String, String)>>,
    }

    impl Peer {
        pub async fn next_frame(&mut self) -> String {
            tokio::time::timeout(std::time::Duration::from_secs(5), self.received.recv())
                .await
                .expect("peer timed out waiting for a frame")
                .expect("peer closed")
        }

        pub fn say(&self, text: impl Into<String>) {
            let _ = self.reply.send(Reply::Text(text.into()));
        }

        pub fn close(&self) {
            let _ = self.reply.send(Reply::Close);
        }
    }

    /// Accept any number of clients. `greeting` frames are sent on each
    /// connection as soon as its first frame arrives.
    pub async fn spawn_peer(greeting: Vec<String>) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let (frame_tx, received) = mpsc::unbounded_channel();
        let (reply, _) = broadcast::channel::<Reply>(64);
        let (header_tx, headers) = mpsc::unbounded_channel();

        let replies = reply.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let reply_rx = replies.subscribe();
                tokio::spawn(serve(
                    tcp,
                    greeting.clone(),
                    frame_tx.clone(),
                    header_tx.clone(),
                    reply_rx,
                ));
            }
        });

        Peer {
            url,
            received,
            reply,
            headers,
        }
    }

    async fn serve(
        tcp: TcpStream,
        greeting: Vec<String>,
        frame_tx: mpsc::UnboundedSender<String>,
        header_tx: mpsc::UnboundedSender<Vec<(String, String)>>,
        mut reply_rx: broadcast::Receiver<Reply>,
    ) {
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let seen = req
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let _ = header_tx.send(seen);
            Ok(resp)
        };
        let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
            return;
        };
        let (mut sink, mut stream) = ws.split();
        let mut greeting = Some(greeting).filter(|g| !g.is_empty());
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(t))) => {
                        let _ = frame_tx.send(t.to_string());
                        for g in greeting.take().unwrap_or_default() {
                            let _ = sink.send(Message::Text(g.into())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
                reply = reply_rx.recv() => match reply {
                    Ok(Reply::Text(t)) => {
                        let _ = sink.send(Message::Text(t.into())).await;
                    }
                    Ok(Reply::Close) | Err(_) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
            }
        }
    }

    /// A listener that accepts TCP but never completes the WebSocket upgrade.
    pub async fn spawn_silent() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                held.push(tcp);
            }
        });
        (url, task)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Open,
        Close,
        Error(String),
        Frame(String),
    }

    struct Echo {
        ack: Option<&'static str>,
    }

    impl Dialect for Echo {
        type Event = Ev;
        fn name(&self) -> &str {
            "echo"
        }
        fn translate(&self, text: &str) -> Vec<Ev> {
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(v) => vec![Ev::Frame(v["say"].as_str().unwrap_or_default().to_string())],
                Err(_) => vec![],
            }
        }
        fn is_setup_ack(&self, text: &str) -> bool {
            self.ack.map(|a| text.contains(a)).unwrap_or(false)
        }
        fn opened(&self) -> Ev {
            Ev::Open
        }
        fn closed(&self) -> Ev {
            Ev::Close
        }
        fn failed(&self, message: String) -> Ev {
            Ev::Error(message)
        }
    }

    fn session(policy: QueuePolicy) -> SocketSession<Echo> {
        SocketSession::new(Echo { ack: None }, policy)
    }

    fn config(url: &str) -> ConnectionConfig {
        ConnectionConfig {
            url: url.to_string(),
            init_messages: vec![serde_json::json!({"hello": 1})],
            ..Default::default()
        }
    }

    async fn next(sub: &mut Subscription<Ev>) -> Ev {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out")
            .expect("emitter gone")
    }

    #[tokio::test]
    async fn queued_frames_follow_handshake_in_order() {
        let mut peer = spawn_peer(vec![]).await;
        let session = Arc::new(session(QueuePolicy::default()));
        let mut sub = session.subscribe();

        let connecting = {
            let session = session.clone();
            let url = peer.url.clone();
            tokio::spawn(async move { session.connect(config(&url)).await })
        };
        // Wait until the attempt is in flight, then send while Connecting.
        while session.state() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }
        assert!(session.send("q1".into()));
        assert!(session.send("q2".into()));
        assert!(connecting.await.unwrap().unwrap());
        assert!(session.send("live".into()));

        assert_eq!(peer.next_frame().await, r#"{"hello":1}"#);
        assert_eq!(peer.next_frame().await, "q1");
        assert_eq!(peer.next_frame().await, "q2");
        assert_eq!(peer.next_frame().await, "live");
        assert_eq!(next(&mut sub).await, Ev::Open);
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn inbound_frames_are_translated_and_garbage_dropped() {
        let peer = spawn_peer(vec![]).await;
        let session = session(QueuePolicy::default());
        let mut sub = session.subscribe();
        assert!(session.connect(config(&peer.url)).await.unwrap());
        assert_eq!(next(&mut sub).await, Ev::Open);

        peer.say("{not json");
        peer.say(r#"{"say":"hi"}"#);
        assert_eq!(next(&mut sub).await, Ev::Frame("hi".into()));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_with_single_close() {
        let peer = spawn_peer(vec![]).await;
        let session = session(QueuePolicy::default());
        let mut sub = session.subscribe();
        assert!(session.connect(config(&peer.url)).await.unwrap());
        assert_eq!(next(&mut sub).await, Ev::Open);

        assert!(session.disconnect().await);
        assert!(!session.disconnect().await);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(next(&mut sub).await, Ev::Close);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.try_recv(), None);
        assert!(!session.send("late".into()));
    }

    #[tokio::test]
    async fn remote_close_emits_close_once() {
        let peer = spawn_peer(vec![]).await;
        let session = session(QueuePolicy::default());
        let mut sub = session.subscribe();
        assert!(session.connect(config(&peer.url)).await.unwrap());
        assert_eq!(next(&mut sub).await, Ev::Open);

        peer.close();
        assert_eq!(next(&mut sub).await, Ev::Close);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.disconnect().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn second_connect_while_active_is_noop() {
        let peer = spawn_peer(vec![]).await;
        let session = session(QueuePolicy::default());
        assert!(session.connect(config(&peer.url)).await.unwrap());
        assert!(!session.connect(config(&peer.url)).await.unwrap());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_during_connect_cancels_attempt() {
        let (url, _listener) = spawn_silent().await;
        let session = Arc::new(SocketSession::new(Echo { ack: None }, QueuePolicy::default()));
        let mut sub = session.subscribe();

        let attempt = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(config(&url)).await })
        };
        while session.state() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }
        assert!(session.send("queued".into()));
        assert!(session.disconnect().await);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.pending_len(), 0);
        assert_eq!(next(&mut sub).await, Ev::Close);

        assert!(!attempt.await.unwrap().unwrap());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn setup_ack_gates_open() {
        let mut peer = spawn_peer(vec![r#"{"noise":true}"#.into(), r#"{"setupComplete":{}}"#.into()]).await;
        let session = SocketSession::new(Echo { ack: Some("setupComplete") }, QueuePolicy::default());
        let mut cfg = config(&peer.url);
        cfg.await_setup = true;
        assert!(session.connect(cfg).await.unwrap());
        assert_eq!(peer.next_frame().await, r#"{"hello":1}"#);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn refused_connection_reports_error_and_resets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let session = session(QueuePolicy::default());
        let mut sub = session.subscribe();
        let err = session.connect(config(&url)).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(next(&mut sub).await, Ev::Error(_)));
    }

    #[test]
    fn idle_queue_is_bounded_and_drops_oldest() {
        let bounded = session(QueuePolicy {
            capacity: 2,
            while_idle: true,
        });
        assert!(bounded.send("a".into()));
        assert!(bounded.send("b".into()));
        assert!(bounded.send("c".into()));
        assert_eq!(bounded.pending_len(), 2);
        assert_eq!(bounded.clear_pending(), 2);
        assert_eq!(bounded.pending_len(), 0);

        let strict = session(QueuePolicy::default());
        assert!(!strict.send("dropped".into()));
        assert!(!strict.send_now("dropped".into()));
    }

    #[tokio::test]
    async fn custom_headers_reach_the_peer() {
        let mut peer = spawn_peer(vec![]).await;
        let session = session(QueuePolicy::default());
        let mut cfg = config(&peer.url);
        cfg.headers.push(("Authorization".into(), "Bearer k".into()));
        assert!(session.connect(cfg).await.unwrap());
        let headers = peer.headers.recv().await.unwrap();
        assert!(headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("authorization") && v == "Bearer k"));
    }
}
